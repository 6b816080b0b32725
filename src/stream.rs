//! Streaming chat response consumption.
//!
//! The backend writes newline-delimited `data: <payload>` frames. A payload
//! that parses as a JSON object is a structured signal (`{"error": ...}` or
//! `{"done": true}`); anything else is a plain-text delta belonging to the
//! reply. `consume_stream` reassembles those frames into incremental chunk
//! callbacks plus one final, post-filtered string.

use std::sync::LazyLock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Frame delimiter prefix on every line the backend emits.
pub const FRAME_PREFIX: &str = "data:";

/// Errors raised while consuming a stream.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The HTTP exchange failed before any frame arrived.
    #[error("stream request failed ({status}): {message}")]
    Start { status: u16, message: String },

    /// The backend sent an explicit error frame mid-stream.
    #[error("{0}")]
    Frame(String),

    /// Reading from the underlying byte stream failed (connection drop).
    #[error("stream transport failed: {0}")]
    Transport(String),
}

/// Exclusive handle on a live chunked byte stream.
///
/// `release` must be idempotent-safe to call once; `consume_stream` wraps the
/// reader in a drop guard so it is called exactly once on every exit path.
#[async_trait]
pub trait ChunkReader: Send {
    /// Next byte block, or `None` once the stream is exhausted.
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError>;

    /// Release the underlying resource.
    fn release(&mut self);
}

/// `ChunkReader` over a reqwest response body.
pub struct HttpChunkReader {
    stream: Option<BoxStream<'static, Result<Bytes, reqwest::Error>>>,
}

impl HttpChunkReader {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            stream: Some(response.bytes_stream().boxed()),
        }
    }
}

#[async_trait]
impl ChunkReader for HttpChunkReader {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, StreamError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes)),
            Some(Err(e)) => Err(StreamError::Transport(e.to_string())),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.stream = None;
    }
}

/// Consume a streaming response to completion.
///
/// `on_chunk` is invoked synchronously for every plain-text delta, in byte
/// order, with the delta and the text accumulated so far. The future resolves
/// with the post-filtered accumulated text once a `done` frame is seen or the
/// stream ends; an error frame or transport failure rejects the whole call
/// and the partial text is discarded (callers wanting partials must capture
/// them via `on_chunk`).
pub async fn consume_stream<R, F>(reader: R, mut on_chunk: F) -> Result<String, StreamError>
where
    R: ChunkReader,
    F: FnMut(&str, &str),
{
    let mut guard = ReaderGuard { reader };
    let mut decoder = Utf8Decoder::default();
    let mut pending = String::new();
    let mut accumulated = String::new();

    loop {
        let chunk = match guard.reader.next_chunk().await? {
            Some(chunk) => chunk,
            None => break,
        };
        pending.push_str(&decoder.push(&chunk));

        while let Some(newline) = pending.find('\n') {
            let line: String = pending.drain(..=newline).collect();
            if let Step::Done = apply_line(&line, &mut accumulated, &mut on_chunk)? {
                return Ok(strip_reasoning(&accumulated));
            }
        }
    }

    // Trailing line without a newline, then end-of-stream without an explicit
    // `done` frame: tolerated, the accumulated text is the result.
    if !pending.is_empty() {
        let line = std::mem::take(&mut pending);
        if let Step::Done = apply_line(&line, &mut accumulated, &mut on_chunk)? {
            return Ok(strip_reasoning(&accumulated));
        }
    }
    Ok(strip_reasoning(&accumulated))
}

/// What a processed line means for the consume loop.
enum Step {
    Continue,
    Done,
}

fn apply_line<F>(line: &str, accumulated: &mut String, on_chunk: &mut F) -> Result<Step, StreamError>
where
    F: FnMut(&str, &str),
{
    match parse_frame(line.trim_end_matches(['\n', '\r'])) {
        None => Ok(Step::Continue),
        Some(Frame::Control(Signal::Error(message))) => Err(StreamError::Frame(message)),
        Some(Frame::Control(Signal::Done)) => Ok(Step::Done),
        Some(Frame::Text(delta)) => {
            accumulated.push_str(&delta);
            on_chunk(&delta, accumulated);
            Ok(Step::Continue)
        }
    }
}

/// One parsed wire frame.
#[derive(Debug, PartialEq)]
enum Frame {
    Control(Signal),
    Text(String),
}

/// Structured signals the backend can embed in a frame.
#[derive(Debug, PartialEq)]
enum Signal {
    Error(String),
    Done,
}

/// Classify a wire line.
///
/// Control frames are decided by a try-parse: only a JSON *object* carrying
/// `error` or a truthy `done` counts. Scalars that happen to be valid JSON
/// (a bare number, a quoted word) are ordinary text deltas, exactly like
/// lines that fail to parse. Blank lines are frame separators.
fn parse_frame(line: &str) -> Option<Frame> {
    if line.is_empty() {
        return None;
    }
    let payload = match line.strip_prefix(FRAME_PREFIX) {
        Some(rest) => rest.strip_prefix(' ').unwrap_or(rest),
        None => line,
    };
    if payload.is_empty() {
        return None;
    }

    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(payload) {
        if let Some(error) = map.get("error")
            && !error.is_null()
        {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Some(Frame::Control(Signal::Error(message)));
        }
        if map.get("done").and_then(Value::as_bool) == Some(true) {
            return Some(Frame::Control(Signal::Done));
        }
    }

    Some(Frame::Text(payload.to_string()))
}

/// Incremental UTF-8 decoder that holds incomplete multi-byte sequences
/// across reads. Truly invalid sequences become replacement characters.
#[derive(Default)]
struct Utf8Decoder {
    partial: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.partial.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.partial) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.partial.clear();
                    break;
                }
                Err(e) => {
                    let valid_len = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.partial[..valid_len]));
                    match e.error_len() {
                        Some(invalid_len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.partial.drain(..valid_len + invalid_len);
                        }
                        None => {
                            // Incomplete sequence at the tail, wait for more bytes.
                            self.partial.drain(..valid_len);
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

static THINK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());
static THINK_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```think\s*\n.*?\n```").unwrap());
static THINK_MARKER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)```think\s*```").unwrap());
static EXTRA_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n\s*\n\s*\n+").unwrap());

/// Strip hidden reasoning markup from a finished reply.
///
/// Removes `<think>...</think>` segments and `think` code fences, then
/// collapses the blank-line runs they leave behind.
pub fn strip_reasoning(text: &str) -> String {
    let text = THINK_TAG.replace_all(text, "");
    let text = THINK_FENCE.replace_all(&text, "");
    let text = THINK_MARKER.replace_all(&text, "");
    let text = EXTRA_BLANK_LINES.replace_all(&text, "\n\n");
    text.trim().to_string()
}

struct ReaderGuard<R: ChunkReader> {
    reader: R,
}

impl<R: ChunkReader> Drop for ReaderGuard<R> {
    fn drop(&mut self) {
        self.reader.release();
    }
}
