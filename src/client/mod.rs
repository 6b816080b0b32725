//! HTTP client for the local backend service.
//!
//! `ApiClient` is the UI-facing surface: it asks the endpoint resolver for a
//! base address, issues the request, and routes streaming bodies through the
//! stream consumer. Progress reads go through the TTL request cache so
//! multiple mounted views polling the same conversation share one fetch.

mod error;

pub use error::{ClientError, Result};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::api::{
    AckResponse, ChatRequest, ChatResponse, ConversationSettings, ConversationSettingsResponse,
    ConversationSummary, HealthResponse, LanguageResponse, ListConversationsResponse,
    StoryGenerateRequest, StoryProgress, StoryProgressResponse,
};
use crate::cache::RequestCache;
use crate::resolver::EndpointResolver;
use crate::stream::{HttpChunkReader, StreamError, consume_stream};

/// Default reuse window for progress reads.
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_millis(1000);

/// HTTP client for the backend service.
pub struct ApiClient {
    resolver: Arc<EndpointResolver>,
    http: reqwest::Client,
    progress_cache: RequestCache<String, StoryProgress, ClientError>,
    progress_ttl: Duration,
}

impl ApiClient {
    /// Create a client over a shared resolver.
    ///
    /// Creating a consumer schedules the resolver's idle bootstrap, so
    /// discovery happens even if no request is made for a while.
    pub fn new(resolver: Arc<EndpointResolver>) -> Self {
        Self::with_progress_ttl(resolver, DEFAULT_PROGRESS_TTL)
    }

    pub fn with_progress_ttl(resolver: Arc<EndpointResolver>, progress_ttl: Duration) -> Self {
        resolver.spawn_idle_bootstrap();
        Self {
            resolver,
            http: reqwest::Client::new(),
            progress_cache: RequestCache::new(),
            progress_ttl,
        }
    }

    /// Check that the backend answers its health endpoint.
    pub async fn health(&self) -> Result<()> {
        let base = self.base_url().await?;
        let response = self.http.get(format!("{base}/api/health")).send().await?;
        let body: HealthResponse = self.json_response(response).await?;
        checked(body.success, body.error, ())
    }

    // ------------------------------------------------------------------------
    // Chat
    // ------------------------------------------------------------------------

    /// Send a chat message and wait for the full reply (non-streaming).
    pub async fn chat(&self, request: &ChatRequest) -> Result<String> {
        let base = self.base_url().await?;
        let response = self
            .http
            .post(format!("{base}/api/chat"))
            .json(request)
            .send()
            .await?;

        let body: ChatResponse = self.json_response(response).await?;
        checked(body.success, body.error, body.response.unwrap_or_default())
    }

    /// Send a chat message and stream the reply.
    ///
    /// `on_chunk` receives each text delta along with the accumulated reply
    /// so far; the returned string is the complete, post-filtered reply.
    pub async fn chat_stream<F>(&self, request: &ChatRequest, on_chunk: F) -> Result<String>
    where
        F: FnMut(&str, &str),
    {
        self.stream_endpoint("/api/chat-stream", request, on_chunk)
            .await
    }

    /// Generate the next story section, streaming the prose as it is written.
    pub async fn generate_story_stream<F>(
        &self,
        request: &StoryGenerateRequest,
        on_chunk: F,
    ) -> Result<String>
    where
        F: FnMut(&str, &str),
    {
        self.stream_endpoint("/api/story/generate-stream", request, on_chunk)
            .await
    }

    // ------------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------------

    /// List all conversations.
    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let base = self.base_url().await?;
        let response = self
            .http
            .get(format!("{base}/api/conversations/list"))
            .send()
            .await?;

        let body: ListConversationsResponse = self.json_response(response).await?;
        checked(body.success, body.error, body.conversations)
    }

    /// Fetch the settings for one conversation.
    pub async fn conversation_settings(
        &self,
        conversation_id: &str,
    ) -> Result<ConversationSettings> {
        let base = self.base_url().await?;
        let response = self
            .http
            .get(format!("{base}/api/conversation/settings"))
            .query(&[("conversation_id", conversation_id)])
            .send()
            .await?;

        let body: ConversationSettingsResponse = self.json_response(response).await?;
        checked(body.success, body.error, body.settings.unwrap_or_default())
    }

    /// Save the settings for one conversation.
    pub async fn save_conversation_settings(
        &self,
        conversation_id: &str,
        settings: &ConversationSettings,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct SaveSettingsRequest<'a> {
            conversation_id: &'a str,
            #[serde(flatten)]
            settings: &'a ConversationSettings,
        }

        let base = self.base_url().await?;
        let response = self
            .http
            .post(format!("{base}/api/conversation/settings"))
            .json(&SaveSettingsRequest {
                conversation_id,
                settings,
            })
            .send()
            .await?;

        let body: AckResponse = self.json_response(response).await?;
        checked(body.success, body.error, ())
    }

    /// Fetch the story progress for one conversation.
    ///
    /// Coalesced: concurrent calls for the same conversation share one
    /// request, and a settled result is reused for the configured TTL.
    pub async fn story_progress(&self, conversation_id: &str) -> Result<StoryProgress> {
        let base = self.base_url().await?;
        let http = self.http.clone();
        let id = conversation_id.to_string();

        let result = self
            .progress_cache
            .get_or_fetch(id.clone(), self.progress_ttl, move || async move {
                let response = http
                    .get(format!("{base}/api/conversation/progress"))
                    .query(&[("conversation_id", id.as_str())])
                    .send()
                    .await
                    .map_err(ClientError::from)?;
                let body: StoryProgressResponse = json_body(response).await?;
                match (body.success, body.progress) {
                    (true, Some(progress)) => Ok(progress),
                    (true, None) => Err(ClientError::Backend("progress missing".to_string())),
                    (false, _) => Err(ClientError::Backend(
                        body.error.unwrap_or_else(|| "unknown error".to_string()),
                    )),
                }
            })
            .await;

        result.map_err(ClientError::from)
    }

    // ------------------------------------------------------------------------
    // App settings / admin
    // ------------------------------------------------------------------------

    /// Fetch the configured UI language.
    pub async fn app_language(&self) -> Result<String> {
        let base = self.base_url().await?;
        let response = self
            .http
            .get(format!("{base}/api/app-settings/language"))
            .send()
            .await?;

        let body: LanguageResponse = self.json_response(response).await?;
        checked(body.success, body.error, body.language.unwrap_or_default())
    }

    /// Ask the backend to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        let base = self.base_url().await?;
        let response = self.http.post(format!("{base}/api/stop")).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(self.parse_error(response).await)
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    async fn base_url(&self) -> Result<String> {
        Ok(self.resolver.wait_for_resolution().await?)
    }

    async fn stream_endpoint<B, F>(&self, path: &str, request: &B, on_chunk: F) -> Result<String>
    where
        B: Serialize,
        F: FnMut(&str, &str),
    {
        let base = self.base_url().await?;
        let response = self
            .http
            .post(format!("{base}{path}"))
            .json(request)
            .send()
            .await?;

        // A non-OK status before streaming begins is a start-up failure,
        // reported with the server's message when one is present.
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = match response.json::<AckResponse>().await {
                Ok(body) => body.error.unwrap_or_else(|| format!("HTTP {status}")),
                Err(_) => format!("HTTP {status}"),
            };
            return Err(StreamError::Start { status, message }.into());
        }

        debug!(path, "consuming response stream");
        let reader = HttpChunkReader::new(response);
        Ok(consume_stream(reader, on_chunk).await?)
    }

    /// Parse a successful JSON response or convert the error response.
    async fn json_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(self.parse_error(response).await)
        }
    }

    async fn parse_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        match response.json::<AckResponse>().await {
            Ok(body) => ClientError::Api {
                status,
                message: body.error.unwrap_or_else(|| format!("HTTP {status}")),
            },
            Err(_) => ClientError::Api {
                status,
                message: format!("HTTP {status}"),
            },
        }
    }
}

/// Unwrap a `{ success, error }` envelope into the payload or the server's
/// message.
fn checked<T>(success: bool, error: Option<String>, value: T) -> Result<T> {
    if success {
        Ok(value)
    } else {
        Err(ClientError::Backend(
            error.unwrap_or_else(|| "unknown error".to_string()),
        ))
    }
}

async fn json_body<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        Ok(response.json().await.map_err(ClientError::from)?)
    } else {
        Err(ClientError::Api {
            status: status.as_u16(),
            message: format!("HTTP {}", status.as_u16()),
        })
    }
}
