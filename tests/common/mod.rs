//! Common test utilities: an in-process mock backend and client wiring.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use fabula::client::ApiClient;
use fabula::resolver::{BackendRuntime, EndpointResolver, PortQuery, SubscribeError};

// ============================================================================
// Mock Backend
// ============================================================================

#[derive(Default)]
pub struct MockState {
    pub progress_hits: AtomicUsize,
    pub chat_hits: AtomicUsize,
    pub saved_settings: Mutex<Option<Value>>,
}

pub struct MockBackend {
    pub port: u16,
    pub state: Arc<MockState>,
}

/// Spawn a mock backend on an ephemeral port.
pub async fn spawn_backend() -> MockBackend {
    let state = Arc::new(MockState::default());

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat))
        .route("/api/chat-stream", post(chat_stream))
        .route("/api/story/generate-stream", post(chat_stream))
        .route("/api/conversations/list", get(list_conversations))
        .route(
            "/api/conversation/settings",
            get(conversation_settings).post(save_settings),
        )
        .route("/api/conversation/progress", get(progress))
        .route("/api/app-settings/language", get(language))
        .route("/api/stop", post(stop))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockBackend { port, state }
}

async fn health() -> Json<Value> {
    Json(json!({"success": true}))
}

async fn chat(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    state.chat_hits.fetch_add(1, Ordering::SeqCst);
    let message = body["message"].as_str().unwrap_or_default();
    Json(json!({"success": true, "response": format!("echo: {message}")}))
}

/// Streams a scripted reply. The request message selects the script:
/// `"reject"` fails before any frame, `"fail"` emits an error frame
/// mid-stream, `"think"` wraps part of the reply in reasoning markup.
async fn chat_stream(Json(body): Json<Value>) -> Response {
    let message = body["message"].as_str().unwrap_or_default();

    if message == "reject" {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "error": "model unavailable"})),
        )
            .into_response();
    }

    let frames: Vec<&str> = match message {
        "fail" => vec![
            "data: partial\n\n",
            "data: {\"error\": \"boom\"}\n\n",
            "data: never delivered\n\n",
        ],
        "think" => vec![
            "data: <think>plotting the next\n\n",
            "data: scene</think>Once upon\n\n",
            "data:  a time\n\n",
            "data: {\"done\": true}\n\n",
        ],
        _ => vec![
            "data: Hello\n\n",
            "data:  world\n\n",
            "data: {\"done\": true}\n\n",
        ],
    };

    let chunks = frames
        .into_iter()
        .map(|f| Ok::<_, Infallible>(Bytes::from(f)));
    Body::from_stream(stream::iter(chunks)).into_response()
}

async fn list_conversations() -> Json<Value> {
    Json(json!({
        "success": true,
        "conversations": [
            {"conversation_id": "conv-1", "title": "Voyage", "updated_at": "2026-08-01T12:00:00Z"},
            {"conversation_id": "conv-2"},
        ]
    }))
}

/// Settings lookup; the id `"missing"` answers `success: false`.
async fn conversation_settings(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
    match params.get("conversation_id").map(String::as_str) {
        Some("missing") => Json(json!({"success": false, "error": "conversation not found"})),
        _ => Json(json!({
            "success": true,
            "settings": {
                "title": "Voyage",
                "background": "a sea tale",
                "allow_auto_generate_characters": true,
            }
        })),
    }
}

async fn save_settings(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    *state.saved_settings.lock().unwrap() = Some(body);
    Json(json!({"success": true}))
}

async fn progress(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    state.progress_hits.fetch_add(1, Ordering::SeqCst);
    let id = params
        .get("conversation_id")
        .cloned()
        .unwrap_or_default();
    Json(json!({
        "success": true,
        "progress": {
            "conversation_id": id,
            "current_section": 3,
            "total_sections": 12,
            "status": "writing",
            "outline_confirmed": true,
        }
    }))
}

async fn language() -> Json<Value> {
    Json(json!({"success": true, "language": "en"}))
}

async fn stop() -> Json<Value> {
    Json(json!({"success": true}))
}

// ============================================================================
// Client Wiring
// ============================================================================

/// Backend runtime that always reports a fixed port.
pub struct StaticRuntime {
    port: u16,
    ready_tx: broadcast::Sender<u16>,
}

impl StaticRuntime {
    pub fn new(port: u16) -> Self {
        let (ready_tx, _) = broadcast::channel(4);
        Self { port, ready_tx }
    }
}

#[async_trait]
impl BackendRuntime for StaticRuntime {
    async fn query_port(&self) -> PortQuery {
        PortQuery {
            success: true,
            port: Some(self.port),
        }
    }

    fn subscribe_ready(&self) -> Result<broadcast::Receiver<u16>, SubscribeError> {
        Ok(self.ready_tx.subscribe())
    }
}

/// Create an `ApiClient` resolved against the given mock backend port.
pub fn client_for(port: u16) -> ApiClient {
    let runtime = Arc::new(StaticRuntime::new(port));
    let resolver = EndpointResolver::new(runtime);
    ApiClient::new(resolver)
}
