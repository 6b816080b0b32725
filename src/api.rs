//! Wire types for the backend HTTP API.
//!
//! Every non-streaming endpoint answers with a `{ success, ...payload,
//! error }` envelope; each response struct here carries its own `success`
//! and `error` fields rather than a generic wrapper so payload fields stay
//! flat, the way the backend serializes them.

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Requests
// ----------------------------------------------------------------------------

/// Body for the chat and streaming-chat endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl ChatRequest {
    pub fn new(conversation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message: message.into(),
            provider: None,
            model: None,
            language: None,
        }
    }
}

/// Body for the streaming story-generation endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StoryGenerateRequest {
    pub conversation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ----------------------------------------------------------------------------
// Responses
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub success: bool,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListConversationsResponse {
    pub success: bool,
    #[serde(default)]
    pub conversations: Vec<ConversationSummary>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationSettingsResponse {
    pub success: bool,
    #[serde(default)]
    pub settings: Option<ConversationSettings>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StoryProgressResponse {
    pub success: bool,
    #[serde(default)]
    pub progress: Option<StoryProgress>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LanguageResponse {
    pub success: bool,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AckResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

// ----------------------------------------------------------------------------
// Payloads
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversationSettings {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub background: Option<String>,
    #[serde(default)]
    pub characters: Option<Vec<String>>,
    #[serde(default)]
    pub outline: Option<String>,
    #[serde(default)]
    pub allow_auto_generate_characters: Option<bool>,
}

/// Generation progress for one conversation's story.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoryProgress {
    pub conversation_id: String,
    #[serde(default)]
    pub current_section: u32,
    #[serde(default)]
    pub total_sections: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub outline_confirmed: bool,
}
