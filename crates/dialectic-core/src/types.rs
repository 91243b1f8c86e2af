//! Core type definitions shared by adapters and the orchestrator

use crate::StageSlug;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Speaker of a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// A request for one logical exchange with a provider.
///
/// Owned by a single continuation loop; only `messages` grows between calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    pub provider_id: String,
    pub prompt_id: String,
    pub messages: Vec<ConversationMessage>,
}

impl ChatRequest {
    /// Build a request whose history is a single user turn carrying `message`
    pub fn new(
        message: impl Into<String>,
        provider_id: impl Into<String>,
        prompt_id: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            messages: vec![ConversationMessage::user(message.clone())],
            message,
            provider_id: provider_id.into(),
            prompt_id: prompt_id.into(),
        }
    }

    /// Replace the history, e.g. to prepend a system turn
    pub fn with_messages(mut self, messages: Vec<ConversationMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// Token accounting for one call or an accumulation of calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Add another call's prompt and completion counts
    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
    }

    /// Recompute `total_tokens` from its parts
    pub fn finalize(mut self) -> Self {
        self.total_tokens = self.prompt_tokens.saturating_add(self.completion_tokens);
        self
    }
}

/// Why a provider stopped generating
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FinishReason {
    Stop,
    Length,
    MaxTokens,
    Unknown,
    ToolCalls,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
            Self::MaxTokens => "max_tokens",
            Self::Unknown => "unknown",
            Self::ToolCalls => "tool_calls",
            Self::ContentFilter => "content_filter",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for FinishReason {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "stop" => Self::Stop,
            "length" => Self::Length,
            "max_tokens" => Self::MaxTokens,
            "unknown" => Self::Unknown,
            "tool_calls" => Self::ToolCalls,
            "content_filter" => Self::ContentFilter,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for FinishReason {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<FinishReason> for String {
    fn from(reason: FinishReason) -> Self {
        reason.as_str().to_string()
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single provider response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResponse {
    pub role: Role,
    pub content: String,
    pub provider_id: String,
    pub prompt_id: String,
    /// Absent when the provider did not report usage
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

impl AdapterResponse {
    /// An assistant response for `request`
    pub fn assistant(
        request: &ChatRequest,
        content: impl Into<String>,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            provider_id: request.provider_id.clone(),
            prompt_id: request.prompt_id.clone(),
            token_usage: None,
            finish_reason,
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    /// Reported usage, zero when absent
    pub fn usage(&self) -> TokenUsage {
        self.token_usage.unwrap_or_default()
    }
}

/// Provider API key. Passed through to adapters untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Read the key from an environment variable
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var(var).ok().filter(|k| !k.is_empty()).map(Self)
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey(***)")
    }
}

/// A model offered by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub id: String,
    pub display_name: String,
}

/// One model's output for one stage of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialecticContribution {
    pub id: String,
    pub session_id: String,
    pub stage: StageSlug,
    pub model_id: String,
    pub model_name: String,
    pub iteration_number: u32,
    /// Storage location of the content (`<session>/<iteration>/<stage>/<model>.md`)
    pub content_path: String,
    pub content: String,
    pub token_usage: TokenUsage,
    /// Number of continuation calls needed beyond the first
    pub continuations: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DialecticContribution {
    pub fn new(
        session_id: impl Into<String>,
        stage: StageSlug,
        model_id: impl Into<String>,
        model_name: impl Into<String>,
        iteration_number: u32,
    ) -> Self {
        let session_id = session_id.into();
        let model_id = model_id.into();
        let content_path = format!(
            "{}/{}/{}/{}.md",
            session_id, iteration_number, stage, model_id
        );
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            stage,
            model_id,
            model_name: model_name.into(),
            iteration_number,
            content_path,
            content: String::new(),
            token_usage: TokenUsage::default(),
            continuations: 0,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>, usage: TokenUsage) -> Self {
        self.content = content.into();
        self.token_usage = usage;
        self
    }
}
