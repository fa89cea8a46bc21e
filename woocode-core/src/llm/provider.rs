//! Provider contract and the backend-agnostic content model
//!
//! Every provider implementation normalizes its own wire protocol onto the
//! types in this module. Messages are built from ordered content parts
//! rather than a flat string so that images, function calls, and code
//! execution results survive a round trip through the layer; a provider that
//! cannot express a part degrades it to text via
//! [`ContentPart::to_text_lossy`] instead of dropping it.
//!
//! ## Role handling per provider
//!
//! - **Gemini** speaks `user`/`model` turns plus a separate
//!   `systemInstruction`; function results travel as `functionResponse`
//!   parts inside `user` turns.
//! - **OpenAI** accepts `system`/`user`/`assistant`; function results are
//!   folded into user-turn text.
//! - **Anthropic** requires strict user/assistant alternation with the
//!   system prompt hoisted into the `system` field.
//! - The local providers follow OpenAI-style roles or ChatML.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::LLMError;

/// Roles of the internal content model. Fixed at message creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Function,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        use crate::config::constants::message_roles;
        match self {
            MessageRole::System => message_roles::SYSTEM,
            MessageRole::User => message_roles::USER,
            MessageRole::Assistant => message_roles::ASSISTANT,
            MessageRole::Function => message_roles::FUNCTION,
        }
    }
}

/// One unit of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        mime_type: String,
        /// Base64 payload, passed through untouched.
        data: String,
    },
    FunctionCall {
        name: String,
        args: Value,
    },
    FunctionResult {
        name: String,
        result: Value,
    },
    CodeExecution {
        code: String,
        language: String,
    },
    CodeExecutionResult {
        output: String,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Textual rendition used when a provider lacks the capability for a
    /// part. Keeps a trace of the original payload instead of dropping it.
    pub fn to_text_lossy(&self) -> String {
        match self {
            ContentPart::Text { text } => text.clone(),
            ContentPart::Image { mime_type, .. } => {
                format!("[image: {mime_type}]")
            }
            ContentPart::FunctionCall { name, args } => {
                format!("[function call {name}({args})]")
            }
            ContentPart::FunctionResult { name, result } => {
                format!("[function result {name}: {result}]")
            }
            ContentPart::CodeExecution { code, language } => {
                format!("```{language}\n{code}\n```")
            }
            ContentPart::CodeExecutionResult { output } => {
                format!("[execution output]\n{output}")
            }
        }
    }
}

/// A single conversation message. Immutable once appended to a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub parts: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<ContentPart>) -> Self {
        Self {
            role,
            parts,
            name: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![ContentPart::text(text)])
    }

    pub fn function_result(name: impl Into<String>, result: Value) -> Self {
        let name = name.into();
        let mut message = Self::new(
            MessageRole::Function,
            vec![ContentPart::FunctionResult {
                name: name.clone(),
                result,
            }],
        );
        message.name = Some(name);
        message
    }

    /// Concatenation of the message's textual parts, with non-text parts
    /// degraded through [`ContentPart::to_text_lossy`].
    pub fn text_lossy(&self) -> String {
        self.parts
            .iter()
            .map(ContentPart::to_text_lossy)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Function-call parts carried by this message, if any.
    pub fn function_calls(&self) -> Vec<(&str, &Value)> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::FunctionCall { name, args } => Some((name.as_str(), args)),
                _ => None,
            })
            .collect()
    }
}

/// Tool declaration forwarded to providers that support function calling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments, passed through opaquely.
    pub parameters: Value,
}

/// A function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: Value,
}

/// Token accounting reported by a provider, when it reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Canonical completion reasons. Every provider's native vocabulary maps
/// onto these four; unknown native values map to `Stop`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    Error(String),
}

/// Generation parameters for one call. Built per request, never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LLMRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub tools: Option<Vec<FunctionDeclaration>>,
}

/// A complete (non-streaming) generation result.
#[derive(Debug, Clone, PartialEq)]
pub struct LLMResponse {
    pub content: String,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

/// One normalized increment of a streaming response.
///
/// A stream is a finite sequence of these, terminated by exactly one event
/// whose `finish_reason` is set. Transport close without a terminal frame is
/// treated as an implicit `Stop`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub content_delta: String,
    pub finish_reason: Option<FinishReason>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub usage: Option<Usage>,
}

impl StreamEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            content_delta: text.into(),
            finish_reason: None,
            tool_calls: None,
            usage: None,
        }
    }

    pub fn finished(reason: FinishReason) -> Self {
        Self {
            content_delta: String::new(),
            finish_reason: Some(reason),
            tool_calls: None,
            usage: None,
        }
    }
}

/// Lazy, finite, non-restartable event sequence produced by
/// [`LLMProvider::stream`]. Dropping it early releases the underlying
/// connection.
pub type LLMStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LLMError>> + Send>>;

/// Metadata describing one model a provider can serve. Display and
/// selection only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    pub capabilities: ModelCapabilities,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub vision: bool,
    pub function_calling: bool,
    pub streaming: bool,
}

impl ModelInfo {
    pub fn new(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            description: None,
            context_length: None,
            capabilities: ModelCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// Contract every provider implementation satisfies.
///
/// Methods take `&self`; providers that own mutable state (a child process
/// handle) guard it internally so one instance can serve concurrent
/// sessions sharing a registry.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stable provider id, also the registry key.
    fn id(&self) -> &str;

    /// One-line description for provider listings.
    fn description(&self) -> &str;

    /// Model used when a request does not name one.
    fn default_model(&self) -> &str;

    /// Whether tool declarations are forwarded to this provider. Providers
    /// without support silently omit tools from outgoing requests.
    fn supports_tools(&self) -> bool {
        true
    }

    /// One-time setup: credential discovery, reachability probe, local
    /// server bootstrap. Fails with `Configuration` when credentials or
    /// binaries are absent; the registry catches such failures.
    async fn initialize(&self) -> Result<(), LLMError>;

    /// Idempotent reachability check. Never errors; any internal fault is
    /// reported as unavailable.
    async fn is_available(&self) -> bool;

    /// Models this provider can serve. Implementations fall back to a
    /// static catalogue on transport failure; listing is advisory, not
    /// critical path.
    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError>;

    /// Single-shot generation.
    async fn generate(&self, request: LLMRequest) -> Result<LLMResponse, LLMError>;

    /// Incremental generation. The returned stream suspends at each network
    /// read and ends when the provider signals completion or the transport
    /// closes.
    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError>;

    /// Release provider-owned resources (local child processes). Must not
    /// panic or propagate failures.
    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lossy_text_keeps_a_trace_of_every_part() {
        let parts = vec![
            ContentPart::text("hello"),
            ContentPart::Image {
                mime_type: "image/png".to_string(),
                data: "aGk=".to_string(),
            },
            ContentPart::FunctionCall {
                name: "read_file".to_string(),
                args: json!({"path": "a.rs"}),
            },
            ContentPart::CodeExecutionResult {
                output: "ok".to_string(),
            },
        ];
        let message = Message::new(MessageRole::User, parts);
        let text = message.text_lossy();
        assert!(text.contains("hello"));
        assert!(text.contains("image/png"));
        assert!(text.contains("read_file"));
        assert!(text.contains("ok"));
    }

    #[test]
    fn function_result_message_carries_its_name() {
        let message = Message::function_result("run_tests", json!({"passed": true}));
        assert_eq!(message.role, MessageRole::Function);
        assert_eq!(message.name.as_deref(), Some("run_tests"));
    }

    #[test]
    fn function_calls_are_extracted_in_order() {
        let message = Message::new(
            MessageRole::Assistant,
            vec![
                ContentPart::FunctionCall {
                    name: "first".to_string(),
                    args: json!({}),
                },
                ContentPart::text("and"),
                ContentPart::FunctionCall {
                    name: "second".to_string(),
                    args: json!({}),
                },
            ],
        );
        let calls = message.function_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "first");
        assert_eq!(calls[1].0, "second");
    }
}
