//! woocode-core: a unified backend layer for LLM-driven coding sessions.
//!
//! The crate normalizes several very different model backends, hosted HTTP
//! APIs and locally spawned processes alike, behind one provider contract:
//!
//! - [`llm::provider::LLMProvider`] is the contract every backend
//!   implements: describe itself, initialize, probe availability, list
//!   models, generate, and stream.
//! - [`llm::registry::ProviderRegistry`] owns the backend set, activates
//!   backends on demand, and auto-detects the first usable one.
//! - [`schema`] carries the external rich content schema and its lossless
//!   converters to and from the internal message model.
//! - [`session::ChatSession`] ties it together: history, streaming with
//!   cancellation, and provider switching mid-conversation.

pub mod config;
pub mod llm;
pub mod schema;
pub mod session;

pub use llm::error::LLMError;
pub use llm::provider::{
    ContentPart, FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, Message,
    MessageRole, ModelInfo, StreamEvent, ToolCall, Usage,
};
pub use llm::registry::{ProviderEntry, ProviderRegistry};
pub use schema::types::{Content, GenerateRequest, GenerateResponse, Part};
pub use session::{CancelHandle, CancelToken, ChatSession, SessionEvent};
