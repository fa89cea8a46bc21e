//! Unified LLM backend layer.
//!
//! Everything above this module speaks one vocabulary: [`Message`] in,
//! [`LLMResponse`] or a stream of [`StreamEvent`] out, regardless of which
//! backend is doing the work.

pub mod error;
pub mod error_display;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod stream;

pub use error::LLMError;
pub use error_display::{format_provider_error, format_provider_warning};
pub use provider::{
    ContentPart, FinishReason, FunctionDeclaration, LLMProvider, LLMRequest, LLMResponse,
    LLMStream, Message, MessageRole, ModelCapabilities, ModelInfo, StreamEvent, ToolCall, Usage,
};
pub use registry::{ProviderEntry, ProviderRegistry};
