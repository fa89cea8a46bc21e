//! Provider backends.
//!
//! Each module speaks one backend's wire protocol and normalizes it to the
//! shared [`crate::llm::provider::LLMProvider`] contract.

pub mod anthropic;
pub mod gemini;
pub mod llamacpp;
pub mod ollama;
pub mod openai;
pub mod qwen;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use llamacpp::LlamaCppProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAIProvider;
pub use qwen::QwenProvider;
