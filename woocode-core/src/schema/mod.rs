//! Rich content schema and its converters

pub mod convert;
pub mod types;

pub use convert::{content_to_message, message_to_content, part_to_external, part_to_internal};
pub use types::{
    Blob, CodeExecutionResult, Content, ExecutableCode, FunctionCall, FunctionResponse,
    GenerateRequest, GenerateResponse, GenerationConfig, Part,
};
