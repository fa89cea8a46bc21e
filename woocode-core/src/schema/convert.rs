//! Bidirectional conversion between the rich schema and the content model
//!
//! Pure, total, deterministic mappings. Role mapping is a bijection except
//! for one asymmetry: the external `model` role maps to internal
//! `Assistant` and back to `model`. This round-trips correctly and is
//! preserved as-is; unifying it would change observable provider request
//! shapes. External `assistant` is also accepted on input for callers that
//! never adopted the `model` spelling.

use crate::config::constants::message_roles;
use crate::llm::provider::{ContentPart, Message, MessageRole};

use super::types::{
    Blob, CodeExecutionResult, Content, ExecutableCode, FunctionCall, FunctionResponse, Part,
};

/// Map an external role string onto the content model. Unknown roles are
/// treated as user turns rather than rejected; conversion is total.
pub fn role_to_internal(role: &str) -> MessageRole {
    match role {
        message_roles::SYSTEM => MessageRole::System,
        message_roles::MODEL | message_roles::ASSISTANT => MessageRole::Assistant,
        message_roles::FUNCTION => MessageRole::Function,
        _ => MessageRole::User,
    }
}

/// Map an internal role back to the external spelling. `Assistant` becomes
/// `model`, the one non-identity leg of the mapping.
pub fn role_to_external(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => message_roles::SYSTEM,
        MessageRole::User => message_roles::USER,
        MessageRole::Assistant => message_roles::MODEL,
        MessageRole::Function => message_roles::FUNCTION,
    }
}

pub fn part_to_internal(part: &Part) -> ContentPart {
    match part {
        Part::Text { text } => ContentPart::Text { text: text.clone() },
        Part::InlineData { inline_data } => ContentPart::Image {
            mime_type: inline_data.mime_type.clone(),
            data: inline_data.data.clone(),
        },
        Part::FunctionCall { function_call } => ContentPart::FunctionCall {
            name: function_call.name.clone(),
            args: function_call.args.clone(),
        },
        Part::FunctionResponse { function_response } => ContentPart::FunctionResult {
            name: function_response.name.clone(),
            result: function_response.response.clone(),
        },
        Part::ExecutableCode { executable_code } => ContentPart::CodeExecution {
            code: executable_code.code.clone(),
            language: executable_code.language.clone(),
        },
        Part::CodeExecutionResult {
            code_execution_result,
        } => ContentPart::CodeExecutionResult {
            output: code_execution_result.output.clone(),
        },
        // Degrade rather than drop: the serialized form is still visible
        // to the provider as plain text.
        Part::Unknown(value) => ContentPart::Text {
            text: value.to_string(),
        },
    }
}

pub fn part_to_external(part: &ContentPart) -> Part {
    match part {
        ContentPart::Text { text } => Part::Text { text: text.clone() },
        ContentPart::Image { mime_type, data } => Part::InlineData {
            inline_data: Blob {
                mime_type: mime_type.clone(),
                data: data.clone(),
            },
        },
        ContentPart::FunctionCall { name, args } => Part::FunctionCall {
            function_call: FunctionCall {
                name: name.clone(),
                args: args.clone(),
            },
        },
        ContentPart::FunctionResult { name, result } => Part::FunctionResponse {
            function_response: FunctionResponse {
                name: name.clone(),
                response: result.clone(),
            },
        },
        ContentPart::CodeExecution { code, language } => Part::ExecutableCode {
            executable_code: ExecutableCode {
                language: language.clone(),
                code: code.clone(),
            },
        },
        ContentPart::CodeExecutionResult { output } => Part::CodeExecutionResult {
            code_execution_result: CodeExecutionResult {
                output: output.clone(),
            },
        },
    }
}

pub fn content_to_message(content: &Content) -> Message {
    let parts = content.parts.iter().map(part_to_internal).collect();
    Message::new(role_to_internal(&content.role), parts)
}

pub fn message_to_content(message: &Message) -> Content {
    Content {
        role: role_to_external(message.role).to_string(),
        parts: message.parts.iter().map(part_to_external).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn every_external_part() -> Vec<Part> {
        vec![
            Part::text("hello"),
            Part::InlineData {
                inline_data: Blob {
                    mime_type: "image/png".to_string(),
                    data: "aGVsbG8=".to_string(),
                },
            },
            Part::FunctionCall {
                function_call: FunctionCall {
                    name: "read_file".to_string(),
                    args: json!({"path": "src/main.rs"}),
                },
            },
            Part::FunctionResponse {
                function_response: FunctionResponse {
                    name: "read_file".to_string(),
                    response: json!({"content": "fn main() {}"}),
                },
            },
            Part::ExecutableCode {
                executable_code: ExecutableCode {
                    language: "python".to_string(),
                    code: "print(2 + 2)".to_string(),
                },
            },
            Part::CodeExecutionResult {
                code_execution_result: CodeExecutionResult {
                    output: "4".to_string(),
                },
            },
        ]
    }

    fn every_internal_part() -> Vec<ContentPart> {
        vec![
            ContentPart::text("hello"),
            ContentPart::Image {
                mime_type: "image/png".to_string(),
                data: "aGVsbG8=".to_string(),
            },
            ContentPart::FunctionCall {
                name: "read_file".to_string(),
                args: json!({"path": "src/main.rs"}),
            },
            ContentPart::FunctionResult {
                name: "read_file".to_string(),
                result: json!({"content": "fn main() {}"}),
            },
            ContentPart::CodeExecution {
                code: "print(2 + 2)".to_string(),
                language: "python".to_string(),
            },
            ContentPart::CodeExecutionResult {
                output: "4".to_string(),
            },
        ]
    }

    #[test]
    fn every_part_round_trips_externally() {
        for part in every_external_part() {
            let round_tripped = part_to_external(&part_to_internal(&part));
            assert_eq!(round_tripped, part);
        }
    }

    #[test]
    fn every_part_round_trips_internally() {
        for part in every_internal_part() {
            let round_tripped = part_to_internal(&part_to_external(&part));
            assert_eq!(round_tripped, part);
        }
    }

    #[test]
    fn unrecognized_parts_degrade_to_text() {
        let raw = json!({"fileData": {"fileUri": "gs://bucket/cat.png", "mimeType": "image/png"}});
        let part: Part = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(part, Part::Unknown(raw.clone()));

        match part_to_internal(&part) {
            ContentPart::Text { text } => {
                assert!(text.contains("fileData"));
                assert!(text.contains("gs://bucket/cat.png"));
            }
            other => panic!("expected text degradation, got {other:?}"),
        }
    }

    #[test]
    fn model_role_maps_to_assistant_and_back() {
        assert_eq!(role_to_internal("model"), MessageRole::Assistant);
        assert_eq!(role_to_external(MessageRole::Assistant), "model");
        // The lenient spelling converges on the same internal role.
        assert_eq!(role_to_internal("assistant"), MessageRole::Assistant);
    }

    #[test]
    fn remaining_roles_are_an_identity_mapping() {
        for role in ["system", "user", "function"] {
            assert_eq!(role_to_external(role_to_internal(role)), role);
        }
    }

    #[test]
    fn content_round_trips_through_the_message_model() {
        let content = Content {
            role: "model".to_string(),
            parts: every_external_part(),
        };
        let round_tripped = message_to_content(&content_to_message(&content));
        assert_eq!(round_tripped, content);
    }

    #[test]
    fn conversion_is_deterministic() {
        let content = Content::user_parts(every_external_part());
        assert_eq!(content_to_message(&content), content_to_message(&content));
    }
}
