//! Google Gemini provider
//!
//! Speaks `generateContent` / `streamGenerateContent?alt=sse`. Gemini only
//! accepts `user`/`model` conversation roles: system messages are hoisted
//! into `systemInstruction`, assistant turns become `model` turns, and
//! function results travel as `functionResponse` parts inside `user` turns.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::{Value, json};
use tracing::warn;

use crate::config::constants::{env, models, providers, urls};
use crate::config::settings::{ProviderSettings, resolve_value};
use crate::llm::error::LLMError;
use crate::llm::provider::{
    ContentPart, FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, Message,
    MessageRole, ModelCapabilities, ModelInfo, StreamEvent, ToolCall, Usage,
};
use crate::llm::stream::drain_sse_events;

pub struct GeminiProvider {
    api_key: Option<String>,
    http_client: HttpClient,
    base_url: String,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            http_client: HttpClient::new(),
            base_url: urls::GEMINI_API_BASE.to_string(),
            model: models::google::DEFAULT_MODEL.to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let api_key = resolve_value(None, settings.api_key.clone(), env::GEMINI_API_KEY, None);
        let mut provider = Self::new(api_key);
        if let Some(base_url) = settings.base_url.clone() {
            provider.base_url = base_url;
        }
        if let Some(model) = settings.model.clone() {
            provider.model = model;
        }
        provider
    }

    fn api_key(&self) -> Result<&str, LLMError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| LLMError::configuration(providers::GEMINI, "GEMINI_API_KEY is not set"))
    }

    fn convert_request(&self, request: &LLMRequest) -> Value {
        let mut contents = Vec::new();
        let mut system_texts: Vec<String> = Vec::new();

        for message in &request.messages {
            match message.role {
                MessageRole::System => {
                    system_texts.push(message.text_lossy());
                }
                MessageRole::User | MessageRole::Assistant => {
                    let role = if message.role == MessageRole::Assistant {
                        "model"
                    } else {
                        "user"
                    };
                    let parts = message
                        .parts
                        .iter()
                        .map(message_part_to_wire)
                        .collect::<Vec<_>>();
                    if !parts.is_empty() {
                        contents.push(json!({"role": role, "parts": parts}));
                    }
                }
                MessageRole::Function => {
                    // Function results are sent straight through as
                    // functionResponse parts in a user turn.
                    let parts = message
                        .parts
                        .iter()
                        .map(|part| match part {
                            ContentPart::FunctionResult { name, result } => json!({
                                "functionResponse": {
                                    "name": name,
                                    "response": result,
                                }
                            }),
                            other => json!({"text": other.to_text_lossy()}),
                        })
                        .collect::<Vec<_>>();
                    contents.push(json!({"role": "user", "parts": parts}));
                }
            }
        }

        let mut body = json!({"contents": contents});

        if !system_texts.is_empty() {
            body["systemInstruction"] = json!({
                "parts": [{"text": system_texts.join("\n")}],
            });
        }

        let mut generation_config = json!({});
        if let Some(temperature) = request.temperature {
            generation_config["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            generation_config["topP"] = json!(top_p);
        }
        if let Some(top_k) = request.top_k {
            generation_config["topK"] = json!(top_k);
        }
        if let Some(max_tokens) = request.max_tokens {
            generation_config["maxOutputTokens"] = json!(max_tokens);
        }
        if let Some(stop_sequences) = &request.stop_sequences {
            generation_config["stopSequences"] = json!(stop_sequences);
        }
        if let Some(config) = generation_config.as_object() {
            if !config.is_empty() {
                body["generationConfig"] = generation_config;
            }
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                body["tools"] = json!([{"functionDeclarations": tools}]);
            }
        }

        body
    }

    fn parse_response(&self, response: &Value) -> Result<LLMResponse, LLMError> {
        let candidate = response
            .get("candidates")
            .and_then(|candidates| candidates.as_array())
            .and_then(|candidates| candidates.first())
            .ok_or_else(|| {
                LLMError::backend(providers::GEMINI, None, "response carried no candidates")
            })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        if let Some(parts) = candidate
            .get("content")
            .and_then(|value| value.get("parts"))
            .and_then(|value| value.as_array())
        {
            collect_parts(parts, &mut content, &mut tool_calls);
        }

        let native_reason = candidate.get("finishReason").and_then(|value| value.as_str());
        let finish_reason = if !tool_calls.is_empty() {
            FinishReason::ToolCalls
        } else {
            map_finish_reason(native_reason)
        };

        Ok(LLMResponse {
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            usage: parse_usage(response.get("usageMetadata")),
            finish_reason,
        })
    }
}

fn message_part_to_wire(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => json!({"text": text}),
        ContentPart::Image { mime_type, data } => json!({
            "inlineData": {"mimeType": mime_type, "data": data}
        }),
        ContentPart::FunctionCall { name, args } => json!({
            "functionCall": {"name": name, "args": args}
        }),
        // Remaining variants have no Gemini request equivalent; degrade to
        // text so they leave a trace.
        other => json!({"text": other.to_text_lossy()}),
    }
}

fn collect_parts(parts: &[Value], content: &mut String, tool_calls: &mut Vec<ToolCall>) {
    for part in parts {
        if let Some(text) = part.get("text").and_then(|value| value.as_str()) {
            content.push_str(text);
        }
        if let Some(call) = part.get("functionCall") {
            let name = call
                .get("name")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string();
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            if !name.is_empty() {
                tool_calls.push(ToolCall { name, args });
            }
        }
    }
}

/// Gemini's finish vocabulary onto the canonical reasons. Unknown values
/// are treated as a normal stop.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some(blocked @ ("SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT")) => {
            FinishReason::Error(blocked.to_string())
        }
        _ => FinishReason::Stop,
    }
}

fn parse_usage(metadata: Option<&Value>) -> Option<Usage> {
    let metadata = metadata?;
    let prompt_tokens = metadata.get("promptTokenCount")?.as_u64()? as u32;
    let completion_tokens = metadata
        .get("candidatesTokenCount")
        .and_then(|value| value.as_u64())
        .unwrap_or(0) as u32;
    let total_tokens = metadata
        .get("totalTokenCount")
        .and_then(|value| value.as_u64())
        .unwrap_or(u64::from(prompt_tokens + completion_tokens)) as u32;
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

#[async_trait]
impl LLMProvider for GeminiProvider {
    fn id(&self) -> &str {
        providers::GEMINI
    }

    fn description(&self) -> &str {
        "Google Gemini hosted API"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), LLMError> {
        self.api_key().map(|_| ())
    }

    async fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        Ok(models::google::SUPPORTED_MODELS
            .iter()
            .map(|id| {
                ModelInfo::new(id, id).with_capabilities(ModelCapabilities {
                    vision: true,
                    function_calling: true,
                    streaming: true,
                })
            })
            .collect())
    }

    async fn generate(&self, request: LLMRequest) -> Result<LLMResponse, LLMError> {
        let api_key = self.api_key()?;
        let body = self.convert_request(&request);
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, api_key
        );

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::GEMINI, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::GEMINI, Some(status), error_text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LLMError::backend(providers::GEMINI, None, err.to_string()))?;

        self.parse_response(&payload)
    }

    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError> {
        let api_key = self.api_key()?;
        let body = self.convert_request(&request);
        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, request.model, api_key
        );

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::GEMINI, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::GEMINI, Some(status), error_text));
        }

        let stream = try_stream! {
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut pending_calls: Vec<ToolCall> = Vec::new();
            let mut usage: Option<Usage> = None;
            let mut terminal: Option<FinishReason> = None;

            'read: while let Some(chunk_result) = body_stream.next().await {
                let chunk =
                    chunk_result.map_err(|err| LLMError::network(providers::GEMINI, err))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                let (events, done) = drain_sse_events(&mut buffer);
                for payload in events {
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(provider = providers::GEMINI, %err, "skipping malformed stream frame");
                            continue;
                        }
                    };

                    if let Some(chunk_usage) = parse_usage(value.get("usageMetadata")) {
                        usage = Some(chunk_usage);
                    }

                    let Some(candidate) = value
                        .get("candidates")
                        .and_then(|candidates| candidates.as_array())
                        .and_then(|candidates| candidates.first())
                    else {
                        continue;
                    };

                    let mut delta = String::new();
                    if let Some(parts) = candidate
                        .get("content")
                        .and_then(|content| content.get("parts"))
                        .and_then(|parts| parts.as_array())
                    {
                        collect_parts(parts, &mut delta, &mut pending_calls);
                    }
                    if !delta.is_empty() {
                        yield StreamEvent::delta(delta);
                    }

                    if let Some(reason) = candidate.get("finishReason").and_then(|value| value.as_str()) {
                        terminal = Some(if pending_calls.is_empty() {
                            map_finish_reason(Some(reason))
                        } else {
                            FinishReason::ToolCalls
                        });
                        break 'read;
                    }
                }

                if done {
                    break;
                }
            }

            let finish_reason = terminal.unwrap_or(FinishReason::Stop);
            yield StreamEvent {
                content_delta: String::new(),
                finish_reason: Some(finish_reason),
                tool_calls: if pending_calls.is_empty() {
                    None
                } else {
                    Some(pending_calls)
                },
                usage,
            };
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reasons_cover_the_native_vocabulary() {
        assert_eq!(map_finish_reason(Some("STOP")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("MAX_TOKENS")), FinishReason::Length);
        assert_eq!(
            map_finish_reason(Some("SAFETY")),
            FinishReason::Error("SAFETY".to_string())
        );
        assert_eq!(
            map_finish_reason(Some("RECITATION")),
            FinishReason::Error("RECITATION".to_string())
        );
        // Unknown and absent reasons default to a normal stop.
        assert_eq!(map_finish_reason(Some("SOMETHING_NEW")), FinishReason::Stop);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn system_messages_are_hoisted_into_system_instruction() {
        let provider = GeminiProvider::new(Some("key".to_string()));
        let request = LLMRequest {
            model: models::google::DEFAULT_MODEL.to_string(),
            messages: vec![
                Message::system("You are helpful"),
                Message::user("2+2?"),
                Message::assistant("4"),
            ],
            ..LLMRequest::default()
        };
        let body = provider.convert_request(&request);

        let instruction = body["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap_or_default();
        assert_eq!(instruction, "You are helpful");

        let contents = body["contents"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
    }

    #[test]
    fn function_results_become_function_response_user_turns() {
        let provider = GeminiProvider::new(Some("key".to_string()));
        let request = LLMRequest {
            model: models::google::DEFAULT_MODEL.to_string(),
            messages: vec![Message::function_result(
                "read_file",
                serde_json::json!({"content": "ok"}),
            )],
            ..LLMRequest::default()
        };
        let body = provider.convert_request(&request);
        let contents = body["contents"].as_array().map(Vec::as_slice).unwrap_or(&[]);
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(
            contents[0]["parts"][0]["functionResponse"]["name"],
            "read_file"
        );
    }

    #[test]
    fn response_with_function_call_maps_to_tool_calls() {
        let provider = GeminiProvider::new(Some("key".to_string()));
        let payload = serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "list_files", "args": {"path": "."}}}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 5, "totalTokenCount": 12}
        });
        let response = provider.parse_response(&payload).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        let calls = response.tool_calls.unwrap_or_default();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_files");
        assert_eq!(response.usage.map(|usage| usage.total_tokens), Some(12));
    }
}
