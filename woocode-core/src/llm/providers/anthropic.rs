//! Anthropic messages provider
//!
//! `POST /v1/messages` with SSE streaming. The event stream is typed
//! (`message_start`, `content_block_start`, `content_block_delta`,
//! `message_delta`, `message_stop`, `ping`); each frame's payload carries
//! its own `type` field, so the `event:` header line can be ignored.
//!
//! Anthropic requires strict user/assistant alternation starting with a
//! user turn, with the system prompt hoisted into the `system` field.
//! [`shape_messages`] enforces that by merging consecutive same-role turns
//! and folding function results into user text.

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::{Value, json};
use tracing::warn;

use crate::config::constants::{defaults, env, models, providers, urls};
use crate::config::settings::{ProviderSettings, resolve_value};
use crate::llm::error::LLMError;
use crate::llm::provider::{
    FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, Message, MessageRole,
    ModelCapabilities, ModelInfo, StreamEvent, ToolCall, Usage,
};
use crate::llm::stream::drain_sse_events;

pub struct AnthropicProvider {
    api_key: Option<String>,
    http_client: HttpClient,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            http_client: HttpClient::new(),
            base_url: urls::ANTHROPIC_API_BASE.to_string(),
            model: models::anthropic::DEFAULT_MODEL.to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let api_key = resolve_value(None, settings.api_key.clone(), env::ANTHROPIC_API_KEY, None);
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
        self.api_key.as_deref().ok_or_else(|| {
            LLMError::configuration(providers::ANTHROPIC, "ANTHROPIC_API_KEY is not set")
        })
    }

    fn convert_request(&self, request: &LLMRequest, stream: bool) -> Value {
        let (system, messages) = shape_messages(&request.messages);

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(defaults::ANTHROPIC_MAX_TOKENS),
            "stream": stream,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(top_k) = request.top_k {
            body["top_k"] = json!(top_k);
        }
        if let Some(stop_sequences) = &request.stop_sequences {
            body["stop_sequences"] = json!(stop_sequences);
        }
        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let tools_json: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "name": tool.name,
                            "description": tool.description,
                            "input_schema": tool.parameters,
                        })
                    })
                    .collect();
                body["tools"] = Value::Array(tools_json);
            }
        }

        body
    }

    fn parse_response(&self, response: &Value) -> Result<LLMResponse, LLMError> {
        let blocks = response
            .get("content")
            .and_then(|content| content.as_array())
            .ok_or_else(|| {
                LLMError::backend(providers::ANTHROPIC, None, "response carried no content")
            })?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|value| value.as_str()) {
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|value| value.as_str()) {
                        content.push_str(text);
                    }
                }
                Some("tool_use") => {
                    let name = block
                        .get("name")
                        .and_then(|value| value.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let args = block.get("input").cloned().unwrap_or_else(|| json!({}));
                    if !name.is_empty() {
                        tool_calls.push(ToolCall { name, args });
                    }
                }
                _ => {}
            }
        }

        let finish_reason =
            map_finish_reason(response.get("stop_reason").and_then(|value| value.as_str()));

        Ok(LLMResponse {
            content,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
            usage: parse_usage(response.get("usage")),
            finish_reason,
        })
    }
}

/// Hoist system messages into the `system` field and enforce strict
/// user/assistant alternation: function results become user turns and
/// consecutive same-role turns are merged.
fn shape_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system_texts = Vec::new();
    let mut shaped: Vec<(String, String)> = Vec::new();

    for message in messages {
        let (role, text) = match message.role {
            MessageRole::System => {
                system_texts.push(message.text_lossy());
                continue;
            }
            MessageRole::User | MessageRole::Function => ("user", message.text_lossy()),
            MessageRole::Assistant => ("assistant", message.text_lossy()),
        };
        if text.is_empty() {
            continue;
        }
        match shaped.last_mut() {
            Some((last_role, last_text)) if last_role == role => {
                last_text.push_str("\n\n");
                last_text.push_str(&text);
            }
            _ => shaped.push((role.to_string(), text)),
        }
    }

    // The API rejects conversations that open with an assistant turn.
    if shaped
        .first()
        .map(|(role, _)| role == "assistant")
        .unwrap_or(false)
    {
        shaped.insert(0, ("user".to_string(), "(continued)".to_string()));
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(system_texts.join("\n"))
    };
    let messages = shaped
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect();
    (system, messages)
}

/// Anthropic's stop vocabulary onto the canonical reasons; unknown values
/// default to a normal stop.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        Some("refusal") => FinishReason::Error("refusal".to_string()),
        // end_turn, stop_sequence, pause_turn, anything newer
        _ => FinishReason::Stop,
    }
}

fn parse_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    let prompt_tokens = usage
        .get("input_tokens")
        .and_then(|value| value.as_u64())
        .unwrap_or(0) as u32;
    let completion_tokens = usage
        .get("output_tokens")
        .and_then(|value| value.as_u64())
        .unwrap_or(0) as u32;
    if prompt_tokens == 0 && completion_tokens == 0 {
        return None;
    }
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn id(&self) -> &str {
        providers::ANTHROPIC
    }

    fn description(&self) -> &str {
        "Anthropic hosted API"
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
        Ok(models::anthropic::SUPPORTED_MODELS
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
        let api_key = self.api_key()?.to_string();
        let body = self.convert_request(&request, false);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", defaults::ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::ANTHROPIC, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(
                providers::ANTHROPIC,
                Some(status),
                error_text,
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LLMError::backend(providers::ANTHROPIC, None, err.to_string()))?;

        self.parse_response(&payload)
    }

    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError> {
        let api_key = self.api_key()?.to_string();
        let body = self.convert_request(&request, true);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .header("x-api-key", &api_key)
            .header("anthropic-version", defaults::ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::ANTHROPIC, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(
                providers::ANTHROPIC,
                Some(status),
                error_text,
            ));
        }

        let stream = try_stream! {
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut terminal: Option<FinishReason> = None;
            let mut usage: Option<Usage> = None;
            // tool_use blocks stream their name first and their arguments as
            // input_json_delta fragments afterwards.
            let mut pending_calls: Vec<(String, String)> = Vec::new();

            'read: while let Some(chunk_result) = body_stream.next().await {
                let chunk =
                    chunk_result.map_err(|err| LLMError::network(providers::ANTHROPIC, err))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                let (events, _) = drain_sse_events(&mut buffer);
                for payload in events {
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(provider = providers::ANTHROPIC, %err, "skipping malformed stream frame");
                            continue;
                        }
                    };

                    match value.get("type").and_then(|value| value.as_str()) {
                        Some("content_block_start") => {
                            if let Some(block) = value.get("content_block") {
                                if block.get("type").and_then(|value| value.as_str())
                                    == Some("tool_use")
                                {
                                    let name = block
                                        .get("name")
                                        .and_then(|value| value.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    pending_calls.push((name, String::new()));
                                }
                            }
                        }
                        Some("content_block_delta") => {
                            let Some(delta) = value.get("delta") else { continue };
                            match delta.get("type").and_then(|value| value.as_str()) {
                                Some("text_delta") => {
                                    if let Some(text) =
                                        delta.get("text").and_then(|value| value.as_str())
                                    {
                                        if !text.is_empty() {
                                            yield StreamEvent::delta(text);
                                        }
                                    }
                                }
                                Some("input_json_delta") => {
                                    if let Some(fragment) =
                                        delta.get("partial_json").and_then(|value| value.as_str())
                                    {
                                        if let Some((_, arguments)) = pending_calls.last_mut() {
                                            arguments.push_str(fragment);
                                        }
                                    }
                                }
                                _ => {}
                            }
                        }
                        Some("message_delta") => {
                            if let Some(reason) = value
                                .pointer("/delta/stop_reason")
                                .and_then(|value| value.as_str())
                            {
                                terminal = Some(map_finish_reason(Some(reason)));
                            }
                            if let Some(delta_usage) = parse_usage(value.get("usage")) {
                                usage = Some(delta_usage);
                            }
                        }
                        Some("message_stop") => {
                            break 'read;
                        }
                        // message_start, ping, anything newer
                        _ => {}
                    }
                }
            }

            let tool_calls: Vec<ToolCall> = pending_calls
                .into_iter()
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, arguments)| ToolCall {
                    name,
                    args: serde_json::from_str(&arguments).unwrap_or_else(|_| json!({})),
                })
                .collect();

            let finish_reason = terminal.unwrap_or(FinishReason::Stop);
            yield StreamEvent {
                content_delta: String::new(),
                finish_reason: Some(finish_reason),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
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
        assert_eq!(map_finish_reason(Some("end_turn")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("stop_sequence")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("max_tokens")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(
            map_finish_reason(Some("refusal")),
            FinishReason::Error("refusal".to_string())
        );
        assert_eq!(map_finish_reason(Some("pause_turn")), FinishReason::Stop);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn shaping_enforces_strict_alternation() {
        let messages = vec![
            Message::system("Be terse"),
            Message::user("first"),
            Message::user("second"),
            Message::assistant("reply"),
            Message::function_result("tool", serde_json::json!({"ok": true})),
            Message::user("next"),
        ];
        let (system, shaped) = shape_messages(&messages);
        assert_eq!(system.as_deref(), Some("Be terse"));

        let roles: Vec<&str> = shaped
            .iter()
            .map(|entry| entry["role"].as_str().unwrap_or_default())
            .collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        // Merged consecutive user turns keep both texts.
        let first = shaped[0]["content"].as_str().unwrap_or_default();
        assert!(first.contains("first") && first.contains("second"));
    }

    #[test]
    fn conversations_never_open_with_an_assistant_turn() {
        let (_, shaped) = shape_messages(&[Message::assistant("dangling reply")]);
        assert_eq!(shaped[0]["role"], "user");
        assert_eq!(shaped[1]["role"], "assistant");
    }

    #[test]
    fn tool_use_blocks_parse_into_tool_calls() {
        let provider = AnthropicProvider::new(Some("key".to_string()));
        let payload = serde_json::json!({
            "content": [
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "toolu_1", "name": "list_files", "input": {"path": "."}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let response = provider.parse_response(&payload).unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        assert_eq!(response.content, "Let me check.");
        let calls = response.tool_calls.unwrap_or_default();
        assert_eq!(calls[0].name, "list_files");
        assert_eq!(response.usage.map(|usage| usage.total_tokens), Some(14));
    }
}
