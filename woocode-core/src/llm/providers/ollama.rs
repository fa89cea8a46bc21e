//! Ollama local provider
//!
//! Talks to a locally running Ollama daemon over loopback HTTP. Streaming
//! responses are newline-delimited JSON: every line is a complete object
//! with `message.content` and a `done` flag, the final line carrying
//! `done_reason` and token counts. This provider does not own the daemon
//! process; availability is probed against `/api/tags`.

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
use crate::llm::stream::drain_lines;

pub struct OllamaProvider {
    http_client: HttpClient,
    base_url: String,
    model: String,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.unwrap_or_else(|| urls::OLLAMA_DEFAULT_BASE_URL.to_string()),
            model: models::ollama::DEFAULT_MODEL.to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let base_url = resolve_value(
            None,
            settings.base_url.clone(),
            env::OLLAMA_BASE_URL,
            Some(urls::OLLAMA_DEFAULT_BASE_URL),
        );
        let mut provider = Self::new(base_url);
        if let Some(model) = settings.model.clone() {
            provider.model = model;
        }
        provider
    }

    fn convert_request(&self, request: &LLMRequest, stream: bool) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                json!({
                    "role": wire_role(message),
                    "content": message.text_lossy(),
                })
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });

        let mut options = json!({});
        if let Some(temperature) = request.temperature {
            options["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            options["top_p"] = json!(top_p);
        }
        if let Some(top_k) = request.top_k {
            options["top_k"] = json!(top_k);
        }
        if let Some(max_tokens) = request.max_tokens {
            options["num_predict"] = json!(max_tokens);
        }
        if let Some(stop_sequences) = &request.stop_sequences {
            options["stop"] = json!(stop_sequences);
        }
        if let Some(opts) = options.as_object() {
            if !opts.is_empty() {
                body["options"] = options;
            }
        }

        if let Some(tools) = &request.tools {
            if !tools.is_empty() {
                let tools_json: Vec<Value> = tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect();
                body["tools"] = Value::Array(tools_json);
            }
        }

        body
    }

    fn parse_response(&self, response: &Value) -> Result<LLMResponse, LLMError> {
        let message = response.get("message").ok_or_else(|| {
            LLMError::backend(providers::OLLAMA, None, "response carried no message")
        })?;

        let content = message
            .get("content")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();

        let tool_calls = message
            .get("tool_calls")
            .and_then(|value| value.as_array())
            .map(|calls| calls.iter().filter_map(parse_tool_call).collect::<Vec<_>>())
            .filter(|calls: &Vec<ToolCall>| !calls.is_empty());

        let finish_reason = if tool_calls.is_some() {
            FinishReason::ToolCalls
        } else {
            map_finish_reason(response.get("done_reason").and_then(|value| value.as_str()))
        };

        Ok(LLMResponse {
            content,
            tool_calls,
            usage: parse_usage(response),
            finish_reason,
        })
    }
}

fn wire_role(message: &Message) -> &'static str {
    match message.role {
        // Ollama accepts a tool role but this layer tracks results by name,
        // so they travel as user turns like the other local providers.
        MessageRole::Function => "user",
        role => role.as_str(),
    }
}

fn parse_tool_call(call: &Value) -> Option<ToolCall> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let args = function.get("arguments").cloned().unwrap_or_else(|| json!({}));
    Some(ToolCall { name, args })
}

/// Tool calls carried by one streamed frame's `message.tool_calls`; each
/// call arrives whole, not fragmented.
fn frame_tool_calls(frame: &Value) -> Vec<ToolCall> {
    frame
        .pointer("/message/tool_calls")
        .and_then(|value| value.as_array())
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default()
}

/// Ollama's `done_reason` values onto the canonical reasons; unknown values
/// default to a normal stop.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") | Some("limit") => FinishReason::Length,
        // "stop", "unload", absent, anything newer
        _ => FinishReason::Stop,
    }
}

fn parse_usage(frame: &Value) -> Option<Usage> {
    let prompt_tokens = frame.get("prompt_eval_count")?.as_u64()? as u32;
    let completion_tokens = frame
        .get("eval_count")
        .and_then(|value| value.as_u64())
        .unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    })
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    fn id(&self) -> &str {
        providers::OLLAMA
    }

    fn description(&self) -> &str {
        "Ollama local daemon"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn initialize(&self) -> Result<(), LLMError> {
        if self.is_available().await {
            Ok(())
        } else {
            Err(LLMError::Unavailable {
                provider: providers::OLLAMA.to_string(),
            })
        }
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.base_url);
        match self
            .http_client
            .get(&url)
            .timeout(defaults::AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        let url = format!("{}/api/tags", self.base_url);
        let fetched = async {
            let response = self
                .http_client
                .get(&url)
                .timeout(defaults::AVAILABILITY_TIMEOUT)
                .send()
                .await
                .ok()?;
            let payload: Value = response.json().await.ok()?;
            let names: Vec<ModelInfo> = payload
                .get("models")?
                .as_array()?
                .iter()
                .filter_map(|model| model.get("name").and_then(|value| value.as_str()))
                .map(|name| {
                    ModelInfo::new(name, name).with_capabilities(ModelCapabilities {
                        vision: false,
                        function_calling: true,
                        streaming: true,
                    })
                })
                .collect();
            Some(names)
        }
        .await;

        // Listing is advisory; fall back to the static catalogue when the
        // daemon cannot be queried.
        Ok(fetched.filter(|models| !models.is_empty()).unwrap_or_else(|| {
            models::ollama::SUPPORTED_MODELS
                .iter()
                .map(|id| {
                    ModelInfo::new(id, id).with_capabilities(ModelCapabilities {
                        vision: false,
                        function_calling: true,
                        streaming: true,
                    })
                })
                .collect()
        }))
    }

    async fn generate(&self, request: LLMRequest) -> Result<LLMResponse, LLMError> {
        let body = self.convert_request(&request, false);
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::OLLAMA, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::OLLAMA, Some(status), error_text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LLMError::backend(providers::OLLAMA, None, err.to_string()))?;

        self.parse_response(&payload)
    }

    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError> {
        let body = self.convert_request(&request, true);
        let url = format!("{}/api/chat", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::OLLAMA, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::OLLAMA, Some(status), error_text));
        }

        let stream = try_stream! {
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut terminal: Option<FinishReason> = None;
            let mut usage: Option<Usage> = None;
            let mut pending_calls: Vec<ToolCall> = Vec::new();

            'read: while let Some(chunk_result) = body_stream.next().await {
                let chunk =
                    chunk_result.map_err(|err| LLMError::network(providers::OLLAMA, err))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for line in drain_lines(&mut buffer) {
                    let value: Value = match serde_json::from_str(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(provider = providers::OLLAMA, %err, "skipping malformed stream frame");
                            continue;
                        }
                    };

                    if let Some(text) = value
                        .pointer("/message/content")
                        .and_then(|value| value.as_str())
                    {
                        if !text.is_empty() {
                            yield StreamEvent::delta(text);
                        }
                    }

                    pending_calls.extend(frame_tool_calls(&value));

                    if value.get("done").and_then(|value| value.as_bool()) == Some(true) {
                        terminal = Some(map_finish_reason(
                            value.get("done_reason").and_then(|value| value.as_str()),
                        ));
                        usage = parse_usage(&value);
                        break 'read;
                    }
                }
            }

            // Same rule as the non-streaming path: a turn that called
            // tools finished because of them, whatever done_reason says.
            let finish_reason = if pending_calls.is_empty() {
                terminal.unwrap_or(FinishReason::Stop)
            } else {
                FinishReason::ToolCalls
            };
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
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("limit")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("unload")), FinishReason::Stop);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn request_uses_ollama_option_names() {
        let provider = OllamaProvider::new(None);
        let request = LLMRequest {
            model: "qwen2.5-coder:7b".to_string(),
            messages: vec![Message::user("hi")],
            temperature: Some(0.2),
            max_tokens: Some(128),
            ..LLMRequest::default()
        };
        let body = provider.convert_request(&request, true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["options"]["num_predict"], 128);
        assert!((body["options"]["temperature"].as_f64().unwrap_or_default() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn function_results_travel_as_user_turns() {
        let message = Message::function_result("fmt", serde_json::json!({"ok": true}));
        assert_eq!(wire_role(&message), "user");
    }

    #[test]
    fn streamed_frames_carry_whole_tool_calls() {
        let frame = serde_json::json!({
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{
                    "function": {
                        "name": "get_weather",
                        "arguments": {"city": "Paris"},
                    }
                }],
            },
            "done": false,
        });
        let calls = frame_tool_calls(&frame);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].args["city"], "Paris");

        // Frames without the field contribute nothing.
        assert!(frame_tool_calls(&serde_json::json!({"done": true})).is_empty());
    }

    #[test]
    fn final_frame_supplies_usage() {
        let frame = serde_json::json!({
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 11,
            "eval_count": 3,
        });
        let usage = parse_usage(&frame).unwrap();
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.total_tokens, 14);
    }
}
