//! OpenAI chat-completions provider
//!
//! Standard `POST /chat/completions` with SSE streaming: `data:` frames
//! carrying chunk objects, terminated by the `[DONE]` sentinel. System
//! messages pass through unchanged; function-result messages are folded
//! into user-turn text since this layer tracks calls by name, not by
//! OpenAI's tool_call ids.

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
    FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, Message, MessageRole,
    ModelCapabilities, ModelInfo, StreamEvent, ToolCall, Usage,
};
use crate::llm::stream::drain_sse_events;

pub struct OpenAIProvider {
    api_key: Option<String>,
    http_client: HttpClient,
    base_url: String,
    model: String,
}

impl OpenAIProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            http_client: HttpClient::new(),
            base_url: urls::OPENAI_API_BASE.to_string(),
            model: models::openai::DEFAULT_MODEL.to_string(),
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let api_key = resolve_value(None, settings.api_key.clone(), env::OPENAI_API_KEY, None);
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
            .ok_or_else(|| LLMError::configuration(providers::OPENAI, "OPENAI_API_KEY is not set"))
    }

    fn convert_request(&self, request: &LLMRequest, stream: bool) -> Value {
        let messages = shape_messages(&request.messages);

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": stream,
        });

        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(max_tokens) = request.max_tokens {
            body["max_completion_tokens"] = json!(max_tokens);
        }
        if let Some(stop_sequences) = &request.stop_sequences {
            body["stop"] = json!(stop_sequences);
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
        let choice = response
            .get("choices")
            .and_then(|choices| choices.as_array())
            .and_then(|choices| choices.first())
            .ok_or_else(|| {
                LLMError::backend(providers::OPENAI, None, "response carried no choices")
            })?;

        let message = choice.get("message").cloned().unwrap_or_else(|| json!({}));
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

        let finish_reason =
            map_finish_reason(choice.get("finish_reason").and_then(|value| value.as_str()));

        Ok(LLMResponse {
            content,
            tool_calls,
            usage: parse_usage(response.get("usage")),
            finish_reason,
        })
    }
}

/// Map messages onto OpenAI's role vocabulary. Function results have no
/// stable id to reference here, so they are folded into user text with
/// their name preserved.
fn shape_messages(messages: &[Message]) -> Vec<Value> {
    let mut shaped = Vec::new();
    for message in messages {
        match message.role {
            MessageRole::Function => {
                shaped.push(json!({
                    "role": "user",
                    "content": message.text_lossy(),
                }));
            }
            role => {
                let mut entry = json!({
                    "role": role.as_str(),
                    "content": message.text_lossy(),
                });
                if role == MessageRole::Assistant {
                    let calls = message.function_calls();
                    if !calls.is_empty() {
                        entry["tool_calls"] = json!(
                            calls
                                .iter()
                                .enumerate()
                                .map(|(index, (name, args))| {
                                    json!({
                                        "id": format!("call_{index}"),
                                        "type": "function",
                                        "function": {
                                            "name": name,
                                            "arguments": args.to_string(),
                                        }
                                    })
                                })
                                .collect::<Vec<_>>()
                        );
                    }
                }
                shaped.push(entry);
            }
        }
    }
    shaped
}

fn parse_tool_call(call: &Value) -> Option<ToolCall> {
    let function = call.get("function")?;
    let name = function.get("name")?.as_str()?.to_string();
    let args = match function.get("arguments") {
        Some(Value::String(raw)) => serde_json::from_str(raw).unwrap_or_else(|_| json!({})),
        Some(value) => value.clone(),
        None => json!({}),
    };
    Some(ToolCall { name, args })
}

/// Streamed tool calls arrive as fragments keyed by `index`: the first
/// fragment names the function, later ones append argument text only.
/// Accumulate name and raw argument string per index until the stream ends.
fn absorb_tool_call_fragment(pending: &mut Vec<(u64, String, String)>, fragment: &Value) {
    let index = fragment
        .get("index")
        .and_then(|value| value.as_u64())
        .unwrap_or(pending.len() as u64);
    if !pending.iter().any(|(existing, _, _)| *existing == index) {
        pending.push((index, String::new(), String::new()));
    }
    let Some((_, name, arguments)) = pending.iter_mut().find(|(existing, _, _)| *existing == index)
    else {
        return;
    };
    let Some(function) = fragment.get("function") else {
        return;
    };
    if let Some(fragment_name) = function.get("name").and_then(|value| value.as_str()) {
        if !fragment_name.is_empty() {
            name.push_str(fragment_name);
        }
    }
    if let Some(fragment_args) = function.get("arguments").and_then(|value| value.as_str()) {
        arguments.push_str(fragment_args);
    }
}

fn finalize_tool_calls(pending: Vec<(u64, String, String)>) -> Vec<ToolCall> {
    pending
        .into_iter()
        .filter(|(_, name, _)| !name.is_empty())
        .map(|(_, name, arguments)| ToolCall {
            name,
            args: serde_json::from_str(&arguments).unwrap_or_else(|_| json!({})),
        })
        .collect()
}

/// OpenAI's finish vocabulary onto the canonical reasons; unknown values
/// default to a normal stop.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolCalls,
        Some("content_filter") => FinishReason::Error("content_filter".to_string()),
        _ => FinishReason::Stop,
    }
}

fn parse_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(|value| value.as_u64())
            .unwrap_or(0) as u32,
        total_tokens: usage
            .get("total_tokens")
            .and_then(|value| value.as_u64())
            .unwrap_or(0) as u32,
    })
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
    fn id(&self) -> &str {
        providers::OPENAI
    }

    fn description(&self) -> &str {
        "OpenAI hosted API"
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
        Ok(models::openai::SUPPORTED_MODELS
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
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::OPENAI, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::OPENAI, Some(status), error_text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LLMError::backend(providers::OPENAI, None, err.to_string()))?;

        self.parse_response(&payload)
    }

    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError> {
        let api_key = self.api_key()?.to_string();
        let body = self.convert_request(&request, true);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::OPENAI, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::OPENAI, Some(status), error_text));
        }

        let stream = try_stream! {
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut pending_calls: Vec<(u64, String, String)> = Vec::new();
            let mut usage: Option<Usage> = None;
            let mut terminal: Option<FinishReason> = None;

            while let Some(chunk_result) = body_stream.next().await {
                let chunk =
                    chunk_result.map_err(|err| LLMError::network(providers::OPENAI, err))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                let (events, saw_done) = drain_sse_events(&mut buffer);
                for payload in events {
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(provider = providers::OPENAI, %err, "skipping malformed stream frame");
                            continue;
                        }
                    };

                    if let Some(chunk_usage) = parse_usage(value.get("usage")) {
                        usage = Some(chunk_usage);
                    }

                    let Some(choice) = value
                        .get("choices")
                        .and_then(|choices| choices.as_array())
                        .and_then(|choices| choices.first())
                    else {
                        continue;
                    };

                    if let Some(delta) = choice.get("delta") {
                        if let Some(text) = delta.get("content").and_then(|value| value.as_str()) {
                            if !text.is_empty() {
                                yield StreamEvent::delta(text);
                            }
                        }
                        if let Some(calls) = delta.get("tool_calls").and_then(|value| value.as_array()) {
                            for fragment in calls {
                                absorb_tool_call_fragment(&mut pending_calls, fragment);
                            }
                        }
                    }

                    if let Some(reason) = choice.get("finish_reason").and_then(|value| value.as_str()) {
                        terminal = Some(map_finish_reason(Some(reason)));
                    }
                }

                if saw_done {
                    break;
                }
            }

            let tool_calls = finalize_tool_calls(pending_calls);
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
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(Some("tool_calls")), FinishReason::ToolCalls);
        assert_eq!(
            map_finish_reason(Some("function_call")),
            FinishReason::ToolCalls
        );
        assert_eq!(
            map_finish_reason(Some("content_filter")),
            FinishReason::Error("content_filter".to_string())
        );
        assert_eq!(map_finish_reason(Some("unheard_of")), FinishReason::Stop);
        assert_eq!(map_finish_reason(None), FinishReason::Stop);
    }

    #[test]
    fn function_results_fold_into_user_text() {
        let shaped = shape_messages(&[Message::function_result(
            "run_tests",
            serde_json::json!({"passed": 12}),
        )]);
        assert_eq!(shaped.len(), 1);
        assert_eq!(shaped[0]["role"], "user");
        let content = shaped[0]["content"].as_str().unwrap_or_default();
        assert!(content.contains("run_tests"));
        assert!(content.contains("12"));
    }

    #[test]
    fn assistant_function_calls_become_tool_calls() {
        use crate::llm::provider::ContentPart;
        let message = Message::new(
            MessageRole::Assistant,
            vec![ContentPart::FunctionCall {
                name: "grep".to_string(),
                args: serde_json::json!({"pattern": "todo"}),
            }],
        );
        let shaped = shape_messages(&[message]);
        assert_eq!(shaped[0]["tool_calls"][0]["function"]["name"], "grep");
    }

    #[test]
    fn streamed_tool_call_fragments_reassemble_per_index() {
        let mut pending = Vec::new();
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({
                "index": 0,
                "id": "call_abc",
                "function": {"name": "get_weather", "arguments": ""}
            }),
        );
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({
                "index": 0,
                "function": {"arguments": "{\"city\":"}
            }),
        );
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({
                "index": 0,
                "function": {"arguments": "\"Paris\"}"}
            }),
        );

        let calls = finalize_tool_calls(pending);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert_eq!(calls[0].args["city"], "Paris");
    }

    #[test]
    fn parallel_tool_call_fragments_stay_separate() {
        let mut pending = Vec::new();
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({"index": 0, "function": {"name": "read", "arguments": ""}}),
        );
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({"index": 1, "function": {"name": "grep", "arguments": ""}}),
        );
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({"index": 1, "function": {"arguments": "{\"pattern\":\"x\"}"}}),
        );
        absorb_tool_call_fragment(
            &mut pending,
            &serde_json::json!({"index": 0, "function": {"arguments": "{\"path\":\"a.rs\"}"}}),
        );

        let calls = finalize_tool_calls(pending);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "read");
        assert_eq!(calls[0].args["path"], "a.rs");
        assert_eq!(calls[1].name, "grep");
        assert_eq!(calls[1].args["pattern"], "x");
    }

    #[test]
    fn string_encoded_arguments_are_decoded() {
        let call = serde_json::json!({
            "id": "call_0",
            "function": {"name": "read", "arguments": "{\"path\": \"a.rs\"}"}
        });
        let parsed = parse_tool_call(&call).unwrap();
        assert_eq!(parsed.name, "read");
        assert_eq!(parsed.args["path"], "a.rs");
    }
}
