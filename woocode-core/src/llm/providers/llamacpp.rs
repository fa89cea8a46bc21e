//! llama.cpp subprocess provider
//!
//! Drives a llama.cpp CLI binary in its JSON stdio mode: one request is a
//! single JSON line on stdin, the reply is line-buffered stdout where each
//! line is a JSON event (`{"token": …}` fragments followed by a
//! `{"done": true, …}` terminator). Blank lines are ignored and malformed
//! lines are logged and skipped. Stdout closing before the terminator means
//! the process died; that surfaces as a backend error on the in-flight
//! call and the child is not restarted automatically.
//!
//! The child is spawned once and reused across calls; the stdio pair is
//! guarded by a mutex so only one exchange is in flight per child.
//! Prompts use ChatML framing, the format the Qwen-family models are
//! trained on.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::config::constants::{defaults, env, models, providers};
use crate::config::settings::{ProviderSettings, resolve_value};
use crate::llm::error::LLMError;
use crate::llm::provider::{
    FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, Message, MessageRole,
    ModelCapabilities, ModelInfo, StreamEvent, Usage,
};

struct ChildIo {
    child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

/// One in-flight request/response exchange on the shared child.
///
/// If the holder is dropped before the terminator line was read (the caller
/// cancelled mid-stream), unread frames are still sitting in the reader and
/// would leak into the next call. Discarding the child (`kill_on_drop` reaps
/// the process) forces a clean respawn instead.
struct Exchange {
    guard: OwnedMutexGuard<Option<ChildIo>>,
    complete: bool,
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if !self.complete {
            self.guard.take();
        }
    }
}

pub struct LlamaCppProvider {
    binary: String,
    model_path: Option<String>,
    model: String,
    io: Arc<Mutex<Option<ChildIo>>>,
}

impl LlamaCppProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let binary = resolve_value(
            None,
            settings.binary.clone(),
            env::LLAMACPP_BIN,
            Some(defaults::LLAMACPP_BIN),
        )
        .unwrap_or_else(|| defaults::LLAMACPP_BIN.to_string());
        let model_path = resolve_value(
            None,
            settings.launch_arg.clone(),
            env::LLAMACPP_MODEL_PATH,
            None,
        );

        Self {
            binary,
            model_path,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| models::llamacpp::DEFAULT_MODEL.to_string()),
            io: Arc::new(Mutex::new(None)),
        }
    }

    fn model_path(&self) -> Result<&str, LLMError> {
        self.model_path.as_deref().ok_or_else(|| {
            LLMError::configuration(providers::LLAMACPP, "LLAMACPP_MODEL_PATH is not set")
        })
    }

    async fn ensure_child(&self) -> Result<(), LLMError> {
        let mut io = self.io.lock().await;
        if io.is_some() {
            return Ok(());
        }

        let model_path = self.model_path()?;
        let mut child = Command::new(&self.binary)
            .arg("--model")
            .arg(model_path)
            .arg("--json-io")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                LLMError::configuration(
                    providers::LLAMACPP,
                    format!("failed to launch {}: {err}", self.binary),
                )
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            LLMError::backend(providers::LLAMACPP, None, "child stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            LLMError::backend(providers::LLAMACPP, None, "child stdout unavailable")
        })?;

        *io = Some(ChildIo {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        });
        Ok(())
    }

    fn request_line(&self, request: &LLMRequest) -> Result<String, LLMError> {
        let mut body = json!({
            "prompt": chatml_prompt(&request.messages),
        });
        if let Some(max_tokens) = request.max_tokens {
            body["n_predict"] = json!(max_tokens);
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
            body["stop"] = json!(stop_sequences);
        }

        let mut line = serde_json::to_string(&body)
            .map_err(|err| LLMError::backend(providers::LLAMACPP, None, err.to_string()))?;
        line.push('\n');
        Ok(line)
    }
}

/// ChatML framing, matching the prompt format the bundled qwen server
/// feeds the same model family.
fn chatml_prompt(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for message in messages {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User | MessageRole::Function => "user",
            MessageRole::Assistant => "assistant",
        };
        prompt.push_str("<|im_start|>");
        prompt.push_str(role);
        prompt.push('\n');
        prompt.push_str(&message.text_lossy());
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

/// The terminator line's `reason` onto the canonical reasons; unknown
/// values default to a normal stop.
fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("length") => FinishReason::Length,
        Some("error") => FinishReason::Error("error".to_string()),
        // "stop", "eos", absent, anything newer
        _ => FinishReason::Stop,
    }
}

fn parse_usage(frame: &Value) -> Option<Usage> {
    let usage = frame.get("usage")?;
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
impl LLMProvider for LlamaCppProvider {
    fn id(&self) -> &str {
        providers::LLAMACPP
    }

    fn description(&self) -> &str {
        "llama.cpp subprocess runtime"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn supports_tools(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<(), LLMError> {
        let model_path = self.model_path()?;
        if !Path::new(model_path).exists() {
            return Err(LLMError::configuration(
                providers::LLAMACPP,
                format!("model file not found: {model_path}"),
            ));
        }
        self.ensure_child().await
    }

    async fn is_available(&self) -> bool {
        if self.io.lock().await.is_some() {
            return true;
        }
        self.model_path
            .as_deref()
            .map(|path| Path::new(path).exists())
            .unwrap_or(false)
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        // One loaded model per child; nothing to query.
        let id = self
            .model_path
            .as_deref()
            .and_then(|path| Path::new(path).file_stem())
            .and_then(|stem| stem.to_str())
            .unwrap_or(&self.model);
        Ok(vec![ModelInfo::new(id, id).with_capabilities(
            ModelCapabilities {
                vision: false,
                function_calling: false,
                streaming: true,
            },
        )])
    }

    async fn generate(&self, request: LLMRequest) -> Result<LLMResponse, LLMError> {
        let mut stream = self.stream(request).await?;
        let mut content = String::new();
        let mut usage = None;
        let mut finish_reason = FinishReason::Stop;

        use futures::StreamExt;
        while let Some(event) = stream.next().await {
            let event = event?;
            content.push_str(&event.content_delta);
            if let Some(event_usage) = event.usage {
                usage = Some(event_usage);
            }
            if let Some(reason) = event.finish_reason {
                finish_reason = reason;
            }
        }

        Ok(LLMResponse {
            content,
            tool_calls: None,
            usage,
            finish_reason,
        })
    }

    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError> {
        self.ensure_child().await?;
        let line = self.request_line(&request)?;
        let io = Arc::clone(&self.io);

        let stream = try_stream! {
            // Holding the owned guard for the stream's lifetime keeps the
            // exchange exclusive on the shared child.
            let mut exchange = Exchange {
                guard: io.lock_owned().await,
                complete: false,
            };
            let child_io = exchange.guard.as_mut().ok_or_else(|| {
                LLMError::backend(providers::LLAMACPP, None, "child process is not running")
            })?;

            child_io
                .stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|err| LLMError::backend(providers::LLAMACPP, None, err.to_string()))?;
            child_io
                .stdin
                .flush()
                .await
                .map_err(|err| LLMError::backend(providers::LLAMACPP, None, err.to_string()))?;

            let mut outcome: Result<(FinishReason, Option<Usage>), LLMError> =
                Ok((FinishReason::Stop, None));

            loop {
                let next = child_io
                    .lines
                    .next_line()
                    .await
                    .map_err(|err| LLMError::backend(providers::LLAMACPP, None, err.to_string()))?;

                let Some(raw) = next else {
                    // Stdout closed before the terminator: the child died
                    // mid-call.
                    outcome = Err(LLMError::backend(
                        providers::LLAMACPP,
                        None,
                        "child process exited mid-generation",
                    ));
                    break;
                };

                if raw.trim().is_empty() {
                    continue;
                }

                let value: Value = match serde_json::from_str(&raw) {
                    Ok(value) => value,
                    Err(err) => {
                        warn!(provider = providers::LLAMACPP, %err, "skipping malformed stdout line");
                        continue;
                    }
                };

                if let Some(token) = value.get("token").and_then(|value| value.as_str()) {
                    if !token.is_empty() {
                        yield StreamEvent::delta(token);
                    }
                }

                if value.get("done").and_then(|value| value.as_bool()) == Some(true) {
                    outcome = Ok((
                        map_finish_reason(value.get("reason").and_then(|value| value.as_str())),
                        parse_usage(&value),
                    ));
                    break;
                }
            }

            if outcome.is_ok() {
                // An error leaves `complete` unset, so the drop discards
                // the dead child and the next call respawns.
                exchange.complete = true;
            }
            let (finish_reason, usage) = outcome?;
            yield StreamEvent {
                content_delta: String::new(),
                finish_reason: Some(finish_reason),
                tool_calls: None,
                usage,
            };
        };

        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        if let Some(mut child_io) = io.take() {
            if let Err(err) = child_io.child.kill().await {
                warn!(provider = providers::LLAMACPP, %err, "failed to stop child process");
            }
        }
    }
}
