//! Local Qwen server provider
//!
//! Owns a child process running the bundled FastAPI Qwen server
//! (`local-models/qwen_server.py`) and talks to it over loopback HTTP.
//! The server exposes `GET /` as a health check, `POST /generate` for
//! completions (NDJSON lines when `stream` is set) and `GET /models` for
//! its catalogue; it caches model weights under `~/.woocode/models`.
//!
//! The child is spawned on `initialize()` if nothing is already answering
//! the health endpoint, then reused across calls until `shutdown()`.
//! Model loading dominates startup, so readiness is polled with a long
//! overall window.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;
use serde_json::{Value, json};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::constants::{defaults, env, models, providers, urls};
use crate::config::settings::{ProviderSettings, resolve_value, woocode_home};
use crate::llm::error::LLMError;
use crate::llm::provider::{
    FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, Message, MessageRole,
    ModelCapabilities, ModelInfo, StreamEvent, Usage,
};
use crate::llm::stream::drain_lines;

pub struct QwenProvider {
    http_client: HttpClient,
    python_bin: String,
    server_script: String,
    port: u16,
    model: String,
    startup_poll_interval: Duration,
    startup_timeout: Duration,
    child: Mutex<Option<Child>>,
}

impl QwenProvider {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let python_bin = resolve_value(
            None,
            settings.binary.clone(),
            env::QWEN_PYTHON_BIN,
            Some(defaults::QWEN_PYTHON_BIN),
        )
        .unwrap_or_else(|| defaults::QWEN_PYTHON_BIN.to_string());
        let server_script = resolve_value(
            None,
            settings.launch_arg.clone(),
            env::QWEN_SERVER_SCRIPT,
            Some(defaults::QWEN_SERVER_SCRIPT),
        )
        .unwrap_or_else(|| defaults::QWEN_SERVER_SCRIPT.to_string());
        let port = settings
            .port
            .or_else(|| {
                std::env::var(env::QWEN_SERVER_PORT)
                    .ok()
                    .and_then(|value| value.parse().ok())
            })
            .unwrap_or(defaults::QWEN_SERVER_PORT);

        Self {
            http_client: HttpClient::new(),
            python_bin,
            server_script,
            port,
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| models::qwen::DEFAULT_MODEL.to_string()),
            startup_poll_interval: defaults::STARTUP_POLL_INTERVAL,
            startup_timeout: defaults::STARTUP_TIMEOUT,
            child: Mutex::new(None),
        }
    }

    /// Override the readiness window. Used by tests and callers that know
    /// the model is already cached.
    pub fn with_startup_window(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.startup_poll_interval = poll_interval;
        self.startup_timeout = timeout;
        self
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}", urls::QWEN_SERVER_HOST, self.port)
    }

    async fn health_check(&self) -> bool {
        let url = self.base_url();
        match self
            .http_client
            .get(&url)
            .timeout(defaults::AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => {
                if !response.status().is_success() {
                    return false;
                }
                let payload: Value = match response.json().await {
                    Ok(payload) => payload,
                    Err(_) => return false,
                };
                payload.get("status").and_then(|value| value.as_str()) == Some("running")
            }
            Err(_) => false,
        }
    }

    async fn spawn_server(&self) -> Result<(), LLMError> {
        let script = std::path::Path::new(&self.server_script);
        if !script.exists() {
            return Err(LLMError::configuration(
                providers::QWEN,
                format!("server script not found: {}", self.server_script),
            ));
        }

        let mut command = Command::new(&self.python_bin);
        command
            .arg(&self.server_script)
            .env(env::QWEN_SERVER_PORT, self.port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // The server caches model weights under the shared home dir.
        if let Some(home) = woocode_home() {
            command.env(env::WOOCODE_HOME, home);
        }

        let spawned = command.spawn().map_err(|err| {
            LLMError::configuration(
                providers::QWEN,
                format!("failed to launch {}: {err}", self.python_bin),
            )
        })?;

        let mut child = self.child.lock().await;
        *child = Some(spawned);
        Ok(())
    }

    /// Poll the health endpoint until the model is loaded or the window
    /// runs out.
    async fn wait_ready(&self) -> Result<(), LLMError> {
        let started = Instant::now();
        while started.elapsed() < self.startup_timeout {
            if self.health_check().await {
                debug!(provider = providers::QWEN, elapsed = ?started.elapsed(), "server ready");
                return Ok(());
            }
            tokio::time::sleep(self.startup_poll_interval).await;
        }
        Err(LLMError::StartupTimeout {
            provider: providers::QWEN.to_string(),
            waited: self.startup_timeout,
        })
    }

    fn convert_request(&self, request: &LLMRequest, stream: bool) -> Value {
        // The server accepts flat role/content pairs; richer parts degrade
        // to text and tools are omitted entirely.
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

        json!({
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(512),
            "temperature": request.temperature.unwrap_or(0.7),
            "top_p": request.top_p.unwrap_or(0.95),
            "top_k": request.top_k.unwrap_or(40),
            "stream": stream,
        })
    }
}

fn wire_role(message: &Message) -> &'static str {
    match message.role {
        // The server only understands system/user/assistant.
        MessageRole::Function => "user",
        role => role.as_str(),
    }
}

fn parse_usage(payload: &Value) -> Option<Usage> {
    let usage = payload.get("usage")?;
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
impl LLMProvider for QwenProvider {
    fn id(&self) -> &str {
        providers::QWEN
    }

    fn description(&self) -> &str {
        "Local Qwen coder server (spawned)"
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    fn supports_tools(&self) -> bool {
        false
    }

    async fn initialize(&self) -> Result<(), LLMError> {
        if self.health_check().await {
            return Ok(());
        }
        self.spawn_server().await?;
        self.wait_ready().await
    }

    async fn is_available(&self) -> bool {
        self.health_check().await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        let url = format!("{}/models", self.base_url());
        let fetched = async {
            let response = self
                .http_client
                .get(&url)
                .timeout(defaults::AVAILABILITY_TIMEOUT)
                .send()
                .await
                .ok()?;
            let payload: Value = response.json().await.ok()?;
            let listed: Vec<ModelInfo> = payload
                .get("models")?
                .as_array()?
                .iter()
                .filter_map(|model| {
                    let id = model.get("id")?.as_str()?;
                    let name = model.get("name").and_then(|value| value.as_str()).unwrap_or(id);
                    let mut info = ModelInfo::new(id, name).with_capabilities(ModelCapabilities {
                        vision: false,
                        function_calling: false,
                        streaming: true,
                    });
                    info.description = model
                        .get("description")
                        .and_then(|value| value.as_str())
                        .map(|value| value.to_string());
                    Some(info)
                })
                .collect();
            Some(listed)
        }
        .await;

        Ok(fetched.filter(|models| !models.is_empty()).unwrap_or_else(|| {
            models::qwen::SUPPORTED_MODELS
                .iter()
                .map(|id| {
                    ModelInfo::new(id, id).with_capabilities(ModelCapabilities {
                        vision: false,
                        function_calling: false,
                        streaming: true,
                    })
                })
                .collect()
        }))
    }

    async fn generate(&self, request: LLMRequest) -> Result<LLMResponse, LLMError> {
        let body = self.convert_request(&request, false);
        let url = format!("{}/generate", self.base_url());

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::QWEN, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::QWEN, Some(status), error_text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|err| LLMError::backend(providers::QWEN, None, err.to_string()))?;

        Ok(LLMResponse {
            content: payload
                .get("content")
                .and_then(|value| value.as_str())
                .unwrap_or_default()
                .to_string(),
            tool_calls: None,
            usage: parse_usage(&payload),
            finish_reason: FinishReason::Stop,
        })
    }

    async fn stream(&self, request: LLMRequest) -> Result<LLMStream, LLMError> {
        let body = self.convert_request(&request, true);
        let url = format!("{}/generate", self.base_url());

        let response = self
            .http_client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| LLMError::network(providers::QWEN, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LLMError::backend(providers::QWEN, Some(status), error_text));
        }

        let stream = try_stream! {
            let mut body_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut usage: Option<Usage> = None;

            'read: while let Some(chunk_result) = body_stream.next().await {
                let chunk =
                    chunk_result.map_err(|err| LLMError::network(providers::QWEN, err))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for line in drain_lines(&mut buffer) {
                    let value: Value = match serde_json::from_str(&line) {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(provider = providers::QWEN, %err, "skipping malformed stream frame");
                            continue;
                        }
                    };

                    if let Some(text) = value.get("content").and_then(|value| value.as_str()) {
                        if !text.is_empty() {
                            yield StreamEvent::delta(text);
                        }
                    }

                    if value.get("done").and_then(|value| value.as_bool()) == Some(true) {
                        usage = parse_usage(&value);
                        break 'read;
                    }
                }
            }

            // The server has no richer finish vocabulary; running out of
            // frames is a normal stop.
            yield StreamEvent {
                content_delta: String::new(),
                finish_reason: Some(FinishReason::Stop),
                tool_calls: None,
                usage,
            };
        };

        Ok(Box::pin(stream))
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Some(mut process) = child.take() {
            if let Err(err) = process.kill().await {
                warn!(provider = providers::QWEN, %err, "failed to stop server process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::ProviderSettings;

    fn provider_on_port(port: u16) -> QwenProvider {
        QwenProvider::from_settings(&ProviderSettings {
            port: Some(port),
            ..ProviderSettings::default()
        })
    }

    #[test]
    fn request_carries_sampling_defaults_from_the_server() {
        let provider = provider_on_port(8765);
        let request = LLMRequest {
            model: models::qwen::DEFAULT_MODEL.to_string(),
            messages: vec![Message::user("hello")],
            ..LLMRequest::default()
        };
        let body = provider.convert_request(&request, false);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["top_k"], 40);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn tools_are_never_forwarded() {
        let provider = provider_on_port(8765);
        assert!(!provider.supports_tools());
    }

    #[tokio::test]
    async fn initialize_times_out_against_a_dead_port() {
        // Port 1 on loopback refuses connections immediately, so the health
        // probe fails fast and a missing script aborts the spawn with a
        // configuration error rather than hanging.
        let provider = QwenProvider::from_settings(&ProviderSettings {
            port: Some(1),
            launch_arg: Some("/nonexistent/qwen_server.py".to_string()),
            ..ProviderSettings::default()
        });
        match provider.initialize().await {
            Err(LLMError::Configuration { provider, .. }) => {
                assert_eq!(provider, "qwen");
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn readiness_wait_times_out_against_a_dead_port() {
        let provider = provider_on_port(1)
            .with_startup_window(Duration::from_millis(10), Duration::from_millis(50));
        match provider.wait_ready().await {
            Err(LLMError::StartupTimeout { provider, waited }) => {
                assert_eq!(provider, "qwen");
                assert_eq!(waited, Duration::from_millis(50));
            }
            other => panic!("expected startup timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_without_a_child_is_a_no_op() {
        let provider = provider_on_port(8765);
        provider.shutdown().await;
    }
}
