//! Conversation sessions over the provider registry.
//!
//! A [`ChatSession`] keeps the running message history, speaks the external
//! rich schema at its edges, and drives whichever backend the registry has
//! active. Streaming calls surface incremental [`SessionEvent`]s and can be
//! cancelled mid-flight; a cancelled turn keeps whatever text had already
//! arrived so the history never silently loses output the caller displayed.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tracing::debug;

use crate::llm::error::LLMError;
use crate::llm::provider::{
    ContentPart, FinishReason, LLMProvider, LLMRequest, Message, MessageRole, ToolCall, Usage,
};
use crate::llm::registry::ProviderRegistry;
use crate::schema::convert::{content_to_message, message_to_content};
use crate::schema::types::{Content, GenerateRequest, GenerateResponse};

/// Caller-side handle that requests cancellation of an in-flight stream.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// The session-side half of a cancellation pair.
#[derive(Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
    /// Set on [`CancelToken::never`] tokens, which own their sender to keep
    /// the channel open; paired tokens rely on the handle instead.
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl CancelToken {
    pub fn pair() -> (CancelHandle, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            CancelToken {
                rx,
                _keepalive: None,
            },
        )
    }

    /// A token that never fires, for callers without a cancel path.
    pub fn never() -> CancelToken {
        let (tx, rx) = watch::channel(false);
        CancelToken {
            rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. If the handle was dropped
    /// without cancelling, this pends forever.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Incremental output of a streaming turn.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Content { delta: String },
    FunctionCall { name: String, args: Value },
    Completed {
        finish_reason: FinishReason,
        usage: Option<Usage>,
    },
}

pub struct ChatSession {
    registry: Arc<RwLock<ProviderRegistry>>,
    history: Vec<Message>,
    system_prompt: Option<String>,
    model: Option<String>,
}

impl ChatSession {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self::with_registry(Arc::new(RwLock::new(registry)))
    }

    /// A session over an already shared registry. Sessions sharing a
    /// registry share active-backend state but keep separate histories.
    pub fn with_registry(registry: Arc<RwLock<ProviderRegistry>>) -> Self {
        Self {
            registry,
            history: Vec::new(),
            system_prompt: None,
            model: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn registry(&self) -> Arc<RwLock<ProviderRegistry>> {
        Arc::clone(&self.registry)
    }

    /// History in the external schema, system directive excluded.
    pub fn history(&self) -> Vec<Content> {
        self.history.iter().map(message_to_content).collect()
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    /// Switches the active backend, keeping the conversation history. An
    /// activation failure leaves both the previous backend and the history
    /// untouched.
    pub async fn switch_provider(
        &mut self,
        id: &str,
        model: Option<String>,
    ) -> Result<(), LLMError> {
        self.registry.write().await.set_active(id).await?;
        self.model = model;
        Ok(())
    }

    /// The active backend's id and the model the next turn would use.
    pub async fn active_info(&self) -> Option<(String, String)> {
        let registry = self.registry.read().await;
        let id = registry.active_id()?.to_string();
        let provider = registry.get(&id).ok()?;
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| provider.default_model().to_string());
        Some((id, model))
    }

    /// One full request/response turn. The request's contents are appended
    /// to the history before the call; the backend's reply is appended
    /// after it.
    pub async fn generate(
        &mut self,
        request: GenerateRequest,
    ) -> Result<GenerateResponse, LLMError> {
        let provider = self.registry.write().await.get_active().await?;
        self.absorb_contents(&request);
        let llm_request = self.build_request(&request, provider.as_ref());

        let response = provider.generate(llm_request).await?;

        let assistant = assistant_message(&response.content, response.tool_calls.as_deref());
        let content = message_to_content(&assistant);
        if !assistant.parts.is_empty() {
            self.history.push(assistant);
        }

        Ok(GenerateResponse {
            content,
            finish_reason: Some(response.finish_reason),
            usage: response.usage,
        })
    }

    /// One streaming turn. Each delta and function call is forwarded to
    /// `on_event` as it arrives, then a single `Completed` event closes the
    /// turn. Cancelling stops the backend stream and keeps the partial text
    /// as the turn's assistant message; the call still resolves Ok.
    pub async fn stream<F>(
        &mut self,
        request: GenerateRequest,
        mut cancel: CancelToken,
        mut on_event: F,
    ) -> Result<GenerateResponse, LLMError>
    where
        F: FnMut(SessionEvent),
    {
        let provider = self.registry.write().await.get_active().await?;
        self.absorb_contents(&request);
        let llm_request = self.build_request(&request, provider.as_ref());

        let mut stream = provider.stream(llm_request).await?;

        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut usage: Option<Usage> = None;
        let mut cancelled = false;

        use futures::StreamExt;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stream cancelled by caller");
                    cancelled = true;
                    break;
                }
                next = stream.next() => {
                    let Some(event) = next else { break };
                    let event = event?;

                    if !event.content_delta.is_empty() {
                        text.push_str(&event.content_delta);
                        on_event(SessionEvent::Content {
                            delta: event.content_delta,
                        });
                    }
                    if let Some(calls) = event.tool_calls {
                        for call in calls {
                            on_event(SessionEvent::FunctionCall {
                                name: call.name.clone(),
                                args: call.args.clone(),
                            });
                            tool_calls.push(call);
                        }
                    }
                    if let Some(event_usage) = event.usage {
                        usage = Some(event_usage);
                    }
                    if let Some(reason) = event.finish_reason {
                        finish_reason = Some(reason);
                        break;
                    }
                }
            }
        }
        drop(stream);

        let finish_reason = finish_reason.unwrap_or(FinishReason::Stop);
        on_event(SessionEvent::Completed {
            finish_reason: finish_reason.clone(),
            usage,
        });
        if cancelled {
            debug!(kept_chars = text.len(), "keeping partial output after cancel");
        }

        let calls = if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        };
        let assistant = assistant_message(&text, calls.as_deref());
        let content = message_to_content(&assistant);
        if !assistant.parts.is_empty() {
            self.history.push(assistant);
        }

        Ok(GenerateResponse {
            content,
            finish_reason: Some(finish_reason),
            usage,
        })
    }

    fn absorb_contents(&mut self, request: &GenerateRequest) {
        for content in &request.contents {
            self.history.push(content_to_message(content));
        }
    }

    fn build_request(&self, request: &GenerateRequest, provider: &dyn LLMProvider) -> LLMRequest {
        let mut messages = Vec::new();
        let system = request
            .system_instruction
            .as_ref()
            .map(content_text)
            .or_else(|| self.system_prompt.clone());
        if let Some(system) = system {
            messages.push(Message::system(system));
        }
        messages.extend(self.history.iter().cloned());

        let config = request.generation_config.clone().unwrap_or_default();
        LLMRequest {
            model: request
                .model
                .clone()
                .or_else(|| self.model.clone())
                .unwrap_or_else(|| provider.default_model().to_string()),
            messages,
            temperature: config.temperature,
            top_p: config.top_p,
            top_k: config.top_k,
            max_tokens: config.max_output_tokens,
            stop_sequences: config.stop_sequences,
            tools: if provider.supports_tools() {
                request.tools.clone()
            } else {
                None
            },
        }
    }
}

fn assistant_message(text: &str, tool_calls: Option<&[ToolCall]>) -> Message {
    let mut parts = Vec::new();
    if !text.is_empty() {
        parts.push(ContentPart::text(text));
    }
    for call in tool_calls.into_iter().flatten() {
        parts.push(ContentPart::FunctionCall {
            name: call.name.clone(),
            args: call.args.clone(),
        });
    }
    Message::new(MessageRole::Assistant, parts)
}

fn content_text(content: &Content) -> String {
    content
        .parts
        .iter()
        .filter_map(|part| part.as_text())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_pair_observes_the_signal() {
        let (handle, token) = CancelToken::pair();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_the_handle_fires() {
        let (handle, mut token) = CancelToken::pair();
        handle.cancel();
        token.cancelled().await;
    }

    #[tokio::test]
    async fn never_token_stays_uncancelled() {
        let mut token = CancelToken::never();
        assert!(!token.is_cancelled());
        // Clones keep the channel open without a live handle anywhere.
        let clone = token.clone();
        drop(clone);
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err());
    }

    #[test]
    fn assistant_message_carries_text_and_calls() {
        let calls = vec![ToolCall {
            name: "search".to_string(),
            args: serde_json::json!({"query": "rust"}),
        }];
        let message = assistant_message("looking that up", Some(&calls));
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.parts.len(), 2);
    }

    #[test]
    fn empty_turns_produce_no_parts() {
        let message = assistant_message("", None);
        assert!(message.parts.is_empty());
    }
}
