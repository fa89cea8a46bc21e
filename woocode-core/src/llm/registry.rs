//! Provider registry and auto-detection.
//!
//! The registry owns one instance of every configured backend and tracks
//! which of them, if any, is active. Activation is the only path that runs
//! a backend's initialization, so merely constructing the registry touches
//! no network and spawns no processes.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::constants::providers;
use crate::config::settings::WoocodeSettings;
use crate::llm::error::LLMError;
use crate::llm::provider::{LLMProvider, ModelInfo};
use crate::llm::providers::{
    AnthropicProvider, GeminiProvider, LlamaCppProvider, OllamaProvider, OpenAIProvider,
    QwenProvider,
};

/// Summary row for a registered backend.
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub id: String,
    pub description: String,
    pub active: bool,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    /// Registration order, which doubles as the auto-detection order.
    order: Vec<String>,
    active: Option<String>,
    default_id: String,
}

impl ProviderRegistry {
    /// An empty registry with a configured default backend id.
    pub fn new(default_id: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            order: Vec::new(),
            active: None,
            default_id: default_id.into(),
        }
    }

    /// Builds the full backend set from settings. Every backend is
    /// registered whether or not it is currently reachable; availability
    /// is checked at activation time.
    pub fn from_settings(settings: &WoocodeSettings) -> Self {
        let default_id = settings
            .provider
            .clone()
            .unwrap_or_else(|| providers::DEFAULT_PROVIDER.to_string());
        let mut registry = Self::new(default_id);

        for id in providers::DETECTION_ORDER {
            let provider_settings = settings.provider_settings(id);
            let provider: Arc<dyn LLMProvider> = match *id {
                providers::GEMINI => Arc::new(GeminiProvider::from_settings(&provider_settings)),
                providers::OPENAI => Arc::new(OpenAIProvider::from_settings(&provider_settings)),
                providers::ANTHROPIC => {
                    Arc::new(AnthropicProvider::from_settings(&provider_settings))
                }
                providers::OLLAMA => Arc::new(OllamaProvider::from_settings(&provider_settings)),
                providers::QWEN => Arc::new(QwenProvider::from_settings(&provider_settings)),
                providers::LLAMACPP => {
                    Arc::new(LlamaCppProvider::from_settings(&provider_settings))
                }
                other => {
                    debug!(provider = other, "unknown provider id in detection order");
                    continue;
                }
            };
            registry.register(provider);
        }
        registry
    }

    /// Registers a backend under its own id, appending it to the
    /// detection order. Re-registering an id replaces the instance and
    /// keeps its original position.
    pub fn register(&mut self, provider: Arc<dyn LLMProvider>) {
        let id = provider.id().to_string();
        if self.providers.insert(id.clone(), provider).is_none() {
            self.order.push(id);
        }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn LLMProvider>, LLMError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| LLMError::NotFound { id: id.to_string() })
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn default_id(&self) -> &str {
        &self.default_id
    }

    /// Activates a backend by id. The backend is initialized and probed
    /// first; on any failure the previously active backend, if one
    /// existed, stays active.
    pub async fn set_active(&mut self, id: &str) -> Result<Arc<dyn LLMProvider>, LLMError> {
        let provider = self.get(id)?;
        provider.initialize().await?;
        if !provider.is_available().await {
            return Err(LLMError::Unavailable {
                provider: id.to_string(),
            });
        }
        self.active = Some(id.to_string());
        Ok(provider)
    }

    /// Walks the detection order and activates the first backend that
    /// initializes and reports itself available. Failures along the way
    /// are logged and skipped.
    pub async fn auto_detect(&mut self) -> Result<Arc<dyn LLMProvider>, LLMError> {
        let candidates = self.order.clone();
        let mut tried = Vec::new();
        for id in candidates {
            match self.set_active(&id).await {
                Ok(provider) => return Ok(provider),
                Err(err) => {
                    debug!(provider = %id, %err, "backend not usable, trying next");
                    tried.push(id);
                }
            }
        }
        Err(LLMError::NoProviderAvailable { tried })
    }

    /// Returns the active backend, falling back to activating the default
    /// one when nothing is active yet.
    pub async fn get_active(&mut self) -> Result<Arc<dyn LLMProvider>, LLMError> {
        if let Some(id) = &self.active {
            return self.get(&id.clone());
        }
        let default_id = self.default_id.clone();
        match self.set_active(&default_id).await {
            Ok(provider) => Ok(provider),
            Err(err) => {
                debug!(provider = %default_id, %err, "default backend activation failed");
                Err(LLMError::NoActiveProvider { default_id })
            }
        }
    }

    /// Model catalogues of every currently available backend. Backends
    /// that are unreachable or whose listing fails are skipped, never
    /// fatal.
    pub async fn list_all_models(&self) -> Vec<(String, Vec<ModelInfo>)> {
        let mut catalogues = Vec::new();
        for id in &self.order {
            let Some(provider) = self.providers.get(id) else {
                continue;
            };
            if !provider.is_available().await {
                continue;
            }
            match provider.list_models().await {
                Ok(models) => catalogues.push((id.clone(), models)),
                Err(err) => {
                    warn!(provider = %id, %err, "model listing failed");
                }
            }
        }
        catalogues
    }

    pub fn list_providers(&self) -> Vec<ProviderEntry> {
        self.order
            .iter()
            .filter_map(|id| {
                self.providers.get(id).map(|provider| ProviderEntry {
                    id: id.clone(),
                    description: provider.description().to_string(),
                    active: self.active.as_deref() == Some(id.as_str()),
                })
            })
            .collect()
    }

    /// Shuts down every backend and clears the active selection. Used on
    /// session teardown so spawned children do not outlive the process.
    pub async fn shutdown_all(&mut self) {
        for id in &self.order {
            if let Some(provider) = self.providers.get(id) {
                provider.shutdown().await;
            }
        }
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::providers;

    #[test]
    fn from_settings_registers_the_full_detection_order() {
        let registry = ProviderRegistry::from_settings(&WoocodeSettings::default());
        let ids: Vec<String> = registry
            .list_providers()
            .into_iter()
            .map(|entry| entry.id)
            .collect();
        assert_eq!(ids, providers::DETECTION_ORDER.to_vec());
        assert_eq!(registry.default_id(), providers::DEFAULT_PROVIDER);
        assert!(registry.active_id().is_none());
    }

    #[test]
    fn settings_provider_overrides_the_default_id() {
        let settings = WoocodeSettings {
            provider: Some(providers::OLLAMA.to_string()),
            ..Default::default()
        };
        let registry = ProviderRegistry::from_settings(&settings);
        assert_eq!(registry.default_id(), providers::OLLAMA);
    }

    #[tokio::test]
    async fn activating_an_unknown_backend_is_not_found() {
        let mut registry = ProviderRegistry::from_settings(&WoocodeSettings::default());
        match registry.set_active("mystery").await {
            Err(LLMError::NotFound { id }) => assert_eq!(id, "mystery"),
            other => panic!("expected not-found, got {:?}", other.map(|p| p.id().to_string())),
        }
        assert!(registry.active_id().is_none());
    }
}
