//! Registry activation and auto-detection behavior, exercised against
//! scripted in-memory backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::stream;

use woocode_core::llm::error::LLMError;
use woocode_core::llm::provider::{
    FinishReason, LLMProvider, LLMRequest, LLMResponse, LLMStream, ModelInfo, StreamEvent,
};
use woocode_core::llm::registry::ProviderRegistry;

struct ScriptedProvider {
    id: &'static str,
    available: bool,
    init_fails: bool,
    listing_fails: bool,
    init_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn available(id: &'static str) -> Self {
        Self {
            id,
            available: true,
            init_fails: false,
            listing_fails: false,
            init_calls: AtomicUsize::new(0),
        }
    }

    fn unavailable(id: &'static str) -> Self {
        Self {
            available: false,
            ..Self::available(id)
        }
    }

    fn broken_init(id: &'static str) -> Self {
        Self {
            init_fails: true,
            ..Self::available(id)
        }
    }

    fn broken_listing(id: &'static str) -> Self {
        Self {
            listing_fails: true,
            ..Self::available(id)
        }
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    fn id(&self) -> &str {
        self.id
    }

    fn description(&self) -> &str {
        "scripted test backend"
    }

    fn default_model(&self) -> &str {
        "scripted-1"
    }

    async fn initialize(&self) -> Result<(), LLMError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.init_fails {
            return Err(LLMError::configuration(self.id, "scripted init failure"));
        }
        Ok(())
    }

    async fn is_available(&self) -> bool {
        self.available
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, LLMError> {
        if self.listing_fails {
            return Err(LLMError::backend(self.id, Some(500), "scripted listing failure"));
        }
        Ok(vec![ModelInfo::new("scripted-1", "Scripted One")])
    }

    async fn generate(&self, _request: LLMRequest) -> Result<LLMResponse, LLMError> {
        Ok(LLMResponse {
            content: "ok".to_string(),
            tool_calls: None,
            usage: None,
            finish_reason: FinishReason::Stop,
        })
    }

    async fn stream(&self, _request: LLMRequest) -> Result<LLMStream, LLMError> {
        Ok(Box::pin(stream::iter(vec![Ok(StreamEvent::finished(
            FinishReason::Stop,
        ))])))
    }
}

fn registry_of(providers: Vec<ScriptedProvider>, default_id: &str) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new(default_id);
    for provider in providers {
        registry.register(Arc::new(provider));
    }
    registry
}

#[tokio::test]
async fn auto_detect_activates_the_first_usable_backend() {
    let mut registry = registry_of(
        vec![
            ScriptedProvider::unavailable("alpha"),
            ScriptedProvider::broken_init("beta"),
            ScriptedProvider::available("gamma"),
        ],
        "alpha",
    );

    let provider = registry.auto_detect().await.unwrap();
    assert_eq!(provider.id(), "gamma");
    assert_eq!(registry.active_id(), Some("gamma"));

    let active = registry.get_active().await.unwrap();
    assert!(Arc::ptr_eq(&provider, &active));
}

#[tokio::test]
async fn auto_detect_reports_every_backend_it_tried() {
    let mut registry = registry_of(
        vec![
            ScriptedProvider::unavailable("alpha"),
            ScriptedProvider::unavailable("beta"),
        ],
        "alpha",
    );

    match registry.auto_detect().await {
        Err(LLMError::NoProviderAvailable { tried }) => {
            assert_eq!(tried, vec!["alpha".to_string(), "beta".to_string()]);
        }
        other => panic!(
            "expected no-provider-available, got {:?}",
            other.map(|p| p.id().to_string())
        ),
    }
    assert!(registry.active_id().is_none());
}

#[tokio::test]
async fn failed_activation_keeps_the_previous_backend_active() {
    let mut registry = registry_of(
        vec![
            ScriptedProvider::available("alpha"),
            ScriptedProvider::unavailable("beta"),
        ],
        "alpha",
    );

    registry.set_active("alpha").await.unwrap();
    match registry.set_active("beta").await {
        Err(LLMError::Unavailable { provider }) => assert_eq!(provider, "beta"),
        other => panic!(
            "expected unavailable, got {:?}",
            other.map(|p| p.id().to_string())
        ),
    }
    assert_eq!(registry.active_id(), Some("alpha"));
}

#[tokio::test]
async fn get_active_falls_back_to_the_default_backend() {
    let mut registry = registry_of(
        vec![
            ScriptedProvider::available("alpha"),
            ScriptedProvider::available("beta"),
        ],
        "beta",
    );

    let provider = registry.get_active().await.unwrap();
    assert_eq!(provider.id(), "beta");
    assert_eq!(registry.active_id(), Some("beta"));
}

#[tokio::test]
async fn get_active_surfaces_a_dead_default() {
    let mut registry = registry_of(vec![ScriptedProvider::unavailable("alpha")], "alpha");

    match registry.get_active().await {
        Err(LLMError::NoActiveProvider { default_id }) => assert_eq!(default_id, "alpha"),
        other => panic!(
            "expected no-active-provider, got {:?}",
            other.map(|p| p.id().to_string())
        ),
    }
}

#[tokio::test]
async fn model_listing_skips_failing_backends() {
    let registry = registry_of(
        vec![
            ScriptedProvider::available("alpha"),
            ScriptedProvider::broken_listing("beta"),
            ScriptedProvider::unavailable("gamma"),
            ScriptedProvider::available("delta"),
        ],
        "alpha",
    );

    let catalogues = registry.list_all_models().await;
    let ids: Vec<&str> = catalogues.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "delta"]);
    assert!(catalogues.iter().all(|(_, models)| !models.is_empty()));
}

#[tokio::test]
async fn activation_initializes_the_backend_exactly_once() {
    let mut registry = ProviderRegistry::new("alpha");
    let provider = Arc::new(ScriptedProvider::available("alpha"));
    registry.register(provider.clone());

    registry.set_active("alpha").await.unwrap();
    registry.get_active().await.unwrap();

    assert_eq!(provider.init_calls.load(Ordering::SeqCst), 1);
}
