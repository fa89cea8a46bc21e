//! Externally supplied provider settings and value precedence
//!
//! The CLI/config layer hands this crate a [`WoocodeSettings`] object it
//! loaded from wherever it pleases (TOML file, flags, dotenv). This module
//! only defines the shape and the precedence rule used when a provider is
//! constructed: explicit call argument > settings object > environment
//! variable > built-in default.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::constants::defaults;

/// Per-provider connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    /// Binary or interpreter used to launch a local provider, where one
    /// applies (qwen: python interpreter, llamacpp: the CLI binary).
    pub binary: Option<String>,
    /// Extra launch argument for local providers (qwen: server script path,
    /// llamacpp: model file path).
    pub launch_arg: Option<String>,
    pub port: Option<u16>,
}

/// Settings for the whole provider layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WoocodeSettings {
    /// Preferred provider id, consulted before auto-detection.
    pub provider: Option<String>,
    /// Default model id applied when a request does not name one.
    pub model: Option<String>,
    pub gemini: Option<ProviderSettings>,
    pub openai: Option<ProviderSettings>,
    pub anthropic: Option<ProviderSettings>,
    pub ollama: Option<ProviderSettings>,
    pub qwen: Option<ProviderSettings>,
    pub llamacpp: Option<ProviderSettings>,
}

impl WoocodeSettings {
    pub fn provider_settings(&self, id: &str) -> ProviderSettings {
        use super::constants::providers;
        let slot = match id {
            providers::GEMINI => &self.gemini,
            providers::OPENAI => &self.openai,
            providers::ANTHROPIC => &self.anthropic,
            providers::OLLAMA => &self.ollama,
            providers::QWEN => &self.qwen,
            providers::LLAMACPP => &self.llamacpp,
            _ => &None,
        };
        slot.clone().unwrap_or_default()
    }
}

/// Resolve a configuration value with the documented precedence:
/// explicit argument, then settings object, then environment, then default.
pub fn resolve_value(
    explicit: Option<String>,
    from_settings: Option<String>,
    env_key: &str,
    default: Option<&str>,
) -> Option<String> {
    explicit
        .filter(|value| !value.is_empty())
        .or_else(|| from_settings.filter(|value| !value.is_empty()))
        .or_else(|| env::var(env_key).ok().filter(|value| !value.is_empty()))
        .or_else(|| default.map(|value| value.to_string()))
}

/// Local cache directory shared with the bundled qwen server
/// (`~/.woocode/models`).
pub fn woocode_home() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(defaults::WOOCODE_HOME_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EnvVarGuard {
        key: &'static str,
    }

    impl EnvVarGuard {
        fn new(key: &'static str, value: &str) -> Self {
            unsafe { env::set_var(key, value) };
            Self { key }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            unsafe { env::remove_var(self.key) };
        }
    }

    #[test]
    fn explicit_value_wins_over_everything() {
        let _guard = EnvVarGuard::new("WOOCODE_TEST_KEY_A", "from-env");
        let resolved = resolve_value(
            Some("from-arg".to_string()),
            Some("from-settings".to_string()),
            "WOOCODE_TEST_KEY_A",
            Some("built-in"),
        );
        assert_eq!(resolved.as_deref(), Some("from-arg"));
    }

    #[test]
    fn settings_beat_environment() {
        let _guard = EnvVarGuard::new("WOOCODE_TEST_KEY_B", "from-env");
        let resolved = resolve_value(
            None,
            Some("from-settings".to_string()),
            "WOOCODE_TEST_KEY_B",
            None,
        );
        assert_eq!(resolved.as_deref(), Some("from-settings"));
    }

    #[test]
    fn environment_beats_default() {
        let _guard = EnvVarGuard::new("WOOCODE_TEST_KEY_C", "from-env");
        let resolved = resolve_value(None, None, "WOOCODE_TEST_KEY_C", Some("built-in"));
        assert_eq!(resolved.as_deref(), Some("from-env"));
    }

    #[test]
    fn home_dir_is_rooted_under_the_user_home() {
        if let Some(home) = woocode_home() {
            assert!(home.ends_with(defaults::WOOCODE_HOME_DIR));
        }
    }

    #[test]
    fn default_applies_last_and_empty_strings_are_skipped() {
        let resolved = resolve_value(
            Some(String::new()),
            Some(String::new()),
            "WOOCODE_TEST_KEY_UNSET",
            Some("built-in"),
        );
        assert_eq!(resolved.as_deref(), Some("built-in"));
    }
}
