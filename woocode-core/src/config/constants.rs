//! Centralized constants for the woocode provider layer

pub mod providers {
    /// Stable provider identifiers, also used as registry keys.
    pub const GEMINI: &str = "gemini";
    pub const OPENAI: &str = "openai";
    pub const ANTHROPIC: &str = "anthropic";
    pub const OLLAMA: &str = "ollama";
    pub const QWEN: &str = "qwen";
    pub const LLAMACPP: &str = "llamacpp";

    /// Auto-detection walks this list in order; the first provider that
    /// initializes and reports itself available wins.
    pub const DETECTION_ORDER: &[&str] = &[GEMINI, OPENAI, ANTHROPIC, OLLAMA, QWEN, LLAMACPP];

    /// Fallback when no provider was ever selected explicitly.
    pub const DEFAULT_PROVIDER: &str = GEMINI;
}

pub mod models {
    pub mod google {
        pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";
        pub const GEMINI_2_5_FLASH: &str = "gemini-2.5-flash";
        pub const GEMINI_2_5_FLASH_LITE: &str = "gemini-2.5-flash-lite";
        pub const GEMINI_2_5_PRO: &str = "gemini-2.5-pro";
        pub const SUPPORTED_MODELS: &[&str] =
            &[GEMINI_2_5_FLASH, GEMINI_2_5_FLASH_LITE, GEMINI_2_5_PRO];
    }

    pub mod openai {
        pub const DEFAULT_MODEL: &str = "gpt-5";
        pub const GPT_5: &str = "gpt-5";
        pub const GPT_5_MINI: &str = "gpt-5-mini";
        pub const GPT_4_1: &str = "gpt-4.1";
        pub const SUPPORTED_MODELS: &[&str] = &[GPT_5, GPT_5_MINI, GPT_4_1];
    }

    pub mod anthropic {
        pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
        pub const CLAUDE_SONNET_4: &str = "claude-sonnet-4-20250514";
        pub const CLAUDE_OPUS_4_1: &str = "claude-opus-4-1-20250805";
        pub const SUPPORTED_MODELS: &[&str] = &[CLAUDE_SONNET_4, CLAUDE_OPUS_4_1];
    }

    pub mod ollama {
        pub const DEFAULT_MODEL: &str = "qwen2.5-coder:7b";
        pub const SUPPORTED_MODELS: &[&str] =
            &["qwen2.5-coder:7b", "qwen2.5-coder:32b", "llama3.1:8b"];
    }

    pub mod qwen {
        pub const DEFAULT_MODEL: &str = "Qwen/Qwen3-Coder-30B-A3B-Instruct";
        pub const QWEN3_CODER_30B: &str = "Qwen/Qwen3-Coder-30B-A3B-Instruct";
        pub const QWEN2_5_CODER_32B: &str = "Qwen/Qwen2.5-Coder-32B-Instruct";
        pub const QWEN2_5_CODER_7B: &str = "Qwen/Qwen2.5-Coder-7B-Instruct";
        pub const SUPPORTED_MODELS: &[&str] =
            &[QWEN3_CODER_30B, QWEN2_5_CODER_32B, QWEN2_5_CODER_7B];
    }

    pub mod llamacpp {
        pub const DEFAULT_MODEL: &str = "qwen2.5-coder-7b-instruct-q4_k_m";
    }
}

pub mod urls {
    pub const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
    pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
    pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
    pub const OLLAMA_DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";
    pub const QWEN_SERVER_HOST: &str = "127.0.0.1";
}

pub mod env {
    pub const GEMINI_API_KEY: &str = "GEMINI_API_KEY";
    pub const OPENAI_API_KEY: &str = "OPENAI_API_KEY";
    pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
    pub const OLLAMA_BASE_URL: &str = "OLLAMA_BASE_URL";
    pub const QWEN_SERVER_PORT: &str = "QWEN_SERVER_PORT";
    pub const QWEN_SERVER_SCRIPT: &str = "QWEN_SERVER_SCRIPT";
    pub const QWEN_PYTHON_BIN: &str = "QWEN_PYTHON_BIN";
    pub const LLAMACPP_BIN: &str = "LLAMACPP_BIN";
    pub const LLAMACPP_MODEL_PATH: &str = "LLAMACPP_MODEL_PATH";
    pub const WOOCODE_PROVIDER: &str = "WOOCODE_PROVIDER";
    pub const WOOCODE_MODEL: &str = "WOOCODE_MODEL";
    /// Cache root handed to spawned local servers.
    pub const WOOCODE_HOME: &str = "WOOCODE_HOME";
}

pub mod defaults {
    use std::time::Duration;

    pub const QWEN_SERVER_PORT: u16 = 8765;
    pub const QWEN_PYTHON_BIN: &str = "python3";
    pub const QWEN_SERVER_SCRIPT: &str = "local-models/qwen_server.py";
    pub const LLAMACPP_BIN: &str = "llama-cli";

    /// Readiness polling for spawned local servers. Model loading dominates
    /// startup, so the overall window is generous while individual probes
    /// stay short.
    pub const STARTUP_POLL_INTERVAL: Duration = Duration::from_secs(2);
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(180);

    /// Reachability probes must answer quickly or the provider is treated
    /// as unavailable.
    pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

    pub const ANTHROPIC_VERSION: &str = "2023-06-01";
    pub const ANTHROPIC_MAX_TOKENS: u32 = 4096;

    /// Directory under the user's home used for local model caches,
    /// matching the bundled qwen server.
    pub const WOOCODE_HOME_DIR: &str = ".woocode";
}

pub mod message_roles {
    pub const SYSTEM: &str = "system";
    pub const USER: &str = "user";
    pub const ASSISTANT: &str = "assistant";
    pub const FUNCTION: &str = "function";
    /// The rich external schema uses "model" where the content model says
    /// assistant.
    pub const MODEL: &str = "model";
}
