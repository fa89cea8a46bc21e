//! Styled rendering of provider errors for terminal output
//!
//! Surfaced errors always name the provider and, when known, the model that
//! was in use, since the caller may be mid-switch when a failure arrives.

use console::style;

/// Style a provider name with its customary accent color.
pub fn style_provider_name(provider: &str) -> String {
    let styled = match provider.to_lowercase().as_str() {
        "gemini" => style(provider).blue(),
        "openai" => style(provider).yellow(),
        "anthropic" => style(provider).magenta(),
        "ollama" | "qwen" | "llamacpp" => style(provider).green(),
        _ => style(provider).cyan(),
    };
    styled.to_string()
}

/// Format a provider error for display: `provider[/model] message`.
pub fn format_provider_error(provider: &str, model: Option<&str>, error: &str) -> String {
    let provider_styled = style_provider_name(provider);
    let error_styled = style(error).red().to_string();
    match model {
        Some(model) => format!("{provider_styled}/{model} {error_styled}"),
        None => format!("{provider_styled} {error_styled}"),
    }
}

/// Format a provider warning for display.
pub fn format_provider_warning(provider: &str, warning: &str) -> String {
    let provider_styled = style_provider_name(provider);
    let warning_styled = style(warning).yellow().to_string();
    format!("{provider_styled} {warning_styled}")
}
