//! Configuration surface consumed by the provider layer

pub mod constants;
pub mod settings;

pub use settings::{ProviderSettings, WoocodeSettings, resolve_value, woocode_home};
