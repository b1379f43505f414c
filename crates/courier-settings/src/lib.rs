//! # courier-settings
//!
//! Layered configuration for the courier transport.
//!
//! Sources, lowest priority first:
//! 1. compiled defaults ([`CourierSettings::default()`])
//! 2. `~/.courier/settings.json`, deep-merged over the defaults
//! 3. `COURIER_*` environment variables

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::{CourierSettings, LogFormat, LoggingSettings, TransportSettings};

use std::sync::OnceLock;

static SETTINGS: OnceLock<CourierSettings> = OnceLock::new();

/// Process-wide settings, loaded on first access.
///
/// Falls back to compiled defaults (with a warning) when loading fails.
pub fn get_settings() -> &'static CourierSettings {
    SETTINGS.get_or_init(|| {
        load_settings().unwrap_or_else(|error| {
            tracing::warn!(%error, "failed to load settings, using defaults");
            CourierSettings::default()
        })
    })
}

/// Install explicit settings before anything calls [`get_settings`].
///
/// # Errors
///
/// Hands the value back if the global was already initialized.
#[allow(clippy::result_large_err)]
pub fn init_settings(settings: CourierSettings) -> std::result::Result<(), CourierSettings> {
    SETTINGS.set(settings)
}
