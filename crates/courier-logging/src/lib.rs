//! # courier-logging
//!
//! One-call `tracing` setup for courier binaries.
//!
//! `RUST_LOG` wins when set. Otherwise the filter is built from
//! [`LoggingSettings::level`] plus its per-module overrides. Output goes to
//! stderr so stdout stays free for command output.

#![deny(unsafe_code)]

use courier_settings::{LogFormat, LoggingSettings};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Errors from [`init_logging`].
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    /// A filter directive did not parse.
    #[error("invalid log filter `{directive}`: {reason}")]
    InvalidFilter {
        /// The offending directive string.
        directive: String,
        /// Parser message.
        reason: String,
    },
    /// A global subscriber is already installed.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Filter directive string for `settings`, e.g. `info,courier_transport=debug`.
pub fn filter_directives(settings: &LoggingSettings) -> String {
    let mut directives = settings.level.trim().to_lowercase();
    if directives.is_empty() {
        directives.push_str("info");
    }
    for (module, level) in &settings.module_levels {
        directives.push_str(&format!(",{module}={}", level.trim().to_lowercase()));
    }
    directives
}

/// Build the filter: `RUST_LOG` if present and valid, else `settings`.
pub fn build_filter(settings: &LoggingSettings) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directives = filter_directives(settings);
    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidFilter {
        directive: directives,
        reason: e.to_string(),
    })
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), LoggingError> {
    let filter = build_filter(settings)?;
    let registry = tracing_subscriber::registry().with(filter);

    let result = match settings.format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_from_level_only() {
        let settings = LoggingSettings::default();
        assert_eq!(filter_directives(&settings), "info");
    }

    #[test]
    fn directives_include_module_overrides() {
        let mut settings = LoggingSettings {
            level: "WARN".into(),
            ..LoggingSettings::default()
        };
        let _ = settings
            .module_levels
            .insert("courier_transport".into(), "debug".into());
        let _ = settings
            .module_levels
            .insert("courier_cli".into(), "trace".into());
        assert_eq!(
            filter_directives(&settings),
            "warn,courier_cli=trace,courier_transport=debug"
        );
    }

    #[test]
    fn blank_level_defaults_to_info() {
        let settings = LoggingSettings {
            level: "  ".into(),
            ..LoggingSettings::default()
        };
        assert_eq!(filter_directives(&settings), "info");
    }

    #[test]
    fn second_init_reports_already_initialized() {
        let settings = LoggingSettings {
            format: LogFormat::Compact,
            ..LoggingSettings::default()
        };
        // The first call may or may not win; the second never does.
        let _ = init_logging(&settings);
        assert!(matches!(
            init_logging(&settings),
            Err(LoggingError::AlreadyInitialized)
        ));
    }
}
