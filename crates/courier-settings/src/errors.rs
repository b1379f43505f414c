//! Errors raised while loading settings.

/// Why settings could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// The settings file exists but could not be read.
    #[error("cannot read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not JSON, or does not fit the settings schema.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// A value the transport cannot run with.
    #[error("invalid `{key}`: {reason}")]
    InvalidValue {
        /// Dotted camelCase path of the offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl SettingsError {
    pub(crate) fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key,
            reason: reason.into(),
        }
    }
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, SettingsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_value_names_key() {
        let err = SettingsError::invalid("transport.reconnectDelayMs", "must be > 0");
        assert_eq!(
            err.to_string(),
            "invalid `transport.reconnectDelayMs`: must be > 0"
        );
    }

    #[test]
    fn json_errors_convert() {
        let source = serde_json::from_str::<serde_json::Value>("{transport").unwrap_err();
        let err: SettingsError = source.into();
        assert!(matches!(err, SettingsError::Json(_)));
        assert!(err.to_string().starts_with("malformed settings"));
    }
}
