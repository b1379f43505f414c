//! Layered loading: compiled defaults, then the user file, then `COURIER_*`
//! environment variables.
//!
//! Merge rules for the user file: objects merge per key, arrays and scalars
//! replace, and `null` leaves the default in place.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{CourierSettings, LogFormat};

/// `~/.courier/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load from [`settings_path`] with env overrides applied.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load from `path` with env overrides applied.
///
/// A missing file yields the defaults. Unreadable or malformed JSON is an
/// error, and so is a merged result that fails validation.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = read_layers(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn read_layers(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "no settings file, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Recursive merge of `source` over `target`.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `COURIER_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    apply_overrides(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`. Values that fail to parse or fall
/// outside their range are ignored with a warning.
pub fn apply_overrides<F>(settings: &mut CourierSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };
    let transport = &mut settings.transport;

    if let Some(v) = env.string("COURIER_URL") {
        transport.url = v;
    }
    if let Some(v) = env.string("COURIER_SEND_DESTINATION") {
        transport.send_destination = v;
    }
    if let Some(v) = env.string("COURIER_TOPIC_PREFIX") {
        transport.topic_prefix = v;
    }
    if let Some(v) = env.u64("COURIER_RECONNECT_DELAY_MS", 10, 3_600_000) {
        transport.reconnect_delay_ms = v;
    }
    if let Some(v) = env.u64("COURIER_MAX_RECONNECT_ATTEMPTS", 0, u64::from(u32::MAX)) {
        // 0 means retry forever
        transport.max_reconnect_attempts = u32::try_from(v).ok().filter(|n| *n > 0);
    }
    if let Some(v) = env.u64("COURIER_CONNECT_TIMEOUT_MS", 100, 600_000) {
        transport.connect_timeout_ms = v;
    }
    if let Some(v) = env.u64("COURIER_HEARTBEAT_OUTGOING_MS", 0, 600_000) {
        transport.heartbeat_outgoing_ms = v;
    }
    if let Some(v) = env.u64("COURIER_HEARTBEAT_INCOMING_MS", 0, 600_000) {
        transport.heartbeat_incoming_ms = v;
    }

    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("COURIER_LOG_FORMAT") {
        match parse_log_format(&v) {
            Some(format) => settings.logging.format = format,
            None => warn!(key = "COURIER_LOG_FORMAT", value = %v, "invalid log format, ignoring"),
        }
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a `u64` within an inclusive range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// `json` or `compact`, case-insensitive.
pub fn parse_log_format(val: &str) -> Option<LogFormat> {
    match val.trim().to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "compact" | "text" => Some(LogFormat::Compact),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = self.string(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid integer env var, ignoring");
        }
        result
    }
}
