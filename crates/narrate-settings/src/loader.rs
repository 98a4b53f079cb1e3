//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::{narrate_home, EndpointSettings, NarrateSettings};

/// `~/.narrate/settings.json`
pub fn settings_path() -> PathBuf {
    narrate_home().join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<NarrateSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<NarrateSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file(path: &Path) -> Result<NarrateSettings> {
    let defaults = serde_json::to_value(NarrateSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
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

/// Apply `NARRATE_*` overrides read through `lookup`.
///
/// Numbers must parse and sit inside their range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Anything else is
/// logged and ignored.
pub fn apply_env_overrides<F>(settings: &mut NarrateSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Storage ─────────────────────────────────────────────────────
    if let Some(v) = env.string("NARRATE_DB_PATH") {
        settings.storage.database_path = v.into();
    }
    if let Some(v) = env.string("NARRATE_OUTPUT_DIR") {
        settings.storage.output_dir = v.into();
    }

    // ── Segmenter / voice ───────────────────────────────────────────
    if let Some(v) = env.u64("NARRATE_MAX_CHARS", 50, 100_000) {
        settings.segmenter.max_chars = v as usize;
    }
    if let Some(v) = env.string("NARRATE_VOICE") {
        settings.voice.voice = v;
    }

    // ── Synthesis ───────────────────────────────────────────────────
    if let Some(v) = env.string("NARRATE_TTS_URL") {
        settings.synthesis.primary.url = v;
    }
    if let Some(v) = env.string("NARRATE_TTS_FALLBACK_URL") {
        match settings.synthesis.fallback.as_mut() {
            Some(fallback) => fallback.url = v,
            None => {
                settings.synthesis.fallback = Some(EndpointSettings {
                    name: "fallback-tts".into(),
                    url: v,
                    api_key_env: Some("NARRATE_TTS_FALLBACK_API_KEY".into()),
                })
            }
        }
    }
    if let Some(v) = env.u64("NARRATE_CONCURRENCY", 1, 64) {
        settings.synthesis.concurrency = v as usize;
    }
    if let Some(v) = env.u64("NARRATE_MAX_RETRIES", 0, 20) {
        settings.synthesis.max_retries = v as u32;
    }
    if let Some(v) = env.u64("NARRATE_CALL_TIMEOUT_MS", 1000, 3_600_000) {
        settings.synthesis.call_timeout_ms = v;
    }
    if let Some(v) = env.u64("NARRATE_RATE_LIMIT_RPM", 0, 100_000) {
        settings.synthesis.requests_per_minute = v as u32;
    }

    // ── Verification ────────────────────────────────────────────────
    if let Some(v) = env.bool("NARRATE_VERIFY") {
        settings.verification.enabled = v;
    }
    if let Some(v) = env.string("NARRATE_STT_URL") {
        settings.verification.transcriber.url = v;
    }
    if let Some(v) = env.unit_f64("NARRATE_VERIFY_THRESHOLD") {
        settings.verification.threshold = v;
    }
    if let Some(v) = env.bool("NARRATE_CASE_SENSITIVE") {
        settings.verification.case_sensitive = v;
    }

    // ── Stitching ───────────────────────────────────────────────────
    if let Some(v) = env.u64("NARRATE_FADE_MS", 0, 5_000) {
        settings.stitching.fade_ms = v as u32;
    }
    if let Some(v) = env.bool("NARRATE_NORMALIZE") {
        settings.stitching.normalize = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("NARRATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("NARRATE_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// A finite float in `0.0..=1.0`.
pub fn parse_unit_f64(val: &str) -> Option<f64> {
    let n: f64 = val.trim().parse().ok()?;
    (n.is_finite() && (0.0..=1.0).contains(&n)).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            tracing::warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn unit_f64(&self, name: &str) -> Option<f64> {
        self.parsed(name, "f64", parse_unit_f64)
    }
}
