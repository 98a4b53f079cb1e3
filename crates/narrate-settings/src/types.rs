//! Settings sections. Every section deserializes with defaults for any
//! missing key, so a settings file only needs the values it changes.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use narrate_core::provider::VoiceConfig;

use crate::errors::{Result, SettingsError};

/// Root of `~/.narrate` (falls back to `/tmp` without `HOME`).
pub fn narrate_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".narrate")
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NarrateSettings {
    pub storage: StorageSettings,
    pub segmenter: SegmenterSettings,
    pub voice: VoiceConfig,
    pub synthesis: SynthesisSettings,
    pub verification: VerificationSettings,
    pub stitching: StitchingSettings,
    pub sync: SyncSettings,
    pub logging: LoggingSettings,
}

impl NarrateSettings {
    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SettingsError::InvalidValue(msg.to_string()));
        if self.segmenter.max_chars == 0 {
            return invalid("segmenter.maxChars must be >= 1");
        }
        if self.synthesis.concurrency == 0 {
            return invalid("synthesis.concurrency must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.synthesis.jitter_factor) {
            return invalid("synthesis.jitterFactor must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.verification.threshold) {
            return invalid("verification.threshold must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.sync.similarity) {
            return invalid("sync.similarity must be within 0..=1");
        }
        if !(0.0..=1.0).contains(&self.sync.min_match_ratio) {
            return invalid("sync.minMatchRatio must be within 0..=1");
        }
        if self.stitching.target_peak_dbfs > 0.0 {
            return invalid("stitching.targetPeakDbfs must be <= 0");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageSettings {
    /// SQLite chunk store.
    pub database_path: PathBuf,
    /// Root for per-chapter artifact directories.
    pub output_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let home = narrate_home();
        Self {
            database_path: home.join("narrate.db"),
            output_dir: home.join("output"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SegmenterSettings {
    /// Upper bound on chunk length, in characters.
    pub max_chars: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self { max_chars: 1000 }
    }
}

/// An HTTP provider endpoint. The key is read from `api_key_env` at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSettings {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SynthesisSettings {
    pub primary: EndpointSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<EndpointSettings>,
    /// Maximum concurrent provider calls.
    pub concurrency: usize,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
    pub call_timeout_ms: u64,
    /// 0 disables rate limiting.
    pub requests_per_minute: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            primary: EndpointSettings {
                name: "primary-tts".into(),
                url: "http://127.0.0.1:8880/v1/tts".into(),
                api_key_env: Some("NARRATE_TTS_API_KEY".into()),
            },
            fallback: None,
            concurrency: 3,
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
            call_timeout_ms: 120_000,
            requests_per_minute: 0,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationSettings {
    /// When off, synthesized chunks are accepted without transcription.
    pub enabled: bool,
    pub transcriber: EndpointSettings,
    /// Scores under this flag the chunk for attention.
    pub threshold: f64,
    pub case_sensitive: bool,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            transcriber: EndpointSettings {
                name: "stt".into(),
                url: "http://127.0.0.1:8881/v1/transcribe".into(),
                api_key_env: Some("NARRATE_STT_API_KEY".into()),
            },
            threshold: 0.85,
            case_sensitive: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StitchingSettings {
    pub fade_ms: u32,
    pub normalize: bool,
    pub target_peak_dbfs: f32,
}

impl Default for StitchingSettings {
    fn default() -> Self {
        Self {
            fade_ms: 50,
            normalize: true,
            target_peak_dbfs: -1.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Source words scanned ahead when aligning a transcribed word.
    pub lookahead: usize,
    /// Minimum positional character similarity for a lenient match.
    pub similarity: f64,
    /// Below this share of matched transcribed words, alignment fails.
    pub min_match_ratio: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lookahead: 4,
            similarity: 0.8,
            min_match_ratio: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
    /// Per-target overrides, e.g. `{"narrate_store": "warn"}`.
    pub modules: BTreeMap<String, String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            modules: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(NarrateSettings::default()).unwrap();
        assert_eq!(json["segmenter"]["maxChars"], 1000);
        assert_eq!(json["synthesis"]["requestsPerMinute"], 0);
        assert_eq!(json["voice"]["voice"], "tara");
        assert!(json["synthesis"].get("fallback").is_none());
    }

    #[test]
    fn partial_section_fills_defaults() {
        let settings: NarrateSettings =
            serde_json::from_str(r#"{"stitching": {"fadeMs": 20}}"#).unwrap();
        assert_eq!(settings.stitching.fade_ms, 20);
        assert!(settings.stitching.normalize);
        assert_eq!(settings.synthesis.concurrency, 3);
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut settings = NarrateSettings::default();
        settings.synthesis.concurrency = 0;
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_threshold_out_of_range() {
        let mut settings = NarrateSettings::default();
        settings.verification.threshold = 1.5;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn fallback_endpoint_parses() {
        let settings: NarrateSettings = serde_json::from_str(
            r#"{"synthesis": {"fallback": {"name": "backup", "url": "http://b/tts"}}}"#,
        )
        .unwrap();
        let fallback = settings.synthesis.fallback.unwrap();
        assert_eq!(fallback.name, "backup");
        assert!(fallback.api_key_env.is_none());
    }
}
