use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::types::Transcript;

/// Voice parameters forwarded to the synthesis provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub voice: String,
    pub temperature: f64,
    pub speed: f64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: "tara".into(),
            temperature: 0.7,
            speed: 1.0,
        }
    }
}

/// Text-to-speech backend. Returns a complete WAV file.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Bytes, ProviderError>;
}

/// Speech-to-text backend with word-level timings.
#[async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, ProviderError>;
}
