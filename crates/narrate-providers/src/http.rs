//! HTTP speech providers.
//!
//! Synthesis posts `{voice, prompt, temperature, speed}` as JSON and accepts
//! either a raw WAV body or `{"audio": "<base64>"}`. Transcription posts the
//! WAV bytes as the request body and expects word-level timings back.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, instrument};

use narrate_core::provider::{SpeechSynthesizer, Transcriber, VoiceConfig};
use narrate_core::{ProviderError, TranscribedWord, Transcript};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Where and how to reach a provider.
#[derive(Clone, Debug)]
pub struct HttpEndpoint {
    pub name: String,
    pub url: String,
    pub api_key: Option<SecretString>,
}

impl HttpEndpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    fn post(&self, client: &Client) -> reqwest::RequestBuilder {
        let req = client.post(&self.url);
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }
}

fn build_client() -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Network(format!("failed to build HTTP client: {e}")))
}

fn send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::Timeout(Duration::ZERO)
    } else {
        ProviderError::Network(e.to_string())
    }
}

fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Map a non-success response onto the provider error taxonomy.
async fn status_error(resp: Response) -> ProviderError {
    let status = resp.status().as_u16();
    let hint = retry_after(resp.headers());
    let body = resp.text().await.unwrap_or_default();
    match ProviderError::from_status(status, body) {
        ProviderError::RateLimited { .. } => ProviderError::RateLimited { retry_after: hint },
        other => other,
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

#[derive(serde::Serialize)]
struct SynthesisRequest<'a> {
    voice: &'a str,
    prompt: &'a str,
    temperature: f64,
    speed: f64,
}

#[derive(Deserialize)]
struct SynthesisJson {
    audio: String,
}

pub struct HttpSynthesizer {
    client: Client,
    endpoint: HttpEndpoint,
}

impl HttpSynthesizer {
    pub fn new(endpoint: HttpEndpoint) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
            endpoint,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    #[instrument(skip_all, fields(provider = %self.endpoint.name, chars = text.len()))]
    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Bytes, ProviderError> {
        let body = SynthesisRequest {
            voice: &voice.voice,
            prompt: text,
            temperature: voice.temperature,
            speed: voice.speed,
        };

        let resp = self
            .endpoint
            .post(&self.client)
            .json(&body)
            .send()
            .await
            .map_err(send_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let json = is_json(resp.headers());
        let bytes = resp.bytes().await.map_err(send_error)?;
        let audio = if json {
            let parsed: SynthesisJson = serde_json::from_slice(&bytes)
                .map_err(|e| ProviderError::InvalidAudio(format!("bad JSON body: {e}")))?;
            Bytes::from(
                base64::engine::general_purpose::STANDARD
                    .decode(parsed.audio.trim())
                    .map_err(|e| ProviderError::InvalidAudio(format!("bad base64 audio: {e}")))?,
            )
        } else {
            bytes
        };

        if audio.is_empty() {
            return Err(ProviderError::InvalidAudio("empty audio body".into()));
        }
        debug!(bytes = audio.len(), "synthesis response");
        Ok(audio)
    }
}

#[derive(Deserialize)]
struct TranscriptionJson {
    #[serde(default)]
    text: String,
    #[serde(default)]
    words: Vec<WordJson>,
}

#[derive(Deserialize)]
struct WordJson {
    word: String,
    start: f64,
    end: f64,
    #[serde(default = "full_confidence")]
    probability: f64,
}

fn full_confidence() -> f64 {
    1.0
}

pub struct HttpTranscriber {
    client: Client,
    endpoint: HttpEndpoint,
}

impl HttpTranscriber {
    pub fn new(endpoint: HttpEndpoint) -> Result<Self, ProviderError> {
        Ok(Self {
            client: build_client()?,
            endpoint,
        })
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    fn name(&self) -> &str {
        &self.endpoint.name
    }

    #[instrument(skip_all, fields(provider = %self.endpoint.name, bytes = audio.len()))]
    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, ProviderError> {
        let resp = self
            .endpoint
            .post(&self.client)
            .header(CONTENT_TYPE, "audio/wav")
            .body(audio.to_vec())
            .send()
            .await
            .map_err(send_error)?;

        if !resp.status().is_success() {
            return Err(status_error(resp).await);
        }

        let parsed: TranscriptionJson = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidInput(format!("bad transcription body: {e}")))?;

        let words = parsed
            .words
            .into_iter()
            .map(|w| TranscribedWord {
                word: w.word.trim().to_string(),
                start: w.start,
                end: w.end.max(w.start),
                confidence: w.probability,
            })
            .filter(|w| !w.word.is_empty())
            .collect();

        Ok(Transcript {
            text: parsed.text.trim().to_string(),
            words,
        })
    }
}
