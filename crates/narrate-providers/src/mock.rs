//! Deterministic in-process speech providers for tests and dry runs.
//!
//! A [`MockStudio`] renders text to a tone whose length follows the word
//! count, and remembers what it rendered so its [`MockTranscriber`] can
//! "hear" the original words back with evenly spaced timings.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use narrate_core::audio::{decode_wav, encode_wav, PcmAudio};
use narrate_core::provider::{SpeechSynthesizer, Transcriber, VoiceConfig};
use narrate_core::{ProviderError, TranscribedWord, Transcript};

const TONE_HZ: f32 = 220.0;
const TONE_AMPLITUDE: f32 = 0.3;

struct StudioState {
    sample_rate: u32,
    secs_per_word: f64,
    /// sha256 of rendered WAV bytes → source text
    rendered: DashMap<String, String>,
    mishear: Mutex<Vec<(String, String)>>,
    transcribe_failures: Mutex<Vec<(String, VecDeque<ProviderError>)>>,
    transcribe_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct MockStudio {
    state: Arc<StudioState>,
}

impl Default for MockStudio {
    fn default() -> Self {
        Self::new(16_000, 0.3)
    }
}

impl MockStudio {
    pub fn new(sample_rate: u32, secs_per_word: f64) -> Self {
        Self {
            state: Arc::new(StudioState {
                sample_rate,
                secs_per_word,
                rendered: DashMap::new(),
                mishear: Mutex::new(Vec::new()),
                transcribe_failures: Mutex::new(Vec::new()),
                transcribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn synthesizer(&self, name: &str) -> MockSynthesizer {
        MockSynthesizer {
            name: name.to_string(),
            state: self.state.clone(),
            sample_rate: self.state.sample_rate,
            failures: Mutex::new(Vec::new()),
            garbled: Mutex::new(Vec::new()),
            latency: None,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn transcriber(&self) -> MockTranscriber {
        MockTranscriber {
            state: self.state.clone(),
        }
    }

    /// Audio rendered from text containing `needle` is transcribed as `heard`.
    pub fn mishear(&self, needle: &str, heard: &str) {
        self.state
            .mishear
            .lock()
            .push((needle.to_string(), heard.to_string()));
    }

    /// Transcription of audio rendered from text containing `needle` fails
    /// with each error in turn before succeeding.
    pub fn fail_transcription(&self, needle: &str, errors: Vec<ProviderError>) {
        self.state
            .transcribe_failures
            .lock()
            .push((needle.to_string(), errors.into()));
    }

    pub fn transcribe_calls(&self) -> usize {
        self.state.transcribe_calls.load(Ordering::SeqCst)
    }

    /// Nominal duration of the tone rendered for `text`.
    pub fn expected_duration(&self, text: &str) -> f64 {
        let frames = frames_for(text, self.state.sample_rate, self.state.secs_per_word);
        frames as f64 / self.state.sample_rate as f64
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count().max(1)
}

fn frames_for(text: &str, sample_rate: u32, secs_per_word: f64) -> usize {
    (word_count(text) as f64 * secs_per_word * sample_rate as f64).round() as usize
}

fn digest_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Take the next scripted error for the first entry whose needle occurs in `text`.
fn next_failure(
    script: &Mutex<Vec<(String, VecDeque<ProviderError>)>>,
    text: &str,
) -> Option<ProviderError> {
    let mut script = script.lock();
    script
        .iter_mut()
        .find(|(needle, errors)| text.contains(needle.as_str()) && !errors.is_empty())
        .and_then(|(_, errors)| errors.pop_front())
}

/// Sine tone with the text's digest written into the leading samples so
/// every distinct text renders to distinct bytes.
fn render(text: &str, sample_rate: u32, secs_per_word: f64) -> PcmAudio {
    let frames = frames_for(text, sample_rate, secs_per_word);
    let mut samples: Vec<f32> = (0..frames)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (t * TONE_HZ * 2.0 * std::f32::consts::PI).sin() * TONE_AMPLITUDE
        })
        .collect();
    for (slot, byte) in samples.iter_mut().zip(Sha256::digest(text.as_bytes())) {
        *slot = (byte as f32 - 128.0) / 1024.0;
    }
    PcmAudio::new(sample_rate, 1, samples)
}

pub struct MockSynthesizer {
    name: String,
    state: Arc<StudioState>,
    sample_rate: u32,
    failures: Mutex<Vec<(String, VecDeque<ProviderError>)>>,
    /// needle → remaining calls answered with bytes that are not audio
    garbled: Mutex<Vec<(String, usize)>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockSynthesizer {
    /// Calls whose text contains `needle` fail with each error in turn.
    /// An empty needle matches every call.
    pub fn fail_on(self, needle: &str, errors: Vec<ProviderError>) -> Self {
        self.failures
            .lock()
            .push((needle.to_string(), errors.into()));
        self
    }

    /// The next `times` calls whose text contains `needle` succeed but
    /// return bytes that are not a WAV file.
    pub fn garble_on(self, needle: &str, times: usize) -> Self {
        self.garbled.lock().push((needle.to_string(), times));
        self
    }

    fn take_garbled(&self, text: &str) -> bool {
        let mut garbled = self.garbled.lock();
        match garbled
            .iter_mut()
            .find(|(needle, left)| *left > 0 && text.contains(needle.as_str()))
        {
            Some((_, left)) => {
                *left -= 1;
                true
            }
            None => false,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Render at a different rate than the studio default.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent `synthesize` calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn synthesize(&self, text: &str, _voice: &VoiceConfig) -> Result<Bytes, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = if text.trim().is_empty() {
            Err(ProviderError::InvalidInput("empty text".into()))
        } else if let Some(err) = next_failure(&self.failures, text) {
            Err(err)
        } else if self.take_garbled(text) {
            Ok(Bytes::from_static(b"<html>502 Bad Gateway</html>"))
        } else {
            let pcm = render(text, self.sample_rate, self.state.secs_per_word);
            encode_wav(&pcm)
                .map_err(|e| ProviderError::InvalidAudio(e.to_string()))
                .map(|wav| {
                    self.state.rendered.insert(digest_hex(&wav), text.to_string());
                    Bytes::from(wav)
                })
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub struct MockTranscriber {
    state: Arc<StudioState>,
}

#[async_trait]
impl Transcriber for MockTranscriber {
    fn name(&self) -> &str {
        "mock-stt"
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, ProviderError> {
        self.state.transcribe_calls.fetch_add(1, Ordering::SeqCst);

        let source = self
            .state
            .rendered
            .get(&digest_hex(audio))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProviderError::InvalidInput("audio was not rendered by this studio".into()))?;

        if let Some(err) = next_failure(&self.state.transcribe_failures, &source) {
            return Err(err);
        }

        let heard = self
            .state
            .mishear
            .lock()
            .iter()
            .find(|(needle, _)| source.contains(needle.as_str()))
            .map(|(_, heard)| heard.clone())
            .unwrap_or_else(|| source.clone());

        let duration = decode_wav(audio)
            .map_err(|e| ProviderError::InvalidAudio(e.to_string()))?
            .duration_secs();
        Ok(spaced_transcript(&heard, duration))
    }
}

/// Spread the words of `text` evenly across `duration` seconds.
fn spaced_transcript(text: &str, duration: f64) -> Transcript {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Transcript::default();
    }
    let slot = duration / tokens.len() as f64;
    let gap = slot * 0.1;
    let words = tokens
        .iter()
        .enumerate()
        .map(|(i, word)| TranscribedWord {
            word: (*word).to_string(),
            start: i as f64 * slot + gap / 2.0,
            end: (i + 1) as f64 * slot - gap / 2.0,
            confidence: 0.95,
        })
        .collect();
    Transcript {
        text: tokens.join(" "),
        words,
    }
}
