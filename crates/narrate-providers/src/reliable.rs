use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{info, warn};

use narrate_core::audio::inspect_wav;
use narrate_core::provider::{SpeechSynthesizer, Transcriber, VoiceConfig};
use narrate_core::{ProviderError, Transcript};

use crate::rate_limit::RateLimiter;

/// Retry, timeout and circuit breaker behaviour of a [`ReliableProvider`].
#[derive(Clone, Debug)]
pub struct ReliableConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random.
    pub jitter_factor: f64,
    /// Bound on a single provider call; expiry is a transient failure.
    pub call_timeout: Duration,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl Default for ReliableConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
            call_timeout: Duration::from_secs(120),
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// Counts failed calls in a row. At the threshold it opens and rejects
/// calls until the cooldown has passed. After that exactly one call at a
/// time is let through as a trial call; its outcome closes or reopens it.
#[derive(Debug)]
struct Breaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    open_since: Option<Instant>,
    trialing: bool,
}

impl Breaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// `Ok(true)` when the caller holds the half-open trial call.
    fn admit(&self) -> Result<bool, ProviderError> {
        let mut state = self.state.lock();
        let Some(since) = state.open_since else {
            return Ok(false);
        };
        if since.elapsed() < self.cooldown || state.trialing {
            return Err(ProviderError::Overloaded);
        }
        state.trialing = true;
        Ok(true)
    }

    /// Give the trial slot back without a verdict.
    fn release_trial(&self) {
        self.state.lock().trialing = false;
    }

    fn succeeded(&self) {
        let mut state = self.state.lock();
        if state.open_since.take().is_some() {
            info!("provider recovered, circuit closed");
        }
        state.failures = 0;
        state.trialing = false;
    }

    fn failed(&self) {
        let mut state = self.state.lock();
        state.failures += 1;
        state.trialing = false;
        let was_open = state.open_since.is_some();
        if was_open || state.failures >= self.threshold {
            if !was_open {
                warn!(
                    failures = state.failures,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "circuit opened"
                );
            }
            state.open_since = Some(Instant::now());
        }
    }

    fn label(&self) -> &'static str {
        match self.state.lock().open_since {
            None => "closed",
            Some(since) if since.elapsed() < self.cooldown => "open",
            Some(_) => "half_open",
        }
    }
}

/// `base · 2^attempt`, capped at `max`, then spread by `± jitter · delay`.
fn backoff(config: &ReliableConfig, attempt: u32) -> Duration {
    let doubled = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = doubled.min(config.max_delay);
    let spread = capped.as_secs_f64() * config.jitter_factor;
    if spread <= 0.0 {
        return capped;
    }
    let jitter = rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
}

/// A speech provider behind a per-call timeout, transient-error retries and
/// a circuit breaker. Rate-limit hints from the provider override backoff.
/// Terminal errors and cancellation are returned as-is.
///
/// With a [`RateLimiter`] attached, every attempt waits for a slot before
/// its timeout starts, so queueing never counts as a slow provider.
/// Synthesized audio must parse as WAV; garbage is a transient
/// `InvalidAudio` and is retried like any other transient failure.
pub struct ReliableProvider<P> {
    inner: P,
    config: ReliableConfig,
    breaker: Breaker,
    limiter: Option<Arc<RateLimiter>>,
    retries: AtomicU64,
}

impl<P> ReliableProvider<P> {
    pub fn new(inner: P, config: ReliableConfig) -> Self {
        let breaker = Breaker::new(
            config.circuit_breaker_threshold,
            config.circuit_breaker_cooldown,
        );
        Self {
            inner,
            config,
            breaker,
            limiter: None,
            retries: AtomicU64::new(0),
        }
    }

    pub fn with_rate_limit(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn with_defaults(inner: P) -> Self {
        Self::new(inner, ReliableConfig::default())
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    /// Retries performed over this provider's lifetime.
    pub fn total_retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn circuit_state_name(&self) -> &'static str {
        self.breaker.label()
    }

    async fn call<T, F, Fut>(&self, provider: &str, mut op: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            let trial = self.breaker.admit()?;

            let err = match tokio::time::timeout(self.config.call_timeout, op()).await {
                Ok(Ok(value)) => {
                    self.breaker.succeeded();
                    return Ok(value);
                }
                Ok(Err(ProviderError::Cancelled)) => {
                    if trial {
                        self.breaker.release_trial();
                    }
                    return Err(ProviderError::Cancelled);
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Timeout(self.config.call_timeout),
            };

            // A trial call gets one attempt; its failure reopens the circuit.
            if trial || !err.is_transient() || attempt >= self.config.max_retries {
                self.breaker.failed();
                return Err(err);
            }

            let delay = err
                .suggested_delay()
                .unwrap_or_else(|| backoff(&self.config, attempt));
            self.retries.fetch_add(1, Ordering::Relaxed);
            warn!(
                provider,
                attempt = attempt + 1,
                of = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                kind = err.error_kind(),
                error = %err,
                "provider call failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl<P: SpeechSynthesizer> SpeechSynthesizer for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<Bytes, ProviderError> {
        let inner = &self.inner;
        self.call(inner.name(), || async move {
            let bytes = inner.synthesize(text, voice).await?;
            inspect_wav(&bytes).map_err(|e| ProviderError::InvalidAudio(e.to_string()))?;
            Ok(bytes)
        })
        .await
    }
}

#[async_trait]
impl<P: Transcriber> Transcriber for ReliableProvider<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn transcribe(&self, audio: &[u8]) -> Result<Transcript, ProviderError> {
        self.call(self.inner.name(), || self.inner.transcribe(audio))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStudio;

    fn quick(max_retries: u32) -> ReliableConfig {
        ReliableConfig {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn http_500() -> ProviderError {
        ProviderError::ServerError {
            status: 500,
            body: "internal".into(),
        }
    }

    fn voice() -> VoiceConfig {
        VoiceConfig::default()
    }

    #[tokio::test]
    async fn healthy_provider_is_called_once() {
        let studio = MockStudio::default();
        let reliable = ReliableProvider::with_defaults(studio.synthesizer("p"));
        assert!(reliable.synthesize("hello", &voice()).await.is_ok());
        assert_eq!(reliable.total_retries(), 0);
        assert_eq!(reliable.inner().calls(), 1);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let studio = MockStudio::default();
        let synth = studio
            .synthesizer("p")
            .fail_on("", vec![http_500(), ProviderError::Overloaded]);
        let reliable = ReliableProvider::new(synth, quick(3));

        assert!(reliable.synthesize("recovered", &voice()).await.is_ok());
        assert_eq!(reliable.total_retries(), 2);
        assert_eq!(reliable.inner().calls(), 3);
    }

    #[tokio::test]
    async fn terminal_errors_return_at_once() {
        let studio = MockStudio::default();
        let synth = studio
            .synthesizer("p")
            .fail_on("", vec![ProviderError::Authentication("bad key".into())]);
        let reliable = ReliableProvider::new(synth, quick(3));

        let err = reliable.synthesize("hello", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Authentication(_)));
        assert_eq!(reliable.inner().calls(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on("", vec![http_500(); 4]);
        let reliable = ReliableProvider::new(synth, quick(3));

        let result = reliable.synthesize("hello", &voice()).await;
        assert!(matches!(result, Err(ProviderError::ServerError { .. })));
        assert_eq!(reliable.total_retries(), 3);
        assert_eq!(reliable.inner().calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_is_retried() {
        let studio = MockStudio::default();
        let synth = studio
            .synthesizer("p")
            .with_latency(Duration::from_secs(10));
        let config = ReliableConfig {
            call_timeout: Duration::from_secs(1),
            ..quick(2)
        };
        let reliable = ReliableProvider::new(synth, config);

        let err = reliable.synthesize("hello", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(d) if d == Duration::from_secs(1)));
        assert_eq!(reliable.inner().calls(), 3);
    }

    #[tokio::test]
    async fn cancellation_is_not_retried() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on("", vec![ProviderError::Cancelled]);
        let reliable = ReliableProvider::new(synth, quick(3));
        let err = reliable.synthesize("hello", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
        assert_eq!(reliable.total_retries(), 0);
    }

    #[tokio::test]
    async fn open_circuit_rejects_without_calling() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on("", vec![http_500(); 3]);
        let config = ReliableConfig {
            circuit_breaker_threshold: 3,
            ..quick(0)
        };
        let reliable = ReliableProvider::new(synth, config);

        for _ in 0..3 {
            assert!(reliable.synthesize("x", &voice()).await.is_err());
        }
        assert_eq!(reliable.circuit_state_name(), "open");

        let err = reliable.synthesize("x", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Overloaded));
        assert_eq!(reliable.inner().calls(), 3);
    }

    #[tokio::test]
    async fn trial_call_after_cooldown_closes_circuit() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on("", vec![http_500(); 3]);
        let config = ReliableConfig {
            circuit_breaker_threshold: 3,
            circuit_breaker_cooldown: Duration::from_millis(30),
            ..quick(0)
        };
        let reliable = ReliableProvider::new(synth, config);

        for _ in 0..3 {
            let _ = reliable.synthesize("x", &voice()).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(reliable.circuit_state_name(), "half_open");

        assert!(reliable.synthesize("x", &voice()).await.is_ok());
        assert_eq!(reliable.circuit_state_name(), "closed");
    }

    #[tokio::test]
    async fn failed_trial_call_reopens_circuit() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on("", vec![http_500(); 3]);
        let config = ReliableConfig {
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown: Duration::from_millis(30),
            ..quick(0)
        };
        let reliable = ReliableProvider::new(synth, config);

        for _ in 0..2 {
            let _ = reliable.synthesize("x", &voice()).await;
        }
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(reliable.synthesize("x", &voice()).await.is_err());
        assert_eq!(reliable.circuit_state_name(), "open");
    }

    #[tokio::test]
    async fn only_one_trial_call_after_cooldown() {
        let studio = MockStudio::default();
        let synth = studio
            .synthesizer("p")
            .fail_on("", vec![http_500(); 2])
            .with_latency(Duration::from_millis(50));
        let config = ReliableConfig {
            circuit_breaker_threshold: 2,
            circuit_breaker_cooldown: Duration::from_millis(30),
            ..quick(0)
        };
        let reliable = ReliableProvider::new(synth, config);

        for _ in 0..2 {
            assert!(reliable.synthesize("x", &voice()).await.is_err());
        }
        assert_eq!(reliable.circuit_state_name(), "open");
        tokio::time::sleep(Duration::from_millis(40)).await;

        let voice = voice();
        let (a, b, c) = tokio::join!(
            reliable.synthesize("x", &voice),
            reliable.synthesize("x", &voice),
            reliable.synthesize("x", &voice),
        );
        let results = [a, b, c];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            results
                .iter()
                .filter(|r| matches!(r, Err(ProviderError::Overloaded)))
                .count(),
            2
        );
        assert_eq!(reliable.inner().calls(), 3);
        assert_eq!(reliable.circuit_state_name(), "closed");
    }

    #[tokio::test]
    async fn failed_trial_call_is_not_retried() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on(
            "",
            vec![ProviderError::Authentication("revoked".into()), http_500()],
        );
        let config = ReliableConfig {
            circuit_breaker_threshold: 1,
            circuit_breaker_cooldown: Duration::from_millis(30),
            ..quick(3)
        };
        let reliable = ReliableProvider::new(synth, config);
        assert!(reliable.synthesize("x", &voice()).await.is_err());
        assert_eq!(reliable.circuit_state_name(), "open");

        tokio::time::sleep(Duration::from_millis(40)).await;
        let err = reliable.synthesize("x", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::ServerError { .. }));
        assert_eq!(reliable.inner().calls(), 2);
        assert_eq!(reliable.total_retries(), 0);
        assert_eq!(reliable.circuit_state_name(), "open");
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_for_a_rate_slot_is_not_a_timeout() {
        let studio = MockStudio::default();
        let config = ReliableConfig {
            call_timeout: Duration::from_secs(15),
            ..quick(0)
        };
        let reliable = ReliableProvider::new(studio.synthesizer("p"), config)
            .with_rate_limit(Arc::new(RateLimiter::per_minute(6)));

        let voice = voice();
        let start = tokio::time::Instant::now();
        let (a, b, c) = tokio::join!(
            reliable.synthesize("one", &voice),
            reliable.synthesize("two", &voice),
            reliable.synthesize("three", &voice),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(start.elapsed(), Duration::from_secs(20));
        assert_eq!(reliable.total_retries(), 0);
        assert_eq!(reliable.circuit_state_name(), "closed");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_take_their_own_rate_slots() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").fail_on("", vec![http_500()]);
        let config = ReliableConfig {
            call_timeout: Duration::from_secs(1),
            ..quick(1)
        };
        let reliable = ReliableProvider::new(synth, config)
            .with_rate_limit(Arc::new(RateLimiter::per_minute(60)));

        let start = tokio::time::Instant::now();
        assert!(reliable.synthesize("x", &voice()).await.is_ok());
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert_eq!(reliable.inner().calls(), 2);
    }

    #[tokio::test]
    async fn unplayable_audio_is_retried() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").garble_on("", 1);
        let reliable = ReliableProvider::new(synth, quick(2));

        let wav = reliable.synthesize("hello", &voice()).await.unwrap();
        assert!(inspect_wav(&wav).is_ok());
        assert_eq!(reliable.total_retries(), 1);
        assert_eq!(reliable.inner().calls(), 2);
    }

    #[tokio::test]
    async fn persistent_garbage_ends_as_invalid_audio() {
        let studio = MockStudio::default();
        let synth = studio.synthesizer("p").garble_on("", 3);
        let reliable = ReliableProvider::new(synth, quick(2));

        let err = reliable.synthesize("hello", &voice()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidAudio(_)));
        assert_eq!(reliable.inner().calls(), 3);
    }

    #[tokio::test]
    async fn transcriber_is_wrapped_too() {
        let studio = MockStudio::default();
        studio.fail_transcription("hello", vec![ProviderError::Network("reset".into())]);
        let wav = studio
            .synthesizer("p")
            .synthesize("hello world", &voice())
            .await
            .unwrap();

        let reliable = ReliableProvider::new(studio.transcriber(), quick(2));
        let transcript = reliable.transcribe(&wav).await.unwrap();
        assert_eq!(transcript.text, "hello world");
        assert_eq!(reliable.total_retries(), 1);
        assert_eq!(reliable.name(), "mock-stt");
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = ReliableConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter_factor: 0.0,
            ..Default::default()
        };
        let ms: Vec<u128> = (0..4).map(|a| backoff(&config, a).as_millis()).collect();
        assert_eq!(ms, [100, 200, 350, 350]);
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let config = ReliableConfig {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.2,
            ..Default::default()
        };
        for _ in 0..50 {
            let ms = backoff(&config, 10).as_millis();
            assert!((4000..=6000).contains(&ms), "delay {ms} out of bounds");
        }
    }
}
