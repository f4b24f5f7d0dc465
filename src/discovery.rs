//! Backend discovery.
//!
//! Finding a recognizer or synthesizer may fail transiently while backends
//! warm up. Synthesizer lookups are retried with bounded exponential backoff.

use crate::config::DiscoveryConfig;
use crate::error::{Result, TurnError};
use crate::stt::SpeechToText;
use crate::tts::TextToSpeech;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Advisory sent to the client on every discovery retry.
pub const DISCOVERY_WARNING: &str = "Looking for the resources, expect some latency.";

/// Locates backend instances.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Connect to a recognizer.
    async fn find_stt(&self) -> Result<Arc<dyn SpeechToText>>;

    /// Connect to a synthesizer for `voice` (`None` = backend default).
    ///
    /// Fails with [`TurnError::BackendUnavailable`] when no instance is free.
    async fn find_tts(&self, voice: Option<&str>) -> Result<Arc<dyn TextToSpeech>>;
}

/// Backoff policy for synthesizer discovery.
pub fn discovery_backoff(config: &DiscoveryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.initial_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_factor(config.growth)
        .with_max_times(config.attempts.saturating_sub(1))
}

/// Look up a synthesizer, retrying failed attempts with backoff.
///
/// `on_retry` runs before every sleep with the failure and the upcoming
/// delay. The last error is returned once all attempts are exhausted.
/// Cancellation is never retried.
pub async fn find_tts_with_backoff<F>(
    discovery: &dyn ServiceDiscovery,
    config: &DiscoveryConfig,
    voice: Option<&str>,
    mut on_retry: F,
) -> Result<Arc<dyn TextToSpeech>>
where
    F: FnMut(&TurnError, Duration) + Send,
{
    (|| async { discovery.find_tts(voice).await })
        .retry(discovery_backoff(config))
        .sleep(tokio::time::sleep)
        .when(|e: &TurnError| !e.is_cancellation())
        .notify(|e: &TurnError, delay: Duration| {
            warn!(delay_ms = delay.as_millis() as u64, "tts discovery failed, retrying: {e}");
            on_retry(e, delay);
        })
        .await
}
