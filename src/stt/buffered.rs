//! Batch recognizer adapter.

use super::{FlushMode, SpeechToText, SttCapabilities};
use crate::error::{Result, TurnError};
use crate::pipeline::messages::Transcription;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, error, info};

/// Most recent samples kept for transcription.
const MAX_BUFFER_SAMPLES: usize = 160_000;

/// Transcriptions shorter than this (after trimming) are treated as noise.
const MIN_TRANSCRIPT_CHARS: usize = 3;

/// A backend that turns a whole utterance into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe mono f32 audio.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<String>;
}

/// Wraps a [`Transcriber`] as a [`SpeechToText`].
///
/// Audio is accumulated until [`flush`](SpeechToText::flush). While the bot
/// speaks, incoming audio is discarded along with anything already
/// buffered, so the bot never transcribes its own voice.
pub struct BufferedStt<T> {
    transcriber: T,
    sample_rate: u32,
    buffer: Mutex<VecDeque<f32>>,
    sent_samples: AtomicU64,
    bot_speaking: AtomicBool,
    processing: AtomicBool,
    closed: AtomicBool,
}

impl<T: Transcriber> BufferedStt<T> {
    /// Wrap `transcriber`, expecting audio at `sample_rate`.
    pub fn new(transcriber: T, sample_rate: u32) -> Self {
        info!(sample_rate, "buffered recognizer ready");
        Self {
            transcriber,
            sample_rate,
            buffer: Mutex::new(VecDeque::with_capacity(MAX_BUFFER_SAMPLES)),
            sent_samples: AtomicU64::new(0),
            bot_speaking: AtomicBool::new(false),
            processing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Samples currently buffered.
    pub fn buffered_samples(&self) -> usize {
        self.lock_buffer().len()
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<f32>> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl<T: Transcriber> SpeechToText for BufferedStt<T> {
    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            reports_pause: false,
            flush: FlushMode::Transcribe,
        }
    }

    async fn send_audio(&self, samples: &[f32]) -> Result<Option<Transcription>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TurnError::StreamClosed("recognizer shut down".into()));
        }
        self.sent_samples
            .fetch_add(samples.len() as u64, Ordering::Relaxed);

        let mut buffer = self.lock_buffer();
        if self.bot_speaking.load(Ordering::Acquire) {
            if !buffer.is_empty() {
                debug!(cleared = buffer.len(), "ignoring audio while bot speaks");
                buffer.clear();
            }
            return Ok(None);
        }
        buffer.extend(samples.iter().copied());
        let excess = buffer.len().saturating_sub(MAX_BUFFER_SAMPLES);
        buffer.drain(..excess);
        Ok(None)
    }

    async fn flush(&self) -> Result<Option<Transcription>> {
        if self.processing.swap(true, Ordering::AcqRel) {
            return Ok(None);
        }
        let audio: Vec<f32> = self.lock_buffer().drain(..).collect();
        let start_time = self.current_time();

        let result = if audio.is_empty() {
            Ok(None)
        } else {
            info!(samples = audio.len(), "transcribing buffered audio");
            match self.transcriber.transcribe(&audio, self.sample_rate).await {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.chars().count() < MIN_TRANSCRIPT_CHARS {
                        debug!(text = %trimmed, "transcription too short, ignored");
                        Ok(None)
                    } else {
                        info!(text = %trimmed, "transcribed");
                        Ok(Some(Transcription {
                            text: trimmed.to_owned(),
                            start_time,
                            is_final: true,
                        }))
                    }
                }
                Err(e) => {
                    error!("transcription failed: {e}");
                    Ok(None)
                }
            }
        };
        self.processing.store(false, Ordering::Release);
        result
    }

    fn pause_prediction(&self) -> f32 {
        if self.bot_speaking.load(Ordering::Acquire) {
            1.0
        } else {
            0.0
        }
    }

    fn current_time(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.sent_samples.load(Ordering::Relaxed) as f64 / f64::from(self.sample_rate)
    }

    fn sent_samples(&self) -> u64 {
        self.sent_samples.load(Ordering::Relaxed)
    }

    fn delay_sec(&self) -> f64 {
        0.0
    }

    fn state(&self) -> &'static str {
        if self.closed.load(Ordering::Acquire) {
            "closed"
        } else if self.processing.load(Ordering::Acquire) {
            "processing"
        } else {
            "ready"
        }
    }

    fn set_bot_speaking(&self, speaking: bool) {
        let was = self.bot_speaking.swap(speaking, Ordering::AcqRel);
        if was != speaking {
            debug!(speaking, "recognizer bot-speaking flag changed");
        }
        if speaking {
            self.lock_buffer().clear();
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.lock_buffer().clear();
        info!("buffered recognizer shut down");
        Ok(())
    }
}
