//! Pause / silence estimation.
//!
//! A single estimator decides when the user has stopped speaking. It fuses
//! frame energy with the recognizer's own pause score (when the recognizer
//! reports one) into a smoothed [0, 1] prediction, and declares a pause at
//! most once per utterance.

use crate::config::PauseConfig;
use crate::conversation::ConversationState;
use tracing::debug;

/// Asymmetric exponential moving average.
///
/// `attack_time` is the half-life while the value rises, `release_time` the
/// half-life while it falls.
#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    attack_time: f64,
    release_time: f64,
    value: f32,
}

impl ExponentialMovingAverage {
    /// Create a smoother starting at `initial`.
    pub fn new(attack_time: f64, release_time: f64, initial: f32) -> Self {
        Self {
            attack_time,
            release_time,
            value: initial,
        }
    }

    /// Fold `observation`, seen for `dt` seconds, into the average.
    pub fn update(&mut self, dt: f64, observation: f32) -> f32 {
        let half_life = if observation > self.value {
            self.attack_time
        } else {
            self.release_time
        };
        let alpha = if half_life <= 0.0 {
            1.0
        } else {
            1.0 - (-dt / half_life * std::f64::consts::LN_2).exp()
        };
        self.value += (alpha as f32) * (observation - self.value);
        self.value = self.value.clamp(0.0, 1.0);
        self.value
    }

    /// Current smoothed value.
    pub fn value(&self) -> f32 {
        self.value
    }

    /// Overwrite the current value.
    pub fn set(&mut self, value: f32) {
        self.value = value.clamp(0.0, 1.0);
    }
}

/// Smoothed pause prediction plus the bookkeeping for the silence rule.
#[derive(Debug, Clone)]
pub struct PauseEstimator {
    config: PauseConfig,
    smoothed: ExponentialMovingAverage,
    silence_sec: f64,
    audio_sec: f64,
    heard_voice: bool,
    declared: bool,
}

impl PauseEstimator {
    /// Create an estimator with an empty utterance.
    pub fn new(config: PauseConfig) -> Self {
        let smoothed =
            ExponentialMovingAverage::new(config.attack_time_sec, config.release_time_sec, 0.0);
        Self {
            config,
            smoothed,
            silence_sec: 0.0,
            audio_sec: 0.0,
            heard_voice: false,
            declared: false,
        }
    }

    /// Feed one frame of received audio.
    ///
    /// `recognizer_pause` is the recognizer's own pause score for recognizers
    /// that report one; it replaces the energy-derived observation for the
    /// smoother, while frame energy still drives the silence counter.
    /// Returns the updated prediction.
    pub fn observe(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        recognizer_pause: Option<f32>,
    ) -> f32 {
        if samples.is_empty() || sample_rate == 0 {
            return self.smoothed.value();
        }
        let dt = samples.len() as f64 / f64::from(sample_rate);
        let silent = compute_rms_energy(samples) < self.config.silence_rms_threshold;

        self.audio_sec += dt;
        if silent {
            self.silence_sec += dt;
        } else {
            self.silence_sec = 0.0;
            if self.declared {
                debug!("voice resumed after pause, re-arming");
            }
            self.heard_voice = true;
            self.declared = false;
        }

        let observation = recognizer_pause.unwrap_or(if silent {
            self.config.silence_observation
        } else {
            self.config.voiced_observation
        });
        self.smoothed.update(dt, observation.clamp(0.0, 1.0))
    }

    /// Current smoothed pause prediction.
    pub fn prediction(&self) -> f32 {
        self.smoothed.value()
    }

    /// Seconds of consecutive silence.
    pub fn silence_sec(&self) -> f64 {
        self.silence_sec
    }

    /// Seconds of audio observed since the last reset.
    pub fn audio_sec(&self) -> f64 {
        self.audio_sec
    }

    /// Check whether a pause should be declared now.
    ///
    /// Returns `true` at most once until voice resumes or the utterance is
    /// reset.
    pub fn poll_pause(&mut self, state: ConversationState) -> bool {
        if self.declared {
            return false;
        }
        let by_score = state == ConversationState::UserSpeaking
            && self.smoothed.value() > self.config.decision_threshold;
        let by_silence = state != ConversationState::BotSpeaking
            && self.heard_voice
            && self.silence_sec > self.config.max_silence_sec
            && self.audio_sec >= self.config.min_audio_sec;
        if by_score || by_silence {
            debug!(
                prediction = self.smoothed.value(),
                silence_sec = self.silence_sec,
                by_score,
                "pause declared"
            );
            self.declared = true;
            return true;
        }
        false
    }

    /// Whether voice activity right now should interrupt the bot.
    pub fn is_voice_activity(&self) -> bool {
        self.smoothed.value() < self.config.interruption_threshold
    }

    /// Start a new utterance: clears counters and the declaration latch.
    pub fn reset_utterance(&mut self) {
        self.silence_sec = 0.0;
        self.audio_sec = 0.0;
        self.heard_voice = false;
        self.declared = false;
    }

    /// Full reset, including the smoothed prediction.
    pub fn reset(&mut self) {
        self.reset_utterance();
        self.smoothed.set(0.0);
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
