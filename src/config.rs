//! Configuration types for the turn-taking pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for a conversation session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BambolaConfig {
    /// Audio framing settings.
    pub audio: AudioConfig,
    /// Pause / silence estimation settings.
    pub pause: PauseConfig,
    /// Turn-taking timing settings.
    pub turn: TurnConfig,
    /// Synthesis backend discovery retry settings.
    pub discovery: DiscoveryConfig,
    /// Session defaults applied before the client sends `session.update`.
    pub session: SessionDefaults,
}

/// Audio framing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz for both input and output audio.
    pub sample_rate: u32,
    /// Samples per frame (1920 samples = 80 ms at 24 kHz).
    pub samples_per_frame: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            samples_per_frame: 1920,
        }
    }
}

impl AudioConfig {
    /// Duration of one frame in seconds.
    pub fn frame_time_sec(&self) -> f64 {
        self.samples_per_frame as f64 / f64::from(self.sample_rate)
    }

    /// Whole frames needed to cover `sec` of audio, plus one.
    ///
    /// A zero-length frame covers nothing, so only the extra frame is counted.
    pub fn frames_covering(&self, sec: f64) -> usize {
        let frame_time = self.frame_time_sec();
        let whole = if frame_time > 0.0 && sec > 0.0 {
            (sec / frame_time).ceil() as usize
        } else {
            0
        };
        whole.saturating_add(1)
    }
}

/// Pause / silence estimator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PauseConfig {
    /// RMS amplitude below which a frame counts as silence.
    pub silence_rms_threshold: f32,
    /// Instantaneous observation fed to the smoother for a silent frame.
    pub silence_observation: f32,
    /// Instantaneous observation fed to the smoother for a voiced frame.
    pub voiced_observation: f32,
    /// Half-life in seconds while the score rises (towards "pause").
    pub attack_time_sec: f64,
    /// Half-life in seconds while the score falls (towards "speaking").
    pub release_time_sec: f64,
    /// Smoothed score above which a pause is declared while the user speaks.
    pub decision_threshold: f32,
    /// Accumulated silence that declares a pause regardless of the score.
    pub max_silence_sec: f64,
    /// Minimum accumulated audio before the silence rule may fire.
    pub min_audio_sec: f64,
    /// Score below which recognizer-level voice activity interrupts the bot.
    pub interruption_threshold: f32,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            silence_rms_threshold: 0.02,
            silence_observation: 0.8,
            voiced_observation: 0.2,
            attack_time_sec: 0.5,
            release_time_sec: 0.1,
            decision_threshold: 0.6,
            max_silence_sec: 2.0,
            min_audio_sec: 1.0,
            interruption_threshold: 0.4,
        }
    }
}

/// Turn-taking timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Seconds of user silence (while waiting for them) before a silence marker is injected.
    pub user_silence_timeout_sec: f64,
    /// Seconds after connection start during which voice activity cannot interrupt the bot.
    ///
    /// Echo cancellation takes a while to settle at the start of a call; a
    /// completed transcription can still interrupt during this window.
    pub uninterruptible_by_vad_sec: f64,
    /// Delay after a completed turn before the recognizer is re-enabled.
    pub settle_delay_ms: u64,
    /// Case-insensitive suffix of an assistant message that ends the session.
    pub farewell_token: String,
    /// Sampling temperature for the first assistant message.
    pub first_message_temperature: f32,
    /// Sampling temperature for later assistant messages.
    pub further_messages_temperature: f32,
    /// How long `emit` waits for an outbound item before returning.
    pub emit_poll_ms: u64,
    /// Minimum received-audio seconds between idle chat snapshots.
    pub snapshot_interval_sec: f64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            user_silence_timeout_sec: 7.0,
            uninterruptible_by_vad_sec: 3.0,
            settle_delay_ms: 1000,
            farewell_token: "bye!".to_owned(),
            first_message_temperature: 0.7,
            further_messages_temperature: 0.7,
            emit_poll_ms: 100,
            snapshot_interval_sec: 1.0,
        }
    }
}

impl TurnConfig {
    /// Post-turn settle delay as a `Duration`.
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Emit poll timeout as a `Duration`.
    pub fn emit_poll(&self) -> Duration {
        Duration::from_millis(self.emit_poll_ms)
    }
}

/// Retry policy for looking up a synthesis backend that may still be warming up.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Total lookup attempts, including the first one.
    pub attempts: usize,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplicative growth of the delay between attempts.
    pub growth: f32,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay_ms: 50,
            growth: 1.5,
            max_delay_ms: 1000,
        }
    }
}

/// Session defaults, overridden per client by `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaults {
    /// Voice used until the client picks one (None = backend default).
    pub voice: Option<String>,
    /// System instructions placed at the head of the chat history.
    pub instructions: String,
    /// Whether sessions are recorded when a recorder is attached.
    pub allow_recording: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            voice: None,
            instructions: "You are a friendly talking doll. Keep answers short and spoken-style."
                .to_owned(),
            allow_recording: true,
        }
    }
}

impl BambolaConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| crate::error::TurnError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Config`](crate::error::TurnError::Config) naming the bad field.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(crate::error::TurnError::Config(
                "audio.sample_rate must be positive".into(),
            ));
        }
        if self.audio.samples_per_frame == 0 {
            return Err(crate::error::TurnError::Config(
                "audio.samples_per_frame must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::TurnError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/bambola/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("bambola").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("bambola")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/bambola-config/config.toml")
        }
    }
}
