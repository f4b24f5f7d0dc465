//! Inbound client events.

use crate::error::{Result, TurnError};
use serde::{Deserialize, Serialize};

/// Session options a client may change at any time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Replacement system instructions; empty or absent keeps the current ones.
    #[serde(default)]
    pub instructions: Option<String>,
    /// Voice for future responses; absent keeps the current one.
    #[serde(default)]
    pub voice: Option<String>,
    /// `false` opts the session out of recording.
    #[serde(default = "default_allow_recording")]
    pub allow_recording: bool,
}

fn default_allow_recording() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            instructions: None,
            voice: None,
            allow_recording: true,
        }
    }
}

/// Events sent by the client, tagged by `"type"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Change session options.
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// New options.
        session: SessionConfig,
    },
    /// The doll's cord was pulled: record the user and buffer the reply.
    #[serde(rename = "unmute.bambola.cordino_tirato")]
    CordPulled,
    /// The doll's cord was released: stop recording.
    #[serde(rename = "unmute.bambola.cordino_rilasciato")]
    CordReleased,
}

impl ClientEvent {
    /// Wire name of this event.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::CordPulled => "unmute.bambola.cordino_tirato",
            Self::CordReleased => "unmute.bambola.cordino_rilasciato",
        }
    }

    /// Parse one JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::Protocol`] for malformed or unknown events.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| TurnError::Protocol(e.to_string()))
    }
}
