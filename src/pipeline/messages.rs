//! Message types passed between the orchestrator and its collaborators.

/// A mono frame of f32 audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Mono f32 samples.
    pub samples: Vec<f32>,
}

impl AudioFrame {
    /// Build a frame.
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    /// A frame of `len` zero samples.
    pub fn silence(sample_rate: u32, len: usize) -> Self {
        Self::new(sample_rate, vec![0.0; len])
    }

    /// Duration in seconds.
    pub fn duration_sec(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }
}

/// A transcription result from a recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    /// The transcribed text.
    pub text: String,
    /// Recognizer clock (seconds) at which the text starts.
    pub start_time: f64,
    /// Whether this closes an utterance (batch recognizers) rather than
    /// being a streaming word delta.
    pub is_final: bool,
}

/// Message sent to a synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TtsClientMessage {
    /// Text to speak.
    Text(String),
    /// No more text for this response.
    Eos,
}

/// Message received from a synthesizer.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsMessage {
    /// Synthesized PCM at the output sample rate.
    Audio {
        /// Mono f32 samples.
        pcm: Vec<f32>,
    },
    /// Text aligned with the audio just produced.
    Text {
        /// The spoken text fragment.
        text: String,
    },
    /// End of the synthesized stream.
    End,
    /// Anything else the backend sends; logged and skipped.
    Other(String),
}
