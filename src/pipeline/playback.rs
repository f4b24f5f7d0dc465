//! Buffered ("doll") playback.
//!
//! When armed, synthesized audio is withheld and released in one atomic
//! sequence once the response is complete:
//! `buffer_ready → playback_started → chunks… → playback_completed`.
//! While the cord is held, the user's audio is also recorded.

use crate::pipeline::messages::AudioFrame;
use crate::runtime::{OutputItem, ServerEvent};
use tracing::{debug, info};

/// The ordered output of a buffer flush.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFlush {
    /// Sum of samples over all buffered chunks.
    pub total_samples: usize,
    /// Items to enqueue, in order.
    pub items: Vec<OutputItem>,
}

/// Buffered-playback state of one session.
#[derive(Debug, Clone, Default)]
pub struct BambolaBufferState {
    is_buffered_mode: bool,
    is_recording: bool,
    pending_chunks: Vec<AudioFrame>,
    response_buffer: Option<Vec<AudioFrame>>,
    buffer_ready: bool,
}

impl BambolaBufferState {
    /// Empty state: live streaming, not recording.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm buffered mode for the next response, starting from an empty buffer.
    pub fn arm(&mut self) {
        self.is_buffered_mode = true;
        self.response_buffer = None;
        self.buffer_ready = false;
        debug!("buffered playback armed");
    }

    /// Whether buffered mode is armed.
    pub fn is_buffered_mode(&self) -> bool {
        self.is_buffered_mode
    }

    /// Whether synthesized audio is currently being withheld.
    pub fn is_buffering(&self) -> bool {
        self.is_buffered_mode && !self.buffer_ready
    }

    /// Whether the last buffered reply has been released.
    pub fn is_buffer_ready(&self) -> bool {
        self.buffer_ready
    }

    /// Begin recording user audio, discarding any earlier recording.
    pub fn start_recording(&mut self) {
        self.pending_chunks.clear();
        self.is_recording = true;
    }

    /// Stop recording. Returns the number of recorded samples.
    pub fn stop_recording(&mut self) -> usize {
        self.is_recording = false;
        self.pending_chunks.iter().map(|c| c.samples.len()).sum()
    }

    /// Whether user audio is being recorded.
    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    /// Record a frame of user audio if recording.
    pub fn add_chunk(&mut self, frame: &AudioFrame) {
        if self.is_recording {
            self.pending_chunks.push(frame.clone());
        }
    }

    /// User audio recorded so far.
    pub fn recorded_audio(&self) -> &[AudioFrame] {
        &self.pending_chunks
    }

    /// Withhold a synthesized chunk if buffering.
    ///
    /// Returns the frame back when it should be emitted live instead.
    pub fn buffer_chunk(&mut self, frame: AudioFrame) -> Option<AudioFrame> {
        if !self.is_buffering() {
            return Some(frame);
        }
        self.response_buffer.get_or_insert_with(Vec::new).push(frame);
        None
    }

    /// Number of withheld chunks.
    pub fn buffered_chunks(&self) -> usize {
        self.response_buffer.as_ref().map_or(0, Vec::len)
    }

    /// Drop withheld audio of an abandoned response, keeping the mode armed.
    pub fn discard_response(&mut self) {
        if let Some(buffer) = self.response_buffer.take() {
            debug!(chunks = buffer.len(), "discarding buffered response");
        }
        self.buffer_ready = false;
    }

    /// Release the withheld reply.
    ///
    /// Returns `None` when nothing was buffered. Otherwise returns the
    /// ordered items to emit and leaves buffered mode. A recording in
    /// progress is kept.
    pub fn flush(&mut self, transcription: &str, llm_response: &str) -> Option<PlaybackFlush> {
        if !self.is_buffered_mode {
            return None;
        }
        let chunks = match self.response_buffer.take() {
            Some(chunks) if !chunks.is_empty() => chunks,
            _ => return None,
        };

        let total_samples: usize = chunks.iter().map(|c| c.samples.len()).sum();
        info!(total_samples, chunks = chunks.len(), "buffered reply ready");

        let mut items = Vec::with_capacity(chunks.len() + 3);
        items.push(OutputItem::Event(ServerEvent::BufferReady {
            buffer_size: total_samples,
            transcription: transcription.to_owned(),
            llm_response: llm_response.to_owned(),
        }));
        items.push(OutputItem::Event(ServerEvent::PlaybackStarted));
        items.extend(chunks.into_iter().map(OutputItem::Audio));
        items.push(OutputItem::Event(ServerEvent::PlaybackCompleted));

        self.is_buffered_mode = false;
        self.buffer_ready = true;
        debug!("buffered playback released");
        Some(PlaybackFlush {
            total_samples,
            items,
        })
    }

    /// Whether nothing is armed, recorded or withheld.
    pub fn is_idle(&self) -> bool {
        !self.is_buffered_mode
            && !self.is_recording
            && self.pending_chunks.is_empty()
            && self.response_buffer.is_none()
    }
}
