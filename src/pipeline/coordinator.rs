//! Turn orchestrator: decides who may speak and wires the recognizer,
//! generator and synthesizer quests together.
//!
//! ```text
//!                 long silence                  pause / final text
//! waiting_for_user ───────────▶ user_speaking ───────────────────▶ bot_speaking
//!        ▲                                                             │
//!        └──────────── reply drained, or interrupted ◀─────────────────┘
//! ```
//!
//! All chat-history and buffer mutations happen under the turn lock. Audio
//! time is measured in received samples, not wall clock, so the orchestrator
//! is not tied to real-time streaming.

use crate::config::BambolaConfig;
use crate::conversation::{
    ChatMessage, Chatbot, ConversationState, INTERRUPTION_CHAR, Role, USER_SILENCE_MARKER,
};
use crate::discovery::{DISCOVERY_WARNING, ServiceDiscovery, find_tts_with_backoff};
use crate::error::{Result, TurnError};
use crate::host::contract::{ClientEvent, SessionConfig};
use crate::llm::TextGenerator;
use crate::pipeline::messages::{AudioFrame, Transcription, TtsClientMessage, TtsMessage};
use crate::pipeline::outbox::{Outbox, OutboxSender};
use crate::pipeline::playback::BambolaBufferState;
use crate::pipeline::words::rechunk_to_words;
use crate::quest::{Quest, QuestManager, QuestSpec};
use crate::recorder::{EventSource, Recorder};
use crate::runtime::{
    ChatSnapshot, DebugSnapshot, OutputItem, Response, ServerEvent, TtsThroughput, TurnTiming,
};
use crate::stt::{FlushMode, SpeechToText};
use crate::timer::Stopwatch;
use crate::tts::TextToSpeech;
use crate::vad::PauseEstimator;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Quest role of the recognizer.
pub const STT_QUEST: &str = "stt";
/// Quest role of the synthesizer.
pub const TTS_QUEST: &str = "tts";
/// Quest role of response generation.
pub const LLM_QUEST: &str = "llm";

const CLOSE_REASON: &str = "The assistant ended the conversation. Bye!";

type SttHandle = Arc<dyn SpeechToText>;
type TtsHandle = Arc<dyn TextToSpeech>;
type ClearHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default)]
struct Clock {
    samples_received: u64,
    waiting_for_user_start: f64,
    last_snapshot: f64,
    stt_last_message_time: f64,
}

struct PendingFlush {
    end_of_flush: f64,
    timer: Stopwatch,
}

#[derive(Default)]
struct Session {
    voice: Option<String>,
    recorder: Option<Arc<dyn Recorder>>,
    clear_hook: Option<ClearHook>,
}

struct Shared {
    config: BambolaConfig,
    discovery: Arc<dyn ServiceDiscovery>,
    generator: Arc<dyn TextGenerator>,
    quests: QuestManager,
    outbox: Outbox,
    turn_lock: tokio::sync::Mutex<()>,
    chatbot: Mutex<Chatbot>,
    buffer: Mutex<BambolaBufferState>,
    debug: Mutex<DebugSnapshot>,
    session: Mutex<Session>,
    clock: Mutex<Clock>,
    pause: Mutex<PauseEstimator>,
    flush: Mutex<Option<PendingFlush>>,
    tts_stopwatch: Mutex<Stopwatch>,
}

/// Orchestrates one conversation session.
///
/// Cheap to clone; clones share the same session. Call
/// [`shutdown`](Self::shutdown) when the session ends so every quest is
/// closed.
#[derive(Clone)]
pub struct TurnCoordinator {
    shared: Arc<Shared>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TurnCoordinator {
    /// Create a session. No backend is contacted until [`start_up`](Self::start_up).
    pub fn new(
        config: BambolaConfig,
        discovery: Arc<dyn ServiceDiscovery>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let chatbot = Chatbot::new(config.session.instructions.clone());
        let pause = PauseEstimator::new(config.pause.clone());
        let session = Session {
            voice: config.session.voice.clone(),
            ..Session::default()
        };
        Self {
            shared: Arc::new(Shared {
                config,
                discovery,
                generator,
                quests: QuestManager::new(),
                outbox: Outbox::new(),
                turn_lock: tokio::sync::Mutex::new(()),
                chatbot: Mutex::new(chatbot),
                buffer: Mutex::new(BambolaBufferState::new()),
                debug: Mutex::new(DebugSnapshot::default()),
                session: Mutex::new(session),
                clock: Mutex::new(Clock::default()),
                pause: Mutex::new(pause),
                flush: Mutex::new(None),
                tts_stopwatch: Mutex::new(Stopwatch::idle()),
            }),
        }
    }

    /// Attach a session recorder.
    pub fn with_recorder(self, recorder: Arc<dyn Recorder>) -> Self {
        if self.shared.config.session.allow_recording {
            self.session().recorder = Some(recorder);
        }
        self
    }

    /// Install a callback that clears audio already handed to the transport.
    pub fn with_clear_hook(self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.session().clear_hook = Some(Arc::new(hook));
        self
    }

    /// Connect the recognizer and start the received-audio clock.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::QuestInit`] if no recognizer could be found.
    pub async fn start_up(&self) -> Result<()> {
        let discovery = Arc::clone(&self.shared.discovery);
        let quest = self
            .shared
            .quests
            .add(QuestSpec::new(
                STT_QUEST,
                move || async move { discovery.find_stt().await },
                |_stt: SttHandle, cancel: CancellationToken| async move {
                    cancel.cancelled().await;
                    Ok(())
                },
                |stt: SttHandle| async move {
                    if let Err(e) = stt.shutdown().await {
                        warn!("recognizer shutdown failed: {e}");
                    }
                },
            ))
            .await;
        quest.get().await?;
        self.reset_waiting_for_user();
        info!("session started");
        Ok(())
    }

    /// Seconds of audio received so far.
    pub fn audio_received_sec(&self) -> f64 {
        let rate = self.shared.config.audio.sample_rate;
        if rate == 0 {
            return 0.0;
        }
        lock(&self.shared.clock).samples_received as f64 / f64::from(rate)
    }

    /// Derived conversation state.
    pub fn conversation_state(&self) -> ConversationState {
        self.chatbot().conversation_state()
    }

    /// Copy of the full chat history.
    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chatbot().chat_history().to_vec()
    }

    /// Items waiting on the outbound queue.
    pub fn pending_output(&self) -> usize {
        self.shared.outbox.len()
    }

    /// Whether a quest is live under `role`.
    pub fn has_quest(&self, role: &str) -> bool {
        self.shared.quests.contains(role)
    }

    /// Handle one frame of user audio.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::InvalidAudio`] for a frame at the wrong sample
    /// rate, and recognizer errors. A failed turn does not end the session.
    pub async fn receive(&self, frame: AudioFrame) -> Result<()> {
        let expected = self.shared.config.audio.sample_rate;
        if frame.sample_rate != expected {
            return Err(TurnError::InvalidAudio(format!(
                "expected {expected} Hz, got {} Hz",
                frame.sample_rate
            )));
        }
        let stt = self
            .stt()
            .ok_or_else(|| TurnError::Stt("recognizer not started".into()))?;

        let _turn = self.shared.turn_lock.lock().await;

        let now = {
            let mut clock = lock(&self.shared.clock);
            clock.samples_received += frame.samples.len() as u64;
            clock.samples_received as f64 / f64::from(expected)
        };
        lock(&self.shared.debug).last_receive_time = now;
        self.buffer().add_chunk(&frame);

        match self.conversation_state() {
            ConversationState::BotSpeaking => {
                // Keeps the long-silence timer from firing right after the bot stops.
                lock(&self.shared.clock).waiting_for_user_start = now;
            }
            ConversationState::UserSpeaking => {
                lock(&self.shared.debug).timing = TurnTiming::default();
            }
            ConversationState::WaitingForUser => {}
        }

        let caps = stt.capabilities();
        let transcription = stt.send_audio(&frame.samples).await?;
        let recognizer_pause = caps.reports_pause.then(|| stt.pause_prediction());
        lock(&self.shared.pause).observe(&frame.samples, frame.sample_rate, recognizer_pause);

        if let Some(transcription) = transcription {
            self.handle_transcription(transcription).await?;
        }

        let flush_deadline = lock(&self.shared.flush).as_ref().map(|f| f.end_of_flush);
        match flush_deadline {
            None => {
                self.detect_long_silence(now);
                let state = self.conversation_state();
                self.update_time_since_last_message(&stt);
                // A padding flush only makes sense once the user's words are in.
                let may_pause = state == ConversationState::UserSpeaking
                    || caps.flush == FlushMode::Transcribe;
                let (pause_declared, voice_activity) = {
                    let mut pause = lock(&self.shared.pause);
                    (may_pause && pause.poll_pause(state), pause.is_voice_activity())
                };
                if pause_declared {
                    self.on_pause(&stt).await?;
                } else if caps.reports_pause
                    && state == ConversationState::BotSpeaking
                    && voice_activity
                    && now > self.shared.config.turn.uninterruptible_by_vad_sec
                {
                    info!("interrupted by voice activity");
                    self.interrupt_locked().await?;
                    self.chatbot().add_chat_message_delta("", Role::User, None);
                }
            }
            Some(deadline) => {
                // No interruption check here: the recognizer is chewing on padding.
                if stt.current_time() > deadline {
                    let pending = lock(&self.shared.flush).take();
                    if let Some(pending) = pending {
                        let elapsed = pending.timer.time();
                        info!(elapsed_ms = elapsed * 1000.0, "recognizer flush finished");
                        lock(&self.shared.debug).timing.flush = Some(elapsed);
                    }
                    if self.conversation_state() == ConversationState::UserSpeaking {
                        self.generate_response().await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Wait briefly for the next outbound item.
    ///
    /// When idle for long enough (in received audio), returns a chat
    /// snapshot instead. Returns `None` if there is nothing to send.
    pub async fn emit(&self) -> Option<OutputItem> {
        let poll = self.shared.config.turn.emit_poll();
        if let Some(item) = self.shared.outbox.recv_timeout(poll).await {
            if let OutputItem::Event(event) = &item {
                if let Err(e) = self.record(EventSource::Server, event).await {
                    warn!("failed to record server event: {e}");
                }
            }
            return Some(item);
        }
        let now = self.audio_received_sec();
        let due = {
            let mut clock = lock(&self.shared.clock);
            let due = clock.last_snapshot < now - self.shared.config.turn.snapshot_interval_sec;
            if due {
                clock.last_snapshot = now;
            }
            due
        };
        due.then(|| OutputItem::Snapshot(self.snapshot()))
    }

    /// Cut the bot off and hand the floor back to the user.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::InvalidStateTransition`] unless the bot is speaking.
    pub async fn interrupt(&self) -> Result<()> {
        let _turn = self.shared.turn_lock.lock().await;
        self.interrupt_locked().await?;
        self.chatbot().add_chat_message_delta("", Role::User, None);
        Ok(())
    }

    /// Apply client session options.
    ///
    /// # Errors
    ///
    /// Returns recorder errors when opting out of recording.
    pub async fn update_session(&self, session: SessionConfig) -> Result<()> {
        let _turn = self.shared.turn_lock.lock().await;
        if let Some(instructions) = session.instructions.as_deref().filter(|s| !s.is_empty()) {
            self.chatbot().set_instructions(instructions);
        }
        if let Some(voice) = session.voice.as_deref().filter(|s| !s.is_empty()) {
            info!(voice, "voice changed");
            self.session().voice = Some(voice.to_owned());
        }
        if !session.allow_recording {
            let recorder = self.session().recorder.take();
            if let Some(recorder) = recorder {
                let event = serde_json::to_value(ClientEvent::SessionUpdate { session })?;
                recorder.add_event(EventSource::Client, event).await?;
                recorder.shutdown(false).await?;
                info!("recording disabled for this session");
            }
        }
        Ok(())
    }

    /// Dispatch one client event.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`update_session`](Self::update_session) and
    /// the recorder.
    pub async fn handle_client_event(&self, event: ClientEvent) -> Result<()> {
        debug!(event = event.as_str(), "client event");
        match event {
            ClientEvent::SessionUpdate { session } => self.update_session(session).await,
            ClientEvent::CordPulled => {
                self.record(EventSource::Client, &ClientEvent::CordPulled)
                    .await?;
                let _turn = self.shared.turn_lock.lock().await;
                let mut buffer = self.buffer();
                buffer.arm();
                buffer.start_recording();
                info!("cord pulled: recording, reply will be buffered");
                Ok(())
            }
            ClientEvent::CordReleased => {
                self.record(EventSource::Client, &ClientEvent::CordReleased)
                    .await?;
                let _turn = self.shared.turn_lock.lock().await;
                let samples = self.buffer().stop_recording();
                info!(samples, "cord released: recording stopped");
                Ok(())
            }
        }
    }

    /// Arm buffered playback for the next reply without recording.
    pub async fn arm_buffered_playback(&self) {
        let _turn = self.shared.turn_lock.lock().await;
        self.buffer().arm();
    }

    /// End the session: close every quest (newest first) and the recorder.
    pub async fn shutdown(&self) {
        self.shared.quests.shutdown().await;
        let recorder = self.session().recorder.take();
        if let Some(recorder) = recorder {
            if let Err(e) = recorder.shutdown(true).await {
                warn!("recorder shutdown failed: {e}");
            }
        }
        info!("session closed");
    }

    async fn handle_transcription(&self, transcription: Transcription) -> Result<()> {
        let delta = ServerEvent::TranscriptionDelta {
            delta: transcription.text.clone(),
            start_time: transcription.start_time,
        };
        if transcription.text.trim().is_empty() {
            self.push(delta);
            return Ok(());
        }

        let mut was_interrupted = false;
        if self.conversation_state() == ConversationState::BotSpeaking {
            info!("interrupted by transcription");
            self.interrupt_locked().await?;
            was_interrupted = true;
        }
        // Pushed after the swap so the interruption does not discard it.
        self.push(delta);

        lock(&self.shared.clock).stt_last_message_time = transcription.start_time;
        let is_new_message =
            self.chatbot()
                .add_chat_message_delta(&transcription.text, Role::User, None);
        if is_new_message {
            self.push(ServerEvent::SpeechStarted);
        }

        // After an interruption, wait for the user to finish.
        if transcription.is_final
            && !was_interrupted
            && self.conversation_state() != ConversationState::BotSpeaking
        {
            self.generate_response().await?;
        }
        Ok(())
    }

    async fn on_pause(&self, stt: &SttHandle) -> Result<()> {
        info!("pause detected");
        {
            let mut debug = lock(&self.shared.debug);
            debug.timing.pause_detection = debug.time_since_last_message;
        }
        self.push(ServerEvent::SpeechStopped);

        match stt.capabilities().flush {
            FlushMode::ZeroPadding => {
                let delay = stt.delay_sec();
                *lock(&self.shared.flush) = Some(PendingFlush {
                    end_of_flush: stt.current_time() + delay,
                    timer: Stopwatch::started(),
                });
                let audio = &self.shared.config.audio;
                let frames = audio.frames_covering(delay);
                let zero = vec![0.0_f32; audio.samples_per_frame];
                debug!(frames, "flushing recognizer with silence");
                for _ in 0..frames {
                    if let Some(t) = stt.send_audio(&zero).await? {
                        self.handle_transcription(t).await?;
                    }
                }
            }
            FlushMode::Transcribe => {
                let timer = Stopwatch::started();
                let transcription = stt.flush().await?;
                lock(&self.shared.debug).timing.flush = Some(timer.time());
                if let Some(t) = transcription {
                    self.handle_transcription(t).await?;
                }
                if self.conversation_state() == ConversationState::UserSpeaking {
                    self.generate_response().await?;
                }
            }
        }
        Ok(())
    }

    fn detect_long_silence(&self, now: f64) {
        if self.conversation_state() != ConversationState::WaitingForUser {
            return;
        }
        let timeout = self.shared.config.turn.user_silence_timeout_sec;
        let waited = now - lock(&self.shared.clock).waiting_for_user_start;
        let silent_for = lock(&self.shared.pause).silence_sec();
        if waited > timeout && silent_for > timeout {
            info!(waited, "long silence detected");
            self.chatbot()
                .add_chat_message_delta(USER_SILENCE_MARKER, Role::User, None);
        }
    }

    fn update_time_since_last_message(&self, stt: &SttHandle) {
        let rate = f64::from(self.shared.config.audio.sample_rate);
        let last = lock(&self.shared.clock).stt_last_message_time;
        let since = stt.sent_samples() as f64 / rate - last;
        lock(&self.shared.debug).time_since_last_message = Some(since);
    }

    async fn interrupt_locked(&self) -> Result<()> {
        let state = self.conversation_state();
        if state != ConversationState::BotSpeaking {
            return Err(TurnError::InvalidStateTransition {
                action: "interrupt",
                state: state.to_string(),
            });
        }

        self.chatbot()
            .add_chat_message_delta(INTERRUPTION_CHAR, Role::Assistant, None);
        if let Some(stt) = self.stt() {
            stt.set_bot_speaking(false);
        }
        let hook = self.session().clear_hook.clone();
        if let Some(hook) = hook {
            hook();
        }

        let tx = self.shared.outbox.replace();
        self.buffer().discard_response();
        let audio = &self.shared.config.audio;
        tx.send(AudioFrame::silence(audio.sample_rate, audio.samples_per_frame));
        tx.send(ServerEvent::InterruptedByVad);

        // Generation first, so it cannot start a new synthesizer behind our back.
        self.shared.quests.remove(LLM_QUEST).await;
        self.shared.quests.remove(TTS_QUEST).await;
        info!("bot interrupted");
        Ok(())
    }

    async fn generate_response(&self) -> Result<()> {
        // Marks the bot's turn before the generation task gets scheduled.
        self.chatbot().add_chat_message_delta("", Role::Assistant, None);
        lock(&self.shared.pause).reset_utterance();
        let this = self.clone();
        self.shared
            .quests
            .add(QuestSpec::from_run_step(LLM_QUEST, move |_cancel| async move {
                this.run_response().await
            }))
            .await;
        Ok(())
    }

    async fn run_response(self) -> Result<()> {
        let generating_message_i = self.chatbot().len();
        match self.generate_response_task(generating_message_i).await {
            Err(e) if !e.is_cancellation() => {
                self.abort_turn(generating_message_i, &e).await;
                Err(e)
            }
            other => other,
        }
    }

    async fn generate_response_task(&self, generating_message_i: usize) -> Result<()> {
        info!(generating_message_i, "generating response");
        let tx = self.shared.outbox.sender();

        if let Some(stt) = self.stt() {
            stt.set_bot_speaking(true);
        }

        let voice = self.session().voice.clone();
        let history = self.chat_history();
        tx.send(ServerEvent::ResponseCreated {
            response: Response::in_progress(voice.as_deref().unwrap_or("missing"), history),
        });

        let llm_stopwatch = Stopwatch::started();
        let tts_quest = self.start_up_tts(generating_message_i).await;

        // System prompt plus the empty assistant marker: this is the opening line.
        let turn = &self.shared.config.turn;
        let temperature = if generating_message_i == 2 {
            turn.first_message_temperature
        } else {
            turn.further_messages_temperature
        };
        let messages = self.chatbot().preprocessed_messages();
        *lock(&self.shared.tts_stopwatch) = Stopwatch::idle();

        let stream = self
            .shared
            .generator
            .chat_completion(messages, temperature)
            .await?;
        let mut words = rechunk_to_words(stream);

        let mut response_words: Vec<String> = Vec::new();
        let mut tts: Option<TtsHandle> = None;
        let mut interrupted = false;

        while let Some(word) = words.next().await {
            let word = word?;
            tx.send(ServerEvent::ResponseTextDeltaReady {
                delta: word.clone(),
            });
            response_words.push(word.clone());

            if response_words.len() == 1 {
                let ttft = llm_stopwatch.time();
                lock(&self.shared.debug).timing.to_first_token = Some(ttft);
                info!(ttft_ms = ttft * 1000.0, "sending first word to tts: {word}");
            }

            lock(&self.shared.tts_stopwatch).start_if_not_started();
            let handle = tts_quest.get().await?;
            tts = Some(Arc::clone(&handle));

            if self.history_advanced(generating_message_i) {
                interrupted = true;
                break;
            }
            handle.send(TtsClientMessage::Text(word)).await?;
        }

        tx.send(ServerEvent::ResponseTextDone {
            text: response_words.concat(),
        });

        if !interrupted {
            let handle = match tts {
                Some(handle) => handle,
                None => tts_quest.get().await?,
            };
            debug!("sending tts end of stream");
            handle.send(TtsClientMessage::Eos).await?;
        }
        info!(words = response_words.len(), "generation finished");
        Ok(())
    }

    async fn abort_turn(&self, generating_message_i: usize, cause: &TurnError) {
        error!("response generation failed: {cause}");
        self.push(ServerEvent::server_error(cause.to_string()));
        self.shared.quests.remove(TTS_QUEST).await;

        let _turn = self.shared.turn_lock.lock().await;
        self.chatbot()
            .add_chat_message_delta("", Role::User, Some(generating_message_i));
        if let Some(stt) = self.stt() {
            stt.set_bot_speaking(false);
        }
        self.reset_waiting_for_user();
    }

    async fn start_up_tts(&self, generating_message_i: usize) -> Arc<Quest<TtsHandle>> {
        let finder = self.clone();
        let runner = self.clone();
        self.shared
            .quests
            .add(QuestSpec::new(
                TTS_QUEST,
                move || async move { finder.find_tts().await },
                move |tts: TtsHandle, _cancel: CancellationToken| async move {
                    runner.tts_loop(tts, generating_message_i).await
                },
                |tts: TtsHandle| async move {
                    if let Err(e) = tts.shutdown().await {
                        warn!("synthesizer shutdown failed: {e}");
                    }
                },
            ))
            .await
    }

    async fn find_tts(&self) -> Result<TtsHandle> {
        let tx = self.shared.outbox.sender();
        let voice = self.session().voice.clone();
        find_tts_with_backoff(
            self.shared.discovery.as_ref(),
            &self.shared.config.discovery,
            voice.as_deref(),
            |_, _| {
                tx.send(ServerEvent::warning(DISCOVERY_WARNING));
            },
        )
        .await
    }

    async fn tts_loop(&self, tts: TtsHandle, generating_message_i: usize) -> Result<()> {
        // Bound to the queue as it is now; an interruption swaps it out.
        let tx = self.shared.outbox.sender();
        let rate = self.shared.config.audio.sample_rate;
        let mut audio_started: Option<f64> = None;

        loop {
            let message = match tts.recv().await {
                None => break,
                Some(Ok(message)) => message,
                Some(Err(TurnError::StreamClosed(reason))) => {
                    error!("tts connection closed: {reason}");
                    break;
                }
                Some(Err(e)) => {
                    error!("tts stream failed: {e}");
                    break;
                }
            };

            if let Some(started) = audio_started {
                let time_received = tts.received_samples() as f64 / f64::from(rate);
                let time_since_start = self.audio_received_sec() - started;
                lock(&self.shared.debug).tts_throughput = Some(TtsThroughput {
                    time_received,
                    time_since_start,
                    ratio: time_received / (time_since_start + 0.01),
                });
            }

            if self.history_advanced(generating_message_i) {
                break;
            }

            match message {
                TtsMessage::Audio { pcm } => {
                    let _turn = self.shared.turn_lock.lock().await;
                    if self.reply_is_stale(&tx, generating_message_i) {
                        debug!("dropping audio of an interrupted reply");
                        return Ok(());
                    }
                    let first_audio = lock(&self.shared.tts_stopwatch).stop();
                    if let Some(t) = first_audio {
                        lock(&self.shared.debug).timing.tts_audio = Some(t);
                    }
                    let live = self.buffer().buffer_chunk(AudioFrame::new(rate, pcm));
                    if let Some(frame) = live {
                        tx.send(frame);
                    }
                    if audio_started.is_none() {
                        audio_started = Some(self.audio_received_sec());
                    }
                }
                TtsMessage::Text { text } => {
                    let _turn = self.shared.turn_lock.lock().await;
                    if self.reply_is_stale(&tx, generating_message_i) {
                        return Ok(());
                    }
                    tx.send(ServerEvent::ResponseTextDelta {
                        delta: text.clone(),
                    });
                    self.chatbot().add_chat_message_delta(
                        &text,
                        Role::Assistant,
                        Some(generating_message_i),
                    );
                }
                TtsMessage::End => break,
                TtsMessage::Other(kind) => warn!(kind = %kind, "unexpected message from tts"),
            }
        }

        self.finish_turn(&tx, generating_message_i).await;
        Ok(())
    }

    async fn finish_turn(&self, tx: &OutboxSender, generating_message_i: usize) {
        let audio = &self.shared.config.audio;
        // Flushes the downstream codec state.
        tx.send(AudioFrame::silence(audio.sample_rate, audio.samples_per_frame));

        {
            let _turn = self.shared.turn_lock.lock().await;
            let (transcription, reply) = {
                let chatbot = self.chatbot();
                (
                    chatbot.last_message(Role::User).unwrap_or_default().to_owned(),
                    chatbot
                        .last_message(Role::Assistant)
                        .unwrap_or_default()
                        .to_owned(),
                )
            };
            let flushed = self.buffer().flush(&transcription, &reply);
            if let Some(flushed) = flushed {
                info!(total_samples = flushed.total_samples, "releasing buffered reply");
                for item in flushed.items {
                    tx.send(item);
                }
            }
            tx.send(OutputItem::Snapshot(self.snapshot()));
            tx.send(ServerEvent::ResponseAudioDone);
            self.chatbot()
                .add_chat_message_delta("", Role::User, Some(generating_message_i));
        }

        tokio::time::sleep(self.shared.config.turn.settle_delay()).await;

        if self.chatbot().len() > generating_message_i + 1 {
            debug!("conversation moved on during settle delay");
            return;
        }
        if let Some(stt) = self.stt() {
            stt.set_bot_speaking(false);
        }
        self.check_for_bot_goodbye(tx);
        self.reset_waiting_for_user();
    }

    fn check_for_bot_goodbye(&self, tx: &OutboxSender) {
        let last = self
            .chatbot()
            .last_message(Role::Assistant)
            .unwrap_or_default()
            .to_lowercase();
        let token = self.shared.config.turn.farewell_token.to_lowercase();
        if !token.is_empty() && last.ends_with(&token) {
            info!("assistant said goodbye, closing stream");
            tx.send(OutputItem::Close(CLOSE_REASON.to_owned()));
        }
    }

    fn snapshot(&self) -> ChatSnapshot {
        let stt = self.stt();
        let tts = self.tts();
        let (state, history) = {
            let chatbot = self.chatbot();
            (chatbot.conversation_state(), chatbot.visible_history())
        };
        let prediction = lock(&self.shared.pause).prediction();
        let mut debug = lock(&self.shared.debug);
        debug.conversation_state = state;
        debug.stt_connection = stt.as_ref().map_or("none", |s| s.state()).to_owned();
        debug.tts_connection = tts.as_ref().map_or("none", |t| t.state()).to_owned();
        debug.tts_voice = tts
            .as_ref()
            .and_then(|t| t.voice())
            .unwrap_or_else(|| "none".to_owned());
        debug.pause_prediction = prediction;
        ChatSnapshot {
            chat_history: history,
            debug: debug.clone(),
        }
    }

    async fn record(&self, source: EventSource, event: &impl Serialize) -> Result<()> {
        let recorder = self.session().recorder.clone();
        if let Some(recorder) = recorder {
            recorder
                .add_event(source, serde_json::to_value(event)?)
                .await?;
        }
        Ok(())
    }

    fn history_advanced(&self, generating_message_i: usize) -> bool {
        self.chatbot().len() > generating_message_i
    }

    /// Whether an interruption has taken the floor from this reply.
    ///
    /// Call with the turn lock held.
    fn reply_is_stale(&self, tx: &OutboxSender, generating_message_i: usize) -> bool {
        !tx.is_current() || self.history_advanced(generating_message_i)
    }

    fn reset_waiting_for_user(&self) {
        let now = self.audio_received_sec();
        lock(&self.shared.clock).waiting_for_user_start = now;
    }

    fn push(&self, item: impl Into<OutputItem>) {
        self.shared.outbox.sender().send(item);
    }

    fn stt(&self) -> Option<SttHandle> {
        self.shared
            .quests
            .quest::<SttHandle>(STT_QUEST)?
            .get_nowait()
    }

    fn tts(&self) -> Option<TtsHandle> {
        self.shared
            .quests
            .quest::<TtsHandle>(TTS_QUEST)?
            .get_nowait()
    }

    fn chatbot(&self) -> MutexGuard<'_, Chatbot> {
        lock(&self.shared.chatbot)
    }

    fn buffer(&self) -> MutexGuard<'_, BambolaBufferState> {
        lock(&self.shared.buffer)
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.shared.session)
    }
}
