//! Scripted backends and a paused-clock harness for driving a session.

use async_trait::async_trait;
use bambola::config::BambolaConfig;
use bambola::conversation::{ChatMessage, ConversationState, Role};
use bambola::discovery::ServiceDiscovery;
use bambola::error::{Result, TurnError};
use bambola::llm::{TextGenerator, TextStream};
use bambola::pipeline::{AudioFrame, Transcription, TtsClientMessage, TtsMessage, TurnCoordinator};
use bambola::recorder::{EventSource, Recorder};
use bambola::runtime::{OutputItem, ServerEvent};
use bambola::stt::{FlushMode, SpeechToText, SttCapabilities};
use bambola::tts::TextToSpeech;
use futures_util::stream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub(crate) const RATE: u32 = 24_000;
pub(crate) const FRAME: usize = 1920;
/// Length of one synthesized chunk from [`FakeTts`].
pub(crate) const TTS_CHUNK: usize = 960;

pub(crate) fn voice() -> AudioFrame {
    AudioFrame::new(RATE, vec![0.3; FRAME])
}

pub(crate) fn silence() -> AudioFrame {
    AudioFrame::silence(RATE, FRAME)
}

// ── recognizer ───────────────────────────────────────────────

#[derive(Default)]
struct SttState {
    sent: u64,
    voiced: usize,
    bot_speaking: bool,
    closed: bool,
    pause: f32,
}

/// Streaming recognizer that emits scripted words on given voiced frames.
pub(crate) struct ScriptedStt {
    script: Vec<(usize, &'static str)>,
    reports_pause: bool,
    state: Mutex<SttState>,
    pub(crate) shutdowns: AtomicUsize,
}

impl ScriptedStt {
    pub(crate) fn new(script: Vec<(usize, &'static str)>, reports_pause: bool) -> Self {
        Self {
            script,
            reports_pause,
            state: Mutex::new(SttState::default()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    pub(crate) fn bot_speaking(&self) -> bool {
        self.state.lock().unwrap().bot_speaking
    }

    pub(crate) fn set_pause(&self, pause: f32) {
        self.state.lock().unwrap().pause = pause;
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    fn capabilities(&self) -> SttCapabilities {
        SttCapabilities {
            reports_pause: self.reports_pause,
            flush: FlushMode::ZeroPadding,
        }
    }

    async fn send_audio(&self, samples: &[f32]) -> Result<Option<Transcription>> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TurnError::StreamClosed("recognizer shut down".into()));
        }
        state.sent += samples.len() as u64;
        let energy = bambola::vad::compute_rms_energy(samples);
        if energy < 0.02 {
            return Ok(None);
        }
        state.voiced += 1;
        let voiced = state.voiced;
        let start_time = state.sent as f64 / f64::from(RATE);
        Ok(self
            .script
            .iter()
            .find(|(at, _)| *at == voiced)
            .map(|(_, text)| Transcription {
                text: (*text).to_owned(),
                start_time,
                is_final: false,
            }))
    }

    async fn flush(&self) -> Result<Option<Transcription>> {
        Ok(None)
    }

    fn pause_prediction(&self) -> f32 {
        self.state.lock().unwrap().pause
    }

    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().sent as f64 / f64::from(RATE)
    }

    fn sent_samples(&self) -> u64 {
        self.state.lock().unwrap().sent
    }

    fn delay_sec(&self) -> f64 {
        0.5
    }

    fn state(&self) -> &'static str {
        if self.state.lock().unwrap().closed {
            "closed"
        } else {
            "connected"
        }
    }

    fn set_bot_speaking(&self, speaking: bool) {
        self.state.lock().unwrap().bot_speaking = speaking;
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.lock().unwrap().closed = true;
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── synthesizer ──────────────────────────────────────────────

/// Synthesizer that answers each word with its text and one audio chunk.
///
/// With `hold_end`, end-of-stream is swallowed so the bot keeps the floor
/// until interrupted.
pub(crate) struct FakeTts {
    tx: Mutex<Option<mpsc::UnboundedSender<TtsMessage>>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TtsMessage>>,
    hold_end: bool,
    voice: Option<String>,
    received: AtomicU64,
    pub(crate) sent: Mutex<Vec<TtsClientMessage>>,
    pub(crate) shutdowns: AtomicUsize,
}

impl FakeTts {
    fn new(voice: Option<&str>, hold_end: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            hold_end,
            voice: voice.map(str::to_owned),
            received: AtomicU64::new(0),
            sent: Mutex::new(Vec::new()),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Deliver an audio chunk nobody asked for, as a synthesizer still
    /// draining its pipeline would.
    pub(crate) fn push_audio(&self, samples: usize) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(TtsMessage::Audio {
                pcm: vec![0.2; samples],
            });
        }
    }
}

#[async_trait]
impl TextToSpeech for FakeTts {
    async fn send(&self, message: TtsClientMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        let guard = self.tx.lock().unwrap();
        let tx = guard
            .as_ref()
            .ok_or_else(|| TurnError::StreamClosed("synthesizer shut down".into()))?;
        match message {
            TtsClientMessage::Text(text) => {
                let _ = tx.send(TtsMessage::Text { text });
                let _ = tx.send(TtsMessage::Audio {
                    pcm: vec![0.1; TTS_CHUNK],
                });
            }
            TtsClientMessage::Eos if self.hold_end => {}
            TtsClientMessage::Eos => {
                let _ = tx.send(TtsMessage::End);
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Option<Result<TtsMessage>> {
        let message = self.rx.lock().await.recv().await?;
        if let TtsMessage::Audio { pcm } = &message {
            self.received.fetch_add(pcm.len() as u64, Ordering::SeqCst);
        }
        Some(Ok(message))
    }

    fn voice(&self) -> Option<String> {
        self.voice.clone()
    }

    fn state(&self) -> &'static str {
        if self.tx.lock().unwrap().is_some() {
            "connected"
        } else {
            "closed"
        }
    }

    fn received_samples(&self) -> u64 {
        self.received.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) -> Result<()> {
        self.tx.lock().unwrap().take();
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── discovery ────────────────────────────────────────────────

/// Hands out the shared recognizer and a fresh [`FakeTts`] per lookup,
/// failing the first `tts_failures` lookups.
pub(crate) struct FakeDiscovery {
    stt: Arc<ScriptedStt>,
    tts_failures: AtomicUsize,
    /// Applies to synthesizers created while set.
    pub(crate) hold_end: AtomicBool,
    pub(crate) tts_lookups: AtomicUsize,
    pub(crate) synthesizers: Mutex<Vec<Arc<FakeTts>>>,
}

#[async_trait]
impl ServiceDiscovery for FakeDiscovery {
    async fn find_stt(&self) -> Result<Arc<dyn SpeechToText>> {
        Ok(Arc::clone(&self.stt) as Arc<dyn SpeechToText>)
    }

    async fn find_tts(&self, voice: Option<&str>) -> Result<Arc<dyn TextToSpeech>> {
        self.tts_lookups.fetch_add(1, Ordering::SeqCst);
        let remaining = self.tts_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.tts_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TurnError::BackendUnavailable {
                role: "tts".into(),
                reason: "all instances busy".into(),
            });
        }
        let tts = Arc::new(FakeTts::new(voice, self.hold_end.load(Ordering::SeqCst)));
        self.synthesizers.lock().unwrap().push(Arc::clone(&tts));
        Ok(tts as Arc<dyn TextToSpeech>)
    }
}

// ── generator ────────────────────────────────────────────────

/// Replies with the same fragments every time and records each request.
pub(crate) struct ScriptedGenerator {
    reply: Vec<&'static str>,
    fail: bool,
    pub(crate) calls: Mutex<Vec<(Vec<ChatMessage>, f32)>>,
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat_completion(
        &self,
        messages: Vec<ChatMessage>,
        temperature: f32,
    ) -> Result<TextStream> {
        self.calls.lock().unwrap().push((messages, temperature));
        if self.fail {
            return Err(TurnError::Llm("model overloaded".into()));
        }
        let fragments: Vec<Result<String>> =
            self.reply.iter().map(|s| Ok((*s).to_owned())).collect();
        Ok(Box::pin(stream::iter(fragments)))
    }
}

// ── recorder ─────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MemoryRecorder {
    pub(crate) events: Mutex<Vec<(EventSource, serde_json::Value)>>,
    pub(crate) closed_with: Mutex<Option<bool>>,
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn add_event(&self, source: EventSource, event: serde_json::Value) -> Result<()> {
        self.events.lock().unwrap().push((source, event));
        Ok(())
    }

    async fn shutdown(&self, keep_recording: bool) -> Result<()> {
        *self.closed_with.lock().unwrap() = Some(keep_recording);
        Ok(())
    }
}

// ── harness ──────────────────────────────────────────────────

pub(crate) struct Options {
    pub(crate) script: Vec<(usize, &'static str)>,
    pub(crate) reply: Vec<&'static str>,
    pub(crate) reports_pause: bool,
    pub(crate) hold_end: bool,
    pub(crate) tts_failures: usize,
    pub(crate) generator_fails: bool,
    /// Samples the live synthesizer pushes while the transport is cleared.
    pub(crate) late_chunk: Option<usize>,
    pub(crate) config: BambolaConfig,
}

impl Default for Options {
    fn default() -> Self {
        let mut config = BambolaConfig::default();
        config.session.instructions = "You are a talking doll.".into();
        config.session.voice = Some("Bambola".into());
        Self {
            script: vec![(3, "Hello"), (5, "there")],
            reply: vec!["Hello ", "world."],
            reports_pause: false,
            hold_end: false,
            tts_failures: 0,
            generator_fails: false,
            late_chunk: None,
            config,
        }
    }
}

pub(crate) struct Harness {
    pub(crate) coordinator: TurnCoordinator,
    pub(crate) stt: Arc<ScriptedStt>,
    pub(crate) discovery: Arc<FakeDiscovery>,
    pub(crate) generator: Arc<ScriptedGenerator>,
    pub(crate) recorder: Arc<MemoryRecorder>,
    /// Times the transport was told to drop queued playback.
    pub(crate) cleared: Arc<AtomicUsize>,
}

impl Harness {
    pub(crate) async fn start(options: Options) -> Self {
        let stt = Arc::new(ScriptedStt::new(options.script, options.reports_pause));
        let discovery = Arc::new(FakeDiscovery {
            stt: Arc::clone(&stt),
            tts_failures: AtomicUsize::new(options.tts_failures),
            hold_end: AtomicBool::new(options.hold_end),
            tts_lookups: AtomicUsize::new(0),
            synthesizers: Mutex::new(Vec::new()),
        });
        let generator = Arc::new(ScriptedGenerator {
            reply: options.reply,
            fail: options.generator_fails,
            calls: Mutex::new(Vec::new()),
        });
        let recorder = Arc::new(MemoryRecorder::default());
        let cleared = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&cleared);
        let hook_discovery = Arc::clone(&discovery);
        let late_chunk = options.late_chunk;
        let coordinator = TurnCoordinator::new(
            options.config,
            Arc::clone(&discovery) as Arc<dyn ServiceDiscovery>,
            Arc::clone(&generator) as Arc<dyn TextGenerator>,
        )
        .with_recorder(Arc::clone(&recorder) as Arc<dyn Recorder>)
        .with_clear_hook(move || {
            hook_count.fetch_add(1, Ordering::SeqCst);
            if let Some(samples) = late_chunk {
                let live = hook_discovery.synthesizers.lock().unwrap().last().cloned();
                if let Some(tts) = live {
                    tts.push_audio(samples);
                }
            }
        });
        coordinator.start_up().await.expect("start up");
        Self {
            coordinator,
            stt,
            discovery,
            generator,
            recorder,
            cleared,
        }
    }

    /// Feed `n` frames, yielding after each so background quests progress.
    pub(crate) async fn feed(&self, frame: fn() -> AudioFrame, n: usize) {
        for _ in 0..n {
            self.coordinator.receive(frame()).await.expect("receive");
            tokio::task::yield_now().await;
        }
    }

    /// The user says "Hello there" and then goes quiet until a reply starts.
    pub(crate) async fn user_turn(&self) {
        self.feed(voice, 20).await;
        assert_eq!(
            self.coordinator.conversation_state(),
            ConversationState::UserSpeaking
        );
        self.feed(silence, 20).await;
    }

    /// Poll `condition` on the paused clock; panics after 30 virtual seconds.
    pub(crate) async fn wait_for(&self, what: &str, condition: impl Fn(&Self) -> bool) {
        let polled = tokio::time::timeout(Duration::from_secs(30), async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(polled.is_ok(), "timed out waiting for {what}");
    }

    /// Wait until a reply has been spoken and the settle delay has passed.
    pub(crate) async fn wait_for_reply_done(&self) {
        self.wait_for("reply spoken", |h| {
            h.coordinator
                .chat_history()
                .last()
                .is_some_and(|m| m.role == Role::User && m.content.is_empty())
        })
        .await;
        self.wait_for("settle delay", |h| !h.stt.bot_speaking()).await;
    }

    /// Wait until the bot has spoken `text` and still holds the floor.
    pub(crate) async fn wait_for_bot_text(&self, text: &str) {
        self.wait_for("bot text", |h| {
            h.coordinator
                .chat_history()
                .last()
                .is_some_and(|m| m.role == Role::Assistant && m.content == text)
        })
        .await;
    }

    /// Take everything on the outbound queue.
    pub(crate) async fn drain(&self) -> Vec<OutputItem> {
        let mut items = Vec::new();
        while let Some(item) = self.coordinator.emit().await {
            items.push(item);
        }
        items
    }

    pub(crate) fn synthesizer(&self, index: usize) -> Arc<FakeTts> {
        Arc::clone(&self.discovery.synthesizers.lock().unwrap()[index])
    }

    pub(crate) fn visible_history(&self) -> Vec<(Role, String)> {
        self.coordinator
            .chat_history()
            .into_iter()
            .filter(|m| m.role != Role::System)
            .map(|m| (m.role, m.content))
            .collect()
    }
}

/// Wire type of every event item, in order. Audio shows up as `"audio"`
/// (synthesized) or `"silence"`.
pub(crate) fn kinds(items: &[OutputItem]) -> Vec<String> {
    items
        .iter()
        .map(|item| match item {
            OutputItem::Event(event) => serde_json::to_value(event).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_owned(),
            OutputItem::Audio(frame) if frame.samples.iter().all(|s| *s == 0.0) => {
                "silence".to_owned()
            }
            OutputItem::Audio(_) => "audio".to_owned(),
            OutputItem::Snapshot(_) => "snapshot".to_owned(),
            OutputItem::Close(_) => "close".to_owned(),
        })
        .collect()
}

pub(crate) fn events(items: &[OutputItem]) -> Vec<&ServerEvent> {
    items
        .iter()
        .filter_map(|item| match item {
            OutputItem::Event(event) => Some(event),
            _ => None,
        })
        .collect()
}

/// Assert `expected` appears in `actual` in order, not necessarily adjacent.
pub(crate) fn assert_in_order(actual: &[String], expected: &[&str]) {
    let mut rest = actual.iter();
    for want in expected {
        assert!(
            rest.any(|got| got == want),
            "`{want}` missing or out of order in {actual:?}"
        );
    }
}
