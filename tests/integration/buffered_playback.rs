//! Cord-pull flow: the reply is withheld and released in one piece.

use crate::helpers::{Harness, Options, TTS_CHUNK, kinds, silence, voice};
use bambola::host::ClientEvent;
use bambola::recorder::EventSource;
use bambola::runtime::{OutputItem, ServerEvent};
use std::sync::atomic::Ordering;

#[tokio::test(start_paused = true)]
async fn reply_is_released_atomically_after_cord_pull() {
    let h = Harness::start(Options {
        script: vec![(3, "Hello"), (5, "there"), (23, "again")],
        ..Options::default()
    })
    .await;

    h.coordinator
        .handle_client_event(ClientEvent::CordPulled)
        .await
        .unwrap();
    h.feed(voice, 20).await;
    h.coordinator
        .handle_client_event(ClientEvent::CordReleased)
        .await
        .unwrap();
    h.feed(silence, 20).await;
    h.wait_for_reply_done().await;

    let items = h.drain().await;
    let kinds = kinds(&items);
    let ready = kinds
        .iter()
        .position(|k| k == "unmute.bambola.buffer_ready")
        .expect("buffer_ready emitted");
    assert!(
        !kinds[..ready].iter().any(|k| k == "audio"),
        "audio leaked before release: {kinds:?}"
    );
    assert_eq!(kinds[ready - 1], "silence");
    assert_eq!(
        kinds[ready..ready + 5],
        [
            "unmute.bambola.buffer_ready".to_owned(),
            "unmute.bambola.playback_started".to_owned(),
            "audio".to_owned(),
            "audio".to_owned(),
            "unmute.bambola.playback_completed".to_owned(),
        ]
    );
    assert_eq!(kinds[ready + 5], "snapshot");
    assert_eq!(kinds[ready + 6], "response.audio.done");

    match &items[ready] {
        OutputItem::Event(ServerEvent::BufferReady {
            buffer_size,
            transcription,
            llm_response,
        }) => {
            assert_eq!(*buffer_size, 2 * TTS_CHUNK);
            assert_eq!(transcription, "Hello there");
            assert_eq!(llm_response, "Hello world.");
        }
        other => panic!("expected buffer_ready, got {other:?}"),
    }

    // Text deltas still stream live while audio is withheld.
    assert!(kinds[..ready].contains(&"response.text.delta".to_owned()));

    let recorded: Vec<_> = h
        .recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .map(|(source, event)| (*source, event["type"].as_str().unwrap().to_owned()))
        .collect();
    let from_client: Vec<_> = recorded
        .iter()
        .filter(|(source, _)| *source == EventSource::Client)
        .map(|(_, kind)| kind.as_str())
        .collect();
    assert_eq!(
        from_client,
        [
            "unmute.bambola.cordino_tirato",
            "unmute.bambola.cordino_rilasciato"
        ]
    );
    let from_server: Vec<_> = recorded
        .iter()
        .filter(|(source, _)| *source == EventSource::Server)
        .map(|(_, kind)| kind.clone())
        .collect();
    crate::helpers::assert_in_order(
        &from_server,
        &[
            "response.created",
            "unmute.bambola.buffer_ready",
            "unmute.bambola.playback_completed",
            "response.audio.done",
        ],
    );

    // One release per pull: the next reply streams live again.
    h.feed(voice, 5).await;
    h.feed(silence, 20).await;
    h.wait_for_reply_done().await;
    let kinds = crate::helpers::kinds(&h.drain().await);
    assert!(!kinds.iter().any(|k| k == "unmute.bambola.buffer_ready"));
    assert_eq!(kinds.iter().filter(|k| *k == "audio").count(), 2);
}

#[tokio::test(start_paused = true)]
async fn interrupted_buffered_reply_is_never_played() {
    let h = Harness::start(Options {
        hold_end: true,
        ..Options::default()
    })
    .await;
    h.coordinator.arm_buffered_playback().await;

    h.user_turn().await;
    h.wait_for_bot_text("Hello world.").await;
    h.coordinator.interrupt().await.unwrap();
    h.feed(silence, 5).await;

    let kinds = kinds(&h.drain().await);
    assert!(!kinds.iter().any(|k| k == "audio"));
    assert!(!kinds.iter().any(|k| k.starts_with("unmute.bambola.")));
    assert!(kinds.contains(&"unmute.interrupted_by_vad".to_owned()));
}

#[tokio::test(start_paused = true)]
async fn audio_arriving_during_interrupt_stays_out_of_next_release() {
    let h = Harness::start(Options {
        script: vec![(3, "Hello"), (5, "there"), (23, "again")],
        hold_end: true,
        late_chunk: Some(4321),
        ..Options::default()
    })
    .await;
    h.coordinator.arm_buffered_playback().await;

    h.user_turn().await;
    h.wait_for_bot_text("Hello world.").await;
    h.discovery.hold_end.store(false, Ordering::SeqCst);
    h.coordinator.interrupt().await.unwrap();
    assert_eq!(h.cleared.load(Ordering::SeqCst), 1);
    h.feed(silence, 5).await;
    h.drain().await;

    // Still armed: the next reply is buffered and holds only its own audio.
    h.feed(voice, 5).await;
    h.feed(silence, 20).await;
    h.wait_for_reply_done().await;
    let items = h.drain().await;

    let sizes: Vec<_> = items
        .iter()
        .filter_map(|item| match item {
            OutputItem::Event(ServerEvent::BufferReady { buffer_size, .. }) => Some(*buffer_size),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, [2 * TTS_CHUNK]);
    assert!(
        items
            .iter()
            .all(|item| !matches!(item, OutputItem::Audio(f) if f.samples.len() == 4321)),
        "audio of the interrupted reply was played"
    );
}
