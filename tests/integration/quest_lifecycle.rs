//! Quest supervision seen from several concurrent callers.

use bambola::error::TurnError;
use bambola::quest::{QuestManager, QuestSpec, QuestState};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn concurrent_waiters_share_one_resource() {
    let manager = QuestManager::new();
    let inits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&inits);
    let quest = manager
        .add(QuestSpec::new(
            "tts",
            move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(Arc::new(String::from("voice-a")))
            },
            |_voice: Arc<String>, cancel| async move {
                cancel.cancelled().await;
                Ok(())
            },
            |_voice| async {},
        ))
        .await;

    let waiters: Vec<_> = (0..4)
        .map(|_| {
            let quest = Arc::clone(&quest);
            tokio::spawn(async move { quest.get().await })
        })
        .collect();
    let mut resources = Vec::new();
    for waiter in waiters {
        resources.push(waiter.await.unwrap().unwrap());
    }

    assert_eq!(inits.load(Ordering::SeqCst), 1);
    assert!(resources.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(quest.state(), QuestState::Running);
    manager.shutdown().await;
    assert_eq!(quest.state(), QuestState::Closed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_waiters_see_the_same_init_failure() {
    let manager = QuestManager::new();
    let quest = manager
        .add(QuestSpec::new(
            "stt",
            || async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Err::<u32, _>(TurnError::BackendUnavailable {
                    role: "stt".into(),
                    reason: "no instance".into(),
                })
            },
            |_, _| async { Ok(()) },
            |_| async {},
        ))
        .await;

    let (a, b) = tokio::join!(quest.get(), quest.get());
    let causes: Vec<_> = [a, b]
        .into_iter()
        .map(|r| match r {
            Err(TurnError::QuestInit { quest, source }) => {
                assert_eq!(quest, "stt");
                source
            }
            other => panic!("expected init failure, got {other:?}"),
        })
        .collect();
    assert!(Arc::ptr_eq(&causes[0], &causes[1]));
    assert_eq!(quest.state(), QuestState::Failed);
}

#[tokio::test(start_paused = true)]
async fn removal_while_waiting_reports_closed() {
    let manager = Arc::new(QuestManager::new());
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);
    let quest = manager
        .add(QuestSpec::new(
            "llm",
            || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(7_u32)
            },
            |_, _| async { Ok(()) },
            move |_| async move {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        ))
        .await;

    let waiter = {
        let quest = Arc::clone(&quest);
        tokio::spawn(async move { quest.get().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    manager.remove("llm").await;

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, TurnError::QuestClosed(ref name) if name == "llm"));
    assert_eq!(closes.load(Ordering::SeqCst), 0);
    assert!(!manager.contains("llm"));
}

#[tokio::test(start_paused = true)]
async fn replacing_a_role_closes_the_old_resource_first() {
    let manager = QuestManager::new();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    for voice in ["first", "second"] {
        let init_log = Arc::clone(&log);
        let close_log = Arc::clone(&log);
        manager
            .add(QuestSpec::new(
                "tts",
                move || async move {
                    init_log.lock().unwrap().push(format!("init {voice}"));
                    Ok(voice)
                },
                |_, cancel| async move {
                    cancel.cancelled().await;
                    Ok(())
                },
                move |voice| async move {
                    close_log.lock().unwrap().push(format!("close {voice}"));
                },
            ))
            .await
            .get()
            .await
            .unwrap();
    }

    assert_eq!(
        *log.lock().unwrap(),
        vec!["init first", "close first", "init second"]
    );
    assert_eq!(manager.names(), vec!["tts".to_owned()]);
    assert_eq!(
        manager.quest::<&'static str>("tts").unwrap().get_nowait(),
        Some("second")
    );
}
