//! Supervised named resources with an init → run → close lifecycle.
//!
//! Every long-lived backend connection (recognizer, synthesizer, response
//! generator) is a quest. A quest runs in its own tokio task:
//!
//! ```text
//! Pending → Initializing → Running → Closing → Closed
//!                 ↘            ↘
//!                  Failed       Failed
//! ```
//!
//! `close` runs exactly once, inside the quest task, after `run` ends for any
//! reason (completion, error, or cancellation). If the quest is cancelled
//! before `init` finished, the pending `init` is dropped and `close` is skipped.

mod manager;

pub use manager::QuestManager;

use crate::error::{Result, TurnError};
use futures_util::future::BoxFuture;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Lifecycle state of a quest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestState {
    /// Created but its task has not been polled yet.
    Pending,
    /// `init` is in progress.
    Initializing,
    /// The resource is ready and `run` is active.
    Running,
    /// `run` ended; `close` is in progress.
    Closing,
    /// Fully torn down.
    Closed,
    /// `init` or `run` raised an unrecovered error.
    Failed,
}

impl QuestState {
    /// Returns `true` once the quest task has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for QuestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

type InitFn<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;
type RunFn<T> = Box<dyn FnOnce(T, CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;
type CloseFn<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;

/// The three callbacks of a quest, not yet started.
///
/// Hand it to [`QuestManager::add`] to schedule it.
pub struct QuestSpec<T> {
    name: String,
    init: InitFn<T>,
    run: RunFn<T>,
    close: CloseFn<T>,
}

impl<T: Clone + Send + Sync + 'static> QuestSpec<T> {
    /// Build a quest from its `init`, `run` and `close` callbacks.
    ///
    /// `run` receives a clone of the resource and the quest's cancellation
    /// token; it should return when the token fires.
    pub fn new<I, IFut, R, RFut, C, CFut>(name: impl Into<String>, init: I, run: R, close: C) -> Self
    where
        I: FnOnce() -> IFut + Send + 'static,
        IFut: Future<Output = Result<T>> + Send + 'static,
        R: FnOnce(T, CancellationToken) -> RFut + Send + 'static,
        RFut: Future<Output = Result<()>> + Send + 'static,
        C: FnOnce(T) -> CFut + Send + 'static,
        CFut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            init: Box::new(move || Box::pin(init())),
            run: Box::new(move |resource, cancel| Box::pin(run(resource, cancel))),
            close: Box::new(move |resource| Box::pin(close(resource))),
        }
    }

    /// Role name this quest will be registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl QuestSpec<()> {
    /// A quest with no resource: only a `run` step.
    pub fn from_run_step<R, RFut>(name: impl Into<String>, run: R) -> Self
    where
        R: FnOnce(CancellationToken) -> RFut + Send + 'static,
        RFut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::new(
            name,
            || async { Ok::<(), TurnError>(()) },
            move |(), cancel| run(cancel),
            |()| async {},
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailurePhase {
    Init,
    Run,
}

struct Failure {
    phase: FailurePhase,
    cause: Arc<TurnError>,
}

impl Failure {
    fn to_error(&self, quest: &str) -> TurnError {
        let quest = quest.to_owned();
        let source = Arc::clone(&self.cause);
        match self.phase {
            FailurePhase::Init => TurnError::QuestInit { quest, source },
            FailurePhase::Run => TurnError::QuestRun { quest, source },
        }
    }
}

struct QuestStatus<T> {
    state: QuestState,
    resource: Option<T>,
    failure: Option<Failure>,
}

/// A running quest. Owned by the [`QuestManager`]; callers hold `Arc` handles.
pub struct Quest<T> {
    name: String,
    status: watch::Receiver<QuestStatus<T>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Quest<T> {
    fn spawn(spec: QuestSpec<T>) -> Arc<Self> {
        let (tx, rx) = watch::channel(QuestStatus {
            state: QuestState::Pending,
            resource: None,
            failure: None,
        });
        let cancel = CancellationToken::new();
        let name = spec.name.clone();
        let task = tokio::spawn(drive(spec, tx, cancel.clone()));
        Arc::new(Self {
            name,
            status: rx,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Role name of this quest.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QuestState {
        self.status.borrow().state
    }

    /// Wait until the resource is ready.
    ///
    /// # Errors
    ///
    /// Returns [`TurnError::QuestInit`] with the original cause if `init`
    /// failed, [`TurnError::QuestRun`] if `run` has since failed, and
    /// [`TurnError::QuestClosed`] if the quest was torn down before `init`
    /// finished.
    pub async fn get(&self) -> Result<T> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| s.resource.is_some() || s.state.is_terminal())
            .await
            .map_err(|_| TurnError::QuestClosed(self.name.clone()))?;
        if let Some(failure) = &status.failure {
            return Err(failure.to_error(&self.name));
        }
        status
            .resource
            .clone()
            .ok_or_else(|| TurnError::QuestClosed(self.name.clone()))
    }

    /// The resource if `init` has completed, without waiting.
    pub fn get_nowait(&self) -> Option<T> {
        self.status.borrow().resource.clone()
    }

    /// Wait for the quest task to end and report how `run` ended.
    ///
    /// # Errors
    ///
    /// Returns the `init` or `run` failure, if any.
    pub async fn finished(&self) -> Result<()> {
        let mut rx = self.status.clone();
        match rx.wait_for(|s| s.state.is_terminal()).await {
            Ok(status) => match &status.failure {
                Some(failure) => Err(failure.to_error(&self.name)),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }

    async fn teardown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!(quest = %self.name, "quest task panicked");
                }
            }
        }
        // Another caller may own the join handle; wait for the task either way.
        let mut rx = self.status.clone();
        let _ = rx.wait_for(|s| s.state.is_terminal()).await;
    }
}

async fn drive<T: Clone + Send + Sync + 'static>(
    spec: QuestSpec<T>,
    tx: watch::Sender<QuestStatus<T>>,
    cancel: CancellationToken,
) {
    let QuestSpec {
        name,
        init,
        run,
        close,
    } = spec;

    tx.send_modify(|s| s.state = QuestState::Initializing);
    debug!(quest = %name, "initializing");

    let initialized = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        result = init() => Some(result),
    };

    let resource = match initialized {
        None => {
            debug!(quest = %name, "cancelled during init, close skipped");
            tx.send_modify(|s| s.state = QuestState::Closed);
            return;
        }
        Some(Err(e)) => {
            error!(quest = %name, "init failed: {e}");
            tx.send_modify(|s| {
                s.state = QuestState::Failed;
                s.failure = Some(Failure {
                    phase: FailurePhase::Init,
                    cause: Arc::new(e),
                });
            });
            return;
        }
        Some(Ok(resource)) => resource,
    };

    tx.send_modify(|s| {
        s.state = QuestState::Running;
        s.resource = Some(resource.clone());
    });
    debug!(quest = %name, "running");

    let outcome = tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(()),
        result = run(resource.clone(), cancel.clone()) => result,
    };

    tx.send_modify(|s| s.state = QuestState::Closing);
    close(resource).await;

    match outcome {
        Ok(()) => {
            debug!(quest = %name, "closed");
            tx.send_modify(|s| s.state = QuestState::Closed);
        }
        Err(e) if e.is_cancellation() => {
            debug!(quest = %name, "closed after cancellation");
            tx.send_modify(|s| s.state = QuestState::Closed);
        }
        Err(e) => {
            error!(quest = %name, "run failed: {e}");
            tx.send_modify(|s| {
                s.state = QuestState::Failed;
                s.failure = Some(Failure {
                    phase: FailurePhase::Run,
                    cause: Arc::new(e),
                });
            });
        }
    }
}

/// Type-erased view of a quest, so quests of different resource types can
/// share one registry.
trait ErasedQuest: Send + Sync {
    fn name(&self) -> &str;
    fn state(&self) -> QuestState;
    fn cancel(&self);
    fn teardown(&self) -> BoxFuture<'_, ()>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Clone + Send + Sync + 'static> ErasedQuest for Quest<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> QuestState {
        Quest::state(self)
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn teardown(&self) -> BoxFuture<'_, ()> {
        Box::pin(Quest::teardown(self))
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
