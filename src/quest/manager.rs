//! Registry of live quests keyed by role name.

use super::{ErasedQuest, Quest, QuestSpec, QuestState};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Owns every live quest of a session.
///
/// At most one quest per name is live: adding a quest under a name that is
/// already taken tears the old one down (awaiting its `close`) before the
/// new one is spawned. Structural changes are serialized so a concurrent
/// `add` and `remove` for the same name cannot interleave.
pub struct QuestManager {
    quests: Mutex<Vec<Arc<dyn ErasedQuest>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl QuestManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            quests: Mutex::new(Vec::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Register and start a quest, replacing any live quest with the same name.
    pub async fn add<T: Clone + Send + Sync + 'static>(&self, spec: QuestSpec<T>) -> Arc<Quest<T>> {
        let _guard = self.lifecycle.lock().await;
        if let Some(old) = self.take(spec.name()) {
            info!(quest = %old.name(), "replacing live quest");
            old.teardown().await;
        }
        let quest = Quest::spawn(spec);
        debug!(quest = %quest.name(), "quest added");
        self.lock_quests()
            .push(Arc::clone(&quest) as Arc<dyn ErasedQuest>);
        quest
    }

    /// Cancel a quest and wait for its `close`. Unknown names are ignored.
    pub async fn remove(&self, name: &str) {
        let _guard = self.lifecycle.lock().await;
        if let Some(old) = self.take(name) {
            debug!(quest = %name, "removing quest");
            old.teardown().await;
        }
    }

    /// Handle to a live quest, if one is registered under `name` with resource type `T`.
    pub fn quest<T: Clone + Send + Sync + 'static>(&self, name: &str) -> Option<Arc<Quest<T>>> {
        let erased = self
            .lock_quests()
            .iter()
            .find(|q| q.name() == name)
            .cloned()?;
        erased.into_any().downcast::<Quest<T>>().ok()
    }

    /// Whether a quest is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.lock_quests().iter().any(|q| q.name() == name)
    }

    /// State of the quest registered under `name`.
    pub fn state(&self, name: &str) -> Option<QuestState> {
        self.lock_quests()
            .iter()
            .find(|q| q.name() == name)
            .map(|q| q.state())
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.lock_quests()
            .iter()
            .map(|q| q.name().to_owned())
            .collect()
    }

    /// Tear down every quest in reverse insertion order.
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        let drained = std::mem::take(&mut *self.lock_quests());
        for quest in drained.into_iter().rev() {
            debug!(quest = %quest.name(), "shutting down quest");
            quest.teardown().await;
        }
    }

    fn take(&self, name: &str) -> Option<Arc<dyn ErasedQuest>> {
        let mut quests = self.lock_quests();
        let idx = quests.iter().position(|q| q.name() == name)?;
        Some(quests.remove(idx))
    }

    fn lock_quests(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn ErasedQuest>>> {
        self.quests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for QuestManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for QuestManager {
    fn drop(&mut self) {
        for quest in self.lock_quests().iter() {
            quest.cancel();
        }
    }
}
