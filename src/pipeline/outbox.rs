//! Outbound queue with atomic replacement.
//!
//! Producers hold an [`OutboxSender`] bound to the queue generation current
//! when they were created. [`Outbox::replace`] discards every queued item and
//! bumps the generation in one critical section, so a sender created before
//! the swap can never deliver into the new queue.

use crate::runtime::OutputItem;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

struct OutboxState {
    generation: u64,
    items: VecDeque<OutputItem>,
}

struct Inner {
    state: Mutex<OutboxState>,
    notify: Notify,
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Single-consumer outbound queue.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
}

/// Producer handle bound to one queue generation.
#[derive(Clone)]
pub struct OutboxSender {
    inner: Arc<Inner>,
    generation: u64,
}

impl OutboxSender {
    /// Enqueue an item. Returns `false` if the queue was replaced since this
    /// sender was created; the item is dropped.
    pub fn send(&self, item: impl Into<OutputItem>) -> bool {
        {
            let mut state = self.inner.lock();
            if state.generation != self.generation {
                trace!(
                    sender_generation = self.generation,
                    generation = state.generation,
                    "dropping item for replaced queue"
                );
                return false;
            }
            state.items.push_back(item.into());
        }
        self.inner.notify.notify_one();
        true
    }

    /// Whether this sender still targets the live queue.
    pub fn is_current(&self) -> bool {
        self.inner.lock().generation == self.generation
    }
}

impl Outbox {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(OutboxState {
                    generation: 0,
                    items: VecDeque::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// A sender bound to the current generation.
    pub fn sender(&self) -> OutboxSender {
        OutboxSender {
            inner: Arc::clone(&self.inner),
            generation: self.inner.lock().generation,
        }
    }

    /// Discard all queued items and invalidate every existing sender.
    ///
    /// Returns a sender for the fresh queue.
    pub fn replace(&self) -> OutboxSender {
        let generation = {
            let mut state = self.inner.lock();
            let dropped = state.items.len();
            state.items.clear();
            state.generation += 1;
            trace!(dropped, generation = state.generation, "outbound queue replaced");
            state.generation
        };
        OutboxSender {
            inner: Arc::clone(&self.inner),
            generation,
        }
    }

    /// Pop the next item without waiting.
    pub fn try_recv(&self) -> Option<OutputItem> {
        self.inner.lock().items.pop_front()
    }

    /// Wait for the next item.
    pub async fn recv(&self) -> OutputItem {
        loop {
            if let Some(item) = self.try_recv() {
                return item;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Wait up to `timeout` for the next item.
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<OutputItem> {
        tokio::time::timeout(timeout, self.recv()).await.ok()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new()
    }
}
