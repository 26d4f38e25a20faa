/// Status broadcaster
///
/// In-process publish/subscribe for aggregate sync state. Decouples the
/// engine's internal transitions from any number of observers; a UI can
/// render "N changes pending" / "syncing" / "all synced" from the
/// snapshot alone.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::SubscriptionId;

/// Snapshot of current synchronization state.
///
/// A derived read-model: `pending_count` mirrors the live queue length and
/// is recomputed after every enqueue, dequeue, and drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Mirrors the connectivity monitor's last observation
    pub is_online: bool,
    /// True only while a drain pass is actively running
    pub is_syncing: bool,
    /// Count of operations currently queued
    pub pending_count: usize,
    /// Completion time (epoch millis) of the most recently completed
    /// drain pass; None before the first pass
    pub last_sync_time: Option<i64>,
}

impl SyncStatus {
    pub fn new(is_online: bool, pending_count: usize, last_sync_time: Option<i64>) -> Self {
        Self {
            is_online,
            is_syncing: false,
            pending_count,
            last_sync_time,
        }
    }
}

type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

pub struct StatusBroadcaster {
    status: RwLock<SyncStatus>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_id: AtomicU64,
}

impl StatusBroadcaster {
    pub fn new(initial: SyncStatus) -> Self {
        Self {
            status: RwLock::new(initial),
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Synchronous snapshot read; always available, never suspends.
    pub fn current(&self) -> SyncStatus {
        self.status.read().clone()
    }

    /// Register a listener. It is invoked with the current status
    /// immediately, then again on every subsequent change, in
    /// subscription order.
    pub fn subscribe(
        &self,
        listener: impl Fn(&SyncStatus) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let listener: Listener = Arc::new(listener);
        self.listeners.write().push((id, listener.clone()));

        listener(&self.current());
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.listeners.write().retain(|(sid, _)| *sid != id);
    }

    /// Apply a mutation to the status and broadcast the updated snapshot
    /// exactly once to all current subscribers.
    pub(crate) fn update(&self, mutate: impl FnOnce(&mut SyncStatus)) {
        let snapshot = {
            let mut status = self.status.write();
            mutate(&mut status);
            status.clone()
        };

        // Listeners run outside the registry lock so one may subscribe or
        // unsubscribe from within its callback.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }
}
