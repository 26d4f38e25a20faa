/// Connectivity monitor
///
/// Single authoritative source of "are we online" for the process.
/// Platform signals are fed in through the `signal_*` methods; redundant
/// signals are debounced. A foreground signal is a sync trigger, not a
/// connectivity transition: it never flips the state and only notifies
/// foreground subscribers while the state is already online.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::SubscriptionId;

/// Network reachability as last reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Online,
    Offline,
}

type Callback = Arc<dyn Fn() + Send + Sync>;

pub struct ConnectivityMonitor {
    state: RwLock<ConnState>,
    online_subs: RwLock<Vec<(SubscriptionId, Callback)>>,
    offline_subs: RwLock<Vec<(SubscriptionId, Callback)>>,
    foreground_subs: RwLock<Vec<(SubscriptionId, Callback)>>,
    next_id: AtomicU64,
}

impl ConnectivityMonitor {
    /// Construct with the platform-reported connectivity at startup.
    pub fn new(initial: ConnState) -> Self {
        Self {
            state: RwLock::new(initial),
            online_subs: RwLock::new(Vec::new()),
            offline_subs: RwLock::new(Vec::new()),
            foreground_subs: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Fallback for platforms with no connectivity signal API: the monitor
    /// degrades to assuming online rather than silently reporting offline.
    pub fn assume_online() -> Self {
        Self::new(ConnState::Online)
    }

    pub fn current(&self) -> ConnState {
        *self.state.read()
    }

    pub fn is_online(&self) -> bool {
        self.current() == ConnState::Online
    }

    /// Platform "came online" signal. Debounced: no-op while already online.
    pub fn signal_online(&self) {
        {
            let mut state = self.state.write();
            if *state == ConnState::Online {
                return;
            }
            *state = ConnState::Online;
        }
        tracing::info!("connectivity restored");
        notify(&self.online_subs);
    }

    /// Platform "went offline" signal. Debounced: no-op while already offline.
    pub fn signal_offline(&self) {
        {
            let mut state = self.state.write();
            if *state == ConnState::Offline {
                return;
            }
            *state = ConnState::Offline;
        }
        tracing::info!("connectivity lost");
        notify(&self.offline_subs);
    }

    /// App-foreground signal. Fires foreground subscribers only when the
    /// state is already online; never a transition.
    pub fn signal_foreground(&self) {
        if self.is_online() {
            notify(&self.foreground_subs);
        }
    }

    /// Subscribe to offline-to-online transitions.
    pub fn on_online(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.register(&self.online_subs, callback)
    }

    /// Subscribe to online-to-offline transitions.
    pub fn on_offline(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.register(&self.offline_subs, callback)
    }

    /// Subscribe to foreground-while-online triggers.
    pub fn on_foreground(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        self.register(&self.foreground_subs, callback)
    }

    /// Remove a subscription registered by any of the `on_*` methods.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.online_subs.write().retain(|(sid, _)| *sid != id);
        self.offline_subs.write().retain(|(sid, _)| *sid != id);
        self.foreground_subs.write().retain(|(sid, _)| *sid != id);
    }

    fn register(
        &self,
        subs: &RwLock<Vec<(SubscriptionId, Callback)>>,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        subs.write().push((id, Arc::new(callback)));
        id
    }
}

/// Invoke subscribers outside the registry lock so a callback may itself
/// subscribe or unsubscribe.
fn notify(subs: &RwLock<Vec<(SubscriptionId, Callback)>>) {
    let snapshot: Vec<Callback> = subs.read().iter().map(|(_, cb)| cb.clone()).collect();
    for cb in snapshot {
        cb();
    }
}
