//! Per-consumer destination subscriptions.

use crate::{
    manager::{ConnectionManager, MessageCallback, Unsubscribe, WeakConnectionManager},
    payload::Payload,
    state::{ConnectionState, ListenerHandle},
};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, warn};

struct Tracked {
    destinations: Vec<String>,
    callback: MessageCallback,
    /// Handles of the subscriptions made since the connection last came up.
    active: Vec<Unsubscribe>,
}

impl Tracked {
    fn holds(&self, destination: &str) -> bool {
        self.active
            .iter()
            .any(|handle| handle.destination() == destination)
    }

    /// Subscribes every destination not already held. A destination whose
    /// subscribe fails stays unheld and is tried again on the next call.
    fn subscribe_missing(&mut self, manager: &ConnectionManager) {
        let mut failed = 0;
        for destination in &self.destinations {
            if self.holds(destination) {
                continue;
            }
            match manager.subscribe_callback(destination, self.callback.clone()) {
                Ok(handle) => self.active.push(handle),
                Err(error) => {
                    failed += 1;
                    warn!(destination = %destination, %error, "Failed to subscribe");
                }
            }
        }
        debug!(count = self.active.len(), failed, "Consumer subscriptions bound");
    }

    fn release_all(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let released = self.active.len();
        for handle in self.active.drain(..) {
            handle.unsubscribe();
        }
        debug!(released, "Consumer subscriptions released");
    }
}

/// Keeps one consumer's list of destinations subscribed with a single shared
/// callback.
///
/// Each destination is subscribed at most once per connection, as soon as the
/// connection is up. A destination whose subscribe failed is retried by
/// [`refresh`](Self::refresh) or on the next connection. Every subscription is cancelled exactly once when the
/// connection leaves CONNECTED, when the list changes, or when this value is
/// dropped. After a reconnect the destinations are subscribed again.
///
/// The manager keeps one subscription per destination, so two consumers
/// naming the same destination replace each other's callback.
///
/// 保持一个使用者的目的地列表处于订阅状态。每个目的地在每次连接中最多订阅一次；
/// 连接离开 CONNECTED、列表变化或本值被释放时，每个订阅恰好取消一次。
pub struct DestinationSubscriptions {
    manager: WeakConnectionManager,
    tracked: Arc<Mutex<Tracked>>,
    listener: ListenerHandle,
}

impl std::fmt::Debug for DestinationSubscriptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tracked = lock(&self.tracked);
        f.debug_struct("DestinationSubscriptions")
            .field("destinations", &tracked.destinations)
            .field("active", &tracked.active.len())
            .finish()
    }
}

fn lock(tracked: &Mutex<Tracked>) -> std::sync::MutexGuard<'_, Tracked> {
    tracked.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes repeats, keeping first occurrences in order.
fn dedup(destinations: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for destination in destinations {
        let destination = destination.into();
        if !unique.contains(&destination) {
            unique.push(destination);
        }
    }
    unique
}

impl DestinationSubscriptions {
    pub fn new<I, S, F>(manager: &ConnectionManager, destinations: I, callback: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Payload) + Send + Sync + 'static,
    {
        let tracked = Arc::new(Mutex::new(Tracked {
            destinations: dedup(destinations),
            callback: Arc::new(callback),
            active: Vec::new(),
        }));

        let weak_tracked: Weak<Mutex<Tracked>> = Arc::downgrade(&tracked);
        let weak_manager = manager.downgrade();
        let listener = manager.on_state_change(move |state| {
            let Some(tracked) = weak_tracked.upgrade() else {
                return;
            };
            if state == ConnectionState::Connected {
                if let Some(manager) = weak_manager.upgrade() {
                    lock(&tracked).subscribe_missing(&manager);
                }
            } else {
                lock(&tracked).release_all();
            }
        });

        if manager.is_connected() {
            lock(&tracked).subscribe_missing(manager);
        }

        Self {
            manager: manager.downgrade(),
            tracked,
            listener,
        }
    }

    pub fn destinations(&self) -> Vec<String> {
        lock(&self.tracked).destinations.clone()
    }

    /// Number of subscriptions currently held.
    pub fn active_count(&self) -> usize {
        lock(&self.tracked).active.len()
    }

    /// Subscribes any destination not currently held, if connected.
    /// Returns the number of subscriptions held afterwards.
    pub fn refresh(&self) -> usize {
        let mut tracked = lock(&self.tracked);
        if let Some(manager) = self.manager.upgrade() {
            if manager.is_connected() {
                tracked.subscribe_missing(&manager);
            }
        }
        tracked.active.len()
    }

    /// Replaces the destination list. A list equal to the current one changes
    /// nothing; any other list releases every current subscription first.
    pub fn set_destinations<I, S>(&self, destinations: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let destinations = dedup(destinations);
        let mut tracked = lock(&self.tracked);
        if tracked.destinations == destinations {
            return;
        }
        tracked.release_all();
        tracked.destinations = destinations;
        if let Some(manager) = self.manager.upgrade() {
            if manager.is_connected() {
                tracked.subscribe_missing(&manager);
            }
        }
    }
}

impl Drop for DestinationSubscriptions {
    fn drop(&mut self) {
        self.listener.remove();
        lock(&self.tracked).release_all();
    }
}
