//! The destination → subscription map owned by the connection manager.
//!
//! 由连接管理器拥有的目的地 → 订阅映射。

use crate::transport::TransportSubscription;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// One destination-level interest.
///
/// The registry id distinguishes successive subscriptions to the same
/// destination, so a handle to a superseded subscription cannot remove the
/// one that replaced it.
///
/// 一个目的地级别的订阅。
#[derive(Debug)]
pub(crate) struct Subscription {
    pub(crate) id: u64,
    pub(crate) handle: Box<dyn TransportSubscription>,
}

#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: DashMap<String, Subscription>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Reserves the id for the next subscription.
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stores `subscription`, retiring whatever was registered for
    /// `destination` before. The previous transport-level subscription is
    /// cancelled before this returns.
    pub(crate) fn insert(&self, destination: &str, subscription: Subscription) {
        if let Some(previous) = self.entries.insert(destination.to_string(), subscription) {
            debug!(destination, id = previous.id, "Replacing subscription");
            previous.handle.unsubscribe();
        }
    }

    /// Cancels and removes the current subscription for `destination`, if any.
    pub(crate) fn retire(&self, destination: &str) -> bool {
        match self.entries.remove(destination) {
            Some((_, previous)) => {
                debug!(destination, id = previous.id, "Retiring subscription");
                previous.handle.unsubscribe();
                true
            }
            None => false,
        }
    }

    /// Cancels and removes the subscription for `destination` only if it is
    /// still the one identified by `id`.
    pub(crate) fn remove(&self, destination: &str, id: u64) -> bool {
        match self.entries.remove_if(destination, |_, entry| entry.id == id) {
            Some((_, entry)) => {
                entry.handle.unsubscribe();
                debug!(destination, id, "Unsubscribed");
                true
            }
            None => false,
        }
    }

    /// Cancels and removes every subscription. Returns how many there were.
    pub(crate) fn clear(&self) -> usize {
        let destinations: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for destination in destinations {
            if let Some((_, entry)) = self.entries.remove(&destination) {
                entry.handle.unsubscribe();
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, destination: &str) -> bool {
        self.entries.contains_key(destination)
    }

    pub(crate) fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> =
            self.entries.iter().map(|e| e.key().clone()).collect();
        destinations.sort();
        destinations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize},
    };

    #[derive(Debug)]
    struct CountingHandle {
        id: String,
        cancelled: AtomicBool,
        cancels: Arc<AtomicUsize>,
    }

    impl TransportSubscription for CountingHandle {
        fn id(&self) -> &str {
            &self.id
        }

        fn unsubscribe(&self) {
            if !self.cancelled.swap(true, Ordering::SeqCst) {
                self.cancels.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn subscription(registry: &SubscriptionRegistry, cancels: &Arc<AtomicUsize>) -> Subscription {
        let id = registry.next_id();
        Subscription {
            id,
            handle: Box::new(CountingHandle {
                id: format!("sub-{id}"),
                cancelled: AtomicBool::new(false),
                cancels: cancels.clone(),
            }),
        }
    }

    #[test]
    fn insert_replaces_and_cancels_previous() {
        let registry = SubscriptionRegistry::default();
        let cancels = Arc::new(AtomicUsize::new(0));

        let first = subscription(&registry, &cancels);
        let first_id = first.id;
        registry.insert("/topic/orders", first);
        registry.insert("/topic/orders", subscription(&registry, &cancels));

        assert_eq!(registry.len(), 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);

        // A stale id no longer matches the replacement.
        assert!(!registry.remove("/topic/orders", first_id));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clear_cancels_everything() {
        let registry = SubscriptionRegistry::default();
        let cancels = Arc::new(AtomicUsize::new(0));
        for destination in ["/a", "/b", "/c"] {
            registry.insert(destination, subscription(&registry, &cancels));
        }

        assert_eq!(registry.destinations(), vec!["/a", "/b", "/c"]);
        assert_eq!(registry.clear(), 3);
        assert_eq!(registry.len(), 0);
        assert_eq!(cancels.load(Ordering::SeqCst), 3);
        assert!(!registry.retire("/a"));
    }
}
