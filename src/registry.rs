//! Concurrent registry of live sessions.
//!
//! Tracks every active session, supports snapshot iteration without
//! holding the lock across caller code, and lets shutdown wait for the
//! membership to drain to zero.

use std::sync::Mutex;
use tokio::sync::Notify;

/// Thread-safe ordered collection with drain-wait semantics.
///
/// Insertion order is preserved; the copyover coordinator relies on it
/// to assign descriptor slots deterministically.
pub struct Registry<T> {
    items: Mutex<Vec<T>>,
    drained: Notify,
}

impl<T: Clone + PartialEq> Registry<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            drained: Notify::new(),
        }
    }

    /// Insert an item. Infallible; the item becomes visible to
    /// subsequent `snapshot` and `remove` calls.
    pub fn add(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    /// Remove the first matching item, if present.
    ///
    /// A missing item is a no-op, not an error: shutdown races can make
    /// two paths try to remove the same session.
    pub fn remove(&self, item: &T) {
        let mut items = self.items.lock().unwrap();
        if let Some(idx) = items.iter().position(|i| i == item) {
            items.remove(idx);
            if items.is_empty() {
                self.drained.notify_waiters();
            }
        }
    }

    /// Copy the membership list out from under the lock.
    ///
    /// Callers iterate the copy, so per-item code may freely call `add`
    /// or `remove` on this registry without deadlocking.
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    /// Invoke `f` once per item present at call time.
    ///
    /// Runs over a snapshot, never holding the lock across `f`, so the
    /// callback may itself call `add` or `remove`.
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        for item in self.snapshot() {
            f(&item);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }

    /// Resolve once the registry is empty.
    ///
    /// Safe to call concurrently with ongoing `add`/`remove`; an item
    /// added after the wait begins extends it. The `Notify` future is
    /// registered before the emptiness check, so a removal landing
    /// between the check and the await cannot be lost.
    pub async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            if self.is_empty() {
                return;
            }
            drained.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_add_remove_pairing() {
        let registry = Registry::new();
        registry.add(1u32);
        registry.add(2u32);
        assert_eq!(registry.len(), 2);

        registry.remove(&1);
        assert_eq!(registry.len(), 1);

        // Double removal is absorbed
        registry.remove(&1);
        assert_eq!(registry.len(), 1);

        registry.remove(&2);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_preserves_order_and_tolerates_mutation() {
        let registry = Registry::new();
        registry.add(10u32);
        registry.add(20u32);
        registry.add(30u32);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot, vec![10, 20, 30]);

        // Mutating while iterating the snapshot must not deadlock
        for item in &snapshot {
            registry.remove(item);
            registry.add(item + 100);
        }
        assert_eq!(registry.snapshot(), vec![110, 120, 130]);
    }

    #[test]
    fn test_for_each_callback_may_mutate_registry() {
        let registry = Registry::new();
        registry.add(1u32);
        registry.add(2u32);

        let mut visited = Vec::new();
        registry.for_each(|item| {
            visited.push(*item);
            // Re-entrant mutation must not deadlock or skew iteration
            registry.remove(item);
            registry.add(item + 10);
        });

        assert_eq!(visited, vec![1, 2]);
        assert_eq!(registry.snapshot(), vec![11, 12]);
    }

    #[tokio::test]
    async fn test_wait_on_empty_returns_immediately() {
        let registry: Registry<u32> = Registry::new();
        timeout(Duration::from_secs(1), registry.wait())
            .await
            .expect("wait on empty registry should resolve");
    }

    #[tokio::test]
    async fn test_wait_resolves_only_after_drain() {
        let registry = Arc::new(Registry::new());
        registry.add(1u32);
        registry.add(2u32);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait().await })
        };

        registry.remove(&1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "wait resolved before drain");

        registry.remove(&2);
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait should resolve after last removal")
            .unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_add_remove() {
        let registry = Arc::new(Registry::new());
        let mut handles = Vec::new();
        for i in 0..32u32 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.add(i);
                tokio::task::yield_now().await;
                registry.remove(&i);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        timeout(Duration::from_secs(1), registry.wait())
            .await
            .expect("registry should drain");
        assert!(registry.is_empty());
    }
}
