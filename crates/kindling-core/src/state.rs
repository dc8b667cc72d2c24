//! Observable state stores backing state channels and slots.
//!
//! A [`StateStore`] is owned by the extension and can be mutated. The registry
//! hands out [`StateReader`]s, which can only read and subscribe. Subscriptions
//! always start with the current value, so the first thing a fresh subscriber
//! sees equals `get_state()`.

use std::sync::Arc;
use tokio::sync::watch;

/// Writable observable state.
#[derive(Debug)]
pub struct StateStore<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> StateStore<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current state.
    pub fn get_state(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the state and notify subscribers.
    pub fn set_state(&self, state: T) {
        self.tx.send_replace(state);
    }

    /// Mutate the state in place and notify subscribers.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        self.tx.send_modify(f);
    }

    pub fn subscribe(&self) -> StateSubscription<T> {
        StateSubscription::new(self.tx.subscribe())
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Read-only view of this store.
    pub fn reader(&self) -> StateReader<T> {
        StateReader {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Default + Send + Sync + 'static> Default for StateStore<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Read-only view of a [`StateStore`].
#[derive(Debug)]
pub struct StateReader<T> {
    tx: Arc<watch::Sender<T>>,
}

impl<T> Clone for StateReader<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> StateReader<T> {
    pub fn get_state(&self) -> T {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> StateSubscription<T> {
        StateSubscription::new(self.tx.subscribe())
    }
}

/// A live subscription to a state store.
///
/// Dropping the subscription unsubscribes.
#[derive(Debug)]
pub struct StateSubscription<T> {
    rx: watch::Receiver<T>,
    delivered_initial: bool,
}

impl<T: Clone + Send + Sync + 'static> StateSubscription<T> {
    fn new(rx: watch::Receiver<T>) -> Self {
        Self {
            rx,
            delivered_initial: false,
        }
    }

    /// Current value without waiting.
    pub fn current(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Next value for this subscriber.
    ///
    /// The first call resolves immediately with the state at subscription time
    /// (or whatever replaced it since). Later calls wait for a change. Returns
    /// `None` once the store has been dropped.
    pub async fn next(&mut self) -> Option<T> {
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        match self.rx.changed().await {
            Ok(()) => Some(self.rx.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    /// Non-blocking check for an unseen change.
    pub fn try_next(&mut self) -> Option<T> {
        if !self.delivered_initial {
            self.delivered_initial = true;
            return Some(self.rx.borrow_and_update().clone());
        }
        match self.rx.has_changed() {
            Ok(true) => Some(self.rx.borrow_and_update().clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_delivery_equals_current_state() {
        let store = StateStore::new(serde_json::json!({ "count": 1 }));
        store.set_state(serde_json::json!({ "count": 2 }));

        let mut sub = store.reader().subscribe();
        let first = sub.next().await.unwrap();
        assert_eq!(first, store.get_state());
        assert_eq!(first["count"], 2);
    }

    #[tokio::test]
    async fn test_subscriber_sees_updates() {
        let store = StateStore::new(0u32);
        let mut sub = store.subscribe();
        assert_eq!(sub.next().await, Some(0));

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.update(|v| *v += 5);
        });

        let next = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap();
        assert_eq!(next, Some(5));
    }

    #[test]
    fn test_try_next_without_change() {
        let store = StateStore::new(String::from("idle"));
        let mut sub = store.subscribe();
        assert_eq!(sub.try_next().as_deref(), Some("idle"));
        assert_eq!(sub.try_next(), None);
        store.set_state("running".to_string());
        assert_eq!(sub.try_next().as_deref(), Some("running"));
    }

    #[test]
    fn test_set_state_without_subscribers() {
        let store = StateStore::new(1);
        store.set_state(7);
        assert_eq!(store.get_state(), 7);
        assert_eq!(store.subscriber_count(), 0);
        let sub = store.subscribe();
        assert_eq!(store.subscriber_count(), 1);
        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_ends_when_store_dropped() {
        let store = StateStore::new(1);
        let mut sub = store.subscribe();
        assert_eq!(sub.next().await, Some(1));
        drop(store);
        assert_eq!(sub.next().await, None);
    }
}
