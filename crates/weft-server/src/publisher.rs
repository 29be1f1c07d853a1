//! The state-update publisher.
//!
//! One watch channel of immutable [`ControlPlaneState`] snapshots. The watch
//! contract is exactly the delivery contract the control plane promises:
//! every subscriber observes a strictly increasing nonce sequence, delivery
//! is FIFO per subscriber, and a slow subscriber skips straight to the
//! latest snapshot rather than draining intermediates.

use std::sync::Arc;

use tokio::sync::watch;

use weft_state::ControlPlaneState;

/// Broadcasts control-plane snapshots to every subscribed stream.
#[derive(Debug)]
pub struct StatePublisher {
    tx: watch::Sender<Arc<ControlPlaneState>>,
}

impl StatePublisher {
    /// Creates a publisher holding an empty nonce-0 snapshot.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ControlPlaneState::default()));
        Self { tx }
    }

    /// Publishes a new snapshot, replacing the held value.
    ///
    /// Called with the store lock held so nonces enter the channel in
    /// store-version order.
    pub fn publish(&self, snapshot: ControlPlaneState) {
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Registers a new subscriber.
    ///
    /// The receiver starts with the current snapshot marked as seen; use
    /// [`watch::Receiver::borrow_and_update`] to read it immediately.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ControlPlaneState>> {
        self.tx.subscribe()
    }

    /// The most recently published snapshot.
    #[must_use]
    pub fn latest(&self) -> Arc<ControlPlaneState> {
        self.tx.borrow().clone()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_state::StateStore;

    fn snapshot_at(version: u64) -> ControlPlaneState {
        let mut store = StateStore::new();
        for i in 0..version {
            store.connections_add(format!("peer-{i}")).unwrap();
        }
        store.snapshot()
    }

    #[tokio::test]
    async fn subscribers_see_strictly_increasing_nonces() {
        let publisher = StatePublisher::new();
        let mut rx = publisher.subscribe();

        let mut last = rx.borrow_and_update().nonce;
        for version in 1..=3 {
            publisher.publish(snapshot_at(version));
            rx.changed().await.unwrap();
            let nonce = rx.borrow_and_update().nonce;
            assert!(nonce > last);
            last = nonce;
        }
    }

    #[tokio::test]
    async fn slow_subscribers_coalesce_to_latest() {
        let publisher = StatePublisher::new();
        let mut rx = publisher.subscribe();
        rx.borrow_and_update();

        publisher.publish(snapshot_at(1));
        publisher.publish(snapshot_at(2));
        publisher.publish(snapshot_at(3));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().nonce, 3);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn latest_tracks_last_publish() {
        let publisher = StatePublisher::new();
        assert_eq!(publisher.latest().nonce, 0);
        publisher.publish(snapshot_at(2));
        assert_eq!(publisher.latest().nonce, 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_fail() {
        let publisher = StatePublisher::new();
        publisher.publish(snapshot_at(1));
        assert_eq!(publisher.latest().nonce, 1);
    }
}
