//! Content-free change notifications.
//!
//! A [`Change`] means "state may have changed, re-read it". It carries no
//! payload and no count: several producers (the two state watchers, the
//! health monitor) share one channel, and the consumer always re-reads the
//! full state after waking.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The wake-up token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Change;

/// Producer half of the change channel.
#[derive(Debug, Clone)]
pub struct ChangeSender {
    tx: mpsc::Sender<Change>,
}

/// Consumer half of the change channel.
#[derive(Debug)]
pub struct ChangeReceiver {
    rx: mpsc::Receiver<Change>,
}

/// Create a change channel.
///
/// The channel holds a single token: a producer that finds the slot taken
/// waits until the consumer has picked it up.
pub fn change_channel() -> (ChangeSender, ChangeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (ChangeSender { tx }, ChangeReceiver { rx })
}

impl ChangeSender {
    /// Publish a change, waiting for room in the channel.
    ///
    /// Returns `false` if the consumer is gone.
    pub async fn notify(&self) -> bool {
        self.tx.send(Change).await.is_ok()
    }

    /// Publish a change unless `cancel` fires first.
    ///
    /// Returns `false` if cancelled or if the consumer is gone.
    pub async fn notify_or_cancel(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = self.notify() => sent,
        }
    }
}

impl ChangeReceiver {
    /// Wait for the next change. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<Change> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_full_slot_blocks_producer() {
        let (tx, mut rx) = change_channel();
        assert!(tx.notify().await);

        let blocked = tokio::time::timeout(Duration::from_millis(20), tx.notify()).await;
        assert!(blocked.is_err(), "second notify should wait for the consumer");

        assert_eq!(rx.recv().await, Some(Change));
        assert!(tx.notify().await);
    }

    #[tokio::test]
    async fn test_notify_or_cancel_gives_up() {
        let (tx, _rx) = change_channel();
        let cancel = CancellationToken::new();
        assert!(tx.notify().await);

        cancel.cancel();
        assert!(!tx.notify_or_cancel(&cancel).await);
    }

    #[tokio::test]
    async fn test_closed_consumer() {
        let (tx, rx) = change_channel();
        drop(rx);
        assert!(!tx.notify().await);
    }
}
