//! Sessions: one per proxied TCP connection.
//!
//! A session is identified by a 16-byte UUID minted on the entry side.
//! The [`registry`] serializes CONNECT against DATA delivery per id;
//! [`stream`] carries the bytes.

pub mod registry;
pub mod stream;

pub use registry::{SessionHandle, SessionRegistry};
pub use stream::{bridge, StreamReader, StreamState, StreamWriter, VirtualStream};

use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative cancellation shared by everything a session owns.
///
/// Cancelling unblocks subscription forwarders, copy loops and pending
/// side-channel waiters. Cheap to clone.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// A fresh, un-cancelled handle.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancels every clone of this handle. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    /// Whether the session has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the session is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_unblocks_waiters() {
        let handle = CancelHandle::new();
        let waiter = handle.clone();

        let task = tokio::spawn(async move { waiter.cancelled().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!task.is_finished());

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.cancelled().await;
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = CancelHandle::new();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
