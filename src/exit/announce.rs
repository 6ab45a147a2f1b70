//! Presence announcements.
//!
//! A public exit publishes a short-lived ANNOUNCE event every ten
//! seconds, carrying an `expiration` tag ten seconds out and no
//! recipient tag. Entry-side resolvers only trust announcements whose
//! timestamp falls within the freshness window, so a crashed exit
//! stops being selected almost immediately.

use std::sync::Arc;
use std::time::Duration;

use crate::codec::{expiration_tag, MessageCodec};
use crate::relay::RelayPool;
use crate::session::CancelHandle;
use crate::{unix_now, ANNOUNCE_WINDOW_SECS, KIND_ANNOUNCE};

/// Interval between announcements, equal to their lifetime.
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(ANNOUNCE_WINDOW_SECS);

/// Publishes presence events until cancelled.
pub struct Announcer {
    codec: MessageCodec,
    pool: Arc<RelayPool>,
    relays: Vec<String>,
}

impl Announcer {
    /// Creates an announcer for the exit identity behind `codec`.
    pub fn new(codec: MessageCodec, pool: Arc<RelayPool>, relays: Vec<String>) -> Self {
        Self { codec, pool, relays }
    }

    /// Announce loop; returns when `cancel` fires.
    pub async fn run(self, cancel: CancelHandle) {
        tracing::info!(pubkey = %self.codec.public_hex(), "announcing exit publicly");
        loop {
            self.announce_once().await;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(ANNOUNCE_INTERVAL) => {}
            }
        }
    }

    async fn announce_once(&self) {
        let expires = unix_now() + ANNOUNCE_WINDOW_SECS;
        // a signing failure skips the round instead of publishing junk
        let envelope = match self
            .codec
            .sign_event(KIND_ANNOUNCE, vec![expiration_tag(expires)], String::new())
        {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::error!(error = %err, "could not sign announcement");
                return;
            }
        };

        if let Err(err) = self.pool.publish(&self.relays, &envelope).await {
            tracing::debug!(error = %err, "announcement not accepted by any relay");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PeerKeys;

    #[test]
    fn test_announcement_shape() {
        let codec = MessageCodec::new(Arc::new(PeerKeys::generate()));
        let expires = unix_now() + ANNOUNCE_WINDOW_SECS;
        let envelope = codec
            .sign_event(KIND_ANNOUNCE, vec![expiration_tag(expires)], String::new())
            .unwrap();

        assert_eq!(envelope.kind, KIND_ANNOUNCE);
        assert_eq!(envelope.recipient(), None);
        assert_eq!(envelope.expiration(), Some(expires));
        assert!(envelope.content.is_empty());
        envelope.verify().unwrap();
    }

    #[tokio::test]
    async fn test_announcer_stops_on_cancel() {
        let codec = MessageCodec::new(Arc::new(PeerKeys::generate()));
        let announcer = Announcer::new(codec, RelayPool::new(), vec!["ws://127.0.0.1:1".into()]);

        let cancel = CancelHandle::new();
        let stopper = cancel.clone();
        let task = tokio::spawn(announcer.run(cancel));

        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
        tokio::time::timeout(Duration::from_secs(30), task)
            .await
            .expect("announcer should stop")
            .unwrap();
    }
}
