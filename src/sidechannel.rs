//! Direct TCP side channel.
//!
//! When the entry is publicly reachable it advertises its address in a
//! CONNECT-REVERSE frame; the exit dials in, identifies the session
//! with its 36-character ASCII UUID and receives a one-byte ACK. From
//! then on the raw socket replaces event publishing for the session's
//! data. Connections that cannot present a known session id are closed
//! without an ACK.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of the hyphenated ASCII session id sent by the exit.
pub const SESSION_TOKEN_LEN: usize = 36;

/// The single acknowledgement byte.
pub const ACK: u8 = 0x01;

/// Sessions waiting for the exit to dial in, keyed by session id.
///
/// Entries are registered by the dial path and claimed exactly once by
/// the accept loop; a dial that times out abandons its entry.
#[derive(Default)]
pub struct PendingTable {
    waiting: Mutex<HashMap<Uuid, oneshot::Sender<TcpStream>>>,
}

impl PendingTable {
    /// Creates an empty table.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `session` and returns the receiver the accepted socket
    /// will arrive on.
    pub fn register(&self, session: Uuid) -> oneshot::Receiver<TcpStream> {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(session, tx);
        rx
    }

    /// Claims the sender for `session`, if it is still pending.
    pub fn claim(&self, session: &Uuid) -> Option<oneshot::Sender<TcpStream>> {
        self.waiting.lock().remove(session)
    }

    /// Drops a registration that timed out.
    pub fn abandon(&self, session: &Uuid) {
        self.waiting.lock().remove(session);
    }

    /// Number of sessions currently waiting.
    pub fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.waiting.lock().is_empty()
    }

    /// Registers `session` and waits up to `timeout` for the exit to
    /// dial in. `None` means the caller should fall back to the
    /// virtual stream.
    pub async fn wait(&self, session: Uuid, timeout: Duration) -> Option<TcpStream> {
        let rx = self.register(session);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(socket)) => Some(socket),
            _ => {
                self.abandon(&session);
                None
            }
        }
    }
}

/// Plain TCP listener bound to the entry's public address.
pub struct SideChannelListener {
    listener: TcpListener,
    pending: Arc<PendingTable>,
}

impl SideChannelListener {
    /// Binds the listener.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).await.map_err(Error::Network)?;
        Ok(Self {
            listener,
            pending: PendingTable::new(),
        })
    }

    /// The pending table the dial path registers sessions in.
    pub fn pending(&self) -> Arc<PendingTable> {
        self.pending.clone()
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        self.listener.local_addr().map_err(Error::Network)
    }

    /// Accept loop; runs until the listener errors.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((socket, peer)) => {
                    tracing::debug!(%peer, "side-channel connection");
                    let pending = self.pending.clone();
                    tokio::spawn(async move {
                        handshake(socket, pending).await;
                    });
                }
                Err(err) => {
                    tracing::warn!(error = %err, "side-channel accept failed");
                    return;
                }
            }
        }
    }
}

/// Reads the session token and hands the socket to the waiting dialer.
async fn handshake(mut socket: TcpStream, pending: Arc<PendingTable>) {
    let mut token = [0u8; SESSION_TOKEN_LEN];
    // short reads close the connection without consulting the table
    if socket.read_exact(&mut token).await.is_err() {
        return;
    }

    let session = match std::str::from_utf8(&token).ok().and_then(|s| Uuid::parse_str(s).ok()) {
        Some(session) => session,
        None => {
            tracing::debug!("side-channel token is not a session id");
            return;
        }
    };

    let Some(waiter) = pending.claim(&session) else {
        tracing::debug!(%session, "side-channel session not pending");
        return;
    };

    if socket.write_all(&[ACK]).await.is_err() {
        return;
    }
    // receiver gone means the dialer already fell back; drop the socket
    let _ = waiter.send(socket);
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start() -> (std::net::SocketAddr, Arc<PendingTable>) {
        let listener = SideChannelListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pending = listener.pending();
        tokio::spawn(listener.run());
        (addr, pending)
    }

    #[tokio::test]
    async fn test_handshake_hands_over_socket() {
        let (addr, pending) = start().await;
        let session = Uuid::new_v4();

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.wait(session, Duration::from_secs(2)).await })
        };

        let mut exit_side = TcpStream::connect(addr).await.unwrap();
        exit_side
            .write_all(session.to_string().as_bytes())
            .await
            .unwrap();

        let mut ack = [0u8; 1];
        exit_side.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack, [ACK]);

        let socket = waiter.await.unwrap();
        assert!(socket.is_some());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_session_gets_no_ack() {
        let (addr, _pending) = start().await;

        let mut exit_side = TcpStream::connect(addr).await.unwrap();
        exit_side
            .write_all(Uuid::new_v4().to_string().as_bytes())
            .await
            .unwrap();

        // connection closes without an ACK byte
        let mut ack = [0u8; 1];
        let read = exit_side.read(&mut ack).await.unwrap();
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_short_token_closes_connection() {
        let (addr, pending) = start().await;
        let session = Uuid::new_v4();
        let _rx = pending.register(session);

        let mut exit_side = TcpStream::connect(addr).await.unwrap();
        exit_side.write_all(b"too short").await.unwrap();
        exit_side.shutdown().await.unwrap();

        let mut ack = [0u8; 1];
        let read = exit_side.read(&mut ack).await.unwrap();
        assert_eq!(read, 0);
        // the registration is untouched
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out_and_abandons() {
        let (_addr, pending) = start().await;
        let session = Uuid::new_v4();

        let socket = pending.wait(session, Duration::from_millis(50)).await;
        assert!(socket.is_none());
        assert!(pending.is_empty());
    }
}
