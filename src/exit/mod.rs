//! Exit node: subscribes for stream events addressed to its key,
//! dials the backend and bridges bytes back to the entry.

pub mod announce;
pub mod https;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::codec::{Envelope, FrameType, MessageCodec, PeerKeys, StreamFrame};
use crate::config::ExitConfig;
use crate::error::{Error, Result};
use crate::relay::{Filter, RelayPool, SubMessage};
use crate::resolver::{encode_nostr_host, encode_nprofile, encode_npub};
use crate::session::{bridge, CancelHandle, SessionHandle, SessionRegistry, VirtualStream};
use crate::sidechannel::ACK;
use crate::{unix_now, SIDECHANNEL_TIMEOUT};

/// Deadline for dialing the backend.
const BACKEND_DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// The exit node.
pub struct ExitNode {
    config: ExitConfig,
    codec: MessageCodec,
    pool: Arc<RelayPool>,
    registry: Arc<SessionRegistry>,
    cancel: CancelHandle,
}

impl ExitNode {
    /// Creates an exit from its configuration. The private key must
    /// already be present (generated by the caller when absent).
    pub fn new(config: ExitConfig) -> Result<Arc<Self>> {
        let keys = PeerKeys::from_hex(&config.nostr_private_key)?;
        Ok(Arc::new(Self {
            codec: MessageCodec::new(Arc::new(keys)),
            pool: RelayPool::new(),
            registry: Arc::new(SessionRegistry::new()),
            cancel: CancelHandle::new(),
            config,
        }))
    }

    /// This exit's public key, hex-encoded.
    pub fn public_hex(&self) -> String {
        self.codec.public_hex()
    }

    /// This exit's `npub` token.
    pub fn npub(&self) -> Result<String> {
        encode_npub(&self.public_hex())
    }

    /// The synthetic hostname under which entries can reach this exit,
    /// embedding its configured relays.
    pub fn nostr_domain(&self) -> Result<String> {
        encode_nostr_host(&self.public_hex(), &self.config.nostr_relays)
    }

    /// The exit's codec (shared with the certificate bootstrap).
    pub fn codec(&self) -> MessageCodec {
        self.codec.clone()
    }

    /// The exit's relay pool.
    pub fn pool(&self) -> Arc<RelayPool> {
        self.pool.clone()
    }

    /// The exit's configuration.
    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    /// The node's root cancellation handle.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Subscribes on every configured relay and routes stream events
    /// until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        for url in &self.config.nostr_relays {
            let handle = self.pool.ensure(url);
            tracing::info!(relay = %handle.url(), "added relay connection");
        }

        if self.config.public {
            let announcer = announce::Announcer::new(
                self.codec.clone(),
                self.pool.clone(),
                self.config.nostr_relays.clone(),
            );
            let cancel = self.cancel.clone();
            tokio::spawn(async move { announcer.run(cancel).await });
        }

        let filter = Filter::streams_to(&self.public_hex(), unix_now());
        let mut events = self.pool.subscribe(&self.config.nostr_relays, filter);
        tracing::info!(pubkey = %self.public_hex(), "exit listening for sessions");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(SubMessage::Event(envelope, origin)) => {
                        let node = Arc::clone(&self);
                        tokio::spawn(async move { node.process_event(envelope, origin).await });
                    }
                    Some(SubMessage::Eose(_)) => {}
                    None => break,
                },
            }
        }

        self.registry.cancel_all();
        Ok(())
    }

    /// Cancels every session and stops the node.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.registry.cancel_all();
        self.pool.close();
    }

    async fn process_event(self: Arc<Self>, envelope: Envelope, origin: String) {
        if envelope.recipient() != Some(self.public_hex().as_str()) {
            return;
        }

        let frame = match self.codec.open_frame(&envelope.content, &envelope.pubkey) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(event = %envelope.id, error = %err, "dropping undecodable event");
                return;
            }
        };

        match frame.frame_type {
            FrameType::Connect => self.handle_connect(envelope, frame, origin).await,
            FrameType::ConnectReverse => {
                self.handle_connect_reverse(envelope, frame, origin).await;
            }
            FrameType::Data => self.handle_data(envelope, frame, origin).await,
        }
    }

    async fn handle_connect(&self, envelope: Envelope, frame: StreamFrame, origin: String) {
        let session = frame.session;
        let _guard = self.registry.lock(&session).await;
        if self.registry.contains(&session) {
            tracing::debug!(%session, "ignoring duplicate CONNECT");
            return;
        }
        self.establish_relay_session(envelope, frame, origin).await;
    }

    /// Opens the backend connection and the reply stream. Caller holds
    /// the session's stripe lock and has checked the id is unknown.
    async fn establish_relay_session(&self, envelope: Envelope, frame: StreamFrame, origin: String) {
        let session = frame.session;
        let backend = match self.dial_backend(&frame.destination).await {
            Ok(backend) => backend,
            Err(err) => {
                // no error frame is sent; the entry will time out
                tracing::error!(%session, error = %err, "backend dial failed");
                return;
            }
        };

        // reply over the relay that carried the CONNECT
        let reply_to = match encode_nprofile(&envelope.pubkey, std::slice::from_ref(&origin)) {
            Ok(token) => token,
            Err(err) => {
                tracing::error!(%session, error = %err, "cannot encode reply address");
                return;
            }
        };

        let stream = VirtualStream::builder(self.codec.clone(), self.pool.clone(), session, reply_to)
            .default_relays(self.config.nostr_relays.clone())
            .build();
        stream.mark_open();

        self.registry.insert(
            session,
            SessionHandle {
                inbound: stream.inbound_sender(),
                cancel: stream.cancel_handle(),
            },
        );

        tracing::info!(%session, destination = %frame.destination, "session open");
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            bridge(stream, backend).await;
            registry.remove(&session);
        });
    }

    async fn handle_connect_reverse(&self, envelope: Envelope, frame: StreamFrame, origin: String) {
        let session = frame.session;
        let guard = self.registry.lock(&session).await;
        if self.registry.contains(&session) {
            tracing::debug!(%session, "ignoring duplicate CONNECT-REVERSE");
            return;
        }

        match self.side_channel_handshake(&frame).await {
            Ok(direct) => {
                let backend = match self.dial_backend(&frame.destination).await {
                    Ok(backend) => backend,
                    Err(err) => {
                        tracing::error!(%session, error = %err, "backend dial failed");
                        return;
                    }
                };

                let cancel = CancelHandle::new();
                // inbound is unused on the direct path; relay DATA for
                // this session is dropped by the closed receiver
                let (inbound, _closed) = mpsc::channel(1);
                self.registry.insert(
                    session,
                    SessionHandle {
                        inbound,
                        cancel: cancel.clone(),
                    },
                );
                drop(guard);

                tracing::info!(%session, "session open over side channel");
                let registry = Arc::clone(&self.registry);
                tokio::spawn(async move {
                    splice_direct(direct, backend, cancel).await;
                    registry.remove(&session);
                });
            }
            Err(err) => {
                tracing::warn!(%session, error = %err, "side channel failed, falling back to relays");
                self.establish_relay_session(envelope, frame, origin).await;
            }
        }
    }

    async fn handle_data(&self, envelope: Envelope, frame: StreamFrame, origin: String) {
        let session = frame.session;
        let _guard = self.registry.lock(&session).await;
        match self.registry.get(&session) {
            Some(handle) => {
                let _ = handle
                    .inbound
                    .send(SubMessage::Event(envelope, origin))
                    .await;
            }
            None => {
                // lossy network: silently drop
                tracing::debug!(%session, "DATA for unknown session");
            }
        }
    }

    /// Dials the configured backend, falling back to the destination
    /// the entry asked for when none is configured.
    async fn dial_backend(&self, destination: &str) -> Result<TcpStream> {
        let target = self
            .config
            .effective_backend()
            .unwrap_or_else(|| destination.to_string());

        match tokio::time::timeout(BACKEND_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(socket)) => Ok(socket),
            Ok(Err(err)) => Err(Error::dial(format!("{target}: {err}"))),
            Err(_) => Err(Error::Timeout(BACKEND_DIAL_TIMEOUT.as_millis() as u64)),
        }
    }

    /// Dials the entry's public address, identifies the session and
    /// waits for the one-byte ACK.
    async fn side_channel_handshake(&self, frame: &StreamFrame) -> Result<TcpStream> {
        if frame.entry_public_address.is_empty() {
            return Err(Error::dial("CONNECT-REVERSE without entry address"));
        }

        let mut socket = match tokio::time::timeout(
            SIDECHANNEL_TIMEOUT,
            TcpStream::connect(&frame.entry_public_address),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                return Err(Error::dial(format!(
                    "{}: {err}",
                    frame.entry_public_address
                )))
            }
            Err(_) => return Err(Error::Timeout(SIDECHANNEL_TIMEOUT.as_millis() as u64)),
        };

        socket
            .write_all(frame.session.to_string().as_bytes())
            .await?;

        let mut ack = [0u8; 1];
        tokio::time::timeout(SIDECHANNEL_TIMEOUT, socket.read_exact(&mut ack))
            .await
            .map_err(|_| Error::Timeout(SIDECHANNEL_TIMEOUT.as_millis() as u64))??;
        if ack[0] != ACK {
            return Err(Error::dial("side channel rejected the session"));
        }
        Ok(socket)
    }
}

/// Splices the side-channel socket with the backend until either side
/// finishes or the session is cancelled.
async fn splice_direct(mut direct: TcpStream, mut backend: TcpStream, cancel: CancelHandle) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::io::copy_bidirectional(&mut direct, &mut backend) => {}
    }
    cancel.cancel();
}
