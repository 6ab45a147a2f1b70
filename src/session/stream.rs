//! Virtual streams: a byte stream carried by events, one per session.
//!
//! The write path seals each buffer into a DATA frame, signs it into a
//! stream event and publishes it to every session relay in parallel;
//! at least one acceptance makes the write stick. The read path
//! consumes subscribed events, deduplicates by event id, decrypts and
//! hands the payload to the caller. Frames from one relay keep that
//! relay's order; across relays only the at-most-once guarantee holds.
//!
//! A stream gets its inbound events one of two ways, chosen at build
//! time: it opens its own subscription lazily on the first write
//! (entry side), or the caller feeds the inbound queue through
//! [`VirtualStream::inbound_sender`] (exit side, routed through the
//! session registry).

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::codec::{FrameType, MessageCodec, StreamFrame};
use crate::error::{Error, Result};
use crate::relay::{Filter, RelayPool, SeenCache, SubMessage};
use crate::resolver::{self, Resolved};
use crate::session::CancelHandle;
use crate::unix_now;

/// Largest payload carried by a single DATA frame. Upstream socket
/// reads use a buffer of this size, so frames map 1:1 to TCP segments
/// and stay well under common relay message limits.
pub const MAX_FRAME_PAYLOAD: usize = 32 * 1024;

/// Capacity of the inbound event queue.
const INBOUND_QUEUE: usize = 256;

/// Duplicate-guard window, shared by the read and write sides.
const SEEN_WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

/// Lifecycle of a session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// CONNECT not yet acknowledged by either side
    Opening,
    /// Bytes may flow in both directions
    Open,
    /// Local side saw EOF: publishes rejected, inbound still drains
    HalfClosed,
    /// Torn down
    Closed,
}

type SharedState = Arc<Mutex<StreamState>>;

/// One bidirectional stream over events.
///
/// Split into [`StreamReader`] and [`StreamWriter`] halves for
/// concurrent copy loops; the halves share the session's cancellation
/// handle and state.
pub struct VirtualStream {
    reader: StreamReader,
    writer: StreamWriter,
}

/// Builder for [`VirtualStream`]; see the module docs for the inbound
/// mode choice.
pub struct VirtualStreamBuilder {
    codec: MessageCodec,
    pool: Arc<RelayPool>,
    session: Uuid,
    destination: String,
    default_relays: Vec<String>,
    target_public_key: Option<String>,
    subscribe_on_write: bool,
    cancel: CancelHandle,
}

impl VirtualStreamBuilder {
    /// Relays used when the destination carries no hints of its own.
    pub fn default_relays(mut self, relays: Vec<String>) -> Self {
        self.default_relays = relays;
        self
    }

    /// Peer key discovered out of band (announcement lookup); skips
    /// destination parsing entirely.
    pub fn target_public_key(mut self, pubkey: Option<String>) -> Self {
        self.target_public_key = pubkey;
        self
    }

    /// Open a subscription for the peer's replies on the first write.
    pub fn subscribe_on_write(mut self) -> Self {
        self.subscribe_on_write = true;
        self
    }

    /// Share an existing cancellation handle instead of a fresh one.
    pub fn cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builds the stream.
    pub fn build(self) -> VirtualStream {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let state: SharedState = Arc::new(Mutex::new(StreamState::Opening));
        let our_pub = self.codec.public_hex();

        VirtualStream {
            reader: StreamReader {
                session: self.session,
                codec: self.codec.clone(),
                our_pub,
                inbound: inbound_rx,
                seen_in: SeenCache::new(SEEN_WINDOW),
                residual: Vec::new(),
                cancel: self.cancel.clone(),
                state: Arc::clone(&state),
            },
            writer: StreamWriter {
                session: self.session,
                codec: self.codec,
                pool: self.pool,
                destination: self.destination,
                default_relays: self.default_relays,
                target_public_key: self.target_public_key,
                resolved: None,
                seen_out: SeenCache::new(SEEN_WINDOW),
                subscribe_on_write: self.subscribe_on_write,
                subscribed: false,
                inbound_tx,
                cancel: self.cancel,
                state,
            },
        }
    }
}

impl VirtualStream {
    /// Starts building a stream for `session` toward `destination`.
    pub fn builder(
        codec: MessageCodec,
        pool: Arc<RelayPool>,
        session: Uuid,
        destination: impl Into<String>,
    ) -> VirtualStreamBuilder {
        VirtualStreamBuilder {
            codec,
            pool,
            session,
            destination: destination.into(),
            default_relays: Vec::new(),
            target_public_key: None,
            subscribe_on_write: false,
            cancel: CancelHandle::new(),
        }
    }

    /// The session id.
    pub fn session(&self) -> Uuid {
        self.writer.session
    }

    /// Sender feeding this stream's inbound queue, for registry-routed
    /// delivery on the exit side.
    pub fn inbound_sender(&self) -> mpsc::Sender<SubMessage> {
        self.writer.inbound_tx.clone()
    }

    /// The session's cancellation handle.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.writer.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StreamState {
        *self.writer.state.lock()
    }

    /// Marks the session OPEN once CONNECT has been sent or served.
    pub fn mark_open(&self) {
        self.writer.mark_open();
    }

    /// Sends one control frame (CONNECT / CONNECT-REVERSE) to the
    /// resolved peer.
    pub async fn send_control(&mut self, frame: &StreamFrame) -> Result<()> {
        self.writer.send_control(frame).await
    }

    /// Reads the next chunk of payload; see [`StreamReader::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.read(buf).await
    }

    /// Writes a buffer as one DATA frame; see [`StreamWriter::write`].
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.writer.write(buf).await
    }

    /// Cancels the session and everything it owns.
    pub fn close(&self) {
        self.writer.close();
    }

    /// Splits into independently owned read and write halves.
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`VirtualStream`].
pub struct StreamReader {
    session: Uuid,
    codec: MessageCodec,
    our_pub: String,
    inbound: mpsc::Receiver<SubMessage>,
    seen_in: SeenCache,
    residual: Vec<u8>,
    cancel: CancelHandle,
    state: SharedState,
}

impl StreamReader {
    /// Reads the next payload bytes into `buf`.
    ///
    /// Returns `Ok(0)` exactly when the stream is finished (cancelled
    /// and drained, or the inbound queue closed). A frame larger than
    /// `buf` is delivered across consecutive reads; residual bytes are
    /// buffered, never discarded.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let drained = self.drain_residual(buf);
        if drained > 0 {
            return Ok(drained);
        }

        loop {
            // consume anything already queued, even after cancellation
            match self.inbound.try_recv() {
                Ok(msg) => {
                    if let Some(n) = self.consume(msg, buf) {
                        return Ok(n);
                    }
                    continue;
                }
                Err(mpsc::error::TryRecvError::Empty) => {}
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.finish();
                    return Ok(0);
                }
            }

            if self.cancel.is_cancelled() {
                self.finish();
                return Ok(0);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => continue,
                msg = self.inbound.recv() => match msg {
                    Some(msg) => {
                        if let Some(n) = self.consume(msg, buf) {
                            return Ok(n);
                        }
                    }
                    None => {
                        self.finish();
                        return Ok(0);
                    }
                },
            }
        }
    }

    fn consume(&mut self, msg: SubMessage, buf: &mut [u8]) -> Option<usize> {
        let (envelope, _origin) = match msg {
            SubMessage::Event(envelope, origin) => (envelope, origin),
            SubMessage::Eose(_) => return None,
        };

        if !self.seen_in.first_sighting(&envelope.id) {
            return None;
        }
        if envelope.recipient() != Some(self.our_pub.as_str()) {
            return None;
        }

        let frame = match self.codec.open_frame(&envelope.content, &envelope.pubkey) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!(event = %envelope.id, error = %err, "dropping undecodable event");
                return None;
            }
        };

        if frame.session != self.session || frame.frame_type != FrameType::Data {
            return None;
        }
        if frame.data.is_empty() {
            // keep-alive
            return None;
        }

        tracing::trace!(session = %self.session, event = %envelope.id, bytes = frame.data.len(), "read data frame");
        let n = buf.len().min(frame.data.len());
        buf[..n].copy_from_slice(&frame.data[..n]);
        if n < frame.data.len() {
            self.residual.extend_from_slice(&frame.data[n..]);
        }
        Some(n)
    }

    fn drain_residual(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.residual.len());
        if n > 0 {
            buf[..n].copy_from_slice(&self.residual[..n]);
            self.residual.drain(..n);
        }
        n
    }

    fn finish(&self) {
        *self.state.lock() = StreamState::Closed;
    }
}

/// Write half of a [`VirtualStream`].
pub struct StreamWriter {
    session: Uuid,
    codec: MessageCodec,
    pool: Arc<RelayPool>,
    destination: String,
    default_relays: Vec<String>,
    target_public_key: Option<String>,
    resolved: Option<Resolved>,
    seen_out: SeenCache,
    subscribe_on_write: bool,
    subscribed: bool,
    inbound_tx: mpsc::Sender<SubMessage>,
    cancel: CancelHandle,
    state: SharedState,
}

impl StreamWriter {
    /// Publishes `buf` as one DATA frame to every session relay.
    ///
    /// The write-through contract: a non-error return means the full
    /// buffer was accepted by at least one relay, and the count is
    /// never short. An empty buffer still publishes a keep-alive event.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.cancel.is_cancelled()
            || matches!(
                *self.state.lock(),
                StreamState::HalfClosed | StreamState::Closed
            )
        {
            return Err(Error::Network(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stream no longer accepts writes",
            )));
        }

        let resolved = self.resolve()?;
        let frame = StreamFrame::data(self.session, buf.to_vec(), self.destination.clone());
        let envelope = self.codec.stream_event(&frame, &resolved.peer)?;

        self.ensure_subscription(&resolved);

        if !self.seen_out.first_sighting(&envelope.id) {
            tracing::debug!(event = %envelope.id, "event already sent");
            return Ok(buf.len());
        }

        self.pool.publish(&resolved.relays, &envelope).await?;
        tracing::trace!(session = %self.session, event = %envelope.id, bytes = buf.len(), "published data frame");
        Ok(buf.len())
    }

    /// Sends one CONNECT or CONNECT-REVERSE frame.
    pub async fn send_control(&mut self, frame: &StreamFrame) -> Result<()> {
        let resolved = self.resolve()?;
        let envelope = self.codec.stream_event(frame, &resolved.peer)?;
        self.ensure_subscription(&resolved);
        self.pool.publish(&resolved.relays, &envelope).await?;
        Ok(())
    }

    /// The resolved `(peer, relays)` pair, computed once per stream.
    pub fn resolve(&mut self) -> Result<Resolved> {
        if let Some(resolved) = &self.resolved {
            return Ok(resolved.clone());
        }
        let resolved = match &self.target_public_key {
            Some(peer) => Resolved {
                peer: peer.clone(),
                relays: self.default_relays.clone(),
            },
            None => resolver::resolve(&self.destination, &self.default_relays)?,
        };
        self.resolved = Some(resolved.clone());
        Ok(resolved)
    }

    fn ensure_subscription(&mut self, resolved: &Resolved) {
        if !self.subscribe_on_write || self.subscribed {
            return;
        }
        self.subscribed = true;

        let mut filter = Filter::streams_to(&self.codec.public_hex(), unix_now());
        filter.authors = Some(vec![resolved.peer.clone()]);
        let mut sub = self.pool.subscribe(&resolved.relays, filter);

        let tx = self.inbound_tx.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.recv() => match msg {
                        Some(msg) => {
                            if tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    /// Marks the stream OPEN.
    pub fn mark_open(&self) {
        let mut state = self.state.lock();
        if *state == StreamState::Opening {
            *state = StreamState::Open;
        }
    }

    /// Local EOF: reject further publishes, keep draining inbound.
    pub fn half_close(&self) {
        let mut state = self.state.lock();
        if *state == StreamState::Open || *state == StreamState::Opening {
            *state = StreamState::HalfClosed;
        }
    }

    /// Cancels the session and everything it owns.
    pub fn close(&self) {
        *self.state.lock() = StreamState::Closed;
        self.cancel.cancel();
    }
}

/// Bridges a virtual stream with a real TCP socket until either side
/// finishes: socket bytes become DATA frames, frames become socket
/// bytes. Cancels the session when both directions are done.
pub async fn bridge(stream: VirtualStream, socket: TcpStream) {
    let session = stream.session();
    let cancel = stream.cancel_handle();
    let (mut reader, mut writer) = stream.split();
    let (mut sock_read, mut sock_write) = socket.into_split();

    let outbound_cancel = cancel.clone();
    let outbound = tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME_PAYLOAD];
        loop {
            let n = tokio::select! {
                _ = outbound_cancel.cancelled() => break,
                read = sock_read.read(&mut buf) => match read {
                    Ok(0) => {
                        writer.half_close();
                        break;
                    }
                    Ok(n) => n,
                    Err(_) => {
                        writer.close();
                        break;
                    }
                },
            };
            if writer.write(&buf[..n]).await.is_err() {
                writer.close();
                break;
            }
        }
    });

    let inbound_cancel = cancel.clone();
    let inbound = tokio::spawn(async move {
        let mut buf = vec![0u8; 2 * MAX_FRAME_PAYLOAD];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sock_write.write_all(&buf[..n]).await.is_err() {
                        inbound_cancel.cancel();
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = sock_write.shutdown().await;
    });

    let _ = tokio::join!(outbound, inbound);
    cancel.cancel();
    tracing::debug!(%session, "session bridge finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PeerKeys;
    use std::time::Duration;

    fn peers() -> (MessageCodec, MessageCodec) {
        (
            MessageCodec::new(Arc::new(PeerKeys::generate())),
            MessageCodec::new(Arc::new(PeerKeys::generate())),
        )
    }

    fn exit_stream(codec: &MessageCodec, session: Uuid) -> VirtualStream {
        VirtualStream::builder(codec.clone(), RelayPool::new(), session, "npub1unused")
            .default_relays(vec!["ws://127.0.0.1:1".into()])
            .build()
    }

    fn data_event(
        from: &MessageCodec,
        to: &MessageCodec,
        session: Uuid,
        payload: &[u8],
    ) -> SubMessage {
        let frame = StreamFrame::data(session, payload.to_vec(), "");
        let envelope = from.stream_event(&frame, &to.public_hex()).unwrap();
        SubMessage::Event(envelope, "ws://r:6666".into())
    }

    #[tokio::test]
    async fn test_read_delivers_decrypted_payload() {
        let (entry, exit) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        inbound
            .send(data_event(&entry, &exit, session, b"ping\n"))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping\n");
    }

    #[tokio::test]
    async fn test_duplicate_event_yields_bytes_once() {
        let (entry, exit) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        let event = data_event(&entry, &exit, session, b"once");
        let duplicate = match &event {
            SubMessage::Event(envelope, _) => {
                SubMessage::Event(envelope.clone(), "ws://other:1".into())
            }
            SubMessage::Eose(_) => unreachable!(),
        };
        inbound.send(event).await.unwrap();
        inbound.send(duplicate).await.unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 4);

        // the duplicate must not surface: the next read should block
        let pending = tokio::time::timeout(Duration::from_millis(50), stream.read(&mut buf)).await;
        assert!(pending.is_err(), "duplicate bytes surfaced");
    }

    #[tokio::test]
    async fn test_frames_for_other_sessions_are_dropped() {
        let (entry, exit) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        inbound
            .send(data_event(&entry, &exit, Uuid::new_v4(), b"stranger"))
            .await
            .unwrap();
        inbound
            .send(data_event(&entry, &exit, session, b"mine"))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"mine");
    }

    #[tokio::test]
    async fn test_events_for_other_recipients_are_dropped() {
        let (entry, exit) = peers();
        let (third, _) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        // addressed to a third party, not to this stream's key
        inbound
            .send(data_event(&entry, &third, session, b"not yours"))
            .await
            .unwrap();
        inbound
            .send(data_event(&entry, &exit, session, b"yours"))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"yours");
    }

    #[tokio::test]
    async fn test_short_buffer_preserves_residual() {
        let (entry, exit) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        inbound
            .send(data_event(&entry, &exit, session, b"abcdefgh"))
            .await
            .unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf, b"def");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"gh");
    }

    #[tokio::test]
    async fn test_zero_length_frames_are_elided() {
        let (entry, exit) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        inbound
            .send(data_event(&entry, &exit, session, b""))
            .await
            .unwrap();
        inbound
            .send(data_event(&entry, &exit, session, b"real"))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"real");
    }

    #[tokio::test]
    async fn test_cancel_drains_queue_then_reports_eof() {
        let (entry, exit) = peers();
        let session = Uuid::new_v4();
        let mut stream = exit_stream(&exit, session);
        let inbound = stream.inbound_sender();

        inbound
            .send(data_event(&entry, &exit, session, b"last words"))
            .await
            .unwrap();
        stream.cancel_handle().cancel();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"last words");
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[tokio::test]
    async fn test_write_rejected_after_half_close() {
        let (_, exit) = peers();
        let stream = exit_stream(&exit, Uuid::new_v4());
        let (_reader, mut writer) = stream.split();

        writer.mark_open();
        writer.half_close();
        assert!(writer.write(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_write_rejected_after_cancel() {
        let (_, exit) = peers();
        let mut stream = exit_stream(&exit, Uuid::new_v4());
        stream.cancel_handle().cancel();
        assert!(stream.write(b"late").await.is_err());
    }

    #[test]
    fn test_state_transitions() {
        let (_, exit) = peers();
        let stream = exit_stream(&exit, Uuid::new_v4());
        assert_eq!(stream.state(), StreamState::Opening);
        stream.mark_open();
        assert_eq!(stream.state(), StreamState::Open);
        stream.close();
        assert_eq!(stream.state(), StreamState::Closed);
    }

    #[test]
    fn test_resolve_prefers_target_override() {
        let (_, exit) = peers();
        let peer = "ab".repeat(32);
        let stream =
            VirtualStream::builder(exit.clone(), RelayPool::new(), Uuid::new_v4(), "example.com:80")
                .default_relays(vec!["ws://r:6666".into()])
                .target_public_key(Some(peer.clone()))
                .build();
        let (_reader, mut writer) = stream.split();

        let resolved = writer.resolve().unwrap();
        assert_eq!(resolved.peer, peer);
        assert_eq!(resolved.relays, vec!["ws://r:6666".to_string()]);
    }
}
