//! The relay pool: connection management, publish fan-out and
//! multiplexed subscriptions.
//!
//! One background task owns each relay's WebSocket. Publishes await the
//! relay's `OK`; subscriptions survive reconnects (the filter's `since`
//! is advanced so only new events replay). A dropped connection backs
//! off 3 s, growing by ×1.7 with no upper bound, until the pool is
//! closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::codec::Envelope;
use crate::error::{Error, Result};
use crate::relay::wire::{self, Filter, RelayMessage};
use crate::{unix_now, RELAY_CONNECT_TIMEOUT};

/// How long a publish waits for the relay's `OK`.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial reconnect back-off.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);

/// Geometric back-off growth factor.
const BACKOFF_FACTOR: f64 = 1.7;

/// Sliding window for the duplicate-event guard.
const SEEN_WINDOW: Duration = Duration::from_secs(60);

/// One message on a subscription channel.
#[derive(Debug)]
pub enum SubMessage {
    /// An event plus the URL of the relay that delivered it first
    Event(Envelope, String),
    /// End-of-stored-events marker from one relay
    Eose(String),
}

/// Windowed set of event ids, used to deliver each id at most once.
///
/// Entries expire after the window so the set stays bounded for
/// long-lived subscriptions.
pub struct SeenCache {
    seen: HashMap<String, Instant>,
    window: Duration,
    last_sweep: Instant,
}

impl SeenCache {
    /// Creates a cache with the given expiry window.
    pub fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
            last_sweep: Instant::now(),
        }
    }

    /// Records `id`; returns `true` the first time an id is seen within
    /// the window.
    pub fn first_sighting(&mut self, id: &str) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_sweep) >= self.window {
            self.seen.retain(|_, at| now.duration_since(*at) < self.window);
            self.last_sweep = now;
        }
        self.seen.insert(id.to_string(), now).is_none()
    }

    /// Number of ids currently tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Where one subscription's events go. Shared by every relay carrying
/// the subscription so duplicates collapse across relays.
#[derive(Clone)]
struct SubSink {
    tx: mpsc::Sender<SubMessage>,
    seen: Arc<Mutex<SeenCache>>,
}

impl SubSink {
    /// Forwards an event; returns `false` once the consumer is gone.
    async fn deliver(&self, envelope: Envelope, origin: &str) -> bool {
        if !self.seen.lock().first_sighting(&envelope.id) {
            return !self.tx.is_closed();
        }
        self.tx
            .send(SubMessage::Event(envelope, origin.to_string()))
            .await
            .is_ok()
    }

    async fn eose(&self, origin: &str) -> bool {
        self.tx.send(SubMessage::Eose(origin.to_string())).await.is_ok()
    }
}

#[derive(Clone)]
struct Subscription {
    id: String,
    filter: Filter,
    sink: SubSink,
}

enum Command {
    Publish {
        envelope: Box<Envelope>,
        done: oneshot::Sender<Result<()>>,
    },
    Subscribe(Subscription),
}

/// Handle to one relay's connection task.
///
/// Idempotently produced by [`RelayPool::ensure`]; valid even while the
/// connection is down or still being established.
#[derive(Clone)]
pub struct RelayHandle {
    url: String,
    commands: mpsc::UnboundedSender<Command>,
}

impl RelayHandle {
    /// The normalized relay URL this handle addresses.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Connects, reconnects, publishes and subscribes across many relays.
pub struct RelayPool {
    relays: Mutex<HashMap<String, RelayHandle>>,
    shutdown: watch::Sender<bool>,
    next_sub: AtomicU64,
}

impl RelayPool {
    /// Creates an empty pool.
    pub fn new() -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            relays: Mutex::new(HashMap::new()),
            shutdown,
            next_sub: AtomicU64::new(1),
        })
    }

    /// Returns the handle for `url`, spawning its connection task on
    /// first use. Never blocks on I/O.
    pub fn ensure(&self, url: &str) -> RelayHandle {
        let url = normalize_url(url);
        let mut relays = self.relays.lock();
        if let Some(handle) = relays.get(&url) {
            return handle.clone();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = RelayHandle {
            url: url.clone(),
            commands: tx,
        };
        relays.insert(url.clone(), handle.clone());
        tokio::spawn(run_relay(url, rx, self.shutdown.subscribe()));
        handle
    }

    /// Publishes one envelope to every relay in `urls` concurrently.
    ///
    /// Succeeds with the number of relays that accepted when at least
    /// one did; fails with [`Error::TransportUnavailable`] when none
    /// accepted within the deadline. One failing relay never blocks the
    /// others.
    pub async fn publish(&self, urls: &[String], envelope: &Envelope) -> Result<usize> {
        let attempts = urls.iter().map(|url| {
            let handle = self.ensure(url);
            let envelope = envelope.clone();
            async move {
                let (done, ack) = oneshot::channel();
                if handle
                    .commands
                    .send(Command::Publish {
                        envelope: Box::new(envelope),
                        done,
                    })
                    .is_err()
                {
                    return false;
                }
                matches!(
                    tokio::time::timeout(PUBLISH_TIMEOUT, ack).await,
                    Ok(Ok(Ok(())))
                )
            }
        });

        let accepted = futures_util::future::join_all(attempts)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        if accepted == 0 {
            return Err(Error::TransportUnavailable);
        }
        Ok(accepted)
    }

    /// Opens one logical subscription across every relay in `urls`.
    ///
    /// Events are deduplicated by id across relays — the first relay to
    /// deliver an id wins. Dropping the receiver ends the subscription
    /// on every relay.
    pub fn subscribe(&self, urls: &[String], filter: Filter) -> mpsc::Receiver<SubMessage> {
        let (tx, rx) = mpsc::channel(256);
        let sink = SubSink {
            tx,
            seen: Arc::new(Mutex::new(SeenCache::new(SEEN_WINDOW))),
        };
        let id = format!("sub{}", self.next_sub.fetch_add(1, Ordering::Relaxed));

        for url in urls {
            let handle = self.ensure(url);
            let _ = handle.commands.send(Command::Subscribe(Subscription {
                id: id.clone(),
                filter: filter.clone(),
                sink: sink.clone(),
            }));
        }
        rx
    }

    /// Returns the first event matching `filter`, or `None` once every
    /// relay reported end-of-stored-events or `wait` elapsed.
    pub async fn query_single(
        &self,
        urls: &[String],
        filter: Filter,
        wait: Duration,
    ) -> Option<Envelope> {
        let mut rx = self.subscribe(urls, filter);
        let mut eose_seen = 0usize;
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(SubMessage::Event(envelope, _))) => return Some(envelope),
                Ok(Some(SubMessage::Eose(_))) => {
                    eose_seen += 1;
                    if eose_seen >= urls.len() {
                        return None;
                    }
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }

    /// Tears down every relay task. Idempotent.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for RelayPool {
    fn drop(&mut self) {
        self.close();
    }
}

fn normalize_url(url: &str) -> String {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{trimmed}")
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnExit {
    Disconnected,
    Shutdown,
}

/// Owns one relay connection for the life of the pool.
async fn run_relay(
    url: String,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut subs: HashMap<String, Subscription> = HashMap::new();
    let mut backoff = RECONNECT_BACKOFF;

    loop {
        let connected =
            tokio::time::timeout(RELAY_CONNECT_TIMEOUT, connect_async(url.as_str())).await;

        match connected {
            Ok(Ok((socket, _response))) => {
                tracing::debug!(relay = %url, "relay connected");
                backoff = RECONNECT_BACKOFF;
                match serve_connection(&url, socket, &mut commands, &mut shutdown, &mut subs).await
                {
                    ConnExit::Shutdown => return,
                    ConnExit::Disconnected => {
                        tracing::debug!(relay = %url, "relay disconnected");
                    }
                }
                // replay only fresh events after the gap
                let now = unix_now();
                for sub in subs.values_mut() {
                    sub.filter.since = Some(now);
                }
            }
            Ok(Err(err)) => {
                tracing::debug!(relay = %url, error = %err, "relay connect failed");
            }
            Err(_) => {
                tracing::debug!(relay = %url, "relay connect timed out");
            }
        }

        if !linger(backoff, &mut commands, &mut shutdown, &mut subs).await {
            return;
        }
        backoff = backoff.mul_f64(BACKOFF_FACTOR);
    }
}

/// Waits out the back-off while keeping the command queue drained.
/// Returns `false` on shutdown.
async fn linger(
    backoff: Duration,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
    subs: &mut HashMap<String, Subscription>,
) -> bool {
    let deadline = tokio::time::Instant::now() + backoff;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            _ = shutdown.changed() => return false,
            cmd = commands.recv() => match cmd {
                Some(Command::Publish { done, .. }) => {
                    let _ = done.send(Err(Error::RelayTransient("relay offline".into())));
                }
                Some(Command::Subscribe(sub)) => {
                    subs.insert(sub.id.clone(), sub);
                }
                None => return false,
            },
        }
    }
}

async fn serve_connection(
    url: &str,
    socket: Socket,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    shutdown: &mut watch::Receiver<bool>,
    subs: &mut HashMap<String, Subscription>,
) -> ConnExit {
    let (mut sink, mut stream) = socket.split();
    let mut pending: HashMap<String, oneshot::Sender<Result<()>>> = HashMap::new();

    // re-issue standing subscriptions
    for sub in subs.values() {
        if let Ok(frame) = wire::req(&sub.id, &sub.filter) {
            if sink.send(Message::Text(frame)).await.is_err() {
                fail_pending(&mut pending);
                return ConnExit::Disconnected;
            }
        }
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                fail_pending(&mut pending);
                return ConnExit::Shutdown;
            }

            cmd = commands.recv() => match cmd {
                Some(Command::Publish { envelope, done }) => {
                    match wire::event(&envelope) {
                        Ok(frame) => {
                            if sink.send(Message::Text(frame)).await.is_err() {
                                let _ = done.send(Err(Error::RelayTransient("send failed".into())));
                                fail_pending(&mut pending);
                                return ConnExit::Disconnected;
                            }
                            pending.insert(envelope.id.clone(), done);
                        }
                        Err(err) => {
                            let _ = done.send(Err(err));
                        }
                    }
                }
                Some(Command::Subscribe(sub)) => {
                    if let Ok(frame) = wire::req(&sub.id, &sub.filter) {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            subs.insert(sub.id.clone(), sub);
                            fail_pending(&mut pending);
                            return ConnExit::Disconnected;
                        }
                    }
                    subs.insert(sub.id.clone(), sub);
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    fail_pending(&mut pending);
                    return ConnExit::Shutdown;
                }
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(exit) = handle_frame(url, &text, &mut sink, subs, &mut pending).await {
                        fail_pending(&mut pending);
                        return exit;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    fail_pending(&mut pending);
                    return ConnExit::Disconnected;
                }
                Some(Ok(_)) => {} // binary and pong frames are ignored
                Some(Err(err)) => {
                    tracing::debug!(relay = %url, error = %err, "websocket error");
                    fail_pending(&mut pending);
                    return ConnExit::Disconnected;
                }
            },
        }
    }
}

async fn handle_frame(
    url: &str,
    text: &str,
    sink: &mut (impl SinkExt<Message> + Unpin),
    subs: &mut HashMap<String, Subscription>,
    pending: &mut HashMap<String, oneshot::Sender<Result<()>>>,
) -> Option<ConnExit> {
    let parsed = match wire::parse(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(relay = %url, error = %err, "unparseable relay frame");
            return None;
        }
    };

    match parsed {
        RelayMessage::Event { sub_id, envelope } => {
            if envelope.verify().is_err() {
                tracing::debug!(relay = %url, event = %envelope.id, "dropping badly signed event");
                return None;
            }
            let delivered = match subs.get(&sub_id) {
                Some(sub) => sub.sink.deliver(envelope, url).await,
                None => true,
            };
            if !delivered {
                // consumer went away: tell the relay to stop
                subs.remove(&sub_id);
                let _ = sink.send(Message::Text(wire::close(&sub_id).ok()?)).await;
            }
        }
        RelayMessage::Ok {
            event_id,
            accepted,
            message,
        } => {
            if let Some(done) = pending.remove(&event_id) {
                let result = if accepted {
                    Ok(())
                } else {
                    Err(Error::RelayTransient(message))
                };
                let _ = done.send(result);
            }
        }
        RelayMessage::Eose { sub_id } => {
            if let Some(sub) = subs.get(&sub_id) {
                if !sub.sink.eose(url).await {
                    subs.remove(&sub_id);
                    let _ = sink.send(Message::Text(wire::close(&sub_id).ok()?)).await;
                }
            }
        }
        RelayMessage::Closed { sub_id, reason } => {
            if reason.starts_with("auth-required:") {
                tracing::warn!(relay = %url, "relay requires AUTH, which is not supported");
            } else {
                tracing::debug!(relay = %url, sub = %sub_id, %reason, "subscription closed by relay");
            }
            subs.remove(&sub_id);
        }
        RelayMessage::Notice { message } => {
            tracing::debug!(relay = %url, %message, "relay notice");
        }
        RelayMessage::Auth { .. } => {
            tracing::debug!(relay = %url, "ignoring AUTH challenge");
        }
        RelayMessage::Unknown => {}
    }
    None
}

fn fail_pending(pending: &mut HashMap<String, oneshot::Sender<Result<()>>>) {
    for (_, done) in pending.drain() {
        let _ = done.send(Err(Error::RelayTransient("connection lost".into())));
    }
}
