//! Entry node: the SOCKS5-facing side of the tunnel.
//!
//! [`EntryDispatcher::dial`] is the dial callback the SOCKS server
//! consumes: it mints a session, sends CONNECT (or CONNECT-REVERSE when
//! a public address is configured) and returns a connection that is
//! either the virtual stream or, after a successful side-channel
//! upgrade, a raw TCP socket.

mod dns;
mod socks;

pub use dns::NostrDns;
pub use socks::SocksServer;

use std::sync::Arc;

use tokio::net::TcpStream;
use uuid::Uuid;

use crate::codec::{MessageCodec, PeerKeys, StreamFrame};
use crate::config::EntryConfig;
use crate::error::Result;
use crate::relay::RelayPool;
use crate::session::VirtualStream;
use crate::sidechannel::PendingTable;
use crate::SIDECHANNEL_TIMEOUT;

/// What a dial produced: relay-carried stream or upgraded raw socket.
pub enum TunnelConn {
    /// Bytes travel as events
    Relay(VirtualStream),
    /// Side-channel upgrade succeeded; bytes travel directly
    Direct(TcpStream),
}

/// Builds tunnel connections for SOCKS CONNECT requests.
#[derive(Clone)]
pub struct EntryDispatcher {
    config: EntryConfig,
    pool: Arc<RelayPool>,
    pending: Option<Arc<PendingTable>>,
}

impl EntryDispatcher {
    /// Creates a dispatcher without side-channel support.
    pub fn new(config: EntryConfig, pool: Arc<RelayPool>) -> Self {
        Self {
            config,
            pool,
            pending: None,
        }
    }

    /// Enables CONNECT-REVERSE emission backed by the side-channel
    /// listener's pending table.
    pub fn with_side_channel(mut self, pending: Arc<PendingTable>) -> Self {
        self.pending = Some(pending);
        self
    }

    /// Dials `addr` through the event network.
    ///
    /// `target_public_key` carries a peer discovered by the resolver
    /// hook (announcement lookup); when set, destination parsing is
    /// skipped and the default relays are used.
    pub async fn dial(&self, addr: &str, target_public_key: Option<String>) -> Result<TunnelConn> {
        let session = Uuid::new_v4();
        // fresh per-stream identity: sessions are unlinkable at relays
        let codec = MessageCodec::new(Arc::new(PeerKeys::generate()));

        let mut stream = VirtualStream::builder(codec, self.pool.clone(), session, addr)
            .default_relays(self.config.nostr_relays.clone())
            .target_public_key(target_public_key)
            .subscribe_on_write()
            .build();

        let reverse = self
            .pending
            .as_ref()
            .and_then(|pending| {
                self.config
                    .public_address
                    .as_ref()
                    .map(|address| (pending.clone(), address.clone()))
            });

        match reverse {
            Some((pending, public_address)) => {
                let frame = StreamFrame::connect_reverse(session, addr, public_address);
                stream.send_control(&frame).await?;
                stream.mark_open();

                match pending.wait(session, SIDECHANNEL_TIMEOUT).await {
                    Some(socket) => {
                        tracing::debug!(%session, "side-channel upgrade");
                        // tear down the subscription; data now flows raw
                        stream.close();
                        Ok(TunnelConn::Direct(socket))
                    }
                    None => {
                        tracing::debug!(%session, "side-channel timeout, staying on relays");
                        Ok(TunnelConn::Relay(stream))
                    }
                }
            }
            None => {
                let frame = StreamFrame::connect(session, addr);
                stream.send_control(&frame).await?;
                stream.mark_open();
                Ok(TunnelConn::Relay(stream))
            }
        }
    }
}
