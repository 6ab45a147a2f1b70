//! # NEWT — Nostr Event-Wire Tunnel
//!
//! A transport layer that replaces the IP path of ordinary TCP proxying
//! with a publish/subscribe event network. A client speaks SOCKS5 to an
//! *entry node*; bytes are encrypted, wrapped in signed events and
//! published to relays addressed to an *exit node* public key; the exit
//! dials a configured backend and proxies bytes back the same way.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SOCKS5 front end (entry) / backend bridge (exit)        │
//! ├──────────────────────────────────────────────────────────┤
//! │  Virtual streams (per-session frames, dedup, ordering)   │
//! ├──────────────────────────────────────────────────────────┤
//! │  Event codec (schnorr envelopes, conversation-key AEAD)  │
//! ├──────────────────────────────────────────────────────────┤
//! │  Relay pool (WebSocket REQ/EVENT/OK, reconnect backoff)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Exit nodes are discoverable by a base32 public key embedded in a
//! synthetic `.nostr` hostname, by an `npub`/`nprofile` token, or — for
//! bare hostnames — by short-lived presence announcements. When both
//! nodes are publicly reachable, sessions can upgrade to a direct TCP
//! side channel that bypasses the relays for data.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod exit;
pub mod relay;
pub mod resolver;
pub mod session;
pub mod sidechannel;

pub use error::{Error, Result};

/// Event kind carrying stream frames (CONNECT / CONNECT-REVERSE / DATA).
///
/// Lies in the relay-ephemeral range: relays fan it out to live
/// subscribers and never store it.
pub const KIND_EPHEMERAL_STREAM: u32 = 28333;

/// Event kind for exit-node presence announcements.
pub const KIND_ANNOUNCE: u32 = 38333;

/// Event kind holding an exit's public TLS certificate (PEM).
pub const KIND_CERT: u32 = 38334;

/// Event kind holding an exit's TLS private key, encrypted to itself.
pub const KIND_PRIVKEY_SEALED: u32 = 38335;

/// Deadline for establishing a relay WebSocket connection.
pub const RELAY_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

/// How long the entry waits for the exit to dial in on the side channel
/// before falling back to the virtual stream.
pub const SIDECHANNEL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Freshness window for presence announcements, in seconds. Events with
/// `created_at` outside `now ± ANNOUNCE_WINDOW_SECS` are ignored.
pub const ANNOUNCE_WINDOW_SECS: u64 = 10;

/// Default SOCKS5 listen port on the entry node.
pub const DEFAULT_SOCKS_PORT: u16 = 8882;

/// Unix seconds right now.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_kind_is_relay_ephemeral() {
        // 20000..30000 is the range relays treat as fire-and-forget
        assert!((20000..30000).contains(&KIND_EPHEMERAL_STREAM));
    }

    #[test]
    fn test_state_kinds_are_replaceable() {
        for kind in [KIND_ANNOUNCE, KIND_CERT, KIND_PRIVKEY_SEALED] {
            assert!((30000..40000).contains(&kind));
        }
    }
}
