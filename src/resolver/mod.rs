//! Destination resolution.
//!
//! A SOCKS CONNECT target names its exit one of three ways: a profile
//! token (`npub…` / `nprofile…`), a synthetic `.nostr` hostname, or a
//! bare hostname resolved through DNS plus a fresh presence
//! announcement. The first two are decoded here; the announcement path
//! needs relay access and lives with the entry's resolver hook.

mod domain;
mod nip19;

pub use domain::{decode_nostr_host, encode_nostr_host, is_nostr_host, split_host_port};
pub use nip19::{decode as decode_profile, encode_nprofile, encode_npub, is_profile_token, Profile};

use crate::error::{Error, Result};
use crate::ANNOUNCE_WINDOW_SECS;

/// A resolved destination: the exit's key and the relays scoped to the
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Exit public key, hex-encoded
    pub peer: String,
    /// Relay URLs for this session
    pub relays: Vec<String>,
}

/// Whether a name short-circuits DNS entirely.
pub fn is_nostr_name(name: &str) -> bool {
    is_profile_token(name) || is_nostr_host(name)
}

/// Resolves a destination that carries its own routing information.
///
/// Relays embedded in the destination *replace* `default_relays` for
/// the session; a destination without relay hints falls back to them.
/// Bare hostnames are not handled here and fail with
/// [`Error::ResolutionFailed`].
pub fn resolve(destination: &str, default_relays: &[String]) -> Result<Resolved> {
    let (host, _port) = split_host_port(destination);

    if is_profile_token(host) {
        let profile = decode_profile(host)?;
        return Ok(with_defaults(profile.pubkey, profile.relays, default_relays));
    }

    if is_nostr_host(host) {
        let (pubkey, relays) = decode_nostr_host(host)?;
        return Ok(with_defaults(pubkey, relays, default_relays));
    }

    Err(Error::resolution(format!(
        "{host} names no exit; announcement lookup required"
    )))
}

fn with_defaults(peer: String, relays: Vec<String>, default_relays: &[String]) -> Resolved {
    let relays = if relays.is_empty() {
        default_relays.to_vec()
    } else {
        relays
    };
    Resolved { peer, relays }
}

/// Whether an announcement timestamp falls within the freshness window
/// (`now ± 10 s`).
pub fn announce_is_fresh(created_at: u64, now: u64) -> bool {
    created_at.abs_diff(now) <= ANNOUNCE_WINDOW_SECS
}
