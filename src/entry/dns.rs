//! SOCKS resolver hook.
//!
//! Names that carry their own routing (`.nostr`, `npub…`, `nprofile…`)
//! short-circuit DNS entirely; the dial callback re-inspects the
//! original name, so no address is needed. Ordinary hostnames are
//! resolved for real, then matched to an exit by the freshest presence
//! announcement on the default relays.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::relay::{Filter, RelayPool};
use crate::resolver::{announce_is_fresh, is_nostr_name};
use crate::{unix_now, ANNOUNCE_WINDOW_SECS};

/// How long to wait for relays to answer an announcement query.
const ANNOUNCE_QUERY_WAIT: Duration = Duration::from_secs(2);

/// Resolver consulted by the SOCKS server before dialing.
#[derive(Clone)]
pub struct NostrDns {
    pool: Arc<RelayPool>,
    relays: Vec<String>,
}

impl NostrDns {
    /// Creates the hook over the entry's default relays.
    pub fn new(pool: Arc<RelayPool>, relays: Vec<String>) -> Self {
        Self { pool, relays }
    }

    /// Resolves `host` for a CONNECT request.
    ///
    /// Returns `None` for self-routing names, and `Some(exit_pubkey)`
    /// for bare hostnames that DNS-resolve and match a fresh
    /// announcement. Anything else is [`Error::ResolutionFailed`],
    /// which the SOCKS layer reports as host-unreachable.
    pub async fn resolve(&self, host: &str) -> Result<Option<String>> {
        if is_nostr_name(host) {
            return Ok(None);
        }

        // confirm the name exists before hunting for an exit
        tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|e| Error::resolution(format!("dns: {host}: {e}")))?
            .next()
            .ok_or_else(|| Error::resolution(format!("dns: {host}: no addresses")))?;

        let since = unix_now().saturating_sub(ANNOUNCE_WINDOW_SECS);
        let announcement = self
            .pool
            .query_single(
                &self.relays,
                Filter::recent_announcements(since),
                ANNOUNCE_QUERY_WAIT,
            )
            .await
            .ok_or_else(|| Error::resolution("no exit announcement found"))?;

        if !announce_is_fresh(announcement.created_at, unix_now()) {
            return Err(Error::resolution("exit announcement is expired"));
        }

        tracing::debug!(exit = %announcement.pubkey, "resolved bare hostname via announcement");
        Ok(Some(announcement.pubkey))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns() -> NostrDns {
        NostrDns::new(RelayPool::new(), vec!["ws://127.0.0.1:1".into()])
    }

    #[tokio::test]
    async fn test_nostr_names_short_circuit() {
        let dns = dns();
        assert_eq!(dns.resolve("vvgkh0abc.nostr").await.unwrap(), None);
        assert_eq!(dns.resolve("npub1qqqq").await.unwrap(), None);
        assert_eq!(dns.resolve("nprofile1qqqq").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unresolvable_hostname_fails() {
        let dns = dns();
        let result = dns.resolve("does-not-exist.invalid").await;
        assert!(matches!(result, Err(Error::ResolutionFailed(_))));
    }

    #[tokio::test]
    async fn test_resolvable_host_without_announcement_fails() {
        let dns = dns();
        // localhost resolves, but the dead relay yields no announcement
        let result = dns.resolve("localhost").await;
        assert!(matches!(result, Err(Error::ResolutionFailed(_))));
    }
}
