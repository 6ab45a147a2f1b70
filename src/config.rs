//! Node configuration from environment variables.
//!
//! Nothing is persisted to disk; an exit's only durable state is its
//! private key, and even certificate material lives on the relays.
//!
//! Entry: `NOSTR_RELAYS` (`;`-separated), `PUBLIC_ADDRESS`, `SOCKS_PORT`.
//! Exit: `NOSTR_RELAYS`, `NOSTR_PRIVATE_KEY`, `BACKEND_HOST`,
//! `HTTPS_PORT`, `HTTPS_TARGET`, `PUBLIC`.

use crate::error::{Error, Result};
use crate::DEFAULT_SOCKS_PORT;

/// Configuration for an entry node.
#[derive(Debug, Clone)]
pub struct EntryConfig {
    /// Default relays, used whenever a destination brings no hints
    pub nostr_relays: Vec<String>,
    /// Public `host:port`; enables the side channel when set
    pub public_address: Option<String>,
    /// SOCKS5 listen port
    pub socks_port: u16,
}

impl EntryConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        Ok(Self {
            nostr_relays: split_relays(lookup("NOSTR_RELAYS").as_deref()),
            public_address: lookup("PUBLIC_ADDRESS").filter(|v| !v.trim().is_empty()),
            socks_port: parse_port(lookup("SOCKS_PORT").as_deref(), DEFAULT_SOCKS_PORT)?,
        })
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.nostr_relays.is_empty() {
            return Err(Error::config("NOSTR_RELAYS must name at least one relay"));
        }
        Ok(())
    }
}

/// Configuration for an exit node.
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Relays to subscribe and publish on
    pub nostr_relays: Vec<String>,
    /// 64-hex private key; empty means "generate one and log it"
    pub nostr_private_key: String,
    /// `host:port` of the backend every session is bridged to
    pub backend_host: Option<String>,
    /// TLS terminator port; enables the certificate bootstrap
    pub https_port: Option<u16>,
    /// Reverse-proxy target URL behind the terminator
    pub https_target: Option<String>,
    /// Whether to announce presence for bare-hostname discovery
    pub public: bool,
}

impl ExitConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let https_port = match lookup("HTTPS_PORT").filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(
                raw.trim()
                    .parse::<u16>()
                    .map_err(|_| Error::config(format!("HTTPS_PORT: {raw} is not a port")))?,
            ),
            None => None,
        };

        Ok(Self {
            nostr_relays: split_relays(lookup("NOSTR_RELAYS").as_deref()),
            nostr_private_key: lookup("NOSTR_PRIVATE_KEY").unwrap_or_default().trim().to_string(),
            backend_host: lookup("BACKEND_HOST").filter(|v| !v.trim().is_empty()),
            https_port,
            https_target: lookup("HTTPS_TARGET").filter(|v| !v.trim().is_empty()),
            public: parse_bool(lookup("PUBLIC").as_deref()),
        })
    }

    /// Validates the configuration. The private key is checked by the
    /// caller once key generation has had its chance.
    pub fn validate(&self) -> Result<()> {
        if self.nostr_relays.is_empty() {
            return Err(Error::config("NOSTR_RELAYS must name at least one relay"));
        }
        if self.https_port.is_some() && self.https_target.is_none() {
            return Err(Error::config("HTTPS_PORT is set but HTTPS_TARGET is not"));
        }
        if self.backend_host.is_none() && self.https_port.is_none() {
            return Err(Error::config(
                "either BACKEND_HOST or HTTPS_PORT must be configured",
            ));
        }
        Ok(())
    }

    /// The address sessions are bridged to: the configured backend, or
    /// the local TLS terminator when only HTTPS is set up.
    pub fn effective_backend(&self) -> Option<String> {
        self.backend_host
            .clone()
            .or_else(|| self.https_port.map(|port| format!("127.0.0.1:{port}")))
    }
}

fn split_relays(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_port(raw: Option<&str>, default: u16) -> Result<u16> {
    match raw {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| Error::config(format!("{raw} is not a port"))),
    }
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(
        raw.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes")
    )
}
