//! Certificate bootstrap and the HTTPS terminator.
//!
//! An exit that terminates TLS keeps no state on disk: the certificate
//! lives on the relays as a CERT event, and the private key as a
//! PRIVKEY_SEALED event encrypted to the exit's own key, so only the
//! holder of the identity can recover it. First startup generates a
//! self-signed certificate whose SAN is the exit's `.nostr` domain and
//! publishes both events; later startups reassemble the identity from
//! the relays. Unreadable PEM is fatal and aborts startup.

use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::codec::{recipient_tag, MessageCodec};
use crate::error::{Error, Result};
use crate::relay::{Filter, RelayPool};
use crate::session::CancelHandle;
use crate::{KIND_CERT, KIND_PRIVKEY_SEALED};

/// How long to wait for relays to answer certificate queries.
const CERT_QUERY_WAIT: Duration = Duration::from_secs(3);

/// Certificate validity.
const CERT_VALIDITY_DAYS: i64 = 10 * 365;

/// A reconstructed TLS identity, PEM on both sides.
pub struct TlsIdentity {
    /// Certificate chain PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

impl TlsIdentity {
    /// Builds a rustls server configuration from the PEM material.
    ///
    /// # Errors
    ///
    /// Any PEM decode failure is [`Error::Fatal`]; the exit must not
    /// start with broken certificate state.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut self.cert_pem.as_bytes())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::fatal(format!("certificate pem: {e}")))?;
        if certs.is_empty() {
            return Err(Error::fatal("certificate pem holds no certificate"));
        }

        let key = rustls_pemfile::private_key(&mut self.key_pem.as_bytes())
            .map_err(|e| Error::fatal(format!("private key pem: {e}")))?
            .ok_or_else(|| Error::fatal("private key pem holds no key"))?;

        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| Error::fatal(format!("tls identity: {e}")))
    }
}

/// Loads or mints the exit's TLS identity from the relays.
pub struct CertBootstrap {
    codec: MessageCodec,
    pool: Arc<RelayPool>,
    relays: Vec<String>,
    domain: String,
}

impl CertBootstrap {
    /// Creates a bootstrap for the identity behind `codec`; `domain`
    /// becomes the certificate's subject alternative name.
    pub fn new(
        codec: MessageCodec,
        pool: Arc<RelayPool>,
        relays: Vec<String>,
        domain: String,
    ) -> Self {
        Self {
            codec,
            pool,
            relays,
            domain,
        }
    }

    /// Fetches the stored identity, or generates and publishes a fresh
    /// one when the relays hold none.
    pub async fn load_or_create(&self) -> Result<TlsIdentity> {
        match self.fetch_stored().await? {
            Some(identity) => {
                tracing::info!("recovered TLS identity from relays");
                Ok(identity)
            }
            None => {
                tracing::info!(domain = %self.domain, "generating fresh TLS identity");
                self.generate_and_store().await
            }
        }
    }

    async fn fetch_stored(&self) -> Result<Option<TlsIdentity>> {
        let us = self.codec.public_hex();
        let cert_filter = Filter {
            authors: Some(vec![us.clone()]),
            kinds: Some(vec![KIND_CERT]),
            tag_p: Some(vec![us.clone()]),
            ..Filter::default()
        };
        let Some(cert_event) = self
            .pool
            .query_single(&self.relays, cert_filter, CERT_QUERY_WAIT)
            .await
        else {
            return Ok(None);
        };

        let key_filter = Filter {
            authors: Some(vec![us.clone()]),
            kinds: Some(vec![KIND_PRIVKEY_SEALED]),
            tag_p: Some(vec![us.clone()]),
            ..Filter::default()
        };
        let key_event = self
            .pool
            .query_single(&self.relays, key_filter, CERT_QUERY_WAIT)
            .await
            .ok_or_else(|| Error::fatal("certificate stored but its sealed key is missing"))?;

        let key_pem_bytes = self
            .codec
            .open_bytes(&key_event.content, &us)
            .map_err(|e| Error::fatal(format!("sealed key did not decrypt: {e}")))?;
        let key_pem = String::from_utf8(key_pem_bytes)
            .map_err(|_| Error::fatal("sealed key is not pem text"))?;

        Ok(Some(TlsIdentity {
            cert_pem: cert_event.content,
            key_pem,
        }))
    }

    async fn generate_and_store(&self) -> Result<TlsIdentity> {
        let identity = mint_identity(&self.domain)?;
        let us = self.codec.public_hex();

        let cert_event = self.codec.sign_event(
            KIND_CERT,
            vec![recipient_tag(&us)],
            identity.cert_pem.clone(),
        )?;
        let sealed = self.codec.seal_bytes(identity.key_pem.as_bytes(), &us)?;
        let key_event =
            self.codec
                .sign_event(KIND_PRIVKEY_SEALED, vec![recipient_tag(&us)], sealed)?;

        // a publish failure costs the next restart a regeneration, not
        // this run its identity
        for event in [&cert_event, &key_event] {
            if let Err(err) = self.pool.publish(&self.relays, event).await {
                tracing::warn!(error = %err, "could not store certificate material on relays");
                break;
            }
        }

        Ok(identity)
    }
}

/// Generates a self-signed certificate for `domain`, valid ten years.
fn mint_identity(domain: &str) -> Result<TlsIdentity> {
    let mut params = CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| Error::fatal(format!("certificate params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "newt");
    params.distinguished_name = dn;
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(CERT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| Error::fatal(format!("key pair: {e}")))?;
    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| Error::fatal(format!("self sign: {e}")))?;

    Ok(TlsIdentity {
        cert_pem: certificate.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

/// Terminates TLS on `port` and splices plaintext to the reverse-proxy
/// target until cancelled.
pub async fn run_terminator(
    identity: &TlsIdentity,
    port: u16,
    target: &str,
    cancel: CancelHandle,
) -> Result<()> {
    let backend = backend_addr(target)?;
    let acceptor = TlsAcceptor::from(Arc::new(identity.server_config()?));
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(Error::Network)?;
    tracing::info!(port, target = %backend, "https terminator listening");

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted,
        };
        let (socket, peer) = accepted.map_err(Error::Network)?;
        let acceptor = acceptor.clone();
        let backend = backend.clone();

        tokio::spawn(async move {
            let mut tls = match acceptor.accept(socket).await {
                Ok(tls) => tls,
                Err(err) => {
                    tracing::debug!(%peer, error = %err, "tls accept failed");
                    return;
                }
            };
            match TcpStream::connect(&backend).await {
                Ok(mut upstream) => {
                    let _ = tokio::io::copy_bidirectional(&mut tls, &mut upstream).await;
                }
                Err(err) => {
                    tracing::warn!(target = %backend, error = %err, "reverse-proxy target unreachable");
                }
            }
        });
    }
}

/// Extracts `host:port` from a reverse-proxy target URL.
fn backend_addr(target: &str) -> Result<String> {
    let (scheme, rest) = match target.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("http", target),
    };
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(Error::config(format!("https target {target} has no host")));
    }

    if authority.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
        Ok(authority.to_string())
    } else {
        let port = if scheme.eq_ignore_ascii_case("https") { 443 } else { 80 };
        Ok(format!("{authority}:{port}"))
    }
}
