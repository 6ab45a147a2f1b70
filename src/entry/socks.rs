//! SOCKS5 front end (RFC 1928).
//!
//! NO-AUTH and USER/PASS methods; CONNECT only. The resolver hook runs
//! before dialing: self-routing names skip DNS, bare hostnames must
//! match a fresh exit announcement. Dial failures map to the reply
//! codes the tunnel distinguishes: host-unreachable for resolution
//! failures, connection-refused when no relay accepts, TTL-expired on
//! timeout.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::entry::{EntryDispatcher, NostrDns, TunnelConn};
use crate::error::{Error, Result};
use crate::session;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// The SOCKS5 server in front of the tunnel.
pub struct SocksServer {
    dialer: EntryDispatcher,
    dns: NostrDns,
    credentials: Option<(String, String)>,
}

impl SocksServer {
    /// Creates an auth-less server.
    pub fn new(dialer: EntryDispatcher, dns: NostrDns) -> Self {
        Self {
            dialer,
            dns,
            credentials: None,
        }
    }

    /// Requires USER/PASS authentication with the given credentials.
    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    /// Serves connections from `listener` until accept fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (client, peer) = listener.accept().await.map_err(Error::Network)?;
            tracing::debug!(%peer, "socks connection");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.serve_client(client).await {
                    tracing::debug!(%peer, error = %err, "socks session ended");
                }
            });
        }
    }

    async fn serve_client(&self, mut client: TcpStream) -> Result<()> {
        self.negotiate_method(&mut client).await?;
        let (host, port) = match read_request(&mut client).await? {
            Some(target) => target,
            None => return Ok(()), // error reply already sent
        };

        // resolver hook: stash the announced peer for the dial callback
        let target_public_key = match self.dns.resolve(&host).await {
            Ok(target) => target,
            Err(err) => {
                send_reply(&mut client, REPLY_HOST_UNREACHABLE).await?;
                return Err(err);
            }
        };

        let destination = format!("{host}:{port}");
        match self.dialer.dial(&destination, target_public_key).await {
            Ok(conn) => {
                send_reply(&mut client, REPLY_SUCCESS).await?;
                match conn {
                    TunnelConn::Direct(mut socket) => {
                        let _ = tokio::io::copy_bidirectional(&mut client, &mut socket).await;
                    }
                    TunnelConn::Relay(stream) => {
                        session::bridge(stream, client).await;
                    }
                }
                Ok(())
            }
            Err(err) => {
                send_reply(&mut client, reply_code(&err)).await?;
                Err(err)
            }
        }
    }

    async fn negotiate_method(&self, client: &mut TcpStream) -> Result<()> {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(Error::malformed(format!(
                "unsupported socks version {}",
                header[0]
            )));
        }

        let mut methods = vec![0u8; header[1] as usize];
        client.read_exact(&mut methods).await?;

        let wanted = if self.credentials.is_some() {
            METHOD_USER_PASS
        } else {
            METHOD_NO_AUTH
        };

        if !methods.contains(&wanted) {
            client
                .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                .await?;
            return Err(Error::malformed("no acceptable auth method"));
        }
        client.write_all(&[SOCKS_VERSION, wanted]).await?;

        if wanted == METHOD_USER_PASS {
            self.check_credentials(client).await?;
        }
        Ok(())
    }

    /// RFC 1929 username/password sub-negotiation.
    async fn check_credentials(&self, client: &mut TcpStream) -> Result<()> {
        let mut header = [0u8; 2];
        client.read_exact(&mut header).await?;
        if header[0] != AUTH_VERSION {
            return Err(Error::malformed("bad auth sub-negotiation version"));
        }

        let mut username = vec![0u8; header[1] as usize];
        client.read_exact(&mut username).await?;

        let mut plen = [0u8; 1];
        client.read_exact(&mut plen).await?;
        let mut password = vec![0u8; plen[0] as usize];
        client.read_exact(&mut password).await?;

        let ok = match &self.credentials {
            Some((user, pass)) => {
                username == user.as_bytes() && password == pass.as_bytes()
            }
            None => true,
        };

        if ok {
            client.write_all(&[AUTH_VERSION, 0x00]).await?;
            Ok(())
        } else {
            client.write_all(&[AUTH_VERSION, 0x01]).await?;
            Err(Error::malformed("credentials rejected"))
        }
    }
}

/// Reads the CONNECT request; sends the error reply itself and returns
/// `None` on unsupported commands or address types.
async fn read_request(client: &mut TcpStream) -> Result<Option<(String, u16)>> {
    let mut header = [0u8; 4];
    client.read_exact(&mut header).await?;

    if header[0] != SOCKS_VERSION {
        return Err(Error::malformed("bad request version"));
    }
    if header[1] != CMD_CONNECT {
        send_reply(client, REPLY_CMD_NOT_SUPPORTED).await?;
        return Ok(None);
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            client.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            client.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| Error::malformed("domain is not utf-8"))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            client.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        _ => {
            send_reply(client, REPLY_ATYP_NOT_SUPPORTED).await?;
            return Ok(None);
        }
    };

    let mut port = [0u8; 2];
    client.read_exact(&mut port).await?;
    Ok(Some((host, u16::from_be_bytes(port))))
}

async fn send_reply(client: &mut TcpStream, code: u8) -> Result<()> {
    client
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
        .map_err(Error::Network)
}

fn reply_code(err: &Error) -> u8 {
    match err {
        Error::ResolutionFailed(_) => REPLY_HOST_UNREACHABLE,
        Error::TransportUnavailable | Error::DialFailed(_) => REPLY_CONNECTION_REFUSED,
        Error::Timeout(_) => REPLY_TTL_EXPIRED,
        _ => REPLY_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EntryConfig;
    use crate::relay::RelayPool;

    fn server(credentials: Option<(String, String)>) -> Arc<SocksServer> {
        let pool = RelayPool::new();
        let config = EntryConfig {
            nostr_relays: vec!["ws://127.0.0.1:1".into()],
            public_address: None,
            socks_port: crate::DEFAULT_SOCKS_PORT,
        };
        let dialer = EntryDispatcher::new(config.clone(), pool.clone());
        let dns = NostrDns::new(pool, config.nostr_relays);
        let mut server = SocksServer::new(dialer, dns);
        if let Some((user, pass)) = credentials {
            server = server.with_credentials(user, pass);
        }
        Arc::new(server)
    }

    async fn start(server: Arc<SocksServer>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.run(listener));
        addr
    }

    async fn connect_request(client: &mut TcpStream, host: &str, port: u16) {
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_auth_greeting() {
        let addr = start(server(None)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS_VERSION, METHOD_NO_AUTH]);
    }

    #[tokio::test]
    async fn test_greeting_without_acceptable_method() {
        let addr = start(server(Some(("user".into(), "pass".into())))).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // offers only NO-AUTH to a server that wants USER/PASS
        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS_VERSION, METHOD_UNACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_user_pass_rejects_wrong_password() {
        let addr = start(server(Some(("user".into(), "secret".into())))).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_USER_PASS])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [SOCKS_VERSION, METHOD_USER_PASS]);

        let mut auth = vec![AUTH_VERSION, 4];
        auth.extend_from_slice(b"user");
        auth.push(5);
        auth.extend_from_slice(b"wrong");
        client.write_all(&auth).await.unwrap();

        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [AUTH_VERSION, 0x01]);
    }

    #[tokio::test]
    async fn test_bind_command_is_rejected() {
        let addr = start(server(None)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        // BIND (0x02)
        client
            .write_all(&[SOCKS_VERSION, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REPLY_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_host_unreachable() {
        let addr = start(server(None)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();

        connect_request(&mut client, "does-not-exist.invalid", 80).await;
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REPLY_HOST_UNREACHABLE);
    }

    #[test]
    fn test_reply_code_mapping() {
        assert_eq!(
            reply_code(&Error::resolution("nope")),
            REPLY_HOST_UNREACHABLE
        );
        assert_eq!(
            reply_code(&Error::TransportUnavailable),
            REPLY_CONNECTION_REFUSED
        );
        assert_eq!(reply_code(&Error::dial("refused")), REPLY_CONNECTION_REFUSED);
        assert_eq!(reply_code(&Error::Timeout(3000)), REPLY_TTL_EXPIRED);
        assert_eq!(reply_code(&Error::crypto("x")), REPLY_FAILURE);
    }
}
