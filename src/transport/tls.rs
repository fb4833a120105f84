//! SSLRequest negotiation over an owned byte transport.
//!
//! The negotiation is a pre-framing transformation: it consumes no framed
//! messages and produces none. The client sends the 8-byte SSLRequest
//! packet and the server answers with a single byte, `'S'` to proceed with
//! a TLS handshake or `'N'` to refuse. Everything after that byte is either
//! TLS records or plaintext FEBE frames.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::trace;

use crate::error::{Error, Result};
use crate::protocol::wire::{ACCEPT_SSL_REPLY, REJECT_SSL_REPLY, SSL_REQUEST_CODE};

/// How hard to try for an encrypted connection, mirroring libpq's sslmode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// Never negotiate; hand the transport back untouched.
    Disable,
    /// Negotiate, accept either outcome.
    Allow,
    /// Negotiate, accept either outcome.
    Prefer,
    /// Negotiate and fail if the server refuses.
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<SslMode> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" => Ok(SslMode::Allow),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            other => Err(Error::Protocol(format!("unknown sslmode {other:?}"))),
        }
    }
}

/// TLS client configuration for the negotiation.
#[derive(Clone)]
pub struct TlsClient {
    mode: SslMode,
    connector: Option<TlsConnector>,
    server_name: Option<ServerName<'static>>,
}

impl TlsClient {
    /// A client that never negotiates.
    pub fn disabled() -> TlsClient {
        TlsClient {
            mode: SslMode::Disable,
            connector: None,
            server_name: None,
        }
    }

    /// A client negotiating under `mode` with the supplied rustls
    /// configuration, verifying the server as `server_name`.
    pub fn new(
        mode: SslMode,
        config: Arc<rustls::ClientConfig>,
        server_name: ServerName<'static>,
    ) -> TlsClient {
        TlsClient {
            mode,
            connector: Some(TlsConnector::from(config)),
            server_name: Some(server_name),
        }
    }

    pub fn mode(&self) -> SslMode {
        self.mode
    }
}

impl fmt::Debug for TlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsClient")
            .field("mode", &self.mode)
            .field("configured", &self.connector.is_some())
            .finish()
    }
}

/// A transport that may have been upgraded to TLS.
#[derive(Debug)]
pub enum MaybeTls<T> {
    Plain(T),
    Tls(Box<TlsStream<T>>),
}

impl<T> AsyncRead for MaybeTls<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(inner) => Pin::new(inner).poll_read(cx, buf),
            MaybeTls::Tls(inner) => Pin::new(inner).poll_read(cx, buf),
        }
    }
}

impl<T> AsyncWrite for MaybeTls<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTls::Plain(inner) => Pin::new(inner).poll_write(cx, buf),
            MaybeTls::Tls(inner) => Pin::new(inner).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(inner) => Pin::new(inner).poll_flush(cx),
            MaybeTls::Tls(inner) => Pin::new(inner).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTls::Plain(inner) => Pin::new(inner).poll_shutdown(cx),
            MaybeTls::Tls(inner) => Pin::new(inner).poll_shutdown(cx),
        }
    }
}

/// Negotiate SSL on a fresh backend connection.
///
/// Sends the SSLRequest packet, reads exactly one reply byte, and either
/// wraps the transport in a TLS client session or hands it back plain,
/// according to the mode. Reading more than the single reply byte here
/// would swallow the server's first framed message.
pub async fn negotiate_tls<T>(mut transport: T, client: &TlsClient) -> Result<MaybeTls<T>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if client.mode == SslMode::Disable {
        return Ok(MaybeTls::Plain(transport));
    }

    // SSLRequest: length int32(8), code int32(80877103); no type byte.
    let mut request = [0u8; 8];
    request[..4].copy_from_slice(&8u32.to_be_bytes());
    request[4..].copy_from_slice(&SSL_REQUEST_CODE.to_be_bytes());
    transport.write_all(&request).await?;
    transport.flush().await?;

    let mut reply = [0u8; 1];
    transport.read_exact(&mut reply).await?;

    match reply[0] {
        ACCEPT_SSL_REPLY => {
            trace!("server accepted SSL, upgrading transport");
            let (connector, name) = match (&client.connector, &client.server_name) {
                (Some(c), Some(n)) => (c, n.clone()),
                _ => {
                    return Err(Error::Protocol(
                        "SSL accepted but no TLS configuration was provided".into(),
                    ))
                }
            };
            let tls = connector.connect(name, transport).await?;
            Ok(MaybeTls::Tls(Box::new(tls)))
        }
        REJECT_SSL_REPLY if client.mode == SslMode::Require => Err(Error::TlsRejected),
        REJECT_SSL_REPLY => {
            trace!("server refused SSL, continuing in plaintext");
            Ok(MaybeTls::Plain(transport))
        }
        other => Err(Error::Protocol(format!(
            "unexpected SSL negotiation reply {other:#04x}"
        ))),
    }
}
