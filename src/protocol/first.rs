//! First-packet interactions with a frontend: startup packets, SSL
//! negotiation requests, and cancellation requests.
//!
//! On the wire these messages carry no type tag; a stream models them with
//! the reserved [`TAG_FIRST`] sentinel and the first four payload bytes
//! discriminate the kind. The [`is_startup`], [`is_ssl_request`], and
//! [`is_cancel_request`] predicates inspect that buffered discriminator
//! without forcing the rest of the payload.
//!
//! Startup can be re-done after an SSL negotiation: wrap the transport in
//! TLS and create a fresh frontend stream on the encrypted output.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};

use crate::codec::buf::{Cursor, PgBuf};
use crate::error::{Error, Result};
use crate::protocol::message::Message;
use crate::protocol::wire::{
    self, CANCEL_REQUEST_CODE, PROTOCOL_VERSION, SSL_REQUEST_CODE, TAG_FIRST,
};

fn has_code_prefix(msg: &Message<'_>, code: u32) -> bool {
    msg.tag() == TAG_FIRST && msg.buffered().starts_with(&code.to_be_bytes())
}

/// Whether this first message is a StartupMessage.
pub fn is_startup(msg: &Message<'_>) -> bool {
    has_code_prefix(msg, PROTOCOL_VERSION)
}

/// Whether this first message is an SSLRequest.
pub fn is_ssl_request(msg: &Message<'_>) -> bool {
    has_code_prefix(msg, SSL_REQUEST_CODE)
}

/// Whether this first message is a CancelRequest.
pub fn is_cancel_request(msg: &Message<'_>) -> bool {
    has_code_prefix(msg, CANCEL_REQUEST_CODE)
}

/// Validate first-message bounds and force the body into memory.
async fn read_first<'m>(msg: &'m mut Message<'_>) -> Result<&'m [u8]> {
    if msg.tag() != TAG_FIRST {
        return Err(Error::BadTypeCode {
            expected: TAG_FIRST,
            got: msg.tag(),
        });
    }
    wire::check_startup_size(msg.declared_size())?;
    msg.force().await
}

/// A StartupMessage: the protocol version word followed by NUL-terminated
/// key/value option pairs, terminated by one extra NUL.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Startup {
    pub params: BTreeMap<String, String>,
}

impl Startup {
    pub fn new(params: BTreeMap<String, String>) -> Startup {
        Startup { params }
    }

    /// Build the on-wire message.
    pub fn encode(&self) -> Message<'static> {
        let mut buf = BytesMut::with_capacity(1024);
        buf.put_u32(PROTOCOL_VERSION);
        for (name, value) in &self.params {
            buf.put_cstr(name);
            buf.put_cstr(value);
        }
        buf.put_u8(b'\0');
        Message::from_bytes(TAG_FIRST, buf.freeze())
    }

    /// Parse a first message as a StartupMessage.
    pub async fn parse(msg: &mut Message<'_>) -> Result<Startup> {
        let body = read_first(msg).await?;
        let mut b = Cursor::new(body);

        let version = b.read_u32()?;
        if version != PROTOCOL_VERSION {
            return Err(Error::StartupVersion {
                got: version,
                expected: PROTOCOL_VERSION,
            });
        }

        let mut params = BTreeMap::new();
        while b.remaining() > 1 {
            let key = b
                .read_cstr()
                .map_err(|_| Error::StartupFormat("unterminated parameter name"))?;
            let value = b
                .read_cstr()
                .map_err(|_| Error::StartupFormat("unterminated parameter value"))?;
            params.insert(key.to_owned(), value.to_owned());
        }

        // Fidelity check: the last byte of the packet must be a NUL.
        if b.read_u8().ok() != Some(b'\0') {
            return Err(Error::StartupFormat("missing trailing NUL"));
        }

        Ok(Startup { params })
    }
}

/// The SSLRequest pseudo-message: an 8-byte packet carrying only its request
/// code. The reply is a single byte, not a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SslRequest;

impl SslRequest {
    pub fn encode(&self) -> Message<'static> {
        Message::from_bytes(TAG_FIRST, SSL_REQUEST_CODE.to_be_bytes().to_vec())
    }
}

/// A CancelRequest: sent on a fresh connection to interrupt the session
/// identified by `(backend_pid, secret_key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelRequest {
    pub backend_pid: u32,
    pub secret_key: u32,
}

impl CancelRequest {
    pub fn encode(&self) -> Message<'static> {
        let mut buf = BytesMut::with_capacity(12);
        buf.put_u32(CANCEL_REQUEST_CODE);
        buf.put_u32(self.backend_pid);
        buf.put_u32(self.secret_key);
        Message::from_bytes(TAG_FIRST, buf.freeze())
    }

    /// Parse a first message as a CancelRequest.
    pub async fn parse(msg: &mut Message<'_>) -> Result<CancelRequest> {
        if msg.declared_size() != 16 {
            return Err(Error::WrongSize {
                expected: 16,
                got: msg.declared_size(),
            });
        }
        let body = read_first(msg).await?;
        let mut b = Cursor::new(body);

        let code = b.read_u32()?;
        if code != CANCEL_REQUEST_CODE {
            return Err(Error::Protocol(format!(
                "expected cancel request code {CANCEL_REQUEST_CODE}, got {code}"
            )));
        }

        Ok(CancelRequest {
            backend_pid: b.read_u32()?,
            secret_key: b.read_u32()?,
        })
    }
}
