//! Transport module - pre-framing transformations of the byte transport.
//!
//! The only transformation the protocol defines is the SSLRequest
//! negotiation: a request packet and a one-byte reply, exchanged before any
//! framed message, optionally upgrading the connection to TLS.

mod tls;

pub use tls::{negotiate_tls, MaybeTls, SslMode, TlsClient};
