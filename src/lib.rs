//! # pgrelay
//!
//! Programmable proxy toolkit for the PostgreSQL frontend/backend (FEBE)
//! wire protocol, version 3.
//!
//! The crate is for building intermediaries (routing proxies, admin
//! gateways, protocol recorders) that sit between a PostgreSQL client
//! (the *frontend*) and a PostgreSQL server (the *backend*), read framed
//! messages off either side, optionally inspect or rewrite them, and
//! forward them on.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): [`Message`](protocol::Message) is one FEBE
//!   message, either fully buffered or a zero-copy "promise" whose payload
//!   tail still sits in the source transport.
//!   [`MessageStream`](protocol::MessageStream) reads and writes framed
//!   messages over a duplex byte transport, including the protocol's
//!   tagless startup phase.
//! - **Codecs** ([`protocol`], [`codec`]): structural parsers and
//!   constructors for the curated message catalogue, the type OID table,
//!   and text-format value encoding.
//! - **Negotiation** ([`transport`]): the SSLRequest handshake, upgrading a
//!   transport to TLS before any framing starts.
//! - **Sessions** ([`session`], [`manager`]): a [`Session`](session::Session)
//!   relays both directions between a paired frontend and backend
//!   concurrently and captures BackendKeyData on the way through; the
//!   [`SessionManager`](manager::SessionManager) tracks live sessions and
//!   dispatches out-of-band cancellation requests to the one they name.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use pgrelay::{MessageStream, Router, Session, SessionManager};
//!
//! async fn serve(manager: Arc<SessionManager>, client: tokio::net::TcpStream) {
//!     let frontend = MessageStream::frontend(client);
//!     let connector = Arc::new(connector_for_backend());
//!     let backend = connector.startup().await.unwrap();
//!     let session = Session::new(Router::new(frontend, backend), connector);
//!     let _ = manager.run_session(session).await;
//! }
//! ```

pub mod codec;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;

pub use error::{Error, Result};
pub use manager::{Canceller, Connector, SessionManager};
pub use protocol::{Message, MessageReader, MessageStream, MessageWriter, Phase};
pub use session::{Relay, Router, Session, SessionKey};
pub use transport::{negotiate_tls, MaybeTls, SslMode, TlsClient};
