//! Tracking live sessions and routing cancellation requests.
//!
//! A CancelRequest arrives on a separate frontend connection and names a
//! *different* session by its `(backend_pid, secret_key)` pair. The manager
//! finds that session in its live set and asks the session's canceller to
//! dial the backend out of band; the targeted session never observes the
//! cancellation through its own streams.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{CancelRequest, MessageStream, Startup};
use crate::session::{Session, SessionKey};
use crate::transport::{negotiate_tls, MaybeTls, TlsClient};

/// Can send (or delegate) a PostgreSQL CancelRequest.
///
/// Implementations should return an error if they know the request will not
/// succeed. The cancellation mechanism itself gives no guarantee, so the
/// absence of an error does not mean the query was interrupted.
#[async_trait]
pub trait Canceller: Send + Sync {
    /// Open a fresh, short-lived stream to the backend, send a
    /// CancelRequest carrying the given data, then close the stream. The
    /// live session connection is never reused for this.
    async fn cancel(&self, backend_pid: u32, secret_key: u32) -> Result<()>;
}

struct SessionEntry {
    id: u64,
    key: Arc<SessionKey>,
    canceller: Arc<dyn Canceller>,
}

/// The set of live sessions, guarded by one mutex.
///
/// The cancellation scan is linear in session count, which is fine for the
/// expected workload of hundreds to low thousands of concurrent sessions.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<Vec<SessionEntry>>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new() -> SessionManager {
        SessionManager::default()
    }

    /// Number of sessions currently tracked.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Register the session, run it to completion, and splice it out of the
    /// live set again. Blocks for the whole session lifetime.
    pub async fn run_session<F, B>(&self, session: Session<F, B>) -> Result<()>
    where
        F: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = SessionEntry {
            id,
            key: session.key_handle(),
            canceller: session.canceller(),
        };
        self.sessions.lock().await.push(entry);
        debug!(session = id, "session started");

        let res = session.run().await;

        let mut sessions = self.sessions.lock().await;
        if let Some(pos) = sessions.iter().position(|entry| entry.id == id) {
            sessions.remove(pos);
        }
        drop(sessions);

        match &res {
            Ok(()) => debug!(session = id, "session ended"),
            Err(err) => debug!(session = id, error = %err, "session ended"),
        }
        res
    }

    /// Dispatch a cancellation to the session whose captured key matches.
    ///
    /// The sentinel `(0, 0)` never matches: a session that has not yet seen
    /// BackendKeyData cannot be cancelled. The session lock is released
    /// before the canceller dials so a slow backend cannot stall relay
    /// bookkeeping.
    pub async fn cancel(&self, backend_pid: u32, secret_key: u32) -> Result<()> {
        let target = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .find(|entry| {
                    let key = entry.key.get();
                    key != (0, 0) && key == (backend_pid, secret_key)
                })
                .map(|entry| entry.canceller.clone())
        };

        match target {
            Some(canceller) => {
                debug!(backend_pid, "dispatching cancellation");
                canceller.cancel(backend_pid, secret_key).await
            }
            None => {
                warn!(backend_pid, "cancel request matched no live session");
                Err(Error::SessionNotFound)
            }
        }
    }
}

/// Dials a fixed backend address, negotiating TLS according to its
/// configuration. Implements both halves of session establishment: the
/// startup connection and out-of-band cancellation connections.
pub struct Connector {
    addr: String,
    tls: TlsClient,
    params: BTreeMap<String, String>,
}

impl Connector {
    /// `params` are the StartupMessage options (`user`, `database`, ...)
    /// sent on each [`startup`](Self::startup) connection.
    pub fn new(
        addr: impl Into<String>,
        tls: TlsClient,
        params: BTreeMap<String, String>,
    ) -> Connector {
        Connector {
            addr: addr.into(),
            tls,
            params,
        }
    }

    async fn dial(&self) -> Result<MessageStream<MaybeTls<TcpStream>>> {
        let conn = TcpStream::connect(&self.addr).await?;
        let conn = negotiate_tls(conn, &self.tls).await?;
        Ok(MessageStream::backend(conn))
    }

    /// Open a stream to the backend, negotiate TLS if configured, and send
    /// a StartupMessage on it before handing it over.
    pub async fn startup(&self) -> Result<MessageStream<MaybeTls<TcpStream>>> {
        let mut stream = self.dial().await?;
        let mut startup = Startup::new(self.params.clone()).encode();
        stream.send(&mut startup).await?;
        stream.flush().await?;
        Ok(stream)
    }
}

#[async_trait]
impl Canceller for Connector {
    async fn cancel(&self, backend_pid: u32, secret_key: u32) -> Result<()> {
        debug!(backend_pid, addr = %self.addr, "dialing backend for cancellation");
        let mut stream = self.dial().await?;
        let mut msg = CancelRequest {
            backend_pid,
            secret_key,
        }
        .encode();
        stream.send(&mut msg).await?;
        stream.flush().await?;
        stream.close().await
    }
}
