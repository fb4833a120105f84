//! Pairing a frontend stream with a backend stream.
//!
//! A [`Router`] owns both streams, split into their four halves, and moves
//! one message at a time in either direction. A [`Session`] drives both
//! directions concurrently until one of them fails, then waits for the
//! other to wind down.
//!
//! Relay is naturally paced by read-then-write: a slow sink blocks its
//! relay task on the write, which stops it reading from the upstream
//! transport, which applies TCP-level backpressure end to end.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::manager::Canceller;
use crate::protocol::{BackendKeyData, MessageReader, MessageStream, MessageWriter};

/// The `(backend_pid, secret_key)` pair a session captured from
/// BackendKeyData. `(0, 0)` means unknown / not yet received, and never
/// matches a cancellation lookup.
#[derive(Debug, Default)]
pub struct SessionKey {
    inner: Mutex<(u32, u32)>,
}

impl SessionKey {
    pub fn get(&self) -> (u32, u32) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, backend_pid: u32, secret_key: u32) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = (backend_pid, secret_key);
    }

    pub fn is_known(&self) -> bool {
        self.get() != (0, 0)
    }
}

/// Moves messages in one direction between two streams.
pub struct Relay<R, W> {
    source: MessageReader<R>,
    sink: MessageWriter<W>,
    observed_key: Option<Arc<SessionKey>>,
}

impl<R, W> Relay<R, W>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Route one message from source to sink, blocking and flushing as
    /// needed.
    pub async fn route(&mut self) -> Result<()> {
        let mut msg = self.source.next().await?;

        if let Some(key) = &self.observed_key {
            if BackendKeyData::is(&msg) {
                let bkd = BackendKeyData::parse(&mut msg).await?;
                key.set(bkd.backend_pid, bkd.secret_key);
                trace!(backend_pid = bkd.backend_pid, "captured backend key data");
            }
        }

        self.sink.send(&mut msg).await?;

        // Flush only when the source momentarily drains: this batches the
        // hot path while bounding delivery latency to one message.
        if !self.source.has_next() {
            self.sink.flush().await?;
        }
        Ok(())
    }
}

/// Routes messages between one frontend and one backend, capturing the
/// backend key as it passes by.
pub struct Router<F, B> {
    forward: Relay<ReadHalf<F>, WriteHalf<B>>,
    reverse: Relay<ReadHalf<B>, WriteHalf<F>>,
    key: Arc<SessionKey>,
}

impl<F, B> Router<F, B>
where
    F: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    pub fn new(frontend: MessageStream<F>, backend: MessageStream<B>) -> Router<F, B> {
        let (fe_r, fe_w) = frontend.into_split();
        let (be_r, be_w) = backend.into_split();
        let key = Arc::new(SessionKey::default());
        Router {
            forward: Relay {
                source: fe_r,
                sink: be_w,
                observed_key: None,
            },
            reverse: Relay {
                source: be_r,
                sink: fe_w,
                observed_key: Some(key.clone()),
            },
            key,
        }
    }

    /// The captured `(backend_pid, secret_key)`; `(0, 0)` until the backend
    /// has sent BackendKeyData.
    pub fn backend_key(&self) -> (u32, u32) {
        self.key.get()
    }

    /// Route the next message from the frontend to the backend.
    pub async fn route_frontend(&mut self) -> Result<()> {
        self.forward.route().await
    }

    /// Route the next message from the backend to the frontend. The key
    /// latch happens before the message is forwarded.
    pub async fn route_backend(&mut self) -> Result<()> {
        self.reverse.route().await
    }
}

/// A running proxied connection: a router plus the canceller that can reach
/// its backend out of band.
pub struct Session<F, B> {
    router: Router<F, B>,
    canceller: Arc<dyn Canceller>,
}

impl<F, B> Session<F, B>
where
    F: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(router: Router<F, B>, canceller: Arc<dyn Canceller>) -> Session<F, B> {
        Session { router, canceller }
    }

    pub fn backend_key(&self) -> (u32, u32) {
        self.router.backend_key()
    }

    pub fn canceller(&self) -> Arc<dyn Canceller> {
        self.canceller.clone()
    }

    pub(crate) fn key_handle(&self) -> Arc<SessionKey> {
        self.router.key.clone()
    }

    /// Run both relay directions until either reports an error, then wait
    /// for the peer task before returning. Clean end-of-stream on either
    /// side is a normal session end.
    pub async fn run(self) -> Result<()> {
        let Router {
            forward, reverse, ..
        } = self.router;

        let (errors, mut results) = mpsc::channel(2);
        tokio::spawn(relay_until_error(forward, errors.clone()));
        tokio::spawn(relay_until_error(reverse, errors));

        let first = results.recv().await;
        // The second error is ignored entirely, but waiting for it ensures
        // the session is fully wound down before returning to the manager.
        let _ = results.recv().await;

        match first {
            None | Some(Error::Eof) => Ok(()),
            Some(err) => {
                debug!(error = %err, "session relay failed");
                Err(err)
            }
        }
    }
}

/// Route until an error surfaces, then report it and stop.
async fn relay_until_error<R, W>(mut relay: Relay<R, W>, errors: mpsc::Sender<Error>)
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Unpin,
{
    let err = loop {
        if let Err(e) = relay.route().await {
            break e;
        }
    };
    let _ = errors.send(err).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageStream, Startup};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    struct NoopCanceller;

    #[async_trait]
    impl Canceller for NoopCanceller {
        async fn cancel(&self, _backend_pid: u32, _secret_key: u32) -> Result<()> {
            Ok(())
        }
    }

    /// Client ↔ proxy and proxy ↔ server transports, with a router wired
    /// between them.
    fn proxy_harness() -> (
        tokio::io::DuplexStream,
        Router<tokio::io::DuplexStream, tokio::io::DuplexStream>,
        tokio::io::DuplexStream,
    ) {
        let (client, fe_transport) = duplex(4096);
        let (be_transport, server) = duplex(4096);
        let router = Router::new(
            MessageStream::frontend(fe_transport),
            MessageStream::backend(be_transport),
        );
        (client, router, server)
    }

    #[tokio::test]
    async fn test_route_frontend_relays_startup_bytes() {
        let (mut client, mut router, mut server) = proxy_harness();

        let mut params = BTreeMap::new();
        params.insert("user".to_string(), "dog".to_string());
        let mut startup = Startup::new(params).encode();
        let mut wire_bytes = Vec::new();
        startup.write_to(&mut wire_bytes).await.unwrap();
        client.write_all(&wire_bytes).await.unwrap();

        router.route_frontend().await.unwrap();

        let mut relayed = vec![0u8; wire_bytes.len()];
        server.read_exact(&mut relayed).await.unwrap();
        assert_eq!(relayed, wire_bytes);
    }

    #[tokio::test]
    async fn test_route_backend_latches_key_before_forwarding() {
        let (mut client, mut router, mut server) = proxy_harness();
        assert_eq!(router.backend_key(), (0, 0));

        let mut bkd = BackendKeyData {
            backend_pid: 1234,
            secret_key: 5768,
        }
        .encode();
        let mut wire_bytes = Vec::new();
        bkd.write_to(&mut wire_bytes).await.unwrap();
        server.write_all(&wire_bytes).await.unwrap();

        router.route_backend().await.unwrap();
        assert_eq!(router.backend_key(), (1234, 5768));

        // The message still reached the frontend.
        let mut relayed = vec![0u8; wire_bytes.len()];
        client.read_exact(&mut relayed).await.unwrap();
        assert_eq!(relayed, wire_bytes);
    }

    #[tokio::test]
    async fn test_session_run_ends_cleanly_on_hangup() {
        let (mut client, mut router, mut server) = proxy_harness();

        // Drive the startup message through so the frontend reader reaches
        // the normal phase before the disconnects.
        let mut startup = Startup::default().encode();
        let mut wire_bytes = Vec::new();
        startup.write_to(&mut wire_bytes).await.unwrap();
        client.write_all(&wire_bytes).await.unwrap();
        router.route_frontend().await.unwrap();
        let mut sink = vec![0u8; wire_bytes.len()];
        server.read_exact(&mut sink).await.unwrap();

        let session = Session::new(router, Arc::new(NoopCanceller));
        drop(client);
        drop(server);
        assert!(session.run().await.is_ok());
    }

    #[test]
    fn test_session_key_sentinel() {
        let key = SessionKey::default();
        assert_eq!(key.get(), (0, 0));
        assert!(!key.is_known());
        key.set(8, 80);
        assert_eq!(key.get(), (8, 80));
        assert!(key.is_known());
    }
}
