//! Message streams over duplex byte transports.
//!
//! [`MessageReader`] drives the decode state machine: a residual buffer
//! accumulates transport reads and is carved into framed messages, with
//! partial frames carried over to the next call. [`MessageWriter`] owns the
//! buffered write path. [`MessageStream`] pairs the two over the split
//! halves of one duplex transport.
//!
//! # Phases
//!
//! A reader is in one of three one-way phases:
//!
//! - `Startup`: the frontend's tagless first-message framing. Only a
//!   StartupMessage moves the stream to `Normal`; an SSLRequest or
//!   CancelRequest leaves it in `Startup` so the same transport can carry a
//!   fresh first message afterwards.
//! - `Normal`: `[tag][length][payload]` framing.
//! - `Errored`: terminal. Entered when a transport error surfaces; the error
//!   is latched and only reported after every already-parseable message in
//!   the residual buffer has been drained.
//!
//! A stream facing a FEBE frontend starts in `Startup`; a stream facing a
//! backend starts in `Normal`, because the proxy only speaks to a server
//! after the client's first message has been consumed and re-emitted.

use bytes::{Buf, BytesMut};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter, ReadHalf, WriteHalf,
};

use crate::codec::buf;
use crate::error::{Error, Result};
use crate::protocol::message::Message;
use crate::protocol::wire::{self, MSG_HEADER_MIN_SIZE, PROTOCOL_VERSION, TAG_FIRST};

/// Size of the scratch refill read against the transport.
pub const DEFAULT_SCRATCH_SIZE: usize = 8 * 1024;

/// Default unflushed-byte bound on the write path. Flush-on-drain is the
/// primary policy; this bound caps how far a chatty peer can defer it.
pub const DEFAULT_MAX_INFLIGHT: usize = 128 * 1024;

/// Connection phase of a [`MessageReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Startup,
    Normal,
    Errored,
}

/// Rebuild a latched error so it can be surfaced more than once.
fn replay(err: &Error) -> Error {
    match err {
        Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        Error::Eof => Error::Eof,
        Error::TruncatedRead => Error::TruncatedRead,
        Error::TooBig { size, limit } => Error::TooBig {
            size: *size,
            limit: *limit,
        },
        Error::WrongSize { expected, got } => Error::WrongSize {
            expected: *expected,
            got: *got,
        },
        other => Error::Protocol(other.to_string()),
    }
}

/// Reads framed messages from a byte transport.
#[derive(Debug)]
pub struct MessageReader<R> {
    transport: R,
    phase: Phase,
    residual: BytesMut,
    latched: Option<Error>,
    scratch_size: usize,
    max_message_size: Option<u32>,
}

enum Step {
    /// A full header is buffered; tag and declared size.
    Header(u8, u32),
    /// No header can form and an error is latched.
    Surface,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Reader for messages coming from a FEBE frontend (begins in the
    /// startup phase).
    pub fn frontend(transport: R) -> MessageReader<R> {
        Self::with_phase(transport, Phase::Startup)
    }

    /// Reader for messages coming from a FEBE backend (begins in the normal
    /// phase).
    pub fn backend(transport: R) -> MessageReader<R> {
        Self::with_phase(transport, Phase::Normal)
    }

    fn with_phase(transport: R, phase: Phase) -> MessageReader<R> {
        MessageReader {
            transport,
            phase,
            residual: BytesMut::with_capacity(DEFAULT_SCRATCH_SIZE),
            latched: None,
            scratch_size: DEFAULT_SCRATCH_SIZE,
            max_message_size: None,
        }
    }

    /// Cap normal-phase declared sizes. There is no built-in cap; the
    /// protocol allows up to 4 GiB frames and it is the caller's call.
    pub fn with_max_message_size(mut self, cap: u32) -> MessageReader<R> {
        self.max_message_size = Some(cap);
        self
    }

    /// Current connection phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether the residual buffer already holds enough bytes for a tagged
    /// message header, i.e. whether [`next`](Self::next) can produce a
    /// message without touching the transport.
    ///
    /// Conservative in the startup phase (tagless framing bypasses the
    /// residual buffer): rely on `next` to drive the first message.
    pub fn has_next(&self) -> bool {
        self.residual.len() >= MSG_HEADER_MIN_SIZE
    }

    /// Produce the next message.
    ///
    /// The returned message may be a promise borrowing this reader; it must
    /// be forced, streamed, or discarded before the next call.
    pub async fn next(&mut self) -> Result<Message<'_>> {
        match self.phase {
            Phase::Startup => self.next_startup().await,
            Phase::Normal => self.next_normal().await,
            Phase::Errored => Err(self
                .latched
                .as_ref()
                .map(replay)
                .unwrap_or_else(|| Error::Protocol("message stream is errored".into()))),
        }
    }

    async fn next_startup(&mut self) -> Result<Message<'_>> {
        let (size, code) = match self.read_first_header().await {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e)),
        };

        // Only a StartupMessage brings the connection out of the startup
        // sequence; SSLRequest and CancelRequest leave it open for a fresh
        // first message on the same transport.
        if u32::from_be_bytes(code) == PROTOCOL_VERSION {
            self.phase = Phase::Normal;
        }

        Ok(Message::promise(
            TAG_FIRST,
            size,
            code.to_vec(),
            &mut self.transport,
        ))
    }

    async fn read_first_header(&mut self) -> Result<(u32, [u8; 4])> {
        let size = buf::read_u32(&mut self.transport).await?;
        wire::check_startup_size(size)?;
        let mut code = [0u8; 4];
        buf::read_exact_or_eof(&mut self.transport, &mut code).await?;
        Ok((size, code))
    }

    async fn next_normal(&mut self) -> Result<Message<'_>> {
        let step = loop {
            if self.has_next() {
                let tag = self.residual[0];
                let size = u32::from_be_bytes([
                    self.residual[1],
                    self.residual[2],
                    self.residual[3],
                    self.residual[4],
                ]);
                break Step::Header(tag, size);
            }
            if self.latched.is_some() {
                break Step::Surface;
            }
            self.refill().await;
        };

        match step {
            Step::Surface => {
                self.phase = Phase::Errored;
                Err(self
                    .latched
                    .as_ref()
                    .map(replay)
                    .unwrap_or_else(|| Error::Protocol("message stream is errored".into())))
            }
            Step::Header(tag, size) => {
                if size < 4 {
                    return Err(self.fail(Error::WrongSize {
                        expected: 4,
                        got: size,
                    }));
                }
                if let Some(cap) = self.max_message_size {
                    if size - 4 > cap {
                        // The frame stays unconsumed; framing is intact and
                        // the caller decides whether to close.
                        return Err(Error::TooBig {
                            size: size - 4,
                            limit: cap,
                        });
                    }
                }

                self.residual.advance(MSG_HEADER_MIN_SIZE);
                let remaining = (size - 4) as usize;

                if self.residual.len() >= remaining {
                    // Fast path: the whole message is buffered. Split it out
                    // of the residual buffer in place.
                    let payload = self.residual.split_to(remaining).freeze();
                    Ok(Message::buffered_general(tag, payload))
                } else {
                    // Split path: detach the buffered payload prefix (the
                    // residual buffer is about to be recycled) and promise
                    // the tail from the transport.
                    let trailing = self.residual.split().freeze();
                    Ok(Message::promise(tag, size, trailing, &mut self.transport))
                }
            }
        }
    }

    /// One scratch-sized read from the transport into the residual buffer.
    /// Errors are latched, not returned: a few valid messages may already be
    /// buffered ahead of the failure and must be delivered first.
    async fn refill(&mut self) {
        self.residual.reserve(self.scratch_size);
        match self.transport.read_buf(&mut self.residual).await {
            Ok(0) => self.latched = Some(Error::Eof),
            Ok(_) => {}
            Err(e) => self.latched = Some(Error::Io(e)),
        }
    }

    fn fail(&mut self, e: Error) -> Error {
        self.latched = Some(replay(&e));
        self.phase = Phase::Errored;
        e
    }
}

/// Writes framed messages to a byte transport through a buffered sink.
#[derive(Debug)]
pub struct MessageWriter<W> {
    sink: BufWriter<W>,
    unflushed: usize,
    max_inflight: Option<usize>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(transport: W) -> MessageWriter<W> {
        MessageWriter {
            sink: BufWriter::new(transport),
            unflushed: 0,
            max_inflight: Some(DEFAULT_MAX_INFLIGHT),
        }
    }

    /// Override the unflushed-byte bound; `None` defers entirely to
    /// flush-on-drain.
    pub fn with_max_inflight(mut self, bound: Option<usize>) -> MessageWriter<W> {
        self.max_inflight = bound;
        self
    }

    /// Write one message. The write lands in the buffered sink; call
    /// [`flush`](Self::flush) (or rely on the inflight bound) to push it to
    /// the peer.
    pub async fn send(&mut self, msg: &mut Message<'_>) -> Result<()> {
        let n = msg.write_to(&mut self.sink).await?;
        self.unflushed += n as usize;
        if let Some(cap) = self.max_inflight {
            if self.unflushed >= cap {
                self.flush().await?;
            }
        }
        Ok(())
    }

    /// Flush the buffered sink down to the transport.
    pub async fn flush(&mut self) -> Result<()> {
        self.sink.flush().await?;
        self.unflushed = 0;
        Ok(())
    }

    /// Flush and shut down the write side of the transport.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.sink.shutdown().await?;
        self.unflushed = 0;
        Ok(())
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink.write_all(bytes).await?;
        self.unflushed += bytes.len();
        Ok(())
    }
}

/// A bidirectional stream of FEBE messages over one duplex transport.
///
/// The stream owns the transport; the caller must not interact with the
/// wrapped object directly. A single stream is not safe for concurrent
/// callers on the same direction; [`into_split`](Self::into_split) yields
/// independently-owned read and write halves for the two-task relay.
#[derive(Debug)]
pub struct MessageStream<T> {
    reader: MessageReader<ReadHalf<T>>,
    writer: MessageWriter<WriteHalf<T>>,
}

impl<T> MessageStream<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin,
{
    /// Stream for a connection to a FEBE frontend (e.g. psql): begins in the
    /// startup phase.
    pub fn frontend(transport: T) -> MessageStream<T> {
        let (r, w) = tokio::io::split(transport);
        MessageStream {
            reader: MessageReader::frontend(r),
            writer: MessageWriter::new(w),
        }
    }

    /// Stream for a connection to a FEBE backend (e.g. Postgres): begins in
    /// the normal phase.
    pub fn backend(transport: T) -> MessageStream<T> {
        let (r, w) = tokio::io::split(transport);
        MessageStream {
            reader: MessageReader::backend(r),
            writer: MessageWriter::new(w),
        }
    }

    /// See [`MessageReader::has_next`].
    pub fn has_next(&self) -> bool {
        self.reader.has_next()
    }

    /// See [`MessageReader::phase`].
    pub fn phase(&self) -> Phase {
        self.reader.phase()
    }

    /// See [`MessageReader::next`].
    pub async fn next(&mut self) -> Result<Message<'_>> {
        self.reader.next().await
    }

    /// See [`MessageWriter::send`].
    pub async fn send(&mut self, msg: &mut Message<'_>) -> Result<()> {
        self.writer.send(msg).await
    }

    /// See [`MessageWriter::flush`].
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await
    }

    /// Answer an SSLRequest with a single reply byte
    /// ([`ACCEPT_SSL_REPLY`](wire::ACCEPT_SSL_REPLY) or
    /// [`REJECT_SSL_REPLY`](wire::REJECT_SSL_REPLY)). Only meaningful while
    /// the connection is still in the startup phase.
    pub async fn send_ssl_reply(&mut self, reply: u8) -> Result<()> {
        if self.reader.phase() != Phase::Startup {
            return Err(Error::Protocol(
                "SSL reply sent outside the startup phase".into(),
            ));
        }
        self.writer.send_raw(&[reply]).await?;
        self.writer.flush().await
    }

    /// Split into independently-owned read and write halves.
    pub fn into_split(self) -> (MessageReader<ReadHalf<T>>, MessageWriter<WriteHalf<T>>) {
        (self.reader, self.writer)
    }

    /// Flush and close the transport.
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await
    }
}
