//! Framed FEBE message with buffered or promised payload.
//!
//! A [`Message`] is either *fully buffered* (the whole payload sits in an
//! owned [`Bytes`]) or a *promise*: a buffered prefix plus a bounded reader
//! that will supply the rest of the payload straight from the originating
//! transport. Promises let the proxy relay large messages without staging
//! them in memory.
//!
//! A promise borrows its source stream exclusively, so the borrow checker
//! guarantees at most one live promise per stream and no interleaved reads.
//! The one contract it cannot enforce: a promise must be consumed (via
//! [`force`](Message::force), [`write_to`](Message::write_to), or
//! [`discard`](Message::discard)) before the borrow ends, or the stream is
//! left positioned mid-message and every later frame will misparse.

use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, Take};

use crate::codec::buf::read_exact_or_eof;
use crate::error::{Error, Result};
use crate::protocol::wire::TAG_FIRST;

/// The bounded tail of a promise message: exactly
/// `declared_size - 4 - prefix_len` bytes of some source transport.
pub type PromiseTail<'a> = Take<&'a mut (dyn AsyncRead + Send + Unpin)>;

/// One FEBE message.
///
/// `declared_size` is the length field as defined by the protocol: the size
/// field itself plus the payload, excluding the type tag. The reserved zero
/// tag ([`TAG_FIRST`]) marks the tagless first-message family and is skipped
/// on the wire.
pub struct Message<'a> {
    tag: u8,
    size: u32,
    buffered: Bytes,
    future: Option<PromiseTail<'a>>,
}

impl Message<'static> {
    /// Build a fully-buffered message from a payload; the declared size is
    /// `payload.len() + 4`.
    ///
    /// ```
    /// use pgrelay::protocol::Message;
    ///
    /// let m = Message::from_bytes(b'Q', &b"select 1\0"[..]);
    /// assert_eq!(m.tag(), b'Q');
    /// assert_eq!(m.declared_size(), 13);
    /// assert!(m.is_buffered());
    /// ```
    pub fn from_bytes(tag: u8, payload: impl Into<Bytes>) -> Message<'static> {
        let buffered = payload.into();
        Message {
            tag,
            size: buffered.len() as u32 + 4,
            buffered,
            future: None,
        }
    }

}

impl<'a> Message<'a> {
    /// Build a fully-buffered message at an arbitrary lifetime. `Message<'a>`
    /// is invariant in `'a` (it stores a `&'a mut dyn AsyncRead`), so a
    /// `Message<'static>` from [`from_bytes`](Message::from_bytes) cannot be
    /// reborrowed as `Message<'a>` by ordinary subtyping; this constructs the
    /// target type directly instead.
    pub(crate) fn buffered_general(tag: u8, payload: impl Into<Bytes>) -> Message<'a> {
        let buffered = payload.into();
        Message {
            tag,
            size: buffered.len() as u32 + 4,
            buffered,
            future: None,
        }
    }
}

impl<'a> Message<'a> {
    /// Build a promise message: `prefix` is already in memory, the rest of
    /// the payload will be pulled from `reader`, bounded to exactly
    /// `size - 4 - prefix.len()` bytes.
    pub fn promise(
        tag: u8,
        size: u32,
        prefix: impl Into<Bytes>,
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
    ) -> Message<'a> {
        let buffered = prefix.into();
        let remaining = u64::from(size).saturating_sub(4 + buffered.len() as u64);
        Message {
            tag,
            size,
            buffered,
            future: Some(reader.take(remaining)),
        }
    }

    /// The message type tag; [`TAG_FIRST`] for the tagless family.
    #[inline]
    pub fn tag(&self) -> u8 {
        self.tag
    }

    /// The declared size: payload length plus the four-byte size field.
    #[inline]
    pub fn declared_size(&self) -> u32 {
        self.size
    }

    /// Whether the whole payload is in memory.
    #[inline]
    pub fn is_buffered(&self) -> bool {
        self.future.is_none()
    }

    /// The payload bytes currently in memory: the whole payload for a
    /// buffered message, the prefix for a promise.
    #[inline]
    pub fn buffered(&self) -> &Bytes {
        &self.buffered
    }

    /// Force the entire payload into memory, turning a promise into a
    /// fully-buffered message, and return it.
    pub async fn force(&mut self) -> Result<&[u8]> {
        if let Some(mut tail) = self.future.take() {
            let payload_len = (self.size as usize).saturating_sub(4);
            let prefix_len = self.buffered.len();
            let mut buf = BytesMut::with_capacity(payload_len);
            buf.extend_from_slice(&self.buffered);
            buf.resize(payload_len, 0);
            read_exact_or_eof(&mut tail, &mut buf[prefix_len..]).await?;
            self.buffered = buf.freeze();
        }
        Ok(&self.buffered)
    }

    /// Serialize the message to `w`: tag byte (skipped for [`TAG_FIRST`]),
    /// big-endian declared size, then the payload. Returns the total number
    /// of bytes written.
    ///
    /// The fast path hands the buffered slice to the writer directly; a
    /// promise streams its prefix and then copies the tail from the source
    /// transport. A promise is consumed by this call.
    pub async fn write_to<W>(&mut self, w: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut total: u64 = 0;

        if self.tag != TAG_FIRST {
            w.write_all(&[self.tag]).await?;
            total += 1;
        }

        w.write_all(&self.size.to_be_bytes()).await?;
        total += 4;

        w.write_all(&self.buffered).await?;
        total += self.buffered.len() as u64;

        if let Some(mut tail) = self.future.take() {
            let expected = tail.limit();
            let copied = tokio::io::copy(&mut tail, w).await?;
            total += copied;
            if copied != expected {
                return Err(Error::TruncatedRead);
            }
        }

        Ok(total)
    }

    /// Drain and detach the promise tail without keeping the bytes. A no-op
    /// for buffered messages. Required before the owning stream can produce
    /// another message if the payload is not otherwise consumed.
    pub async fn discard(&mut self) -> Result<()> {
        if let Some(mut tail) = self.future.take() {
            tokio::io::copy(&mut tail, &mut tokio::io::sink()).await?;
        }
        Ok(())
    }

    /// A byte source yielding exactly the payload: the buffered prefix
    /// chained with the promise tail, if any.
    ///
    /// The view is one-shot; a message whose tail has been consumed through
    /// it should not subsequently be forced or serialized.
    pub fn payload_reader(&mut self) -> PayloadReader<'_, 'a> {
        PayloadReader {
            prefix: &self.buffered,
            tail: self.future.as_mut(),
        }
    }

    /// Force the payload and detach from the source stream, yielding an
    /// owned message.
    pub async fn into_owned(mut self) -> Result<Message<'static>> {
        self.force().await?;
        Ok(Message {
            tag: self.tag,
            size: self.size,
            buffered: self.buffered,
            future: None,
        })
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("tag", &(self.tag as char))
            .field("size", &self.size)
            .field("buffered", &self.buffered.len())
            .field("promise", &self.future.is_some())
            .finish()
    }
}

/// Payload view returned by [`Message::payload_reader`].
pub struct PayloadReader<'m, 'a> {
    prefix: &'m [u8],
    tail: Option<&'m mut PromiseTail<'a>>,
}

impl AsyncRead for PayloadReader<'_, '_> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = &mut *self;
        if !me.prefix.is_empty() {
            let n = me.prefix.len().min(buf.remaining());
            buf.put_slice(&me.prefix[..n]);
            me.prefix = &me.prefix[n..];
            return Poll::Ready(Ok(()));
        }
        match me.tail.as_mut() {
            Some(tail) => Pin::new(&mut **tail).poll_read(cx, buf),
            None => Poll::Ready(Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_from_bytes_accessors() {
        let m = Message::from_bytes(b'K', &[0u8, 0, 4, 210, 0, 0, 22, 136][..]);
        assert_eq!(m.tag(), b'K');
        assert_eq!(m.declared_size(), 12);
        assert!(m.is_buffered());
        assert_eq!(m.buffered().len(), 8);
    }

    #[tokio::test]
    async fn test_write_to_buffered() {
        let mut m = Message::from_bytes(b'Z', &b"I"[..]);
        let mut out = Vec::new();
        let n = m.write_to(&mut out).await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(out, [b'Z', 0, 0, 0, 5, b'I']);
    }

    #[tokio::test]
    async fn test_write_to_skips_first_tag() {
        let mut m = Message::from_bytes(TAG_FIRST, &[0x04, 0xd2, 0x16, 0x2f][..]);
        let mut out = Vec::new();
        let n = m.write_to(&mut out).await.unwrap();
        assert_eq!(n, 8);
        assert_eq!(out, [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
    }

    #[tokio::test]
    async fn test_force_transitions_promise_to_buffered() {
        let mut src: &[u8] = b"orld";
        let mut m = Message::promise(b'D', 9, &b"w"[..], &mut src);
        assert!(!m.is_buffered());
        assert_eq!(m.force().await.unwrap(), b"world");
        assert!(m.is_buffered());
        // Forcing again is a cheap no-op on the same bytes.
        assert_eq!(m.force().await.unwrap(), b"world");
    }

    #[tokio::test]
    async fn test_promise_serialize_equals_buffered_serialize() {
        let payload = b"payload bytes here";
        let mut buffered = Message::from_bytes(b'D', &payload[..]);
        let mut expected = Vec::new();
        buffered.write_to(&mut expected).await.unwrap();

        let mut src: &[u8] = &payload[5..];
        let mut promise =
            Message::promise(b'D', payload.len() as u32 + 4, &payload[..5], &mut src);
        let mut got = Vec::new();
        let n = promise.write_to(&mut got).await.unwrap();

        assert_eq!(got, expected);
        assert_eq!(n as usize, got.len());
    }

    #[tokio::test]
    async fn test_promise_tail_is_bounded() {
        // The source holds more bytes than the message declares; the tail
        // must stop at the declared size.
        let mut src: &[u8] = b"abcdefXXXX";
        let mut m = Message::promise(b'D', 10, &b""[..], &mut src);
        assert_eq!(m.force().await.unwrap(), b"abcdef");
        // The extra bytes stay in the source.
        let mut rest = Vec::new();
        src.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"XXXX");
    }

    #[tokio::test]
    async fn test_force_short_tail_is_truncated() {
        let mut src: &[u8] = b"ab";
        let mut m = Message::promise(b'D', 10, &b""[..], &mut src);
        assert!(matches!(m.force().await, Err(Error::TruncatedRead)));
    }

    #[tokio::test]
    async fn test_discard_drains_the_tail() {
        let mut src: &[u8] = b"abcdefrest";
        {
            let mut m = Message::promise(b'D', 10, &b""[..], &mut src);
            m.discard().await.unwrap();
            assert!(m.is_buffered());
        }
        let mut rest = Vec::new();
        src.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"rest");
    }

    #[tokio::test]
    async fn test_payload_reader_chains_prefix_and_tail() {
        let mut src: &[u8] = b" world";
        let mut m = Message::promise(b'D', 15, &b"hello"[..], &mut src);
        let mut out = Vec::new();
        m.payload_reader().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_into_owned_copies_payload() {
        let mut src: &[u8] = b"tail";
        let m = Message::promise(b'D', 12, &b"head"[..], &mut src);
        let owned = m.into_owned().await.unwrap();
        assert!(owned.is_buffered());
        assert_eq!(&owned.buffered()[..], b"headtail");
    }
}
