//! Network-byte-order primitives for FEBE fields.
//!
//! All multi-byte integers on the wire are big endian; there is no
//! byte-order alternative. Strings are UTF-8 followed by a single NUL.
//!
//! The write side rides on [`bytes::BufMut`], whose integer putters are
//! already big-endian; [`PgBuf`] adds the NUL-terminated string form. The
//! read side comes in two flavors: [`Cursor`] for payloads already in
//! memory, and the async helpers for bytes still on a transport.

use bytes::BufMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

/// Extends [`BufMut`] with the FEBE string form.
pub trait PgBuf: BufMut {
    /// Write `s` as UTF-8 bytes followed by a NUL terminator.
    fn put_cstr(&mut self, s: &str);
}

impl<B: BufMut> PgBuf for B {
    fn put_cstr(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(b'\0');
    }
}

/// Decodes fields from an in-memory payload slice.
///
/// The API mirrors [`bytes::Buf`], but every operation returns an error
/// instead of panicking: a malformed message from a peer must never crash
/// the proxy. An exhausted cursor reports [`Error::Eof`]; a read that can
/// only be partially satisfied reports [`Error::TruncatedRead`].
#[derive(Debug)]
pub struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    /// Construct a cursor decoding from the beginning of `buf`.
    pub fn new(buf: &'a [u8]) -> Cursor<'a> {
        Cursor { buf }
    }

    /// Number of bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() >= n {
            let (head, tail) = self.buf.split_at(n);
            self.buf = tail;
            Ok(head)
        } else if self.buf.is_empty() {
            Err(Error::Eof)
        } else {
            Err(Error::TruncatedRead)
        }
    }

    /// Return the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8> {
        self.buf.first().copied().ok_or(Error::Eof)
    }

    /// Read a single byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit signed integer.
    pub fn read_i16(&mut self) -> Result<i16> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a 16-bit unsigned integer.
    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a 32-bit signed integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a 32-bit unsigned integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read exactly `n` raw bytes.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read a NUL-terminated UTF-8 string; the terminator is consumed but
    /// not included. Length-unbounded at this layer: callers enforce
    /// framing bounds.
    pub fn read_cstr(&mut self) -> Result<&'a str> {
        if self.buf.is_empty() {
            return Err(Error::Eof);
        }
        let pos = self
            .buf
            .iter()
            .position(|b| *b == b'\0')
            .ok_or(Error::TruncatedRead)?;
        let raw = &self.buf[..pos];
        self.buf = &self.buf[pos + 1..];
        std::str::from_utf8(raw)
            .map_err(|e| Error::Protocol(format!("string is not valid UTF-8: {e}")))
    }
}

/// Read exactly `buf.len()` bytes from `r`.
///
/// End of stream before the first byte is a clean [`Error::Eof`]; end of
/// stream after some bytes were obtained is [`Error::TruncatedRead`].
pub async fn read_exact_or_eof<R>(r: &mut R, buf: &mut [u8]) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                Error::Eof
            } else {
                Error::TruncatedRead
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read a big-endian 32-bit unsigned integer from an async byte source.
pub async fn read_u32<R>(r: &mut R) -> Result<u32>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut be = [0u8; 4];
    read_exact_or_eof(r, &mut be).await?;
    Ok(u32::from_be_bytes(be))
}
