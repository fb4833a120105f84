//! Codec module - byte-level and value-level encoding for FEBE fields.
//!
//! Two layers live here:
//!
//! - [`buf`] - network-byte-order integers and NUL-terminated strings over
//!   byte slices and async byte sources
//! - [`text`] - PostgreSQL text-format value encoding and OID-tagged decoding
//!
//! # Design
//!
//! The byte layer never enforces framing bounds: callers (the message stream
//! and the message parsers) carry the size discipline, the codec only reports
//! whether the bytes it was asked for exist. A read that finds nothing is a
//! clean [`Eof`]; a read that finds some but not all of its bytes is a
//! [`TruncatedRead`].
//!
//! [`Eof`]: crate::error::Error::Eof
//! [`TruncatedRead`]: crate::error::Error::TruncatedRead

pub mod buf;
pub mod text;

pub use buf::{Cursor, PgBuf};
pub use text::{DecodeOptions, Decoded, Value};
