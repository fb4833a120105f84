//! Protocol module - FEBE framing, message streams, and message codecs.
//!
//! This module implements the structural layer of the wire protocol:
//! - framed messages with buffered or promised payloads
//! - message streams with startup-phase-aware decoding and carry-over
//! - codecs for the curated message catalogue and the type OID table

pub mod backend;
pub mod first;
mod message;
pub mod oid;
mod stream;
pub mod wire;

pub use backend::{
    describe_status_code, AuthenticationOk, BackendKeyData, CommandComplete, DataRow,
    ErrorResponse, FieldDescription, Query, ReadyForQuery, RowDescription,
};
pub use first::{is_cancel_request, is_ssl_request, is_startup, CancelRequest, SslRequest, Startup};
pub use message::{Message, PayloadReader, PromiseTail};
pub use oid::{typlen, Oid};
pub use stream::{
    MessageReader, MessageStream, MessageWriter, Phase, DEFAULT_MAX_INFLIGHT, DEFAULT_SCRATCH_SIZE,
};
pub use wire::{Format, TransactionStatus, MSG_HEADER_MIN_SIZE, TAG_FIRST};
