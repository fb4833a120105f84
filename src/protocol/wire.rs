//! Wire-level constants for FEBE v3.
//!
//! Normal-phase framing:
//! ```text
//! ┌──────────┬──────────┬──────────────────┐
//! │ Type tag │ Length   │ Payload          │
//! │ 1 byte   │ 4 bytes  │ length - 4 bytes │
//! │          │ uint32 BE│                  │
//! └──────────┴──────────┴──────────────────┘
//! ```
//!
//! The length covers itself plus the payload, excluding the tag. The very
//! first frontend message carries no tag byte; its first four payload bytes
//! discriminate StartupMessage, SSLRequest, and CancelRequest. Internally
//! such messages use the reserved [`TAG_FIRST`] sentinel.
//!
//! All multi-byte integers are big endian.

use crate::error::{Error, Result};

/// Size of a tagged frame header: one tag byte plus a four-byte length.
///
/// A reader holding fewer residual bytes than this cannot form a message
/// without touching the transport.
pub const MSG_HEADER_MIN_SIZE: usize = 5;

/// Reserved internal tag for the tagless first-message family.
pub const TAG_FIRST: u8 = b'\0';

/// The StartupMessage protocol version word for FEBE v3 (0x0003_0000).
pub const PROTOCOL_VERSION: u32 = 196_608;

/// Request code carried by an SSLRequest (0x04d2_162f).
pub const SSL_REQUEST_CODE: u32 = 80_877_103;

/// Request code carried by a CancelRequest (0x04d2_162e).
pub const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// Largest startup-phase payload (declared size minus the size field)
/// accepted. Lifted from the PostgreSQL source.
pub const STARTUP_PAYLOAD_MAX: u32 = 10_000;

/// Smallest startup-phase payload: the version or request-code word.
pub const STARTUP_PAYLOAD_MIN: u32 = 4;

/// Single-byte reply accepting an SSLRequest.
pub const ACCEPT_SSL_REPLY: u8 = b'S';

/// Single-byte reply refusing an SSLRequest. The frontend may close the
/// connection if it is dissatisfied with the refusal.
pub const REJECT_SSL_REPLY: u8 = b'N';

/// Validate a startup-phase declared size (the on-wire length field).
pub fn check_startup_size(declared: u32) -> Result<()> {
    let payload = declared.saturating_sub(4);
    if payload > STARTUP_PAYLOAD_MAX {
        Err(Error::TooBig {
            size: payload,
            limit: STARTUP_PAYLOAD_MAX,
        })
    } else if declared < 4 + STARTUP_PAYLOAD_MIN {
        Err(Error::WrongSize {
            expected: 4 + STARTUP_PAYLOAD_MIN,
            got: declared,
        })
    } else {
        Ok(())
    }
}

/// FEBE message type tags.
///
/// Several distinct messages share a byte on the wire (both Describe and
/// DataRow appear as `'D'`); the constant names keep the manual's message
/// name next to the character code so captured traffic stays readable.
/// SSLRequest has no tag here: it is a negotiation mechanic handled before
/// framing starts, not a first-class message.
pub mod tag {
    pub const AUTHENTICATION_OK: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const BIND: u8 = b'B';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE: u8 = b'C';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const DATA_ROW: u8 = b'D';
    pub const DESCRIBE: u8 = b'D';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const EXECUTE: u8 = b'E';
    pub const FLUSH: u8 = b'H';
    pub const FUNCTION_CALL: u8 = b'F';
    pub const FUNCTION_CALL_RESPONSE: u8 = b'V';
    pub const NO_DATA: u8 = b'n';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const PARSE: u8 = b'P';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const PASSWORD_MESSAGE: u8 = b'p';
    pub const PORTAL_SUSPENDED: u8 = b's';
    pub const QUERY: u8 = b'Q';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}

/// Result-column encoding format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl TryFrom<i16> for Format {
    type Error = Error;

    fn try_from(raw: i16) -> Result<Format> {
        match raw {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(Error::Protocol(format!("unknown encoding format {other}"))),
        }
    }
}

/// Backend transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; queries are rejected until rollback.
    Failed,
}

impl TransactionStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = Error;

    fn try_from(raw: u8) -> Result<TransactionStatus> {
        match raw {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::Protocol(format!(
                "invalid transaction status {:?}",
                other as char
            ))),
        }
    }
}
