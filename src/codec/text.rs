//! PostgreSQL text-format value encoding and OID-tagged decoding.
//!
//! Encoding covers the closed set of scalar types the library can produce
//! itself: 16/32/64-bit integers, 32/64-bit floats, strings, and booleans.
//! Each encoded cell is its textual representation prefixed by a 32-bit
//! byte length (integers as decimal, floats in `e` notation, booleans as
//! `t`/`f`, strings verbatim). Binary format has a dedicated encoder only
//! for int2.
//!
//! Decoding maps a raw text-format cell plus its type OID back to a typed
//! value for a fixed set of scalars; anything else passes through as raw
//! bytes.

use bytes::{BufMut, BytesMut};
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::error::{Error, Result};
use crate::protocol::oid::{oids, Oid};
use crate::protocol::wire::Format;

/// A value the library knows how to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bool(bool),
}

impl Value {
    /// The text-format representation, without the length prefix.
    pub fn text(&self) -> String {
        match self {
            Value::Int2(v) => v.to_string(),
            Value::Int4(v) => v.to_string(),
            Value::Int8(v) => v.to_string(),
            Value::Float4(v) => format!("{v:e}"),
            Value::Float8(v) => format!("{v:e}"),
            Value::Text(v) => v.clone(),
            Value::Bool(v) => if *v { "t" } else { "f" }.to_string(),
        }
    }

    /// The PostgreSQL type OID this value maps to.
    pub fn oid(&self) -> Oid {
        match self {
            Value::Int2(_) => oids::INT2,
            Value::Int4(_) => oids::INT4,
            Value::Int8(_) => oids::INT8,
            Value::Float4(_) => oids::FLOAT4,
            Value::Float8(_) => oids::FLOAT8,
            Value::Text(_) => oids::TEXT,
            Value::Bool(_) => oids::BOOL,
        }
    }
}

/// Encode one cell, length prefix included, in the requested format.
pub fn encode(buf: &mut BytesMut, value: &Value, format: Format) -> Result<()> {
    match format {
        Format::Text => {
            let repr = value.text();
            buf.put_i32(repr.len() as i32);
            buf.put_slice(repr.as_bytes());
            Ok(())
        }
        Format::Binary => match value {
            Value::Int2(v) => {
                buf.put_i32(2);
                buf.put_i16(*v);
                Ok(())
            }
            other => Err(Error::Protocol(format!(
                "no binary encoding for {other:?}"
            ))),
        },
    }
}

/// Guess the type OIDs for a rectangular row set, column by column, from
/// the first non-NULL value seen in each column. Columns that never show a
/// value stay [`oids::UNKNOWN`].
pub fn guess_oids(rows: &[Vec<Option<Value>>]) -> Vec<Oid> {
    let Some(first) = rows.first() else {
        return Vec::new();
    };
    let mut guessed = vec![oids::UNKNOWN; first.len()];
    for row in rows {
        let mut got_all = true;
        for (i, slot) in guessed.iter_mut().enumerate() {
            if *slot == oids::UNKNOWN {
                match row.get(i).and_then(|cell| cell.as_ref()) {
                    Some(v) => *slot = v.oid(),
                    None => got_all = false,
                }
            }
        }
        if got_all {
            break;
        }
    }
    guessed
}

/// Options for [`decode`].
#[derive(Debug, Clone)]
pub struct DecodeOptions {
    /// Accept half-hour timezone offsets (`-07:30`) on `timestamptz` and
    /// `timetz` values. On by default; turn off to insist on whole-hour
    /// offsets.
    pub half_hour_zone: bool,
}

impl Default for DecodeOptions {
    fn default() -> DecodeOptions {
        DecodeOptions {
            half_hour_zone: true,
        }
    }
}

/// A decoded text-format value.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Bytes(Vec<u8>),
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(PrimitiveDateTime),
    TimestampTz(OffsetDateTime),
    Date(Date),
    Time(Time),
    TimeTz(Time, UtcOffset),
    /// Passthrough for types outside the supported set.
    Raw(Vec<u8>),
}

const DATE_FMT: &[BorrowedFormatItem<'static>] =
    format_description!(version = 2, "[year]-[month]-[day]");

const TIME_FMT: &[BorrowedFormatItem<'static>] = format_description!(
    version = 2,
    "[hour]:[minute]:[second][optional [.[subsecond]]]"
);

const TIMESTAMP_FMT: &[BorrowedFormatItem<'static>] = format_description!(
    version = 2,
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"
);

const TIMESTAMPTZ_FMT: &[BorrowedFormatItem<'static>] = format_description!(
    version = 2,
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]][offset_hour sign:mandatory][optional [:[offset_minute]]]"
);

const TIMESTAMPTZ_WHOLE_HOUR_FMT: &[BorrowedFormatItem<'static>] = format_description!(
    version = 2,
    "[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]][offset_hour sign:mandatory]"
);

const OFFSET_FMT: &[BorrowedFormatItem<'static>] = format_description!(
    version = 2,
    "[offset_hour sign:mandatory][optional [:[offset_minute]]]"
);

const OFFSET_WHOLE_HOUR_FMT: &[BorrowedFormatItem<'static>] =
    format_description!(version = 2, "[offset_hour sign:mandatory]");

/// Decode a text-format cell into a typed value according to its OID.
///
/// Supported: bytea (hex form), bool, the int family, the float family,
/// numeric, and the timestamp/date/time family. Any other OID passes the
/// bytes through as [`Decoded::Raw`].
///
/// # Panics
///
/// Malformed input for one of the supported types is fatal at the decode
/// call site: a backend that emits unparseable text for a type it declared
/// is not something this library can relay meaningfully.
pub fn decode(raw: &[u8], type_oid: Oid, opts: &DecodeOptions) -> Decoded {
    match type_oid {
        oids::BYTEA => {
            let hex = raw.strip_prefix(b"\\x").unwrap_or_else(|| {
                panic!("pgrelay: decode: bytea cell is not in hex form")
            });
            Decoded::Bytes(hex_decode(hex))
        }
        oids::BOOL => Decoded::Bool(raw.first() == Some(&b't')),
        oids::INT2 | oids::INT4 | oids::INT8 => {
            Decoded::Int(must_utf8(raw).parse().unwrap_or_else(|e| {
                panic!("pgrelay: decode: bad integer: {e}");
            }))
        }
        oids::FLOAT4 | oids::FLOAT8 | oids::NUMERIC => {
            Decoded::Float(must_utf8(raw).parse().unwrap_or_else(|e| {
                panic!("pgrelay: decode: bad float: {e}");
            }))
        }
        oids::DATE => Decoded::Date(must_parse(raw, |s| Date::parse(s, DATE_FMT))),
        oids::TIME => Decoded::Time(must_parse(raw, |s| Time::parse(s, TIME_FMT))),
        oids::TIMESTAMP => {
            Decoded::Timestamp(must_parse(raw, |s| PrimitiveDateTime::parse(s, TIMESTAMP_FMT)))
        }
        oids::TIMESTAMPTZ => {
            let fmt = if opts.half_hour_zone {
                TIMESTAMPTZ_FMT
            } else {
                TIMESTAMPTZ_WHOLE_HOUR_FMT
            };
            Decoded::TimestampTz(must_parse(raw, |s| OffsetDateTime::parse(s, fmt)))
        }
        oids::TIMETZ => {
            let text = must_utf8(raw);
            let split = text[1..]
                .find(['+', '-'])
                .map(|i| i + 1)
                .unwrap_or_else(|| panic!("pgrelay: decode: timetz cell has no offset"));
            let offset_fmt = if opts.half_hour_zone {
                OFFSET_FMT
            } else {
                OFFSET_WHOLE_HOUR_FMT
            };
            let time = must_parse(text[..split].as_bytes(), |s| Time::parse(s, TIME_FMT));
            let offset =
                must_parse(text[split..].as_bytes(), |s| UtcOffset::parse(s, offset_fmt));
            Decoded::TimeTz(time, offset)
        }
        _ => Decoded::Raw(raw.to_vec()),
    }
}

fn must_utf8(raw: &[u8]) -> &str {
    std::str::from_utf8(raw)
        .unwrap_or_else(|e| panic!("pgrelay: decode: cell is not UTF-8: {e}"))
}

fn must_parse<T, E: std::fmt::Display>(
    raw: &[u8],
    parse: impl FnOnce(&str) -> std::result::Result<T, E>,
) -> T {
    parse(must_utf8(raw)).unwrap_or_else(|e| panic!("pgrelay: decode: {e}"))
}

fn hex_decode(hex: &[u8]) -> Vec<u8> {
    fn nibble(b: u8) -> u8 {
        match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            other => panic!("pgrelay: decode: bad hex digit {:?}", other as char),
        }
    }
    if hex.len() % 2 != 0 {
        panic!("pgrelay: decode: odd-length hex string");
    }
    hex.chunks_exact(2)
        .map(|pair| (nibble(pair[0]) << 4) | nibble(pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time as time_lit};

    #[test]
    fn test_text_representations() {
        assert_eq!(Value::Int2(-3).text(), "-3");
        assert_eq!(Value::Int4(42).text(), "42");
        assert_eq!(Value::Int8(1 << 40).text(), "1099511627776");
        assert_eq!(Value::Float8(1.5).text(), "1.5e0");
        assert_eq!(Value::Bool(true).text(), "t");
        assert_eq!(Value::Bool(false).text(), "f");
        assert_eq!(Value::Text("verbatim".into()).text(), "verbatim");
    }

    #[test]
    fn test_encode_text_length_prefix() {
        let mut buf = BytesMut::new();
        encode(&mut buf, &Value::Int4(1234), Format::Text).unwrap();
        assert_eq!(&buf[..4], &4i32.to_be_bytes());
        assert_eq!(&buf[4..], b"1234");
    }

    #[test]
    fn test_encode_binary_int2() {
        let mut buf = BytesMut::new();
        encode(&mut buf, &Value::Int2(-2), Format::Binary).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 2, 0xff, 0xfe]);
    }

    #[test]
    fn test_encode_binary_unsupported() {
        let mut buf = BytesMut::new();
        assert!(encode(&mut buf, &Value::Int8(1), Format::Binary).is_err());
    }

    #[test]
    fn test_value_oids() {
        assert_eq!(Value::Int2(0).oid(), oids::INT2);
        assert_eq!(Value::Bool(false).oid(), oids::BOOL);
        assert_eq!(Value::Text(String::new()).oid(), oids::TEXT);
    }

    #[test]
    fn test_guess_oids_skips_nulls() {
        let rows = vec![
            vec![None, Some(Value::Bool(true))],
            vec![Some(Value::Int8(9)), Some(Value::Bool(false))],
        ];
        assert_eq!(guess_oids(&rows), vec![oids::INT8, oids::BOOL]);
    }

    #[test]
    fn test_guess_oids_all_null_column() {
        let rows = vec![vec![None], vec![None]];
        assert_eq!(guess_oids(&rows), vec![oids::UNKNOWN]);
        assert!(guess_oids(&[]).is_empty());
    }

    #[test]
    fn test_decode_scalars() {
        let opts = DecodeOptions::default();
        assert_eq!(decode(b"42", oids::INT4, &opts), Decoded::Int(42));
        assert_eq!(decode(b"-7", oids::INT8, &opts), Decoded::Int(-7));
        assert_eq!(decode(b"1.25", oids::FLOAT8, &opts), Decoded::Float(1.25));
        assert_eq!(decode(b"10.50", oids::NUMERIC, &opts), Decoded::Float(10.5));
        assert_eq!(decode(b"t", oids::BOOL, &opts), Decoded::Bool(true));
        assert_eq!(decode(b"f", oids::BOOL, &opts), Decoded::Bool(false));
    }

    #[test]
    fn test_decode_bytea_hex() {
        let opts = DecodeOptions::default();
        assert_eq!(
            decode(b"\\xdeadBEEF", oids::BYTEA, &opts),
            Decoded::Bytes(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn test_decode_time_family() {
        let opts = DecodeOptions::default();
        assert_eq!(
            decode(b"2012-06-07", oids::DATE, &opts),
            Decoded::Date(date!(2012 - 06 - 07))
        );
        assert_eq!(
            decode(b"15:04:05", oids::TIME, &opts),
            Decoded::Time(time_lit!(15:04:05))
        );
        assert_eq!(
            decode(b"2012-06-07 15:04:05", oids::TIMESTAMP, &opts),
            Decoded::Timestamp(datetime!(2012-06-07 15:04:05))
        );
        assert_eq!(
            decode(b"2012-06-07 15:04:05.25", oids::TIMESTAMP, &opts),
            Decoded::Timestamp(datetime!(2012-06-07 15:04:05.25))
        );
    }

    #[test]
    fn test_decode_timestamptz_offsets() {
        let opts = DecodeOptions::default();
        assert_eq!(
            decode(b"2012-06-07 15:04:05-07", oids::TIMESTAMPTZ, &opts),
            Decoded::TimestampTz(datetime!(2012-06-07 15:04:05 -7))
        );
        // The half-hour-offset form is accepted under the default options.
        assert_eq!(
            decode(b"2012-06-07 15:04:05+05:30", oids::TIMESTAMPTZ, &opts),
            Decoded::TimestampTz(datetime!(2012-06-07 15:04:05 +5:30))
        );
    }

    #[test]
    fn test_decode_timetz() {
        let opts = DecodeOptions::default();
        assert_eq!(
            decode(b"15:04:05-07", oids::TIMETZ, &opts),
            Decoded::TimeTz(time_lit!(15:04:05), UtcOffset::from_hms(-7, 0, 0).unwrap())
        );
        assert_eq!(
            decode(b"15:04:05+05:30", oids::TIMETZ, &opts),
            Decoded::TimeTz(time_lit!(15:04:05), UtcOffset::from_hms(5, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_decode_unknown_oid_passthrough() {
        let opts = DecodeOptions::default();
        assert_eq!(
            decode(b"anything", oids::TSQUERY, &opts),
            Decoded::Raw(b"anything".to_vec())
        );
    }

    #[test]
    #[should_panic(expected = "bad integer")]
    fn test_decode_malformed_supported_type_is_fatal() {
        decode(b"not a number", oids::INT4, &DecodeOptions::default());
    }
}
