//! Codecs for the tagged FEBE messages this library understands at the
//! structural level.
//!
//! Each kind has an `encode` constructor that writes a correct payload into
//! a framed [`Message`] and a `parse` that validates tag and size before
//! extracting fields. Messages outside this catalogue still relay fine; the
//! proxy only needs structural knowledge of the ones it inspects.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use bytes::{BufMut, Bytes, BytesMut};
use regex::Regex;

use crate::codec::buf::{Cursor, PgBuf};
use crate::codec::text::Value;
use crate::error::{Error, Result};
use crate::protocol::message::Message;
use crate::protocol::oid::{self, Oid};
use crate::protocol::wire::{tag, Format, TransactionStatus};

fn expect_tag(msg: &Message<'_>, expected: u8) -> Result<()> {
    if msg.tag() == expected {
        Ok(())
    } else {
        Err(Error::BadTypeCode {
            expected,
            got: msg.tag(),
        })
    }
}

fn expect_size(msg: &Message<'_>, expected: u32) -> Result<()> {
    if msg.declared_size() == expected {
        Ok(())
    } else {
        Err(Error::WrongSize {
            expected,
            got: msg.declared_size(),
        })
    }
}

/// AuthenticationOk: the all-zero authentication response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationOk;

impl AuthenticationOk {
    pub fn encode(&self) -> Message<'static> {
        Message::from_bytes(tag::AUTHENTICATION_OK, vec![0, 0, 0, 0])
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<AuthenticationOk> {
        expect_tag(msg, tag::AUTHENTICATION_OK)?;
        expect_size(msg, 8)?;
        let body = msg.force().await?;
        let code = Cursor::new(body).read_u32()?;
        if code != 0 {
            return Err(Error::Protocol(format!(
                "authentication response {code} is not Ok"
            )));
        }
        Ok(AuthenticationOk)
    }
}

/// BackendKeyData: the `(backend_pid, secret_key)` pair a frontend must echo
/// in a later CancelRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendKeyData {
    pub backend_pid: u32,
    pub secret_key: u32,
}

impl BackendKeyData {
    pub fn is(msg: &Message<'_>) -> bool {
        msg.tag() == tag::BACKEND_KEY_DATA
    }

    pub fn encode(&self) -> Message<'static> {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u32(self.backend_pid);
        buf.put_u32(self.secret_key);
        Message::from_bytes(tag::BACKEND_KEY_DATA, buf.freeze())
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<BackendKeyData> {
        expect_tag(msg, tag::BACKEND_KEY_DATA)?;
        expect_size(msg, 12)?;
        let body = msg.force().await?;
        let mut b = Cursor::new(body);
        Ok(BackendKeyData {
            backend_pid: b.read_u32()?,
            secret_key: b.read_u32()?,
        })
    }
}

/// ReadyForQuery: the backend is idle and carries its transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub fn is(msg: &Message<'_>) -> bool {
        msg.tag() == tag::READY_FOR_QUERY
    }

    pub fn encode(&self) -> Message<'static> {
        Message::from_bytes(tag::READY_FOR_QUERY, vec![self.status.as_byte()])
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<ReadyForQuery> {
        expect_tag(msg, tag::READY_FOR_QUERY)?;
        expect_size(msg, 5)?;
        let body = msg.force().await?;
        let status = TransactionStatus::try_from(Cursor::new(body).read_u8()?)?;
        Ok(ReadyForQuery { status })
    }
}

/// One column descriptor within a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: u32,
    pub table_attno: i16,
    pub type_oid: Oid,
    pub typlen: i16,
    pub atttypmod: i32,
    pub format: Format,
}

impl FieldDescription {
    /// A text-format field with no table origin, sized from the OID
    /// catalogue.
    pub fn new(name: impl Into<String>, type_oid: Oid) -> FieldDescription {
        FieldDescription {
            name: name.into(),
            table_oid: 0,
            table_attno: 0,
            type_oid,
            typlen: oid::typlen(type_oid),
            atttypmod: -1,
            format: Format::Text,
        }
    }
}

/// RowDescription: the shape of the rows a query will produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

impl RowDescription {
    pub fn encode(&self) -> Message<'static> {
        // Heuristic per-field estimate to avoid growing the buffer.
        let field_len_est = 10 + 4 + 2 + 4 + 2 + 4 + 2;
        let mut buf = BytesMut::with_capacity(2 + self.fields.len() * field_len_est);
        buf.put_i16(self.fields.len() as i16);
        for field in &self.fields {
            buf.put_cstr(&field.name);
            buf.put_u32(field.table_oid);
            buf.put_i16(field.table_attno);
            buf.put_u32(field.type_oid);
            buf.put_i16(field.typlen);
            buf.put_i32(field.atttypmod);
            buf.put_i16(field.format as i16);
        }
        Message::from_bytes(tag::ROW_DESCRIPTION, buf.freeze())
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<RowDescription> {
        expect_tag(msg, tag::ROW_DESCRIPTION)?;
        let body = msg.force().await?;
        let mut b = Cursor::new(body);

        let count = b.read_u16()?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            fields.push(FieldDescription {
                name: b.read_cstr()?.to_owned(),
                table_oid: b.read_u32()?,
                table_attno: b.read_i16()?,
                type_oid: b.read_u32()?,
                typlen: b.read_i16()?,
                atttypmod: b.read_i32()?,
                format: Format::try_from(b.read_i16()?)?,
            });
        }
        Ok(RowDescription { fields })
    }
}

/// DataRow: one result row; a `None` column is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub values: Vec<Option<Bytes>>,
}

impl DataRow {
    /// Text-encode a row of typed values.
    pub fn from_values(cols: &[Option<Value>]) -> DataRow {
        let values = cols
            .iter()
            .map(|col| col.as_ref().map(|v| Bytes::from(v.text())))
            .collect();
        DataRow { values }
    }

    pub fn encode(&self) -> Message<'static> {
        let data_size: usize = self.values.iter().flatten().map(|v| v.len() + 4).sum();
        let mut buf = BytesMut::with_capacity(2 + data_size);
        buf.put_i16(self.values.len() as i16);
        for value in &self.values {
            match value {
                Some(v) => {
                    buf.put_i32(v.len() as i32);
                    buf.put_slice(v);
                }
                None => buf.put_i32(-1),
            }
        }
        Message::from_bytes(tag::DATA_ROW, buf.freeze())
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<DataRow> {
        expect_tag(msg, tag::DATA_ROW)?;
        let body = msg.force().await?;
        let mut b = Cursor::new(body);

        let count = b.read_u16()?;
        let mut values = Vec::with_capacity(count as usize);
        for i in 0..count {
            let len = b.read_i32()?;
            if len >= 0 {
                values.push(Some(Bytes::copy_from_slice(b.read_bytes(len as usize)?)));
            } else if len == -1 {
                values.push(None);
            } else {
                return Err(Error::Protocol(format!(
                    "invalid length {len} for column {i}"
                )));
            }
        }
        Ok(DataRow { values })
    }
}

/// CommandComplete: the command tag closing a statement, parsed into its
/// verb, affected-row count, and (for inserts) object OID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandComplete {
    /// The command verb, or the full tag when it carries no counts.
    pub tag: String,
    pub affected_count: u64,
    pub oid: Option<u32>,
}

fn cmd_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(INSERT|DELETE|UPDATE|SELECT|MOVE|FETCH|COPY) (\d+)(?: (\d+))?")
            .expect("command tag pattern is valid")
    })
}

impl CommandComplete {
    pub fn encode(cmd_tag: &str) -> Message<'static> {
        let mut buf = BytesMut::with_capacity(cmd_tag.len() + 1);
        buf.put_cstr(cmd_tag);
        Message::from_bytes(tag::COMMAND_COMPLETE, buf.freeze())
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<CommandComplete> {
        expect_tag(msg, tag::COMMAND_COMPLETE)?;
        let body = msg.force().await?;
        let full_tag = Cursor::new(body).read_cstr()?;

        let Some(caps) = cmd_tag_re().captures(full_tag) else {
            // Tags like BEGIN or SET carry no counts.
            return Ok(CommandComplete {
                tag: full_tag.to_owned(),
                affected_count: 0,
                oid: None,
            });
        };

        let parse_num = |s: &str| {
            s.parse::<u64>()
                .map_err(|e| Error::Protocol(format!("bad count in command tag {full_tag:?}: {e}")))
        };

        // INSERT tags read "INSERT <oid> <rows>"; everything else is
        // "<verb> <rows>".
        let (affected_count, oid) = match caps.get(3) {
            Some(rows) => {
                let oid = u32::try_from(parse_num(&caps[2])?).map_err(|_| {
                    Error::Protocol(format!("oid out of range in command tag {full_tag:?}"))
                })?;
                (parse_num(rows.as_str())?, Some(oid))
            }
            None => (parse_num(&caps[2])?, None),
        };

        Ok(CommandComplete {
            tag: caps[1].to_owned(),
            affected_count,
            oid,
        })
    }
}

/// ErrorResponse: a sequence of `(field code, value)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorResponse {
    pub fields: BTreeMap<u8, String>,
}

impl ErrorResponse {
    pub fn is(msg: &Message<'_>) -> bool {
        msg.tag() == tag::ERROR_RESPONSE
    }

    /// The primary human-readable message ('M' field), if present.
    pub fn message(&self) -> Option<&str> {
        self.fields.get(&b'M').map(String::as_str)
    }

    /// The severity ('S' field), if present.
    pub fn severity(&self) -> Option<&str> {
        self.fields.get(&b'S').map(String::as_str)
    }

    pub fn encode(&self) -> Message<'static> {
        let mut buf = BytesMut::new();
        for (code, value) in &self.fields {
            buf.put_u8(*code);
            buf.put_cstr(value);
        }
        buf.put_u8(b'\0');
        Message::from_bytes(tag::ERROR_RESPONSE, buf.freeze())
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<ErrorResponse> {
        expect_tag(msg, tag::ERROR_RESPONSE)?;
        let body = msg.force().await?;
        let mut b = Cursor::new(body);

        let mut fields = BTreeMap::new();
        loop {
            let code = b.read_u8()?;
            if code == 0 {
                break;
            }
            fields.insert(code, b.read_cstr()?.to_owned());
        }
        Ok(ErrorResponse { fields })
    }
}

/// Logical names of the ErrorResponse and NoticeResponse field codes, from
/// the protocol-error-fields page of the PostgreSQL manual.
pub fn describe_status_code(code: u8) -> &'static str {
    match code {
        b'S' => "Severity",
        b'C' => "Code",
        b'M' => "Message",
        b'D' => "Detail",
        b'H' => "Hint",
        b'P' => "Position",
        b'p' => "Internal position",
        b'q' => "Internal query",
        b'W' => "Where",
        b'F' => "File",
        b'L' => "Line",
        b'R' => "Routine",
        _ => "[unknown]",
    }
}

/// Query: a simple-protocol query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub query: String,
}

impl Query {
    pub fn new(query: impl Into<String>) -> Query {
        Query {
            query: query.into(),
        }
    }

    pub fn is(msg: &Message<'_>) -> bool {
        msg.tag() == tag::QUERY
    }

    pub fn encode(&self) -> Message<'static> {
        let mut buf = BytesMut::with_capacity(self.query.len() + 1);
        buf.put_cstr(&self.query);
        Message::from_bytes(tag::QUERY, buf.freeze())
    }

    pub async fn parse(msg: &mut Message<'_>) -> Result<Query> {
        expect_tag(msg, tag::QUERY)?;
        let body = msg.force().await?;
        Ok(Query {
            query: Cursor::new(body).read_cstr()?.to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::oid::oids;

    #[tokio::test]
    async fn test_backend_key_data_roundtrip() {
        let bkd = BackendKeyData {
            backend_pid: 1234,
            secret_key: 5768,
        };
        let mut msg = bkd.encode();
        assert_eq!(msg.declared_size(), 12);
        assert!(BackendKeyData::is(&msg));

        let reparsed = BackendKeyData::parse(&mut msg).await.unwrap();
        assert_eq!(reparsed, bkd);
    }

    #[tokio::test]
    async fn test_backend_key_data_wrong_size() {
        let mut msg = Message::from_bytes(tag::BACKEND_KEY_DATA, vec![0u8; 9]);
        assert!(matches!(
            BackendKeyData::parse(&mut msg).await,
            Err(Error::WrongSize {
                expected: 12,
                got: 13
            })
        ));
    }

    #[tokio::test]
    async fn test_bad_type_code() {
        let mut msg = Message::from_bytes(b'Q', vec![0u8; 8]);
        assert!(matches!(
            BackendKeyData::parse(&mut msg).await,
            Err(Error::BadTypeCode {
                expected: b'K',
                got: b'Q'
            })
        ));
    }

    #[tokio::test]
    async fn test_authentication_ok_roundtrip() {
        let mut msg = AuthenticationOk.encode();
        assert_eq!(msg.declared_size(), 8);
        AuthenticationOk::parse(&mut msg).await.unwrap();
    }

    #[tokio::test]
    async fn test_authentication_other_scheme_rejected() {
        let mut msg = Message::from_bytes(tag::AUTHENTICATION_OK, vec![0, 0, 0, 5]);
        assert!(matches!(
            AuthenticationOk::parse(&mut msg).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_for_query_roundtrip() {
        for status in [
            TransactionStatus::Idle,
            TransactionStatus::InTransaction,
            TransactionStatus::Failed,
        ] {
            let mut msg = ReadyForQuery { status }.encode();
            let reparsed = ReadyForQuery::parse(&mut msg).await.unwrap();
            assert_eq!(reparsed.status, status);
        }
    }

    #[tokio::test]
    async fn test_row_description_roundtrip() {
        let rd = RowDescription {
            fields: vec![
                FieldDescription::new("id", oids::INT4),
                FieldDescription::new("name", oids::TEXT),
            ],
        };
        let mut msg = rd.encode();
        let reparsed = RowDescription::parse(&mut msg).await.unwrap();
        assert_eq!(reparsed, rd);
        assert_eq!(reparsed.fields[0].typlen, 4);
        assert_eq!(reparsed.fields[1].typlen, -1);
    }

    #[tokio::test]
    async fn test_data_row_roundtrip_with_null() {
        let row = DataRow {
            values: vec![
                Some(Bytes::from_static(b"42")),
                None,
                Some(Bytes::from_static(b"")),
            ],
        };
        let mut msg = row.encode();
        let reparsed = DataRow::parse(&mut msg).await.unwrap();
        assert_eq!(reparsed, row);
    }

    #[tokio::test]
    async fn test_data_row_from_values() {
        let row = DataRow::from_values(&[Some(Value::Int4(7)), None, Some(Value::Bool(true))]);
        assert_eq!(row.values[0].as_deref(), Some(&b"7"[..]));
        assert_eq!(row.values[1], None);
        assert_eq!(row.values[2].as_deref(), Some(&b"t"[..]));
    }

    #[tokio::test]
    async fn test_command_complete_select() {
        let mut msg = CommandComplete::encode("SELECT 5");
        let cc = CommandComplete::parse(&mut msg).await.unwrap();
        assert_eq!(cc.tag, "SELECT");
        assert_eq!(cc.affected_count, 5);
        assert_eq!(cc.oid, None);
    }

    #[tokio::test]
    async fn test_command_complete_insert_with_oid() {
        let mut msg = CommandComplete::encode("INSERT 0 1");
        let cc = CommandComplete::parse(&mut msg).await.unwrap();
        assert_eq!(cc.tag, "INSERT");
        assert_eq!(cc.affected_count, 1);
        assert_eq!(cc.oid, Some(0));
    }

    #[tokio::test]
    async fn test_command_complete_bare_tag() {
        let mut msg = CommandComplete::encode("BEGIN");
        let cc = CommandComplete::parse(&mut msg).await.unwrap();
        assert_eq!(cc.tag, "BEGIN");
        assert_eq!(cc.affected_count, 0);
        assert_eq!(cc.oid, None);
    }

    #[tokio::test]
    async fn test_error_response_roundtrip() {
        let mut fields = BTreeMap::new();
        fields.insert(b'S', "ERROR".to_string());
        fields.insert(b'C', "57014".to_string());
        fields.insert(b'M', "canceling statement due to user request".to_string());
        let resp = ErrorResponse { fields };

        let mut msg = resp.encode();
        let reparsed = ErrorResponse::parse(&mut msg).await.unwrap();
        assert_eq!(reparsed, resp);
        assert_eq!(reparsed.severity(), Some("ERROR"));
        assert_eq!(
            reparsed.message(),
            Some("canceling statement due to user request")
        );
    }

    #[test]
    fn test_describe_status_code() {
        assert_eq!(describe_status_code(b'M'), "Message");
        assert_eq!(describe_status_code(b'S'), "Severity");
        assert_eq!(describe_status_code(b'!'), "[unknown]");
    }

    #[tokio::test]
    async fn test_query_roundtrip() {
        let q = Query::new("select * from pg_stat_activity");
        let mut msg = q.encode();
        assert!(Query::is(&msg));
        let reparsed = Query::parse(&mut msg).await.unwrap();
        assert_eq!(reparsed, q);
    }
}
