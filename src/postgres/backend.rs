//! Messages flowing server to client.
//!
//! Decoders cover the frames the pooler must interpret: the authentication
//! exchange when opening a backend, and the `ReadyForQuery` /
//! `CommandComplete` tags sniffed off the proxied stream for release timing.
//! The few frames the pooler originates toward clients live here too.
use bytes::{Buf, Bytes, BufMut};

use super::{BufMutExt, ProtocolDecode, ProtocolEncode, ProtocolError, RawFrame, nul_str_len};
use crate::common::ByteStr;

macro_rules! assert_msgtype {
    ($typ:ident) => {
        if Self::MSGTYPE != $typ {
            return Err(ProtocolError::unexpected(Self::MSGTYPE, $typ))
        }
    };
}

/// Postgres backend messages the pooler recognizes.
///
/// Anything else decodes to [`BackendMessage::Other`] and is carried
/// opaquely, never misinterpreted.
#[derive(Debug)]
pub enum BackendMessage {
    Authentication(Authentication),
    BackendKeyData(BackendKeyData),
    CommandComplete(CommandComplete),
    DataRow(DataRow),
    ErrorResponse(ErrorResponse),
    NoticeResponse(NoticeResponse),
    ParameterStatus(ParameterStatus),
    ReadyForQuery(ReadyForQuery),
    RowDescription(RowDescription),
    Other(RawFrame),
}

macro_rules! match_backend {
    ($($name:ident,)*) => {
        impl BackendMessage {
            pub fn msgtype(&self) -> u8 {
                match self {
                    $(Self::$name(_) => $name::MSGTYPE,)*
                    Self::Other(frame) => frame.msgtype,
                }
            }
        }

        impl ProtocolDecode for BackendMessage {
            fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
                let message = match msgtype {
                    $($name::MSGTYPE => Self::$name(<$name as ProtocolDecode>::decode(msgtype, body)?),)*
                    _ => Self::Other(RawFrame { msgtype, body }),
                };
                Ok(message)
            }
        }
    };
}

match_backend! {
    Authentication,
    BackendKeyData,
    CommandComplete,
    DataRow,
    ErrorResponse,
    NoticeResponse,
    ParameterStatus,
    ReadyForQuery,
    RowDescription,
}

/// Identifies the message as an authentication request.
///
/// Only the `Ok` sub-code is ever consumed; any challenge means the backend
/// wants credentials this pooler does not carry, and the connection fails
/// with [`UnsupportedAuth`].
#[derive(Debug)]
pub struct Authentication {
    pub code: u32,
}

impl Authentication {
    pub const MSGTYPE: u8 = b'R';
    pub const OK: u32 = 0;

    pub fn is_ok(&self) -> bool {
        self.code == Self::OK
    }
}

impl ProtocolDecode for Authentication {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 4 {
            return Err(ProtocolError::Malformed("authentication without sub-code"));
        }
        Ok(Self { code: body.get_u32() })
    }
}

/// An authentication challenge the pooler cannot answer.
#[derive(Debug, thiserror::Error)]
#[error("unsupported authentication request: {}", self.method())]
pub struct UnsupportedAuth {
    pub code: u32,
}

impl UnsupportedAuth {
    pub fn method(&self) -> &'static str {
        match self.code {
            2 => "kerberos v5",
            3 => "cleartext password",
            5 => "md5 password",
            7 => "gss",
            9 => "sspi",
            10 => "sasl",
            _ => "unknown",
        }
    }
}

/// Reports successful authentication, the only `R` frame the pooler
/// originates itself.
#[derive(Debug)]
pub struct AuthenticationOk;

impl ProtocolEncode for AuthenticationOk {
    const MSGTYPE: u8 = Authentication::MSGTYPE;

    fn size_hint(&self) -> i32 { 4 }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u32(Authentication::OK);
    }
}

/// Identifies the message as cancellation key data.
#[derive(Debug)]
pub struct BackendKeyData {
    /// The process ID of this backend.
    pub process_id: u32,
    /// The secret key of this backend.
    pub secret_key: u32,
}

impl BackendKeyData {
    pub const MSGTYPE: u8 = b'K';
}

impl ProtocolDecode for BackendKeyData {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 8 {
            return Err(ProtocolError::Malformed("truncated BackendKeyData"));
        }
        Ok(Self {
            process_id: body.get_u32(),
            secret_key: body.get_u32(),
        })
    }
}

/// Identifies the message as a run-time parameter status report.
#[derive(Debug)]
pub struct ParameterStatus {
    /// The name of the run-time parameter being reported.
    pub name: ByteStr,
    /// The current value of the parameter.
    pub value: ByteStr,
}

impl ParameterStatus {
    pub const MSGTYPE: u8 = b'S';
}

impl ProtocolDecode for ParameterStatus {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self {
            name: super::frame::take_nul_str(&mut body)?,
            value: super::frame::take_nul_str(&mut body)?,
        })
    }
}

/// A warning message the client should see; forwarded, never acted on.
#[derive(Debug)]
pub struct NoticeResponse {
    pub body: Bytes,
}

impl NoticeResponse {
    pub const MSGTYPE: u8 = b'N';
}

impl ProtocolDecode for NoticeResponse {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { body })
    }
}

/// Backend transaction status carried by `ReadyForQuery`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// `'I'`, idle outside any transaction block.
    Idle,
    /// `'T'`, inside a transaction block.
    InTransaction,
    /// `'E'`, inside a failed transaction block.
    Failed,
}

impl TransactionStatus {
    pub fn from_u8(status: u8) -> Result<Self, ProtocolError> {
        match status {
            b'I' => Ok(Self::Idle),
            b'T' => Ok(Self::InTransaction),
            b'E' => Ok(Self::Failed),
            other => Err(ProtocolError::UnknownStatus(other as char)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Idle => b'I',
            Self::InTransaction => b'T',
            Self::Failed => b'E',
        }
    }
}

/// Sent whenever the backend is ready for a new query cycle.
///
/// This is the authoritative release boundary for every pool mode.
#[derive(Debug)]
pub struct ReadyForQuery {
    pub status: TransactionStatus,
}

impl ReadyForQuery {
    pub const MSGTYPE: u8 = b'Z';

    pub fn idle() -> Self {
        Self { status: TransactionStatus::Idle }
    }
}

impl ProtocolDecode for ReadyForQuery {
    fn decode(msgtype: u8, body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let Some(status) = body.first() else {
            return Err(ProtocolError::Malformed("ReadyForQuery without status"));
        };
        Ok(Self { status: TransactionStatus::from_u8(*status)? })
    }
}

impl ProtocolEncode for ReadyForQuery {
    const MSGTYPE: u8 = b'Z';

    fn size_hint(&self) -> i32 { 1 }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(self.status.as_u8());
    }
}

/// Identifies the message as a command-completed response.
#[derive(Debug)]
pub struct CommandComplete {
    /// The command tag, usually a single word naming the completed command.
    pub tag: ByteStr,
}

impl CommandComplete {
    pub const MSGTYPE: u8 = b'C';
}

impl ProtocolDecode for CommandComplete {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        Ok(Self { tag: super::frame::take_nul_str(&mut body)? })
    }
}

impl ProtocolEncode for &CommandComplete {
    const MSGTYPE: u8 = b'C';

    fn size_hint(&self) -> i32 {
        nul_str_len(&self.tag)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(&self.tag);
    }
}

/// Identifies the message as a row description.
#[derive(Debug)]
pub struct RowDescription {
    /// Specifies the number of fields in a row (can be zero).
    pub field_len: u16,
    /// Undecoded field descriptions.
    pub body: Bytes,
}

impl RowDescription {
    pub const MSGTYPE: u8 = b'T';
}

impl ProtocolDecode for RowDescription {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 2 {
            return Err(ProtocolError::Malformed("truncated RowDescription"));
        }
        Ok(Self {
            field_len: body.get_u16(),
            body,
        })
    }
}

/// Identifies the message as a data row.
#[derive(Debug)]
pub struct DataRow {
    /// The number of column values that follow (possibly zero).
    pub column_len: u16,
    pub body: Bytes,
}

impl DataRow {
    pub const MSGTYPE: u8 = b'D';
}

impl ProtocolDecode for DataRow {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        if body.remaining() < 2 {
            return Err(ProtocolError::Malformed("truncated DataRow"));
        }
        Ok(Self {
            column_len: body.get_u16(),
            body,
        })
    }
}

/// Identifies the message as an error.
///
/// The body is a sequence of field-code/string pairs terminated by a zero
/// byte. Fields of unrecognized type are preserved.
#[derive(Debug, thiserror::Error)]
#[error("{}: {} ({})", self.severity(), self.message(), self.code())]
pub struct ErrorResponse {
    pub fields: Vec<(u8, ByteStr)>,
}

impl ErrorResponse {
    pub const MSGTYPE: u8 = b'E';

    fn field(&self, code: u8) -> &str {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn severity(&self) -> &str {
        self.field(b'S')
    }

    /// The SQLSTATE code.
    pub fn code(&self) -> &str {
        self.field(b'C')
    }

    pub fn message(&self) -> &str {
        self.field(b'M')
    }
}

impl ProtocolDecode for ErrorResponse {
    fn decode(msgtype: u8, mut body: Bytes) -> Result<Self, ProtocolError> {
        assert_msgtype!(msgtype);
        let mut fields = Vec::new();
        loop {
            match body.first() {
                Some(0) | None => break,
                Some(_) => {}
            }
            let code = body.get_u8();
            let value = super::frame::take_nul_str(&mut body)?;
            fields.push((code, value));
        }
        Ok(Self { fields })
    }
}

/// The error frame the pooler originates itself: fixed severity `FATAL`,
/// SQLSTATE `08006` (connection failure).
#[derive(Debug)]
pub struct FatalResponse<'a> {
    pub message: &'a str,
}

impl FatalResponse<'_> {
    const SEVERITY: &'static str = "FATAL";
    const SQLSTATE: &'static str = "08006";
}

impl ProtocolEncode for FatalResponse<'_> {
    const MSGTYPE: u8 = ErrorResponse::MSGTYPE;

    fn size_hint(&self) -> i32 {
        // S and V severity, C code, M message, terminator
        (1 + nul_str_len(Self::SEVERITY)) * 2
            + (1 + nul_str_len(Self::SQLSTATE))
            + (1 + nul_str_len(self.message))
            + 1
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_u8(b'S');
        buf.put_nul_str(Self::SEVERITY);
        buf.put_u8(b'V');
        buf.put_nul_str(Self::SEVERITY);
        buf.put_u8(b'C');
        buf.put_nul_str(Self::SQLSTATE);
        buf.put_u8(b'M');
        buf.put_nul_str(self.message);
        buf.put_u8(0);
    }
}
