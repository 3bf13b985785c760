//! Postgres wire protocol.
//!
//! Pure framing, parsing and emission over byte buffers. No I/O happens in
//! this module; [`crate::net::PgStream`] drives it against sockets.
use bytes::{BufMut, BytesMut};

mod frame;
pub mod frontend;
pub mod backend;
pub mod sql;

pub use frame::{Initial, RawFrame, StartupParams, split_frame, split_initial};
pub use backend::{ErrorResponse, UnsupportedAuth};

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Magic "version" carried by the SSLRequest initial frame.
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Magic "version" carried by the CancelRequest initial frame.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Frames longer than this are rejected as a protocol error.
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 256 * 1024 * 1024;

/// A type which can be encoded into a postgres wire message.
///
/// For historical reasons the very first message of a connection (startup,
/// SSLRequest) has no message-type byte; those carry their own `write`
/// methods instead of implementing this trait.
pub trait ProtocolEncode {
    /// Message type tag.
    const MSGTYPE: u8;

    /// Size of the main body, excluding tag and length prefix.
    fn size_hint(&self) -> i32;

    /// Write the main body of the message.
    ///
    /// Writing less or past [`size_hint`][ProtocolEncode::size_hint] bytes
    /// results in panic.
    fn encode(self, buf: impl BufMut);
}

/// A type which can be decoded from a postgres wire message body.
pub trait ProtocolDecode: Sized {
    fn decode(msgtype: u8, body: bytes::Bytes) -> Result<Self, ProtocolError>;
}

/// Write a tagged message to `buf`.
pub fn write<M: ProtocolEncode>(msg: M, buf: &mut BytesMut) {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let size = msg.size_hint();
    buf.reserve(PREFIX + size as usize);

    let offset = buf.len();
    buf.put_u8(M::MSGTYPE);
    buf.put_i32(4 + size);

    msg.encode(&mut *buf);

    assert_eq!(
        buf.len() - offset,
        PREFIX + size as usize,
        "message body not equal to size hint"
    );
}

/// Wire-level violation. Connections that produce one are dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("unexpected message type {found:?}, expected {expected:?}")]
    Unexpected { expected: char, found: char },
    #[error("frame length {len} exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("unsupported startup code {0}")]
    BadStartup(i32),
    #[error("unknown transaction status {0:?}")]
    UnknownStatus(char),
    #[error("malformed message: {0}")]
    Malformed(&'static str),
}

impl ProtocolError {
    pub(crate) fn unexpected(expected: u8, found: u8) -> Self {
        Self::Unexpected { expected: expected as char, found: found as char }
    }
}

pub(crate) trait BufMutExt: BufMut {
    /// Write a C style nul terminated string.
    fn put_nul_str(&mut self, s: &str) {
        self.put_slice(s.as_bytes());
        self.put_u8(0);
    }
}

impl<B: BufMut> BufMutExt for B { }

/// Body length of a nul terminated string.
pub(crate) fn nul_str_len(s: &str) -> i32 {
    s.len() as i32 + 1
}
