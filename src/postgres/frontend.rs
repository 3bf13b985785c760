//! Messages flowing client to server.
//!
//! The pooler sits on both ends of these: it parses them off accepted client
//! sockets and originates its own toward the backend when opening a
//! connection.
use bytes::{BufMut, BytesMut};

use super::{
    BufMutExt, PROTOCOL_VERSION, ProtocolEncode, ProtocolError, RawFrame, SSL_REQUEST_CODE,
    nul_str_len,
};
use crate::common::ByteStr;

/// Postgres Startup frontend message.
///
/// For historical reasons, the very first message sent by the client
/// has no initial message-type byte, thus [`Startup`] does not implement
/// [`ProtocolEncode`].
#[derive(Debug)]
pub struct Startup<'a> {
    /// The database user name to connect as.
    pub user: &'a str,
    /// The database to connect to.
    pub database: &'a str,
    /// Further run-time parameters, replayed verbatim.
    pub params: &'a [(ByteStr, ByteStr)],
}

impl Startup<'_> {
    pub fn write(self, buf: &mut BytesMut) {
        let offset = buf.len();

        // Length of message contents in bytes, including self.
        // reserve 4 bytes for length
        buf.put_i32(0);

        buf.put_i32(PROTOCOL_VERSION);

        buf.put_nul_str("user");
        buf.put_nul_str(self.user);

        buf.put_nul_str("database");
        buf.put_nul_str(self.database);

        for (key, value) in self.params {
            buf.put_nul_str(key);
            buf.put_nul_str(value);
        }

        // A zero byte is required as a terminator after the last name/value pair.
        buf.put_u8(b'\0');

        // write the length
        let len = (buf.len() - offset) as i32;
        let mut written = &mut buf[offset..];
        written.put_i32(len);
    }
}

/// Asks the server to negotiate TLS before any startup exchange.
///
/// Like [`Startup`], carries no message-type byte.
#[derive(Debug)]
pub struct SslRequest;

impl SslRequest {
    pub fn write(self, buf: &mut BytesMut) {
        buf.put_i32(8);
        buf.put_i32(SSL_REQUEST_CODE);
    }
}

/// Identifies the message as a simple query.
pub struct Query<'a> {
    /// The query string itself.
    pub sql: &'a str,
}

impl ProtocolEncode for Query<'_> {
    const MSGTYPE: u8 = b'Q';

    fn size_hint(&self) -> i32 {
        nul_str_len(self.sql)
    }

    fn encode(self, mut buf: impl BufMut) {
        buf.put_nul_str(self.sql);
    }
}

/// Identifies the message as a termination notice.
pub struct Terminate;

impl ProtocolEncode for Terminate {
    const MSGTYPE: u8 = b'X';

    fn size_hint(&self) -> i32 { 0 }

    fn encode(self, _: impl BufMut) { }
}

/// A client frame after the startup exchange, classified by tag.
///
/// Only the tags the release policy cares about are interpreted; everything
/// else stays opaque and is forwarded as-is.
#[derive(Debug)]
pub enum ClientMessage {
    Query { sql: ByteStr },
    Terminate,
    Other(u8),
}

impl ClientMessage {
    pub fn classify(frame: &RawFrame) -> Result<Self, ProtocolError> {
        match frame.msgtype {
            b'Q' => {
                let mut body = frame.body.clone();
                let sql = super::frame::take_nul_str(&mut body)?;
                Ok(Self::Query { sql })
            }
            b'X' => Ok(Self::Terminate),
            other => Ok(Self::Other(other)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::{split_frame, write};

    #[test]
    fn query_roundtrip() {
        let mut buf = BytesMut::new();
        write(Query { sql: "SELECT 1" }, &mut buf);

        let frame = split_frame(&mut buf, 1024).unwrap().unwrap();
        let ClientMessage::Query { sql } = ClientMessage::classify(&frame).unwrap() else {
            panic!("expected query");
        };
        assert_eq!(sql, "SELECT 1");
    }

    #[test]
    fn terminate_classified() {
        let mut buf = BytesMut::new();
        write(Terminate, &mut buf);
        let frame = split_frame(&mut buf, 1024).unwrap().unwrap();
        assert!(matches!(
            ClientMessage::classify(&frame).unwrap(),
            ClientMessage::Terminate
        ));
    }

    #[test]
    fn unhandled_tags_stay_opaque() {
        let frame = RawFrame { msgtype: b'P', body: bytes::Bytes::from_static(b"\0q\0\0\0") };
        assert!(matches!(
            ClientMessage::classify(&frame).unwrap(),
            ClientMessage::Other(b'P')
        ));
    }
}
