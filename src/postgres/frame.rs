//! Incremental framing over an append-only receive buffer.
//!
//! The splitters consume complete frames off the front of a `BytesMut` and
//! leave partial trailing frames untouched, so callers keep appending reads
//! to the same buffer until a full frame is available.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{CANCEL_REQUEST_CODE, PROTOCOL_VERSION, ProtocolError, SSL_REQUEST_CODE};
use crate::common::ByteStr;

/// A complete tagged frame, body not yet interpreted.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub msgtype: u8,
    pub body: Bytes,
}

impl RawFrame {
    /// Bytes this frame occupies on the wire.
    pub fn wire_len(&self) -> usize {
        1 + 4 + self.body.len()
    }

    /// Re-emit the frame unchanged, tag and length prefix included.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.reserve(self.wire_len());
        buf.put_u8(self.msgtype);
        buf.put_i32(self.body.len() as i32 + 4);
        buf.extend_from_slice(&self.body);
    }
}

/// Split one tagged frame off the front of `buf`.
///
/// Returns `None` when the buffer does not yet hold a complete frame.
pub fn split_frame(buf: &mut BytesMut, max_len: usize) -> Result<Option<RawFrame>, ProtocolError> {
    // msgtype + length
    const PREFIX: usize = 1 + 4;

    let Some(mut header) = buf.get(..PREFIX) else {
        return Ok(None);
    };

    let msgtype = header.get_u8();
    let body_len = header.get_i32();

    if body_len < 4 {
        return Err(ProtocolError::Malformed("frame length below 4"));
    }
    let frame_len = 1 + body_len as usize;
    if frame_len > max_len {
        return Err(ProtocolError::Oversized { len: frame_len, max: max_len });
    }
    if buf.len() < frame_len {
        buf.reserve(frame_len - buf.len());
        return Ok(None);
    }

    buf.advance(PREFIX);
    let body = buf.split_to(body_len as usize - 4).freeze();
    Ok(Some(RawFrame { msgtype, body }))
}

/// The first frame of a client connection, which carries no type tag.
#[derive(Debug)]
pub enum Initial {
    SslRequest,
    CancelRequest,
    Startup(StartupParams),
}

/// Split the untagged initial frame off the front of `buf`.
///
/// The frame is recognized by its 4 byte length followed by a version or
/// magic request code. Returns `None` until the frame is complete.
pub fn split_initial(buf: &mut BytesMut, max_len: usize) -> Result<Option<Initial>, ProtocolError> {
    const LEN: usize = 4;

    let Some(mut header) = buf.get(..LEN) else {
        return Ok(None);
    };

    let len = header.get_i32();
    if len < 8 {
        return Err(ProtocolError::Malformed("initial frame length below 8"));
    }
    let len = len as usize;
    if len > max_len {
        return Err(ProtocolError::Oversized { len, max: max_len });
    }
    if buf.len() < len {
        buf.reserve(len - buf.len());
        return Ok(None);
    }

    buf.advance(LEN);
    let mut body = buf.split_to(len - 4).freeze();
    let code = body.get_i32();

    match code {
        SSL_REQUEST_CODE if len == 8 => Ok(Some(Initial::SslRequest)),
        CANCEL_REQUEST_CODE if len == 16 => Ok(Some(Initial::CancelRequest)),
        PROTOCOL_VERSION => Ok(Some(Initial::Startup(StartupParams::parse(body)?))),
        code => Err(ProtocolError::BadStartup(code)),
    }
}

/// Parameters carried by the client startup frame.
///
/// `user` and `database` are pulled out; every other pair is preserved in
/// order so it can be replayed on backends opened for this client.
#[derive(Debug, Clone)]
pub struct StartupParams {
    pub user: ByteStr,
    pub database: ByteStr,
    pub params: Vec<(ByteStr, ByteStr)>,
}

impl StartupParams {
    fn parse(mut body: Bytes) -> Result<Self, ProtocolError> {
        let mut user = None;
        let mut database = None;
        let mut params = Vec::new();

        loop {
            match body.first() {
                // a lone nul terminates the parameter list
                Some(0) => break,
                Some(_) => {}
                None => return Err(ProtocolError::Malformed("startup parameters not terminated")),
            }

            let key = take_nul_str(&mut body)?;
            let value = take_nul_str(&mut body)?;
            match key.as_str() {
                "user" => user = Some(value),
                "database" => database = Some(value),
                _ => params.push((key, value)),
            }
        }

        let Some(user) = user else {
            return Err(ProtocolError::Malformed("startup without user parameter"));
        };
        let database = database.unwrap_or_else(|| user.clone());

        Ok(Self { user, database, params })
    }
}

pub(super) fn take_nul_str(body: &mut Bytes) -> Result<ByteStr, ProtocolError> {
    let Some(end) = body.iter().position(|b| *b == 0) else {
        return Err(ProtocolError::Malformed("string not nul terminated"));
    };
    let s = body.split_to(end);
    body.advance(1);
    ByteStr::from_utf8(s).map_err(|_| ProtocolError::Malformed("non UTF-8 string"))
}

#[cfg(test)]
mod test {
    use bytes::BufMut;

    use super::*;
    use crate::postgres::frontend::{SslRequest, Startup};

    #[test]
    fn partial_frame_is_left_in_place() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'Q');
        buf.put_i32(12);
        buf.put_slice(b"sel");

        assert!(split_frame(&mut buf, 1024).unwrap().is_none());
        assert_eq!(buf.len(), 8);

        buf.put_slice(b"ect 1\0");
        let frame = split_frame(&mut buf, 1024).unwrap().unwrap();
        assert_eq!(frame.msgtype, b'Q');
        assert_eq!(&frame.body[..], b"select 1\0");
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_i32(1024);
        assert!(matches!(
            split_frame(&mut buf, 64),
            Err(ProtocolError::Oversized { .. })
        ));
    }

    #[test]
    fn reemitted_frame_is_identical() {
        let mut wire = BytesMut::new();
        wire.put_u8(b'C');
        wire.put_i32(13);
        wire.put_slice(b"SELECT 1\0");
        let original = wire.clone();

        let frame = split_frame(&mut wire, 1024).unwrap().unwrap();
        let mut out = BytesMut::new();
        frame.write_to(&mut out);
        assert_eq!(&out[..], &original[..]);
    }

    #[test]
    fn ssl_request_recognized() {
        let mut buf = BytesMut::new();
        SslRequest.write(&mut buf);
        assert!(matches!(
            split_initial(&mut buf, 1024).unwrap(),
            Some(Initial::SslRequest)
        ));
    }

    #[test]
    fn cancel_request_recognized() {
        let mut buf = BytesMut::new();
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(1234);
        buf.put_i32(5678);
        assert!(matches!(
            split_initial(&mut buf, 1024).unwrap(),
            Some(Initial::CancelRequest)
        ));
    }

    #[test]
    fn startup_params_extracted() {
        let params = [("application_name".into(), "psql".into())];
        let mut buf = BytesMut::new();
        Startup { user: "alice", database: "orders", params: &params }.write(&mut buf);

        // partial delivery first
        let mut partial = BytesMut::from(&buf[..6]);
        assert!(split_initial(&mut partial, 1024).unwrap().is_none());

        let Some(Initial::Startup(startup)) = split_initial(&mut buf, 1024).unwrap() else {
            panic!("expected startup");
        };
        assert_eq!(startup.user, "alice");
        assert_eq!(startup.database, "orders");
        assert_eq!(startup.params.len(), 1);
        assert_eq!(startup.params[0].0, "application_name");
        assert_eq!(startup.params[0].1, "psql");
    }

    #[test]
    fn startup_database_defaults_to_user() {
        let pairs = b"user\0bob\0\0";
        let mut buf = BytesMut::new();
        buf.put_i32(4 + 4 + pairs.len() as i32);
        buf.put_i32(PROTOCOL_VERSION);
        buf.put_slice(pairs);
        let Some(Initial::Startup(startup)) = split_initial(&mut buf, 1024).unwrap() else {
            panic!("expected startup");
        };
        assert_eq!(startup.database, "bob");
    }

    #[test]
    fn unknown_startup_code_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_i32(8);
        buf.put_i32(12345);
        assert!(matches!(
            split_initial(&mut buf, 1024),
            Err(ProtocolError::BadStartup(12345))
        ));
    }
}
