//! Buffered framed stream over a [`Socket`].
use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::Socket;
use crate::{
    Result,
    postgres::{
        self, Initial, ProtocolDecode, ProtocolEncode, ProtocolError, RawFrame,
        frontend::{SslRequest, Startup},
    },
};

const DEFAULT_BUF_CAPACITY: usize = 1024;

/// Buffered read and write socket speaking postgres frames.
///
/// Reads append to an internal buffer and frames are split off its front, so
/// partial frames simply wait for the next read. Writes accumulate until
/// [`flush`][PgStream::flush]; a frame is never partially written.
#[derive(Debug)]
pub struct PgStream {
    socket: Socket,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_frame: usize,
}

impl PgStream {
    pub fn new(socket: Socket, max_frame: usize) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            write_buf: BytesMut::with_capacity(DEFAULT_BUF_CAPACITY),
            max_frame,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.socket.is_tls()
    }

    /// Buffer a tagged message. Caller must [`flush`][PgStream::flush].
    pub fn send<M: ProtocolEncode>(&mut self, message: M) {
        postgres::write(message, &mut self.write_buf);
    }

    /// Buffer a startup message, which carries no type tag.
    pub fn send_startup(&mut self, startup: Startup<'_>) {
        startup.write(&mut self.write_buf);
    }

    /// Buffer an SSLRequest, which carries no type tag.
    pub fn send_ssl_request(&mut self) {
        SslRequest.write(&mut self.write_buf);
    }

    /// Buffer a raw frame unchanged.
    pub fn write_frame(&mut self, frame: &RawFrame) {
        frame.write_to(&mut self.write_buf);
    }

    /// Buffer raw bytes, used for the single byte SSLRequest replies.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.write_buf.extend_from_slice(bytes);
    }

    /// Write every buffered message to the underlying io.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.socket.write_all_buf(&mut self.write_buf).await?;
        self.socket.flush().await
    }

    /// Read once into the buffer, returning the number of bytes received.
    ///
    /// Zero means the peer closed its end.
    pub async fn read_more(&mut self) -> io::Result<usize> {
        self.socket.read_buf(&mut self.read_buf).await
    }

    /// Split one complete frame off the buffer, if available.
    pub fn try_split_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        postgres::split_frame(&mut self.read_buf, self.max_frame)
    }

    /// No partial frame is waiting in the read buffer.
    pub fn is_drained(&self) -> bool {
        self.read_buf.is_empty()
    }

    /// Receive one complete tagged frame.
    pub async fn recv_frame(&mut self) -> Result<RawFrame> {
        loop {
            if let Some(frame) = self.try_split_frame()? {
                return Ok(frame);
            }
            if self.read_more().await? == 0 {
                return Err(closed().into());
            }
        }
    }

    /// Receive and decode one message.
    pub async fn recv<M: ProtocolDecode>(&mut self) -> Result<M> {
        let frame = self.recv_frame().await?;
        Ok(M::decode(frame.msgtype, frame.body)?)
    }

    /// Receive the untagged initial frame of a client connection.
    pub async fn recv_initial(&mut self) -> Result<Initial> {
        loop {
            if let Some(initial) = postgres::split_initial(&mut self.read_buf, self.max_frame)? {
                return Ok(initial);
            }
            if self.read_more().await? == 0 {
                return Err(closed().into());
            }
        }
    }

    /// Receive the single byte answering an SSLRequest.
    pub async fn recv_reply_byte(&mut self) -> Result<u8> {
        loop {
            if !self.read_buf.is_empty() {
                let byte = self.read_buf[0];
                self.read_buf.advance(1);
                return Ok(byte);
            }
            if self.read_more().await? == 0 {
                return Err(closed().into());
            }
        }
    }

    /// Switch an accepted stream to TLS after replying `'S'`.
    ///
    /// The client must not speak before the handshake; buffered plaintext at
    /// this point is a protocol violation.
    pub async fn upgrade_server(self, acceptor: &TlsAcceptor) -> Result<PgStream> {
        if !self.read_buf.is_empty() {
            return Err(ProtocolError::Malformed("unexpected data before tls handshake").into());
        }
        let socket = self.socket.upgrade_server(acceptor).await?;
        Ok(PgStream {
            socket,
            read_buf: self.read_buf,
            write_buf: self.write_buf,
            max_frame: self.max_frame,
        })
    }

    /// Switch an outbound stream to TLS after the server replied `'S'`.
    pub async fn upgrade_client(
        self,
        connector: &TlsConnector,
        name: rustls::pki_types::ServerName<'static>,
    ) -> Result<PgStream> {
        if !self.read_buf.is_empty() {
            return Err(ProtocolError::Malformed("unexpected data before tls handshake").into());
        }
        let socket = self.socket.upgrade_client(connector, name).await?;
        Ok(PgStream {
            socket,
            read_buf: self.read_buf,
            write_buf: self.write_buf,
            max_frame: self.max_frame,
        })
    }

    /// Shut down the write half, flushing first on a best effort basis.
    pub async fn shutdown(&mut self) {
        let _ = self.flush().await;
        let _ = self.socket.shutdown().await;
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed")
}
