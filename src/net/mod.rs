//! Socket and stream plumbing.
use std::io;

use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub mod tls;
mod stream;

pub use stream::PgStream;

/// A plain TCP stream or either side of a TLS session, implementing
/// `AsyncRead` and `AsyncWrite` transparently.
pub struct Socket {
    kind: Kind,
}

enum Kind {
    Tcp(TcpStream),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl Socket {
    pub async fn connect_tcp(host: &str, port: u16) -> io::Result<Socket> {
        let socket = TcpStream::connect((host, port)).await?;
        socket.set_nodelay(true)?;
        Ok(Socket { kind: Kind::Tcp(socket) })
    }

    /// Wrap an accepted client stream.
    pub fn from_tcp(socket: TcpStream) -> Socket {
        let _ = socket.set_nodelay(true);
        Socket { kind: Kind::Tcp(socket) }
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self.kind, Kind::Tcp(_))
    }

    /// Upgrade an outbound plain stream after the server agreed to TLS.
    pub async fn upgrade_client(
        self,
        connector: &TlsConnector,
        name: rustls::pki_types::ServerName<'static>,
    ) -> io::Result<Socket> {
        let Kind::Tcp(socket) = self.kind else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket already upgraded"));
        };
        let tls = connector.connect(name, socket).await?;
        Ok(Socket { kind: Kind::TlsClient(Box::new(tls)) })
    }

    /// Upgrade an accepted plain stream after replying `'S'` to SSLRequest.
    pub async fn upgrade_server(self, acceptor: &TlsAcceptor) -> io::Result<Socket> {
        let Kind::Tcp(socket) = self.kind else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket already upgraded"));
        };
        let tls = acceptor.accept(socket).await?;
        Ok(Socket { kind: Kind::TlsServer(Box::new(tls)) })
    }
}

impl tokio::io::AsyncRead for Socket {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_read(cx, buf),
            Kind::TlsClient(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
            Kind::TlsServer(t) => Pin::new(t.as_mut()).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Socket {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_write(cx, buf),
            Kind::TlsClient(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
            Kind::TlsServer(t) => Pin::new(t.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_flush(cx),
            Kind::TlsClient(t) => Pin::new(t.as_mut()).poll_flush(cx),
            Kind::TlsServer(t) => Pin::new(t.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        use std::pin::Pin;
        match &mut self.kind {
            Kind::Tcp(t) => Pin::new(t).poll_shutdown(cx),
            Kind::TlsClient(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
            Kind::TlsServer(t) => Pin::new(t.as_mut()).poll_shutdown(cx),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            Kind::Tcp(t) => std::fmt::Debug::fmt(t, f),
            Kind::TlsClient(_) => f.write_str("TlsClient"),
            Kind::TlsServer(_) => f.write_str("TlsServer"),
        }
    }
}

/// TLS machinery built once from [`crate::config::Config`] at startup.
pub struct TlsContext {
    /// Accepts client TLS when `client_tls_mode` enables it.
    pub acceptor: Option<TlsAcceptor>,
    /// Dials backend TLS when `server_tls_mode` enables it.
    pub connector: Option<TlsConnector>,
}

impl TlsContext {
    pub fn build(config: &crate::config::Config) -> Result<Self, tls::TlsError> {
        Ok(Self {
            acceptor: config
                .client_tls
                .mode
                .enabled()
                .then(|| tls::acceptor(&config.client_tls))
                .transpose()?,
            connector: config
                .server_tls
                .mode
                .enabled()
                .then(|| tls::connector(&config.server_tls))
                .transpose()?,
        })
    }
}
