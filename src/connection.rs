//! Backend connections to the postgres server.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;

use crate::{
    Error, Result,
    common::ByteStr,
    config::{Config, TlsMode},
    net::{PgStream, Socket, tls::TlsError},
    pool::PoolKey,
    postgres::{ProtocolError, UnsupportedAuth, backend::BackendMessage, frontend::Startup},
};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A live connection to the postgres server, authenticated and drained to
/// its first `ReadyForQuery`.
///
/// Owned either by the pool's free list or by exactly one client session,
/// never both; release hands ownership back to the pool.
#[derive(Debug)]
pub struct ServerConnection {
    id: u64,
    key: PoolKey,
    pub(crate) stream: PgStream,
    pub(crate) in_use: bool,
    authenticated: bool,
    created_at: Instant,
    last_used_at: Instant,
}

impl ServerConnection {
    /// Open, negotiate TLS and authenticate a backend, all within the
    /// configured connect deadline.
    pub async fn connect(
        config: &Config,
        connector: Option<&TlsConnector>,
        key: PoolKey,
        params: &[(ByteStr, ByteStr)],
    ) -> Result<Self> {
        match timeout(config.server_connect_timeout, Self::open(config, connector, key, params)).await {
            Ok(result) => result,
            Err(elapsed) => Err(Error::from(elapsed).context("backend connect deadline exceeded")),
        }
    }

    async fn open(
        config: &Config,
        connector: Option<&TlsConnector>,
        key: PoolKey,
        params: &[(ByteStr, ByteStr)],
    ) -> Result<Self> {
        let socket = Socket::connect_tcp(&config.server_host, config.server_port).await?;
        let mut stream = PgStream::new(socket, config.max_message_len);

        if config.server_tls.mode.enabled() {
            stream.send_ssl_request();
            stream.flush().await?;
            match stream.recv_reply_byte().await? {
                b'S' => {
                    let connector = connector.ok_or(TlsError::Missing("connector"))?;
                    let name = rustls::pki_types::ServerName::try_from(
                        config.server_host.as_str().to_owned(),
                    )
                    .map_err(|_| TlsError::InvalidName(config.server_host.to_string()))?;
                    stream = stream.upgrade_client(connector, name).await?;
                }
                b'N' if matches!(config.server_tls.mode, TlsMode::Allow | TlsMode::Prefer) => {
                    crate::common::verbose!("server refused tls, continuing plaintext");
                }
                b'N' => return Err(TlsError::Refused.into()),
                other => return Err(ProtocolError::unexpected(b'S', other).into()),
            }
        }

        stream.send_startup(Startup {
            user: &key.user,
            database: &key.database,
            params,
        });
        stream.flush().await?;

        let mut authenticated = false;
        loop {
            match stream.recv::<BackendMessage>().await? {
                BackendMessage::Authentication(auth) if auth.is_ok() => authenticated = true,
                BackendMessage::Authentication(auth) => {
                    return Err(UnsupportedAuth { code: auth.code }.into());
                }
                BackendMessage::ErrorResponse(err) => return Err(err.into()),
                BackendMessage::ReadyForQuery(_) if authenticated => break,
                // out of order, skip
                BackendMessage::ReadyForQuery(_) => {}
                // ParameterStatus, BackendKeyData and the like: startup
                // chatter the sessions must never see
                _ => {}
            }
        }

        let now = Instant::now();
        Ok(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            stream,
            in_use: false,
            authenticated,
            created_at: now,
            last_used_at: now,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub(crate) fn touch(&mut self) {
        self.last_used_at = Instant::now();
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used_at.elapsed()
    }

    /// How long this backend has been alive.
    pub(crate) fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Close the socket on a best effort basis.
    pub async fn shutdown(&mut self) {
        self.stream.shutdown().await;
    }
}
