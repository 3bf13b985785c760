//! Client sessions.
//!
//! One task per accepted socket. The handshake walks the session from `New`
//! through TLS negotiation and authentication to `Active`, then hands over
//! to the proxy engine. Cleanup releases a held backend exactly once.
use std::{sync::Arc, time::Duration};

use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::{
    Error, ErrorKind, Result,
    common::ByteStr,
    config::{Config, PoolMode},
    connection::ServerConnection,
    net::{PgStream, Socket},
    pool::{Pool, PoolKey},
    postgres::{
        Initial, ProtocolError,
        backend::{AuthenticationOk, FatalResponse, ReadyForQuery},
    },
    proxy::{self, BoundaryTracker},
};

/// Client session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Authenticating,
    Active,
    Closed,
}

/// An accepted client connection that reached the active state.
pub struct ClientSession {
    pub(crate) id: u64,
    pub(crate) stream: PgStream,
    pub(crate) state: SessionState,
    /// Logical identity from the startup frame.
    pub(crate) key: PoolKey,
    /// Startup parameters beyond user/database, replayed on fresh backends.
    pub(crate) params: Vec<(ByteStr, ByteStr)>,
    pub(crate) backend: Option<ServerConnection>,
    pub(crate) boundary: BoundaryTracker,
}

impl ClientSession {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The `(database, user)` identity this session authenticated as.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }
}

/// Accept-to-close lifecycle of one client socket.
pub async fn run(
    id: u64,
    socket: TcpStream,
    config: Arc<Config>,
    acceptor: Option<TlsAcceptor>,
    pool: Pool,
) {
    let mut session = match handshake(id, socket, &config, acceptor.as_ref(), &pool).await {
        Ok(Some(session)) => session,
        // declined during handshake; whatever answer was due went out already
        Ok(None) => return,
        Err(err) => {
            debug!(session = id, %err, "handshake failed");
            return;
        }
    };

    info!(session = id, key = %session.key, mode = %config.pool_mode, "session active");

    if let Err(err) = proxy::run(&mut session, &config, &pool).await {
        debug!(session = id, %err, "session ended on error");
    }
    session.state = SessionState::Closed;

    // the one release of the cleanup path; the session id also clears any
    // pin held for this session
    if let Some(conn) = session.backend.take() {
        pool.release(conn, Some(id));
    }
    session.stream.shutdown().await;
    debug!(session = id, "session closed");
}

/// Drive the pre-active phase under the login deadline.
async fn handshake(
    id: u64,
    socket: TcpStream,
    config: &Config,
    acceptor: Option<&TlsAcceptor>,
    pool: &Pool,
) -> Result<Option<ClientSession>> {
    let mut slot = Some(PgStream::new(Socket::from_tcp(socket), config.max_message_len));

    match config.client_login_timeout {
        Some(deadline) => {
            match timeout(deadline, handshake_inner(id, &mut slot, config, acceptor, pool)).await {
                Ok(result) => result,
                Err(elapsed) => {
                    warn!(session = id, "login timeout");
                    if let Some(mut stream) = slot.take() {
                        stream.send(FatalResponse { message: "Login timeout" });
                        let _ = timeout(Duration::from_secs(1), stream.flush()).await;
                    }
                    Err(Error::from(elapsed).context("client login timed out"))
                }
            }
        }
        None => handshake_inner(id, &mut slot, config, acceptor, pool).await,
    }
}

/// The `New -> Authenticating -> Active` walk.
///
/// The stream lives in `slot` so the login timeout path can still answer the
/// client after cancelling this future; it is only absent mid TLS upgrade.
async fn handshake_inner(
    id: u64,
    slot: &mut Option<PgStream>,
    config: &Config,
    acceptor: Option<&TlsAcceptor>,
    pool: &Pool,
) -> Result<Option<ClientSession>> {
    let mut state = SessionState::New;
    debug!(session = id, ?state, "client accepted");

    loop {
        let initial = borrow(slot)?.recv_initial().await?;
        match initial {
            Initial::SslRequest => {
                let stream = borrow(slot)?;
                if stream.is_tls() {
                    return Err(ProtocolError::Malformed("repeated SSLRequest").into());
                }
                let Some(acceptor) = acceptor else {
                    // client_tls_mode = disable: refuse and hang up
                    stream.write_raw(&[b'N']);
                    stream.flush().await?;
                    return Ok(None);
                };
                stream.write_raw(&[b'S']);
                stream.flush().await?;

                let Some(plain) = slot.take() else {
                    return Err(ProtocolError::Malformed("stream torn down").into());
                };
                *slot = Some(plain.upgrade_server(acceptor).await?);
                debug!(session = id, "client upgraded to tls");
                // still `New`: the client repeats its startup over TLS
            }
            Initial::CancelRequest => {
                // query cancellation is keyed to server-issued secrets this
                // pooler never hands out; close quietly, no backend touched
                debug!(session = id, "cancel request dropped");
                return Ok(None);
            }
            Initial::Startup(startup) => {
                let stream = borrow(slot)?;
                if config.client_tls.mode.required() && !stream.is_tls() {
                    warn!(session = id, "plain client rejected, tls required");
                    stream.send(FatalResponse { message: "Server requires TLS" });
                    stream.flush().await?;
                    return Ok(None);
                }

                state = SessionState::Authenticating;
                let key = PoolKey { database: startup.database, user: startup.user };
                let params = startup.params;
                debug!(session = id, %key, ?state, "startup received");

                // session mode binds its backend for life at startup
                let backend = if config.pool_mode == PoolMode::Session {
                    match pool.acquire(id, key.clone(), params.clone()).await {
                        Ok(conn) => Some(conn),
                        Err(err) => {
                            let message = match err.kind() {
                                ErrorKind::Exhausted(_) => "Connection pool exhausted".into(),
                                ErrorKind::Database(db) => db.message().to_string(),
                                _ => "Server connection error".into(),
                            };
                            warn!(session = id, %key, %err, "acquire failed at startup");
                            let stream = borrow(slot)?;
                            stream.send(FatalResponse { message: &message });
                            stream.flush().await?;
                            return Ok(None);
                        }
                    }
                } else {
                    None
                };

                let stream = borrow(slot)?;
                stream.send(AuthenticationOk);
                stream.send(ReadyForQuery::idle());
                stream.flush().await?;

                let Some(stream) = slot.take() else {
                    return Err(ProtocolError::Malformed("stream torn down").into());
                };
                return Ok(Some(ClientSession {
                    id,
                    stream,
                    state: SessionState::Active,
                    key,
                    params,
                    backend,
                    boundary: BoundaryTracker::new(config.pool_mode),
                }));
            }
        }
    }
}

fn borrow(slot: &mut Option<PgStream>) -> Result<&mut PgStream> {
    slot.as_mut()
        .ok_or_else(|| ProtocolError::Malformed("stream torn down").into())
}

#[cfg(test)]
mod test {
    use bytes::BytesMut;
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        postgres::backend::{Authentication, ErrorResponse, TransactionStatus},
        postgres::ProtocolDecode,
        testutil,
    };

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    /// Bind a pooler-side listener that serves sessions with the given
    /// config and pool.
    async fn spawn_pooler(config: Arc<Config>, pool: Pool) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut next_id = 1;
            loop {
                let Ok((socket, _)) = listener.accept().await else { break };
                let id = next_id;
                next_id += 1;
                tokio::spawn(run(id, socket, Arc::clone(&config), None, pool.clone()));
            }
        });
        addr
    }

    #[test]
    fn session_handshake_binds_a_backend() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let config = testutil::arc_config(backend, PoolMode::Session);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut buf = BytesMut::new();
            testutil::client_startup(&mut client, "alice", "orders").await;

            let auth = testutil::read_frame(&mut client, &mut buf).await;
            let auth = Authentication::decode(auth.msgtype, auth.body).unwrap();
            assert!(auth.is_ok());

            let ready = testutil::read_frame(&mut client, &mut buf).await;
            let ready = ReadyForQuery::decode(ready.msgtype, ready.body).unwrap();
            assert_eq!(ready.status, TransactionStatus::Idle);

            // one backend exists and it is checked out to this session
            testutil::await_stats(&pool, 1, 0).await;

            // a query round trips through the backend double
            testutil::client_query(&mut client, "SELECT 1").await;
            let frames = testutil::read_until_ready(&mut client, &mut buf).await;
            assert_eq!(frames[0].msgtype, b'C');
            assert_eq!(frames.last().unwrap().msgtype, b'Z');

            // close releases the backend to the free list
            testutil::client_terminate(&mut client).await;
            drop(client);
            testutil::await_stats(&pool, 1, 1).await;
        })
    }

    #[test]
    fn plain_client_rejected_when_tls_required() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let mut config = testutil::config(backend);
            config.client_tls.mode = crate::config::TlsMode::Require;
            config.client_tls.key_file = Some("unused.key".into());
            config.client_tls.cert_file = Some("unused.crt".into());
            let config = Arc::new(config);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut buf = BytesMut::new();
            testutil::client_startup(&mut client, "alice", "orders").await;

            let frame = testutil::read_frame(&mut client, &mut buf).await;
            let err = ErrorResponse::decode(frame.msgtype, frame.body).unwrap();
            assert_eq!(err.severity(), "FATAL");
            assert_eq!(err.message(), "Server requires TLS");

            // no backend was ever acquired
            testutil::await_stats(&pool, 0, 0).await;
        })
    }

    #[test]
    fn transaction_mode_releases_after_commit() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let config = testutil::arc_config(backend, PoolMode::Transaction);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut buf = BytesMut::new();
            testutil::client_startup(&mut client, "alice", "orders").await;
            // auth completes without a backend in transaction mode
            testutil::read_until_ready(&mut client, &mut buf).await;
            testutil::await_stats(&pool, 0, 0).await;

            testutil::client_query(&mut client, "BEGIN").await;
            let frames = testutil::read_until_ready(&mut client, &mut buf).await;
            let ready = frames.last().unwrap();
            let ready = ReadyForQuery::decode(ready.msgtype, ready.body.clone()).unwrap();
            assert_eq!(ready.status, TransactionStatus::InTransaction);
            // held across the transaction
            testutil::await_stats(&pool, 1, 0).await;

            testutil::client_query(&mut client, "SELECT 1").await;
            testutil::read_until_ready(&mut client, &mut buf).await;
            testutil::await_stats(&pool, 1, 0).await;

            testutil::client_query(&mut client, "COMMIT").await;
            testutil::read_until_ready(&mut client, &mut buf).await;
            // the boundary after COMMIT frees the backend, session stays up
            testutil::await_stats(&pool, 1, 1).await;

            // the next query re-acquires
            testutil::client_query(&mut client, "SELECT 1").await;
            testutil::read_until_ready(&mut client, &mut buf).await;
            testutil::await_stats(&pool, 1, 1).await;
        })
    }

    #[test]
    fn statement_mode_reuses_one_backend_serially() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let config = testutil::arc_config(backend, PoolMode::Statement);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut buf = BytesMut::new();
            testutil::client_startup(&mut client, "alice", "orders").await;
            testutil::read_until_ready(&mut client, &mut buf).await;

            for _ in 0..10 {
                testutil::client_query(&mut client, "SELECT 1").await;
                testutil::read_until_ready(&mut client, &mut buf).await;
                // released between queries, never more than one backend
                testutil::await_stats(&pool, 1, 1).await;
            }
        })
    }

    #[test]
    fn pool_exhaustion_rejects_second_session() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let mut config = testutil::config(backend);
            config.max_client_conn = 1;
            let config = Arc::new(config);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            let mut first = TcpStream::connect(pooler).await.unwrap();
            let mut buf_a = BytesMut::new();
            testutil::client_startup(&mut first, "alice", "orders").await;
            testutil::read_until_ready(&mut first, &mut buf_a).await;
            testutil::await_stats(&pool, 1, 0).await;

            let mut second = TcpStream::connect(pooler).await.unwrap();
            let mut buf_b = BytesMut::new();
            testutil::client_startup(&mut second, "alice", "orders").await;
            let frame = testutil::read_frame(&mut second, &mut buf_b).await;
            let err = ErrorResponse::decode(frame.msgtype, frame.body).unwrap();
            assert_eq!(err.message(), "Connection pool exhausted");
            drop(second);

            // the first session is unaffected
            testutil::client_query(&mut first, "SELECT 1").await;
            testutil::read_until_ready(&mut first, &mut buf_a).await;

            // once it leaves, a retry succeeds
            testutil::client_terminate(&mut first).await;
            drop(first);
            testutil::await_stats(&pool, 1, 1).await;

            let mut retry = TcpStream::connect(pooler).await.unwrap();
            let mut buf_c = BytesMut::new();
            testutil::client_startup(&mut retry, "alice", "orders").await;
            let auth = testutil::read_frame(&mut retry, &mut buf_c).await;
            assert_eq!(auth.msgtype, b'R');
        })
    }

    #[test]
    fn silent_client_hits_login_timeout() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let mut config = testutil::config(backend);
            config.client_login_timeout = Some(Duration::from_millis(200));
            let config = Arc::new(config);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            // connect and never send a startup
            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut buf = BytesMut::new();
            let frame = testutil::read_frame(&mut client, &mut buf).await;
            let err = ErrorResponse::decode(frame.msgtype, frame.body).unwrap();
            assert_eq!(err.message(), "Login timeout");
            testutil::await_stats(&pool, 0, 0).await;
        })
    }

    #[test]
    fn idle_client_is_closed() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let mut config = testutil::config(backend);
            config.pool_mode = PoolMode::Statement;
            config.client_idle_timeout = Some(Duration::from_millis(200));
            let config = Arc::new(config);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut buf = BytesMut::new();
            testutil::client_startup(&mut client, "alice", "orders").await;
            testutil::read_until_ready(&mut client, &mut buf).await;

            // go silent and wait for the sweep
            let frame = testutil::read_frame(&mut client, &mut buf).await;
            let err = ErrorResponse::decode(frame.msgtype, frame.body).unwrap();
            assert_eq!(err.message(), "Client idle timeout");
        })
    }

    #[test]
    fn cancel_request_closes_quietly() {
        runtime().block_on(async {
            let backend = testutil::spawn_backend().await;
            let config = testutil::arc_config(backend, PoolMode::Session);
            let pool = Pool::new(Arc::clone(&config), None);
            let pooler = spawn_pooler(Arc::clone(&config), pool.clone()).await;

            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut client = TcpStream::connect(pooler).await.unwrap();
            let mut frame = BytesMut::new();
            bytes::BufMut::put_i32(&mut frame, 16);
            bytes::BufMut::put_i32(&mut frame, crate::postgres::CANCEL_REQUEST_CODE);
            bytes::BufMut::put_i32(&mut frame, 42);
            bytes::BufMut::put_i32(&mut frame, 7);
            client.write_all(&frame).await.unwrap();

            // the pooler just hangs up, nothing is written back
            let mut out = [0u8; 8];
            let n = client.read(&mut out).await.unwrap();
            assert_eq!(n, 0);
            testutil::await_stats(&pool, 0, 0).await;
        })
    }
}
