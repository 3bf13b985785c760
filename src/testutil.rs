//! In-process doubles for exercising the pooler end to end: a loopback
//! backend speaking just enough of the server protocol (trust auth, simple
//! query cycle with transaction status), and raw-socket client helpers.
use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use crate::{
    config::{Config, TlsSettings, TlsMode, PoolMode},
    net::{PgStream, Socket},
    postgres::{
        self, RawFrame,
        backend::{AuthenticationOk, CommandComplete, ReadyForQuery, TransactionStatus},
        frontend::{ClientMessage, Startup},
        sql::{TxnVerb, query_verb},
    },
};

/// A config pointing at a loopback backend, everything else defaulted for
/// tests.
pub(crate) fn config(backend: SocketAddr) -> Config {
    Config {
        listen_host: "127.0.0.1".into(),
        listen_port: 6432,
        server_host: "127.0.0.1".into(),
        server_port: backend.port(),
        pool_mode: PoolMode::Session,
        max_client_conn: 20,
        pool_size: 10,
        server_connect_timeout: Duration::from_secs(5),
        client_login_timeout: Some(Duration::from_secs(5)),
        server_idle_timeout: None,
        client_idle_timeout: None,
        client_tls: TlsSettings {
            mode: TlsMode::Disable,
            key_file: None,
            cert_file: None,
            ca_file: None,
        },
        server_tls: TlsSettings {
            mode: TlsMode::Disable,
            key_file: None,
            cert_file: None,
            ca_file: None,
        },
        max_message_len: postgres::DEFAULT_MAX_MESSAGE_LEN,
    }
}

/// Spawn a backend double on a loopback port.
///
/// It accepts any startup as trust auth and answers every simple query with
/// `CommandComplete` and a `ReadyForQuery` whose status tracks
/// `BEGIN`/`COMMIT`/`ROLLBACK`.
pub(crate) async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            tokio::spawn(serve(stream));
        }
    });
    addr
}

async fn serve(stream: TcpStream) {
    let mut stream = PgStream::new(Socket::from_tcp(stream), postgres::DEFAULT_MAX_MESSAGE_LEN);

    match stream.recv_initial().await {
        Ok(postgres::Initial::Startup(_)) => {}
        // tests never ask for backend tls; refuse and read the real startup
        Ok(postgres::Initial::SslRequest) => {
            stream.write_raw(&[b'N']);
            if stream.flush().await.is_err() {
                return;
            }
            match stream.recv_initial().await {
                Ok(postgres::Initial::Startup(_)) => {}
                _ => return,
            }
        }
        _ => return,
    }

    stream.send(AuthenticationOk);
    // the parameter chatter a real server emits before ReadyForQuery
    stream.write_frame(&RawFrame {
        msgtype: b'S',
        body: Bytes::from_static(b"server_version\015.0\0"),
    });
    stream.write_frame(&RawFrame {
        msgtype: b'K',
        body: Bytes::from_static(&[0, 0, 0, 42, 0, 0, 0, 7]),
    });
    stream.send(ReadyForQuery::idle());
    if stream.flush().await.is_err() {
        return;
    }

    let mut in_txn = false;
    loop {
        let Ok(frame) = stream.recv_frame().await else { return };
        match ClientMessage::classify(&frame) {
            Ok(ClientMessage::Query { sql }) => {
                let verb = query_verb(&sql);
                match verb {
                    Some(TxnVerb::Begin) => in_txn = true,
                    Some(TxnVerb::Commit) | Some(TxnVerb::Rollback) => in_txn = false,
                    None => {}
                }
                let tag = match verb {
                    Some(TxnVerb::Begin) => "BEGIN",
                    Some(TxnVerb::Commit) => "COMMIT",
                    Some(TxnVerb::Rollback) => "ROLLBACK",
                    None => "SELECT 1",
                };
                stream.send(&CommandComplete { tag: tag.into() });
                stream.send(ReadyForQuery {
                    status: if in_txn {
                        TransactionStatus::InTransaction
                    } else {
                        TransactionStatus::Idle
                    },
                });
                if stream.flush().await.is_err() {
                    return;
                }
            }
            Ok(ClientMessage::Terminate) => return,
            Ok(ClientMessage::Other(_)) => {}
            Err(_) => return,
        }
    }
}

/// Write a client startup frame straight onto a raw test socket.
pub(crate) async fn client_startup(stream: &mut TcpStream, user: &str, database: &str) {
    let mut buf = BytesMut::new();
    Startup { user, database, params: &[] }.write(&mut buf);
    stream.write_all(&buf).await.unwrap();
}

/// Write a simple query frame straight onto a raw test socket.
pub(crate) async fn client_query(stream: &mut TcpStream, sql: &str) {
    let mut buf = BytesMut::new();
    postgres::write(postgres::frontend::Query { sql }, &mut buf);
    stream.write_all(&buf).await.unwrap();
}

/// Write a terminate frame straight onto a raw test socket.
pub(crate) async fn client_terminate(stream: &mut TcpStream) {
    let mut buf = BytesMut::new();
    postgres::write(postgres::frontend::Terminate, &mut buf);
    stream.write_all(&buf).await.unwrap();
}

/// Read one complete frame off a raw test socket, buffering partial reads.
pub(crate) async fn read_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> RawFrame {
    loop {
        if let Some(frame) = postgres::split_frame(buf, postgres::DEFAULT_MAX_MESSAGE_LEN).unwrap() {
            return frame;
        }
        let n = stream.read_buf(buf).await.unwrap();
        assert_ne!(n, 0, "peer closed while a frame was expected");
    }
}

/// Read frames until `ReadyForQuery`, returning everything seen.
pub(crate) async fn read_until_ready(stream: &mut TcpStream, buf: &mut BytesMut) -> Vec<RawFrame> {
    let mut frames = Vec::new();
    loop {
        let frame = read_frame(stream, buf).await;
        let done = frame.msgtype == b'Z';
        frames.push(frame);
        if done {
            return frames;
        }
    }
}

/// Poll the pool counters until they match or a deadline passes.
pub(crate) async fn await_stats(pool: &crate::pool::Pool, total: usize, idle: usize) {
    for _ in 0..100 {
        let stats = pool.stats().await.unwrap();
        if stats.total == total && stats.idle == idle {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stats = pool.stats().await.unwrap();
    panic!(
        "pool stats never reached total={total} idle={idle}, last seen total={} idle={}",
        stats.total, stats.idle,
    );
}

/// Shorthand for the arc'd config most session tests need.
pub(crate) fn arc_config(backend: SocketAddr, mode: PoolMode) -> Arc<Config> {
    let mut config = config(backend);
    config.pool_mode = mode;
    Arc::new(config)
}
