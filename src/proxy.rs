//! The proxy engine.
//!
//! Pipes bytes both ways between an active session and its backend. Client
//! frames are forwarded opaquely after sniffing `Query` verbs; server frames
//! are forwarded unchanged while `ReadyForQuery` and `CommandComplete` feed
//! the release tracker. Frames move whole: a frame either flushes fully or
//! the socket is closed.
use std::{io, ops::ControlFlow, sync::Arc};

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    ErrorKind, Result,
    config::{Config, PoolMode},
    pool::Pool,
    postgres::{
        ProtocolDecode,
        backend::{CommandComplete, FatalResponse, ReadyForQuery, TransactionStatus},
        frontend::ClientMessage,
        sql::{TxnVerb, command_tag_verb, query_verb},
    },
    session::ClientSession,
};

/// Decides when the backend goes back to the pool.
///
/// Client verbs and server command tags are advisory hints; the status byte
/// of `ReadyForQuery` is reconciled first and wins when they disagree.
#[derive(Debug)]
pub struct BoundaryTracker {
    mode: PoolMode,
    in_transaction: bool,
    pending_release: bool,
}

impl BoundaryTracker {
    pub(crate) fn new(mode: PoolMode) -> Self {
        Self { mode, in_transaction: false, pending_release: false }
    }

    /// Feed the verb of a client `Query`.
    pub(crate) fn observe_verb(&mut self, verb: Option<TxnVerb>) {
        match verb {
            Some(TxnVerb::Begin) => self.in_transaction = true,
            Some(TxnVerb::Commit) | Some(TxnVerb::Rollback) => self.pending_release = true,
            None => {}
        }
    }

    /// Feed the verb of a server `CommandComplete` tag.
    pub(crate) fn observe_tag(&mut self, verb: Option<TxnVerb>) {
        self.observe_verb(verb);
    }

    /// Feed a server `ReadyForQuery`; returns whether to release now.
    pub(crate) fn observe_ready(&mut self, status: TransactionStatus) -> bool {
        match self.mode {
            PoolMode::Session => false,
            PoolMode::Statement => {
                self.in_transaction = false;
                self.pending_release = false;
                true
            }
            PoolMode::Transaction => {
                // the server status is authoritative over the client hint
                self.in_transaction = !matches!(status, TransactionStatus::Idle);
                if self.pending_release || !self.in_transaction {
                    self.pending_release = false;
                    self.in_transaction = false;
                    true
                } else {
                    false
                }
            }
        }
    }
}

enum Read {
    Client(io::Result<usize>),
    Server(io::Result<usize>),
}

/// Drive an active session until either side goes away.
///
/// Never releases the backend on exit paths; the caller's cleanup does that
/// exactly once. Mid-session boundary releases and dead-backend discards
/// happen here.
pub(crate) async fn run(
    session: &mut ClientSession,
    config: &Arc<Config>,
    pool: &Pool,
) -> Result<()> {
    loop {
        let ClientSession { stream, backend, .. } = &mut *session;
        let read = async {
            match backend {
                Some(conn) => tokio::select! {
                    n = stream.read_more() => Read::Client(n),
                    n = conn.stream.read_more() => Read::Server(n),
                },
                None => Read::Client(stream.read_more().await),
            }
        };

        let read = match config.client_idle_timeout {
            Some(idle) => match timeout(idle, read).await {
                Ok(read) => read,
                Err(_) => {
                    debug!(session = session.id, "closing idle client");
                    session.stream.send(FatalResponse { message: "Client idle timeout" });
                    let _ = session.stream.flush().await;
                    return Ok(());
                }
            },
            None => read.await,
        };

        match read {
            // client went away; cleanup returns any held backend
            Read::Client(Ok(0)) => return Ok(()),
            Read::Client(Ok(_)) => {
                if handle_client(session, pool).await?.is_break() {
                    return Ok(());
                }
            }
            Read::Client(Err(err)) => return Err(err.into()),
            Read::Server(Ok(0)) => return backend_failed(session, pool).await,
            Read::Server(Ok(_)) => handle_server(session, pool).await?,
            Read::Server(Err(err)) => {
                debug!(session = session.id, %err, "backend read failed");
                return backend_failed(session, pool).await;
            }
        }
    }
}

/// Drain complete client frames: sniff, acquire on demand, forward.
async fn handle_client(session: &mut ClientSession, pool: &Pool) -> Result<ControlFlow<()>> {
    loop {
        let Some(frame) = session.stream.try_split_frame()? else { break };
        match ClientMessage::classify(&frame)? {
            ClientMessage::Query { sql } => {
                session.boundary.observe_verb(query_verb(&sql));
                if ensure_backend(session, pool).await? {
                    if let Some(conn) = session.backend.as_mut() {
                        conn.stream.write_frame(&frame);
                    }
                }
            }
            ClientMessage::Terminate => {
                return Ok(ControlFlow::Break(()));
            }
            ClientMessage::Other(_) => {
                if ensure_backend(session, pool).await? {
                    if let Some(conn) = session.backend.as_mut() {
                        conn.stream.write_frame(&frame);
                    }
                }
            }
        }
    }

    if let Some(conn) = session.backend.as_mut() {
        if conn.stream.flush().await.is_err() {
            return backend_failed(session, pool).await.map(|_| ControlFlow::Break(()));
        }
    }
    Ok(ControlFlow::Continue(()))
}

/// Make sure a backend is bound, acquiring one in transaction and statement
/// modes where the session may have lost it at the previous boundary.
///
/// On exhaustion the client gets an error and stays connected; its next
/// frame re-drives acquisition.
async fn ensure_backend(session: &mut ClientSession, pool: &Pool) -> Result<bool> {
    if session.backend.is_some() {
        return Ok(true);
    }
    match pool
        .acquire(session.id, session.key.clone(), session.params.clone())
        .await
    {
        Ok(conn) => {
            session.backend = Some(conn);
            Ok(true)
        }
        Err(err) if matches!(err.kind(), ErrorKind::Exhausted(_)) => {
            warn!(session = session.id, "no backend available mid-session");
            session.stream.send(FatalResponse { message: "No available connections" });
            session.stream.send(ReadyForQuery::idle());
            session.stream.flush().await?;
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Drain complete server frames: forward unchanged, sniff boundaries,
/// release at the policy-defined moment.
async fn handle_server(session: &mut ClientSession, pool: &Pool) -> Result<()> {
    let ClientSession { stream, backend, boundary, .. } = &mut *session;
    let Some(conn) = backend.as_mut() else { return Ok(()) };

    // Release only when the boundary is the last frame of the batch; frames
    // after a ReadyForQuery belong to the next cycle on this backend.
    let mut release = false;
    loop {
        let Some(frame) = conn.stream.try_split_frame()? else { break };
        release = false;
        match frame.msgtype {
            ReadyForQuery::MSGTYPE => {
                let ready = ReadyForQuery::decode(frame.msgtype, frame.body.clone())?;
                release = boundary.observe_ready(ready.status);
            }
            CommandComplete::MSGTYPE => {
                let complete = CommandComplete::decode(frame.msgtype, frame.body.clone())?;
                boundary.observe_tag(command_tag_verb(&complete.tag));
            }
            _ => {}
        }
        stream.write_frame(&frame);
    }

    stream.flush().await?;

    // a partially received next frame means the cycle is not over
    if release && backend.as_ref().is_some_and(|conn| conn.stream.is_drained()) {
        if let Some(conn) = backend.take() {
            crate::common::verbose!(conn = conn.id(), "release at query boundary");
            pool.release(conn, None);
        }
    }
    Ok(())
}

/// The backend socket died under the session: tell the client, drop the
/// backend without re-pooling it, and end the session.
async fn backend_failed(session: &mut ClientSession, pool: &Pool) -> Result<()> {
    warn!(session = session.id, "backend connection error");
    if let Some(conn) = session.backend.take() {
        pool.discard(conn);
    }
    session.stream.send(FatalResponse { message: "Server connection error" });
    let _ = session.stream.flush().await;
    Ok(())
}
