//! Backend connection pooling.
//!
//! All pool state lives on a single worker task; the [`Pool`] handle talks
//! to it over a command channel, so concurrent acquire and release from many
//! session tasks observe one serialization order.
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;

use crate::{Result, common::ByteStr, config::Config, connection::ServerConnection};

mod worker;

use worker::WorkerMessage;

/// The `(database, user)` pair partitioning backend connections.
///
/// Matching is literal string equality; no canonicalization.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub database: ByteStr,
    pub user: ByteStr,
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.database, self.user)
    }
}

/// Handle to the pool worker task.
#[derive(Clone)]
pub struct Pool {
    send: mpsc::UnboundedSender<WorkerMessage>,
}

impl Pool {
    /// Spawn the worker task and return a handle to it.
    pub fn new(config: Arc<Config>, connector: Option<TlsConnector>) -> Pool {
        Pool { send: worker::spawn(config, connector) }
    }

    /// Check out a backend for `(database, user)`, opening a new one when no
    /// idle backend exists and the global cap allows it.
    ///
    /// Returns [`Exhausted`] immediately when the cap is reached, and
    /// suspends while a fresh backend connects otherwise.
    pub async fn acquire(
        &self,
        session_id: u64,
        key: PoolKey,
        params: Vec<(ByteStr, ByteStr)>,
    ) -> Result<ServerConnection> {
        let (reply, recv) = oneshot::channel();
        self.send
            .send(WorkerMessage::Acquire { session_id, key, params, reply })
            .map_err(|_| PoolClosed)?;
        recv.await.map_err(|_| PoolClosed)?
    }

    /// Hand a backend back to its free list.
    ///
    /// A `session_id` removes the session pin held for this backend, if any.
    pub fn release(&self, conn: ServerConnection, session_id: Option<u64>) {
        let _ = self.send.send(WorkerMessage::Release { conn, session_id });
    }

    /// Drop a failed backend without returning it to the free list.
    pub fn discard(&self, conn: ServerConnection) {
        let _ = self.send.send(WorkerMessage::Discard { conn });
    }

    /// Close every idle backend and refuse further acquisition.
    pub fn shutdown(&self) {
        let _ = self.send.send(WorkerMessage::Shutdown);
    }

    /// Counters for logging and invariant checks.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, recv) = oneshot::channel();
        self.send
            .send(WorkerMessage::Stats { reply })
            .map_err(|_| PoolClosed)?;
        recv.await.map_err(|_| PoolClosed.into())
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pool")
    }
}

/// Snapshot of the pool counters.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Backends alive across all keys, idle and checked out.
    pub total: usize,
    /// Backends currently sitting in free lists.
    pub idle: usize,
}

/// The global connection cap is reached and no idle backend matches.
#[derive(Debug, thiserror::Error)]
#[error("connection pool exhausted")]
pub struct Exhausted;

/// The pool worker has shut down.
#[derive(Debug, thiserror::Error)]
#[error("connection pool is shut down")]
pub struct PoolClosed;
