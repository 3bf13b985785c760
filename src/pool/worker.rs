//! The pool worker task.
//!
//! Sole owner of the free lists, the session pin map and the global
//! connection counter. Everything that touches them arrives as a
//! [`WorkerMessage`], so there is exactly one serialization order and no
//! backend can be double-issued or miscounted.
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep},
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::{Exhausted, PoolClosed, PoolKey, PoolStats};
use crate::{
    Result,
    common::ByteStr,
    config::{Config, PoolMode},
    connection::ServerConnection,
};

/// Idle period to park on when no eviction deadline is pending.
const FAR_AWAY: Duration = Duration::from_secs(24 * 60 * 60);

type AcquireSend = oneshot::Sender<Result<ServerConnection>>;

pub(super) enum WorkerMessage {
    Acquire {
        session_id: u64,
        key: PoolKey,
        params: Vec<(ByteStr, ByteStr)>,
        reply: AcquireSend,
    },
    Release {
        conn: ServerConnection,
        session_id: Option<u64>,
    },
    Discard {
        conn: ServerConnection,
    },
    /// A spawned connect attempt resolved; the slot was reserved up front.
    Connected {
        session_id: u64,
        key: PoolKey,
        result: Result<ServerConnection>,
        reply: AcquireSend,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    Shutdown,
}

pub(super) fn spawn(
    config: Arc<Config>,
    connector: Option<TlsConnector>,
) -> mpsc::UnboundedSender<WorkerMessage> {
    let (send, recv) = mpsc::unbounded_channel();
    let worker = Worker {
        config,
        connector,
        recv,
        send: send.downgrade(),
        idle: HashMap::new(),
        pins: HashMap::new(),
        total: 0,
    };
    tokio::spawn(worker.run());
    send
}

struct Worker {
    config: Arc<Config>,
    connector: Option<TlsConnector>,
    recv: mpsc::UnboundedReceiver<WorkerMessage>,
    /// Handed to spawned connect tasks so their results come back through
    /// the same channel. Weak, so the worker still exits once every [`super::Pool`]
    /// handle is gone.
    send: mpsc::WeakUnboundedSender<WorkerMessage>,
    /// Free list per key. Fresh and released backends go to the front.
    idle: HashMap<PoolKey, VecDeque<ServerConnection>>,
    /// `(session_id, key) -> backend id`, session mode only.
    pins: HashMap<(u64, PoolKey), u64>,
    /// Backends alive across all keys, idle and checked out, including
    /// reserved slots for in-flight connects.
    total: usize,
}

impl Worker {
    async fn run(mut self) {
        let timer = sleep(FAR_AWAY);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                msg = self.recv.recv() => {
                    let Some(msg) = msg else { break };
                    if self.handle(msg) {
                        break;
                    }
                }
                _ = timer.as_mut() => {
                    self.evict_idle();
                }
            }

            let deadline = self
                .next_evict_deadline()
                .unwrap_or_else(|| Instant::now() + FAR_AWAY);
            timer.as_mut().reset(deadline);
        }

        debug!("pool worker stopped");
    }

    /// Returns `true` when the worker should stop.
    fn handle(&mut self, msg: WorkerMessage) -> bool {
        match msg {
            WorkerMessage::Acquire { session_id, key, params, reply } => {
                self.acquire(session_id, key, params, reply);
            }
            WorkerMessage::Release { conn, session_id } => {
                self.release(conn, session_id);
            }
            WorkerMessage::Discard { conn } => {
                self.total -= 1;
                warn!(
                    conn = conn.id(),
                    key = %conn.key(),
                    age = ?conn.age(),
                    "dropping failed backend"
                );
            }
            WorkerMessage::Connected { session_id, key, result, reply } => {
                self.connected(session_id, key, result, reply);
            }
            WorkerMessage::Stats { reply } => {
                let idle = self.idle.values().map(VecDeque::len).sum();
                let _ = reply.send(PoolStats { total: self.total, idle });
            }
            WorkerMessage::Shutdown => {
                info!(total = self.total, "pool shutting down");
                self.idle.clear();
                self.pins.clear();
                return true;
            }
        }
        false
    }

    fn acquire(
        &mut self,
        session_id: u64,
        key: PoolKey,
        params: Vec<(ByteStr, ByteStr)>,
        reply: AcquireSend,
    ) {
        // a pinned session reclaims its previous backend when still idle
        if self.config.pool_mode == PoolMode::Session {
            if let Some(&pinned) = self.pins.get(&(session_id, key.clone())) {
                let taken = self.idle.get_mut(&key).and_then(|list| {
                    let at = list.iter().position(|conn| conn.id() == pinned)?;
                    list.remove(at)
                });
                match taken {
                    Some(conn) => {
                        self.hand_out(conn, session_id, reply);
                        return;
                    }
                    // the pinned backend was evicted meanwhile
                    None => {
                        self.pins.remove(&(session_id, key.clone()));
                    }
                }
            }
        }

        if let Some(conn) = self.idle.get_mut(&key).and_then(VecDeque::pop_front) {
            self.hand_out(conn, session_id, reply);
            return;
        }

        if self.total >= self.config.max_client_conn {
            debug!(%key, total = self.total, "pool exhausted");
            let _ = reply.send(Err(Exhausted.into()));
            return;
        }

        let Some(send) = self.send.upgrade() else {
            let _ = reply.send(Err(PoolClosed.into()));
            return;
        };

        // reserve the slot so concurrent acquires cannot blow the cap
        self.total += 1;
        let config = Arc::clone(&self.config);
        let connector = self.connector.clone();
        tokio::spawn(async move {
            let result =
                ServerConnection::connect(&config, connector.as_ref(), key.clone(), &params).await;
            let _ = send.send(WorkerMessage::Connected { session_id, key, result, reply });
        });
    }

    fn connected(
        &mut self,
        session_id: u64,
        key: PoolKey,
        result: Result<ServerConnection>,
        reply: AcquireSend,
    ) {
        match result {
            Ok(conn) => {
                info!(conn = conn.id(), %key, total = self.total, "backend connected");
                self.hand_out(conn, session_id, reply);
            }
            Err(err) => {
                self.total -= 1;
                warn!(%key, %err, "backend connect failed");
                let _ = reply.send(Err(err));
            }
        }
    }

    fn hand_out(&mut self, mut conn: ServerConnection, session_id: u64, reply: AcquireSend) {
        debug_assert!(!conn.in_use, "idle backend still marked in use");
        conn.in_use = true;
        conn.touch();
        let pin = (session_id, conn.key().clone());
        if self.config.pool_mode == PoolMode::Session {
            self.pins.insert(pin.clone(), conn.id());
        }
        if let Err(Ok(mut conn)) = reply.send(Ok(conn)) {
            // requester went away while we worked; back to the free list
            self.pins.remove(&pin);
            conn.in_use = false;
            conn.touch();
            self.idle.entry(conn.key().clone()).or_default().push_front(conn);
        }
    }

    fn release(&mut self, mut conn: ServerConnection, session_id: Option<u64>) {
        debug_assert!(conn.in_use, "released backend was not checked out");
        if let Some(session_id) = session_id {
            self.pins.remove(&(session_id, conn.key().clone()));
        }
        conn.in_use = false;
        conn.touch();
        crate::common::verbose!(conn = conn.id(), "backend released");
        self.idle.entry(conn.key().clone()).or_default().push_front(conn);
    }

    fn next_evict_deadline(&self) -> Option<Instant> {
        let timeout = self.config.server_idle_timeout?;
        self.idle
            .values()
            .flatten()
            .map(|conn| conn.last_used_at() + timeout)
            .min()
    }

    fn evict_idle(&mut self) -> usize {
        let Some(timeout) = self.config.server_idle_timeout else {
            return 0;
        };
        let mut evicted = 0;
        for (key, list) in self.idle.iter_mut() {
            let before = list.len();
            list.retain(|conn| conn.idle_for() <= timeout);
            let count = before - list.len();
            if count > 0 {
                info!(%key, count, "evicted idle backends");
            }
            evicted += count;
        }
        self.idle.retain(|_, list| !list.is_empty());
        self.total -= evicted;
        evicted
    }
}
