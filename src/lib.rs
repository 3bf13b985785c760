//! Transparent postgres connection pooler.
//!
//! Clients speak the ordinary postgres frontend/backend protocol to the
//! pooler; the pooler multiplexes them onto a smaller, reusable set of
//! backend connections. Release timing follows the configured pool mode:
//! per session, per transaction, or per statement, driven by the
//! `ReadyForQuery` boundaries sniffed off the proxied server stream.
//!
//! # Examples
//!
//! ```no_run
//! # async fn app() -> postgate::Result<()> {
//! let config = postgate::Config::from_env()?;
//! postgate::server::run(config).await
//! # }
//! ```
//!
//! Everything is configured through `POSTGATE_*` environment variables, for
//! example:
//!
//! ```text
//! POSTGATE_LISTEN_PORT=6432
//! POSTGATE_SERVER_HOST=db.internal
//! POSTGATE_POOL_MODE=transaction
//! POSTGATE_MAX_CLIENT_CONN=50
//! ```

pub mod common;

// Protocol
pub mod postgres;

// Connection
pub mod config;
pub mod net;
pub mod connection;
pub mod pool;

// Operation
pub mod session;
pub mod proxy;
pub mod server;

mod error;

#[cfg(test)]
mod testutil;

#[doc(inline)]
pub use config::{Config, PoolMode, TlsMode};
#[doc(inline)]
pub use connection::ServerConnection;
#[doc(inline)]
pub use pool::{Pool, PoolKey, PoolStats};
#[doc(inline)]
pub use session::{ClientSession, SessionState};
#[doc(inline)]
pub use error::{Error, ErrorKind, Result};
