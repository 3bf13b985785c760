//! Pooler configuration.
//!
//! Every knob is read from `POSTGATE_*` environment variables. File and
//! command line configuration layers are the business of whatever supervises
//! the process; this crate only consumes the resolved values.
use std::{borrow::Cow, env::var, fmt, path::PathBuf, str::FromStr, time::Duration};

use crate::common::ByteStr;

/// How client sessions share backend connections, see [`crate::pool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolMode {
    /// One backend per client session, released when the client disconnects.
    Session,
    /// Backend released at transaction boundaries.
    Transaction,
    /// Backend released after every query cycle.
    Statement,
}

impl FromStr for PoolMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "transaction" => Ok(Self::Transaction),
            "statement" => Ok(Self::Statement),
            _ => Err(ParseError::new("pool_mode must be one of `session`, `transaction`, `statement`")),
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Session => "session",
            Self::Transaction => "transaction",
            Self::Statement => "statement",
        })
    }
}

/// TLS negotiation policy, mirroring the libpq `sslmode` ladder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl TlsMode {
    /// TLS may be negotiated at all.
    pub fn enabled(self) -> bool {
        !matches!(self, Self::Disable)
    }

    /// Plaintext is not acceptable.
    pub fn required(self) -> bool {
        matches!(self, Self::Require | Self::VerifyCa | Self::VerifyFull)
    }

    /// The peer certificate chain must verify against a CA.
    pub fn verifies(self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

impl FromStr for TlsMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            _ => Err(ParseError::new(
                "tls mode must be one of `disable`, `allow`, `prefer`, `require`, `verify-ca`, `verify-full`",
            )),
        }
    }
}

impl fmt::Display for TlsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        })
    }
}

/// TLS material for one side of the proxy.
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub mode: TlsMode,
    pub key_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

impl TlsSettings {
    fn disabled() -> Self {
        Self { mode: TlsMode::Disable, key_file: None, cert_file: None, ca_file: None }
    }

    fn from_env(prefix: &str) -> Result<Self, ParseError> {
        Ok(Self {
            mode: match var(format!("{prefix}_MODE")) {
                Ok(ok) => ok.parse()?,
                Err(_) => TlsMode::Disable,
            },
            key_file: var(format!("{prefix}_KEY_FILE")).ok().map(Into::into),
            cert_file: var(format!("{prefix}_CERT_FILE")).ok().map(Into::into),
            ca_file: var(format!("{prefix}_CA_FILE")).ok().map(Into::into),
        })
    }

    fn validate(&self, side: &str) -> Result<(), ParseError> {
        if self.mode.enabled() && (self.key_file.is_none() || self.cert_file.is_none()) {
            return Err(ParseError::owned(format!(
                "{side} tls mode `{}` requires key and cert files", self.mode,
            )));
        }
        if self.mode.verifies() && self.ca_file.is_none() {
            return Err(ParseError::owned(format!(
                "{side} tls mode `{}` requires a ca file", self.mode,
            )));
        }
        Ok(())
    }
}

/// Resolved pooler configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_host: ByteStr,
    pub listen_port: u16,
    pub server_host: ByteStr,
    pub server_port: u16,
    pub pool_mode: PoolMode,
    /// Global cap on backend connections across all pool keys.
    pub max_client_conn: usize,
    /// Soft per-key target. Accepted and reported, not enforced.
    pub pool_size: usize,
    /// Deadline covering backend connect, TLS negotiation and authentication.
    pub server_connect_timeout: Duration,
    /// Deadline for a client to reach the active state. `None` disables.
    pub client_login_timeout: Option<Duration>,
    /// Idle backends older than this are evicted. `None` disables.
    pub server_idle_timeout: Option<Duration>,
    /// Idle client sessions older than this are closed. `None` disables.
    pub client_idle_timeout: Option<Duration>,
    pub client_tls: TlsSettings,
    pub server_tls: TlsSettings,
    /// Upper bound on a single wire frame.
    pub max_message_len: usize,
}

macro_rules! env {
    ($name:literal, $def:expr) => {
        match var($name) {
            Ok(ok) => ok.into(),
            Err(_) => $def.into(),
        }
    };
    ($name:literal as $ty:ty, $def:expr) => {
        match var($name) {
            Ok(ok) => match ok.parse::<$ty>() {
                Ok(ok) => ok,
                Err(_) => return Err(ParseError::new(concat!("invalid ", $name))),
            },
            Err(_) => $def,
        }
    };
}

impl Config {
    /// Retrieve configuration from `POSTGATE_*` environment variables,
    /// falling back to defaults, then validate the ranges.
    pub fn from_env() -> Result<Config, ParseError> {
        let config = Self {
            listen_host: env!("POSTGATE_LISTEN_HOST", "127.0.0.1"),
            listen_port: env!("POSTGATE_LISTEN_PORT" as u16, 6432),
            server_host: env!("POSTGATE_SERVER_HOST", "127.0.0.1"),
            server_port: env!("POSTGATE_SERVER_PORT" as u16, 5432),
            pool_mode: env!("POSTGATE_POOL_MODE" as PoolMode, PoolMode::Session),
            max_client_conn: env!("POSTGATE_MAX_CLIENT_CONN" as usize, 20),
            pool_size: env!("POSTGATE_POOL_SIZE" as usize, 10),
            server_connect_timeout: Duration::from_millis(
                env!("POSTGATE_SERVER_CONNECT_TIMEOUT" as u64, 5_000),
            ),
            client_login_timeout: millis_opt(env!("POSTGATE_CLIENT_LOGIN_TIMEOUT" as u64, 10_000)),
            server_idle_timeout: millis_opt(env!("POSTGATE_SERVER_IDLE_TIMEOUT" as u64, 60_000)),
            client_idle_timeout: millis_opt(env!("POSTGATE_CLIENT_IDLE_TIMEOUT" as u64, 0)),
            client_tls: TlsSettings::from_env("POSTGATE_CLIENT_TLS")?,
            server_tls: TlsSettings::from_env("POSTGATE_SERVER_TLS")?,
            max_message_len: env!(
                "POSTGATE_MAX_MESSAGE_LEN" as usize,
                crate::postgres::DEFAULT_MAX_MESSAGE_LEN
            ),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.listen_port == 0 {
            return Err(ParseError::new("listen_port must be within 1-65535"));
        }
        if self.server_port == 0 {
            return Err(ParseError::new("server_port must be within 1-65535"));
        }
        if self.max_client_conn < 1 {
            return Err(ParseError::new("max_client_conn must be at least 1"));
        }
        if self.pool_size < 1 {
            return Err(ParseError::new("pool_size must be at least 1"));
        }
        if self.server_connect_timeout < Duration::from_secs(1) {
            return Err(ParseError::new("server_connect_timeout must be at least 1000ms"));
        }
        if self.client_login_timeout.is_some_and(|t| t < Duration::from_secs(1)) {
            return Err(ParseError::new("client_login_timeout must be 0 or at least 1000ms"));
        }
        self.client_tls.validate("client")?;
        self.server_tls.validate("server")?;
        Ok(())
    }
}

fn millis_opt(ms: u64) -> Option<Duration> {
    (ms != 0).then(|| Duration::from_millis(ms))
}

/// Error when resolving configuration.
pub struct ParseError {
    reason: Cow<'static, str>,
}

impl ParseError {
    fn new(reason: &'static str) -> Self {
        Self { reason: reason.into() }
    }

    fn owned(reason: String) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for ParseError { }

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl fmt::Debug for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
