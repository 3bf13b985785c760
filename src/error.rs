//! `postgate` error types.
use std::{backtrace::Backtrace, fmt, io, str::Utf8Error};

use crate::{
    config::ParseError,
    net::tls::TlsError,
    pool::{Exhausted, PoolClosed},
    postgres::{ErrorResponse, ProtocolError, UnsupportedAuth},
};

/// A specialized [`Result`] type for `postgate` operation.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All possible error from the `postgate` library.
pub struct Error {
    context: String,
    backtrace: Backtrace,
    kind: ErrorKind,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    /// Attach a human readable context to the error message.
    pub(crate) fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// All possible error kind from the `postgate` library.
pub enum ErrorKind {
    Config(ParseError),
    Protocol(ProtocolError),
    Io(io::Error),
    Database(ErrorResponse),
    Tls(TlsError),
    UnsupportedAuth(UnsupportedAuth),
    Exhausted(Exhausted),
    PoolClosed(PoolClosed),
    Timeout(tokio::time::error::Elapsed),
    Utf8(Utf8Error),
}

macro_rules! from {
    (<$ty:ty>$pat:pat => $body:expr) => {
        impl From<$ty> for Error {
            fn from($pat: $ty) -> Self {
                let backtrace = std::backtrace::Backtrace::capture();
                Self { context: String::new(), backtrace, kind: $body }
            }
        }
    };
}

from!(<ErrorKind>e => e);
from!(<ParseError>e => ErrorKind::Config(e));
from!(<ProtocolError>e => ErrorKind::Protocol(e));
from!(<io::Error>e => ErrorKind::Io(e));
from!(<ErrorResponse>e => ErrorKind::Database(e));
from!(<TlsError>e => ErrorKind::Tls(e));
from!(<UnsupportedAuth>e => ErrorKind::UnsupportedAuth(e));
from!(<Exhausted>e => ErrorKind::Exhausted(e));
from!(<PoolClosed>e => ErrorKind::PoolClosed(e));
from!(<tokio::time::error::Elapsed>e => ErrorKind::Timeout(e));
from!(<Utf8Error>e => ErrorKind::Utf8(e));

impl std::error::Error for Error { }

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.context.is_empty() {
            write!(f, "{}: ", self.context)?;
        }

        fmt::Display::fmt(&self.kind, f)?;

        if let std::backtrace::BacktraceStatus::Captured = self.backtrace.status() {
            let mut backtrace = self.backtrace.to_string();
            write!(f, "\n\n")?;
            writeln!(f, "Stack backtrace:")?;
            backtrace.truncate(backtrace.trim_end().len());
            write!(f, "{}", backtrace)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

impl std::error::Error for ErrorKind { }

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => e.fmt(f),
            Self::Protocol(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
            Self::Database(e) => e.fmt(f),
            Self::Tls(e) => e.fmt(f),
            Self::UnsupportedAuth(e) => e.fmt(f),
            Self::Exhausted(e) => e.fmt(f),
            Self::PoolClosed(e) => e.fmt(f),
            Self::Timeout(e) => e.fmt(f),
            Self::Utf8(e) => e.fmt(f),
        }
    }
}

impl fmt::Debug for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
