use std::borrow::Cow;
use std::{fmt, io, result};

#[derive(Debug)]
pub enum TetherError {
    Io(io::Error),
    /// Encoded document exceeds the size ceiling
    TooLarge { size: usize, limit: usize },
    /// Empty key, oversized key, or key inside the reserved namespace
    InvalidKey(Cow<'static, str>),
    /// Value or predicate is not representable
    Encoding(Cow<'static, str>),
    /// Backing contained a structurally invalid page or side entry
    Corrupt(Cow<'static, str>),
    /// Operation deadline elapsed before the worker picked it up
    Timeout,
    /// Worker waited longer than `lock_timeout` for the shared lease to drain
    LockTimeout,
    /// Operation enqueued after `close()`
    Closed,
}

impl fmt::Display for TetherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TetherError::Io(err) => write!(f, "I/O error: {err}"),
            TetherError::TooLarge { size, limit } => {
                write!(f, "Document too large: {size} bytes exceeds {limit} byte ceiling")
            }
            TetherError::InvalidKey(msg) => write!(f, "Invalid key: {msg}"),
            TetherError::Encoding(msg) => write!(f, "Encoding error: {msg}"),
            TetherError::Corrupt(msg) => write!(f, "Data corruption: {msg}"),
            TetherError::Timeout => write!(f, "Operation deadline exceeded"),
            TetherError::LockTimeout => write!(f, "Database lock timed out"),
            TetherError::Closed => write!(f, "Database is closed"),
        }
    }
}

impl std::error::Error for TetherError {}

macro_rules! err_from_impl {
    ($variant:ident, $err_ty:ty) => {
        impl From<$err_ty> for TetherError {
            fn from(err: $err_ty) -> Self {
                TetherError::$variant(err)
            }
        }
    };
}

err_from_impl!(Io, io::Error);

impl From<serde_json::Error> for TetherError {
    fn from(err: serde_json::Error) -> Self {
        TetherError::Encoding(err.to_string().into())
    }
}

impl TetherError {
    /// Transient failures are retried by the worker; everything else
    /// surfaces to the originating completion immediately.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, TetherError::Io(_))
    }
}

pub type Result<T> = result::Result<T, TetherError>;
