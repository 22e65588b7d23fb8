//! Error type shared by every component of the store.
//!
//! Errors fall into a few kinds with different caller responses:
//!
//! | Kind | Variant | Typical response |
//! |------|---------|------------------|
//! | Precondition | `InvalidArgument` | Fix the call site |
//! | Lifecycle | `Disposed` | Stop using the handle |
//! | Cancellation | `Cancelled` | Partial work is kept |
//! | Store | `Database` | Busy/locked is retried internally, anything else propagates |

use thiserror::Error;

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: i32 = 5;
/// SQLite primary result code for `SQLITE_LOCKED`.
const SQLITE_LOCKED: i32 = 6;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required argument was missing, empty, or out of range.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// The component was used after it was disposed.
    #[error("{0} has been disposed")]
    Disposed(&'static str),

    /// A cooperative cancellation was observed.
    #[error("operation cancelled during {phase}")]
    Cancelled { phase: &'static str },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored column held a value that cannot be mapped back onto a record.
    #[error("failed to decode column `{column}`: {reason}")]
    Decode { column: &'static str, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }

    pub(crate) fn decode(column: &'static str, reason: impl ToString) -> Self {
        Self::Decode {
            column,
            reason: reason.to_string(),
        }
    }

    /// Whether this is transient SQLite contention (busy or locked).
    ///
    /// SQLite reports extended result codes; the primary code lives in the
    /// low byte.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Database(db)) => db
                .code()
                .and_then(|code| code.parse::<i32>().ok())
                .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
