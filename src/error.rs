//! Error types shared by the server and client roles.
//!
//! Only fatal conditions are errors. A peer hanging up or sending an
//! oversized frame is reported as a `ConnectionOutcome` instead, because the
//! reactor recovers from those by closing a single connection.

use crate::config::ConfigError;
use std::io;

/// Crate result type
pub type Result<T> = std::result::Result<T, ChatError>;

/// Fatal errors
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    MessageTooLarge { len: usize, max: usize },

    #[error("could not resolve {0}")]
    Resolve(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ChatError {
    /// Wrap a system error with the name of the call that produced it.
    pub fn io(op: &'static str, source: io::Error) -> Self {
        ChatError::Io { op, source }
    }
}

/// Attach an operation name to `io::Result` values.
pub trait IoContext<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|e| ChatError::io(op, e))
    }
}
