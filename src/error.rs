use thiserror::Error;

use crate::core::PacketError;
use crate::runtime::{CalculatorError, ConfigError, GraphError, StreamError};

/// Whether retrying this operation may succeed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help once downstream queues drain.
    Retryable,
    /// Unknown if retry will help.
    Unknown,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over canonical capability errors.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Calculator(#[from] CalculatorError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl Error {
    pub fn transience(&self) -> Transience {
        match self {
            // A full queue drains; everything else needs different input.
            Error::Graph(GraphError::QueueFull { .. }) => Transience::Retryable,
            Error::Config(_)
            | Error::Packet(_)
            | Error::Stream(_)
            | Error::Calculator(_)
            | Error::Graph(_) => Transience::Permanent,
        }
    }

    /// True when this status is the normal outcome of `cancel()`.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Graph(GraphError::Cancelled))
    }
}
