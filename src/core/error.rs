//! Packet-level capability errors.
//!
//! Bounded and stable: these represent domain refusals (wrong type, no
//! payload), not implementation details.

use thiserror::Error;

use super::timestamp::Timestamp;

/// Failure to read a packet payload.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PacketError {
    #[error("packet holds `{actual}`, caller asked for `{expected}`")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },
    #[error("packet at {timestamp} is empty")]
    Empty { timestamp: Timestamp },
}
