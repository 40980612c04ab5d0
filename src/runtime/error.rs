//! Runtime capability errors: configuration, streams, calculators, graph
//! lifecycle.
//!
//! One taxonomy, not one type: `ConfigError` is fatal at `load`/`start`,
//! stream violations are fatal for the offending node, `QueueFull` is a
//! plain backpressure signal to the caller.

use thiserror::Error;

use crate::core::Timestamp;

/// The graph description is malformed. Surfaced by `Graph::load` (or by
/// `start` for side-packet and service requirements that are only knowable
/// then); no partial graph is left behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("node `{node}` names unknown calculator `{calculator}`")]
    UnknownCalculator { node: String, calculator: String },
    #[error("duplicate node name `{name}`")]
    DuplicateNodeName { name: String },
    #[error("stream `{stream}` has two producers: `{first}` and `{second}`")]
    DuplicateProducer {
        stream: String,
        first: String,
        second: String,
    },
    #[error("node `{node}` input `{tag}` reads stream `{stream}` which nothing produces")]
    MissingProducer {
        node: String,
        tag: String,
        stream: String,
    },
    #[error(
        "stream `{stream}`: producer `{producer}` emits `{produced}` but \
         consumer `{consumer}` expects `{expected}`"
    )]
    TypeMismatch {
        stream: String,
        producer: String,
        produced: &'static str,
        consumer: String,
        expected: &'static str,
    },
    #[error("graph contains a cycle through nodes: {}", nodes.join(", "))]
    Cycle { nodes: Vec<String> },
    #[error("node `{node}` declares no input streams; data enters only through graph input streams")]
    NoInputs { node: String },
    #[error("node `{node}` repeats port tag `{tag}`")]
    DuplicateTag { node: String, tag: String },
    #[error("node `{node}` binds unknown port tag `{tag}`")]
    UnknownTag { node: String, tag: String },
    #[error("node `{node}` port `{tag}` has no stream bound")]
    UnboundPort { node: String, tag: String },
    #[error("node `{node}` selects unknown input-stream handler `{policy}`")]
    UnknownHandler { node: String, policy: String },
    #[error("node `{node}` handler is invalid: {reason}")]
    InvalidHandler { node: String, reason: String },
    #[error("node `{node}` is bound to unknown executor `{executor}`")]
    UnknownExecutor { node: String, executor: String },
    #[error("node `{node}` requires side packet `{tag}` (name `{name}`) which nothing supplies")]
    MissingSidePacket {
        node: String,
        tag: String,
        name: String,
    },
    #[error("side packet `{name}` has two producers: `{first}` and `{second}`")]
    DuplicateSidePacketProducer {
        name: String,
        first: String,
        second: String,
    },
    #[error("node `{node}` requires service `{service}` which was not provided")]
    MissingService { node: String, service: String },
    #[error("node `{node}` rejected its configuration: {reason}")]
    BadNodeOptions { node: String, reason: String },
}

/// Violation of the per-stream ordering protocol. Fatal for the node (or
/// ingress call) that attempted it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamError {
    #[error(
        "stream `{stream}`: packet at {timestamp} regresses below the bound {bound}"
    )]
    TimestampRegression {
        stream: String,
        timestamp: Timestamp,
        bound: Timestamp,
    },
    #[error(
        "output `{port}`: emission at {timestamp} violates monotonicity (last emitted {last}, \
         invocation at {input})"
    )]
    TimestampMonotonicity {
        port: String,
        timestamp: Timestamp,
        last: Timestamp,
        input: Timestamp,
    },
    #[error("stream `{stream}`: timestamp {timestamp} is not allowed on a stream")]
    InvalidTimestamp {
        stream: String,
        timestamp: Timestamp,
    },
    #[error("stream `{stream}` is closed")]
    Closed { stream: String },
}

/// Failure escaping user calculator code.
///
/// The scheduler records the first one per graph, stops dispatching new
/// work, closes every opened node and surfaces it from `wait_until_done`.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum CalculatorError {
    #[error("{message}")]
    Failed { message: String },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Packet(#[from] crate::core::PacketError),
}

impl CalculatorError {
    /// An opaque failure with a message.
    pub fn msg(message: impl Into<String>) -> CalculatorError {
        CalculatorError::Failed {
            message: message.into(),
        }
    }
}

/// Graph lifecycle and ingress statuses.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum GraphError {
    #[error("`{stream}` is not a graph input stream")]
    UnknownStream { stream: String },
    #[error("backpressure: downstream queue of `{stream}` is full")]
    QueueFull { stream: String },
    #[error("{reason}")]
    FailedPrecondition { reason: String },
    #[error("graph was cancelled")]
    Cancelled,
    #[error("node `{node}` failed: {source}")]
    Node {
        node: String,
        #[source]
        source: CalculatorError,
    },
    #[error("executor `{name}` failed to start: {message}")]
    ExecutorSpawn { name: String, message: String },
    #[error("internal invariant violated: {reason}")]
    Internal { reason: &'static str },
}

impl GraphError {
    pub(crate) fn precondition(reason: impl Into<String>) -> GraphError {
        GraphError::FailedPrecondition {
            reason: reason.into(),
        }
    }
}
