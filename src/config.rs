//! Graph and process configuration schema.
//!
//! The wire format is someone else's problem: any serde front end can
//! produce these structures. `Graph::load` consumes them as-is.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::HandlerChoice;

/// Declarative description of a whole graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Streams fed by external producers, in no particular order.
    pub input_streams: Vec<String>,
    pub nodes: Vec<NodeConfig>,
    /// The default executor every node runs on unless bound elsewhere.
    pub executor: ExecutorConfig,
    /// Additional named executors referenced by `NodeConfig::executor`.
    pub executors: BTreeMap<String, ExecutorConfig>,
    pub backpressure: BackpressureMode,
    /// Queue cap applied to every input queue whose handler does not set its
    /// own. `0` means unbounded.
    pub default_queue_cap: usize,
}

impl GraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input_stream(mut self, name: impl Into<String>) -> Self {
        self.input_streams.push(name.into());
        self
    }

    pub fn node(mut self, node: NodeConfig) -> Self {
        self.nodes.push(node);
        self
    }
}

/// One calculator instance and its bindings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    /// Registered calculator type name.
    pub calculator: String,
    #[serde(default)]
    pub inputs: Vec<PortBinding>,
    #[serde(default)]
    pub outputs: Vec<PortBinding>,
    #[serde(default)]
    pub input_side_packets: Vec<SideBinding>,
    #[serde(default)]
    pub output_side_packets: Vec<SideBinding>,
    /// Graph-level input-stream-handler override; takes priority over the
    /// default the calculator's contract may set.
    #[serde(default)]
    pub handler: Option<HandlerChoice>,
    /// Named executor this node is routed to; the default pool otherwise.
    #[serde(default)]
    pub executor: Option<String>,
    /// Opaque calculator options, passed through to the contract function
    /// and every invocation context.
    #[serde(default)]
    pub options: serde_json::Value,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, calculator: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calculator: calculator.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            input_side_packets: Vec::new(),
            output_side_packets: Vec::new(),
            handler: None,
            executor: None,
            options: serde_json::Value::Null,
        }
    }

    pub fn input(mut self, tag: impl Into<String>, stream: impl Into<String>) -> Self {
        self.inputs.push(PortBinding {
            tag: tag.into(),
            stream: stream.into(),
        });
        self
    }

    pub fn output(mut self, tag: impl Into<String>, stream: impl Into<String>) -> Self {
        self.outputs.push(PortBinding {
            tag: tag.into(),
            stream: stream.into(),
        });
        self
    }

    pub fn input_side_packet(mut self, tag: impl Into<String>, name: impl Into<String>) -> Self {
        self.input_side_packets.push(SideBinding {
            tag: tag.into(),
            name: name.into(),
        });
        self
    }

    pub fn output_side_packet(mut self, tag: impl Into<String>, name: impl Into<String>) -> Self {
        self.output_side_packets.push(SideBinding {
            tag: tag.into(),
            name: name.into(),
        });
        self
    }

    pub fn handler(mut self, choice: HandlerChoice) -> Self {
        self.handler = Some(choice);
        self
    }

    pub fn executor(mut self, name: impl Into<String>) -> Self {
        self.executor = Some(name.into());
        self
    }

    pub fn options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }
}

/// Binds a contract port tag to a named stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortBinding {
    pub tag: String,
    pub stream: String,
}

/// Binds a contract side-packet tag to a graph-wide side-packet name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SideBinding {
    pub tag: String,
    pub name: String,
}

/// What external `add_packet` does when a downstream queue is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// Block the producer until the queue drains.
    #[default]
    WaitTillNotFull,
    /// Return `QueueFull` instead of blocking.
    AddIfNotFull,
}

/// Thread-pool sizing for one executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker count; `0` means one per available core.
    pub workers: usize,
    /// Minimum stack size per worker, for calculators that need deep stacks.
    pub stack_size: Option<usize>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            stack_size: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Compact,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
        }
    }
}
