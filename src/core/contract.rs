//! Calculator contracts: the statically-declared shape of a node.
//!
//! A contract names the input and output ports, the side packets the
//! calculator reads or produces, and the services it depends on. It is
//! computed once per node before the graph starts, from the calculator's
//! registered contract function, and drives type resolution and validation.

use serde::{Deserialize, Serialize};

use super::types::DeclaredType;

/// One stream endpoint of a node.
#[derive(Clone, Debug)]
pub struct PortSpec {
    pub tag: String,
    pub declared: DeclaredType,
}

/// One side-packet endpoint of a node.
#[derive(Clone, Debug)]
pub struct SidePacketSpec {
    pub tag: String,
    pub declared: DeclaredType,
    pub optional: bool,
}

/// Sub-policy of the fixed-size handler when a queue is at capacity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFull {
    /// External producers block (or get `QueueFull` in non-blocking mode).
    #[default]
    Block,
    /// The oldest queued packet is dropped to admit the new one.
    DropOldest,
}

/// Input-stream-handler selection, by registered policy name.
///
/// Appears in two places with a fixed precedence: the graph configuration
/// (override) and the contract (node default). A name that resolves to no
/// policy is a configuration error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandlerChoice {
    pub policy: String,
    pub max_queue_size: Option<usize>,
    pub on_full: OnFull,
}

impl Default for HandlerChoice {
    fn default() -> Self {
        Self {
            policy: "default".to_string(),
            max_queue_size: None,
            on_full: OnFull::default(),
        }
    }
}

impl HandlerChoice {
    pub fn immediate() -> Self {
        Self {
            policy: "immediate".to_string(),
            ..Self::default()
        }
    }

    pub fn fixed_size(max_queue_size: usize, on_full: OnFull) -> Self {
        Self {
            policy: "fixed_size".to_string(),
            max_queue_size: Some(max_queue_size),
            on_full,
        }
    }
}

/// Declared input/output shape of a calculator instance.
#[derive(Clone, Debug, Default)]
pub struct CalculatorContract {
    inputs: Vec<PortSpec>,
    outputs: Vec<PortSpec>,
    input_side_packets: Vec<SidePacketSpec>,
    output_side_packets: Vec<SidePacketSpec>,
    services: Vec<String>,
    input_stream_handler: Option<HandlerChoice>,
}

impl CalculatorContract {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an input stream carrying `T`.
    pub fn input<T: Send + Sync + 'static>(&mut self, tag: impl Into<String>) -> &mut Self {
        self.add_input(tag, DeclaredType::of::<T>())
    }

    /// Declare an input stream accepting any packet type.
    pub fn input_any(&mut self, tag: impl Into<String>) -> &mut Self {
        self.add_input(tag, DeclaredType::Any)
    }

    pub fn add_input(&mut self, tag: impl Into<String>, declared: DeclaredType) -> &mut Self {
        self.inputs.push(PortSpec {
            tag: tag.into(),
            declared,
        });
        self
    }

    /// Declare an output stream carrying `T`.
    pub fn output<T: Send + Sync + 'static>(&mut self, tag: impl Into<String>) -> &mut Self {
        self.add_output(tag, DeclaredType::of::<T>())
    }

    /// Declare an output stream whose type follows the input.
    pub fn output_any(&mut self, tag: impl Into<String>) -> &mut Self {
        self.add_output(tag, DeclaredType::Any)
    }

    pub fn add_output(&mut self, tag: impl Into<String>, declared: DeclaredType) -> &mut Self {
        self.outputs.push(PortSpec {
            tag: tag.into(),
            declared,
        });
        self
    }

    /// Require a side packet of type `T` to be present before `open`.
    pub fn require_side_packet<T: Send + Sync + 'static>(
        &mut self,
        tag: impl Into<String>,
    ) -> &mut Self {
        self.input_side_packets.push(SidePacketSpec {
            tag: tag.into(),
            declared: DeclaredType::of::<T>(),
            optional: false,
        });
        self
    }

    /// Accept a side packet of type `T` if one is supplied.
    pub fn optional_side_packet<T: Send + Sync + 'static>(
        &mut self,
        tag: impl Into<String>,
    ) -> &mut Self {
        self.input_side_packets.push(SidePacketSpec {
            tag: tag.into(),
            declared: DeclaredType::of::<T>(),
            optional: true,
        });
        self
    }

    /// Declare a side packet this calculator produces during `open`.
    pub fn produce_side_packet<T: Send + Sync + 'static>(
        &mut self,
        tag: impl Into<String>,
    ) -> &mut Self {
        self.output_side_packets.push(SidePacketSpec {
            tag: tag.into(),
            declared: DeclaredType::of::<T>(),
            optional: false,
        });
        self
    }

    /// Name an external service singleton the calculator depends on.
    pub fn use_service(&mut self, name: impl Into<String>) -> &mut Self {
        self.services.push(name.into());
        self
    }

    /// Set this node's default input-stream handler. A handler named in the
    /// graph configuration for this node takes priority.
    pub fn set_input_stream_handler(&mut self, choice: HandlerChoice) -> &mut Self {
        self.input_stream_handler = Some(choice);
        self
    }

    pub fn inputs(&self) -> &[PortSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[PortSpec] {
        &self.outputs
    }

    pub fn input_side_packets(&self) -> &[SidePacketSpec] {
        &self.input_side_packets
    }

    pub fn output_side_packets(&self) -> &[SidePacketSpec] {
        &self.output_side_packets
    }

    pub fn services(&self) -> &[String] {
        &self.services
    }

    pub fn input_stream_handler(&self) -> Option<&HandlerChoice> {
        self.input_stream_handler.as_ref()
    }

    pub fn input_index(&self, tag: &str) -> Option<usize> {
        self.inputs.iter().position(|p| p.tag == tag)
    }

    pub fn output_index(&self, tag: &str) -> Option<usize> {
        self.outputs.iter().position(|p| p.tag == tag)
    }
}
