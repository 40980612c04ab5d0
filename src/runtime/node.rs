//! The scheduler's unit of work: one calculator instance plus its bindings.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::core::{CalculatorContract, Timestamp};

use super::calculator::Calculator;
use super::context::{ServiceSet, SidePacketSet};
use super::handler::HandlerPolicy;
use super::stream::InputChannel;

/// Lifecycle of a node, driven solely by the scheduler and serialized per
/// node. `Active` and `Closing` are the in-flight states; the scheduler
/// guarantees no two in-flight periods overlap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    NotOpened,
    Idle,
    Active,
    Closing,
    Closed,
    Failing,
}

/// Downstream fan-out of one output port.
pub(crate) struct OutputEdges {
    pub stream: Arc<str>,
    pub edges: Vec<Arc<InputChannel>>,
}

/// Environment resolved at start, before `open`.
pub(crate) struct NodeEnv {
    pub side_packets: SidePacketSet,
    pub services: ServiceSet,
}

pub(crate) struct NodeCell {
    pub state: NodeState,
    /// Last emitted timestamp per output port; feeds the monotonicity check.
    pub last_emitted: Vec<Timestamp>,
}

pub(crate) struct Node {
    pub index: usize,
    pub name: String,
    /// Topological rank; ties in the ready queue break toward lower rank.
    pub rank: usize,
    pub contract: CalculatorContract,
    pub policy: HandlerPolicy,
    /// Executor slot this node's invocations run on.
    pub executor: usize,
    pub options: serde_json::Value,
    /// Aligned with `contract.inputs()`.
    pub inputs: Vec<Arc<InputChannel>>,
    /// Aligned with `contract.outputs()`.
    pub outputs: Vec<OutputEdges>,
    /// Taken (dropped) when the node closes.
    pub calculator: Mutex<Option<Box<dyn Calculator>>>,
    pub env: OnceLock<NodeEnv>,
    cell: Mutex<NodeCell>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: usize,
        name: String,
        rank: usize,
        contract: CalculatorContract,
        policy: HandlerPolicy,
        executor: usize,
        options: serde_json::Value,
        inputs: Vec<Arc<InputChannel>>,
        outputs: Vec<OutputEdges>,
        calculator: Box<dyn Calculator>,
    ) -> Node {
        let ports = contract.outputs().len();
        Node {
            index,
            name,
            rank,
            contract,
            policy,
            executor,
            options,
            inputs,
            outputs,
            calculator: Mutex::new(Some(calculator)),
            env: OnceLock::new(),
            cell: Mutex::new(NodeCell {
                state: NodeState::NotOpened,
                last_emitted: vec![Timestamp::UNSTARTED; ports],
            }),
        }
    }

    pub(crate) fn cell(&self) -> MutexGuard<'_, NodeCell> {
        self.cell.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn state(&self) -> NodeState {
        self.cell().state
    }

    /// Headers of the input streams, aligned with `contract.inputs()`.
    pub(crate) fn input_headers(&self) -> Vec<Option<crate::core::Packet>> {
        self.inputs.iter().map(|ch| ch.header()).collect()
    }
}
