//! Input-stream handlers: when is a node's input set ready to invoke?
//!
//! A handler is a policy over the node's input channels. The scheduler
//! re-evaluates it whenever any upstream channel changes.

use std::sync::Arc;

use crate::core::{HandlerChoice, OnFull, Packet, Timestamp};

use super::error::ConfigError;
use super::stream::InputChannel;

/// Resolved readiness policy for one node.
///
/// Selection precedence: graph-level override > contract default > `Default`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerPolicy {
    /// Synchronize by timestamp: invoke at the smallest `t` where every
    /// input either has a packet at exactly `t` or a bound past `t`.
    Default,
    /// Invoke as soon as any input has data; co-inputs not at the invoking
    /// timestamp are observed as empty.
    Immediate,
    /// As `Default`, with per-input queues capped at `max_queue_size`.
    FixedSize {
        max_queue_size: usize,
        on_full: OnFull,
    },
}

impl HandlerPolicy {
    /// Resolve the effective policy for a node.
    pub(crate) fn resolve(
        node: &str,
        graph_override: Option<&HandlerChoice>,
        contract_default: Option<&HandlerChoice>,
    ) -> Result<HandlerPolicy, ConfigError> {
        let Some(choice) = graph_override.or(contract_default) else {
            return Ok(HandlerPolicy::Default);
        };
        match choice.policy.as_str() {
            "default" => Ok(HandlerPolicy::Default),
            "immediate" => Ok(HandlerPolicy::Immediate),
            "fixed_size" => {
                let max_queue_size = choice.max_queue_size.unwrap_or(0);
                if max_queue_size == 0 {
                    return Err(ConfigError::InvalidHandler {
                        node: node.to_string(),
                        reason: "fixed_size requires max_queue_size >= 1".to_string(),
                    });
                }
                Ok(HandlerPolicy::FixedSize {
                    max_queue_size,
                    on_full: choice.on_full,
                })
            }
            other => Err(ConfigError::UnknownHandler {
                node: node.to_string(),
                policy: other.to_string(),
            }),
        }
    }

    /// Queue cap this policy imposes on each input channel.
    pub(crate) fn queue_cap(&self) -> Option<usize> {
        match self {
            HandlerPolicy::FixedSize { max_queue_size, .. } => Some(*max_queue_size),
            _ => None,
        }
    }

    pub(crate) fn on_full(&self) -> OnFull {
        match self {
            HandlerPolicy::FixedSize { on_full, .. } => *on_full,
            _ => OnFull::Block,
        }
    }
}

/// What the handler concluded about a node's inputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    NotReady,
    /// An invocation at this timestamp is due.
    ReadyForProcess(Timestamp),
    /// Every input is drained and closed; the node can close.
    ReadyForClose,
}

/// Evaluate readiness over a node's input channels.
pub(crate) fn compute_readiness(
    policy: HandlerPolicy,
    channels: &[Arc<InputChannel>],
) -> Readiness {
    // A stream-less node (side-packet generator) does all its work in open.
    if channels.is_empty() {
        return Readiness::ReadyForClose;
    }
    let cursors: Vec<(Option<Timestamp>, Timestamp)> =
        channels.iter().map(|ch| ch.cursor()).collect();

    if cursors
        .iter()
        .all(|(head, bound)| head.is_none() && *bound == Timestamp::DONE)
    {
        return Readiness::ReadyForClose;
    }

    match policy {
        HandlerPolicy::Default | HandlerPolicy::FixedSize { .. } => {
            // Smallest timestamp that could still be produced or consumed.
            let target = cursors
                .iter()
                .map(|(head, bound)| head.unwrap_or(*bound))
                .min()
                .unwrap_or(Timestamp::UNSTARTED);
            let any_packet = cursors.iter().any(|(head, _)| *head == Some(target));
            if !any_packet {
                return Readiness::NotReady;
            }
            let settled = cursors
                .iter()
                .all(|(head, bound)| *head == Some(target) || *bound > target);
            if settled {
                Readiness::ReadyForProcess(target)
            } else {
                Readiness::NotReady
            }
        }
        HandlerPolicy::Immediate => {
            match cursors.iter().filter_map(|(head, _)| *head).min() {
                Some(target) => Readiness::ReadyForProcess(target),
                None => Readiness::NotReady,
            }
        }
    }
}

/// Collect the input set for an invocation at `timestamp`: present packets
/// are popped, absent inputs are observed as empty packets.
pub(crate) fn take_input_set(channels: &[Arc<InputChannel>], timestamp: Timestamp) -> Vec<Packet> {
    channels
        .iter()
        .map(|ch| {
            ch.pop_at(timestamp)
                .unwrap_or_else(|| Packet::empty(timestamp))
        })
        .collect()
}
