//! The scheduler: readiness detection, dispatch, shutdown.
//!
//! One `SchedCore` per running graph. Work items are ordered by
//! (topological rank, invocation timestamp, node id) and dispatched to the
//! node's executor; the node state machine guarantees a single in-flight
//! invocation per node. The ready-set lock is held only to enqueue and
//! dequeue, never across user code.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::core::{Packet, Timestamp};
use crate::error::Error;

use super::context::{CalculatorContext, OutputScratch, Phase};
use super::error::{CalculatorError, GraphError};
use super::executor::Executor;
use super::handler::{self, Readiness};
use super::node::{Node, NodeState};
use super::profile::{ProfileEvent, ProfilePhase, Profiler};
use super::stream::{AddOutcome, InputChannel};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum WorkKind {
    Process,
    Close,
}

/// Ordering is the scheduling tie-break: topological rank first, then
/// invocation timestamp, then node id.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct WorkItem {
    rank: usize,
    timestamp: Timestamp,
    node: usize,
    kind: WorkKind,
}

struct SchedInner {
    /// Queued plus running work items.
    pending: usize,
    closed_nodes: usize,
    done: bool,
    first_error: Option<Error>,
}

pub(crate) struct SchedCore {
    pub(crate) nodes: Vec<Arc<Node>>,
    executors: OnceLock<Vec<Arc<dyn Executor>>>,
    /// One ready queue per executor slot, so a node's work always lands on
    /// its own executor.
    queues: Vec<Mutex<BinaryHeap<Reverse<WorkItem>>>>,
    inner: Mutex<SchedInner>,
    cond: Condvar,
    gate_lock: Mutex<()>,
    gate: Condvar,
    started: AtomicBool,
    cancelled: AtomicBool,
    /// Stop dispatching `Process`; only `Close` work remains.
    draining: AtomicBool,
    profiler: OnceLock<Profiler>,
}

impl SchedCore {
    pub(crate) fn new(nodes: Vec<Arc<Node>>, executor_slots: usize) -> Arc<SchedCore> {
        Arc::new(SchedCore {
            nodes,
            executors: OnceLock::new(),
            queues: (0..executor_slots.max(1))
                .map(|_| Mutex::new(BinaryHeap::new()))
                .collect(),
            inner: Mutex::new(SchedInner {
                pending: 0,
                closed_nodes: 0,
                done: false,
                first_error: None,
            }),
            cond: Condvar::new(),
            gate_lock: Mutex::new(()),
            gate: Condvar::new(),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            profiler: OnceLock::new(),
        })
    }

    pub(crate) fn set_executors(&self, executors: Vec<Arc<dyn Executor>>) {
        let _ = self.executors.set(executors);
    }

    pub(crate) fn set_profiler(&self, profiler: Profiler) {
        let _ = self.profiler.set(profiler);
    }

    pub(crate) fn profile(&self, make: impl FnOnce() -> ProfileEvent) {
        if let Some(profiler) = self.profiler.get() {
            profiler.emit(make());
        }
    }

    pub(crate) fn profiler_dropped(&self) -> u64 {
        self.profiler.get().map_or(0, Profiler::dropped_events)
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.lock_inner().done
    }

    fn lock_inner(&self) -> MutexGuard<'_, SchedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- lifecycle -------------------------------------------------------

    /// Open one node synchronously (called in topological order by the
    /// graph). Returns the side packets the calculator produced.
    pub(crate) fn run_open(
        self: &Arc<Self>,
        node: &Arc<Node>,
    ) -> Result<Vec<(usize, Packet)>, CalculatorError> {
        let env = node
            .env
            .get()
            .ok_or_else(|| CalculatorError::msg("node environment was not resolved"))?;
        let inputs = vec![Packet::empty(Timestamp::UNSTARTED); node.contract.inputs().len()];
        let headers = node.input_headers();
        let mut scratch = OutputScratch::new(Phase::Open, &node.cell().last_emitted);

        self.profile(|| ProfileEvent::InvocationStart {
            node: node.name.clone(),
            phase: ProfilePhase::Open,
            timestamp: Timestamp::UNSTARTED,
        });
        let result = {
            let mut guard = node
                .calculator
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(calculator) => {
                    let mut ctx = CalculatorContext::new(
                        &node.name,
                        Timestamp::UNSTARTED,
                        &inputs,
                        &headers,
                        &node.contract,
                        &env.side_packets,
                        &env.services,
                        &node.options,
                        &mut scratch,
                    );
                    calculator.open(&mut ctx)
                }
                None => Ok(()),
            }
        };
        self.profile(|| ProfileEvent::InvocationEnd {
            node: node.name.clone(),
            phase: ProfilePhase::Open,
            timestamp: Timestamp::UNSTARTED,
        });
        result?;

        self.flush_outputs(node, &mut scratch)?;
        {
            let mut cell = node.cell();
            cell.last_emitted = scratch.ports.iter().map(|p| p.last).collect();
            cell.state = NodeState::Idle;
        }
        self.profile(|| ProfileEvent::NodeOpened {
            node: node.name.clone(),
        });
        tracing::debug!(node = %node.name, "node opened");
        Ok(std::mem::take(&mut scratch.side_packets))
    }

    /// Let notifications start scheduling work, then sweep every node once
    /// so pre-start emissions and bounds are considered.
    pub(crate) fn start_running(self: &Arc<Self>) {
        self.started.store(true, Ordering::SeqCst);
        for index in 0..self.nodes.len() {
            self.notify_node(index);
        }
    }

    /// Abrupt stop. Idempotent; the first call wins the final status.
    pub(crate) fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut inner = self.lock_inner();
            if inner.done {
                return;
            }
            if inner.first_error.is_none() {
                inner.first_error = Some(Error::Graph(GraphError::Cancelled));
            }
        }
        tracing::info!("graph cancel requested");
        self.draining.store(true, Ordering::SeqCst);
        self.close_idle_nodes();
        self.notify_gate();
    }

    /// Record a failure. The first error per graph is authoritative and
    /// starts the drain; later ones are logged and suppressed.
    pub(crate) fn record_error(self: &Arc<Self>, error: Error) {
        let is_first = {
            let mut inner = self.lock_inner();
            if inner.done {
                false
            } else if inner.first_error.is_none() {
                inner.first_error = Some(error.clone());
                true
            } else {
                false
            }
        };
        if is_first {
            tracing::error!(error = %error, "graph failed; draining");
            self.draining.store(true, Ordering::SeqCst);
            self.close_idle_nodes();
            self.notify_gate();
        } else {
            tracing::warn!(error = %error, "error during shutdown suppressed");
        }
    }

    /// Close every node synchronously, in reverse topological order. Used
    /// when `start` fails partway through opening.
    pub(crate) fn close_all_sync(self: &Arc<Self>) {
        let mut order: Vec<Arc<Node>> = self.nodes.to_vec();
        order.sort_by_key(|n| Reverse(n.rank));
        for node in order {
            match node.state() {
                NodeState::NotOpened => self.mark_closed_without_close(&node),
                NodeState::Closed => {}
                _ => self.run_close(&node),
            }
        }
    }

    fn mark_closed_without_close(self: &Arc<Self>, node: &Arc<Node>) {
        {
            let mut cell = node.cell();
            if cell.state == NodeState::Closed {
                return;
            }
            cell.state = NodeState::Closed;
        }
        self.note_node_closed();
    }

    // ---- waiting ---------------------------------------------------------

    /// Block until no work is queued or in flight. More input may arrive.
    pub(crate) fn wait_until_idle(&self) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        while inner.pending > 0 && !inner.done {
            inner = self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        match &inner.first_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// Block until every node reached `Closed`.
    pub(crate) fn wait_until_done(&self) -> Result<(), Error> {
        let mut inner = self.lock_inner();
        while !inner.done {
            inner = self.cond.wait(inner).unwrap_or_else(PoisonError::into_inner);
        }
        match &inner.first_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    // ---- backpressure gate ----------------------------------------------

    /// Wait until none of `channels` is at capacity. On success the gate
    /// lock is returned still held, so the caller's append is serialized
    /// against other blocked producers.
    pub(crate) fn block_till_not_full<'a>(
        &'a self,
        channels: &[Arc<InputChannel>],
    ) -> Result<MutexGuard<'a, ()>, GraphError> {
        let mut guard = self
            .gate_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.is_cancelled() {
                return Err(GraphError::Cancelled);
            }
            if self.is_draining() || self.is_done() {
                return Err(GraphError::precondition("graph is shutting down"));
            }
            if !channels
                .iter()
                .any(|ch| ch.gates_ingress() && ch.over_cap())
            {
                return Ok(guard);
            }
            guard = self
                .gate
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn gate_guard(&self) -> MutexGuard<'_, ()> {
        self.gate_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_gate(&self) {
        let _guard = self.gate_guard();
        self.gate.notify_all();
    }

    // ---- readiness and dispatch -----------------------------------------

    /// Re-evaluate one node after an upstream change.
    pub(crate) fn notify_node(self: &Arc<Self>, index: usize) {
        if !self.started.load(Ordering::SeqCst) {
            return;
        }
        let node = &self.nodes[index];
        let item = {
            let mut cell = node.cell();
            if cell.state != NodeState::Idle {
                None
            } else if self.is_draining() {
                cell.state = NodeState::Closing;
                Some(WorkItem {
                    rank: node.rank,
                    timestamp: Timestamp::DONE,
                    node: index,
                    kind: WorkKind::Close,
                })
            } else {
                match handler::compute_readiness(node.policy, &node.inputs) {
                    Readiness::ReadyForProcess(timestamp) => {
                        cell.state = NodeState::Active;
                        Some(WorkItem {
                            rank: node.rank,
                            timestamp,
                            node: index,
                            kind: WorkKind::Process,
                        })
                    }
                    Readiness::ReadyForClose => {
                        cell.state = NodeState::Closing;
                        Some(WorkItem {
                            rank: node.rank,
                            timestamp: Timestamp::DONE,
                            node: index,
                            kind: WorkKind::Close,
                        })
                    }
                    Readiness::NotReady => None,
                }
            }
        };
        if let Some(item) = item {
            self.enqueue(item, node.executor);
        }
    }

    fn close_idle_nodes(self: &Arc<Self>) {
        for index in 0..self.nodes.len() {
            self.notify_node(index);
        }
    }

    fn schedule_close(self: &Arc<Self>, index: usize) {
        let node = &self.nodes[index];
        {
            let mut cell = node.cell();
            match cell.state {
                NodeState::Failing | NodeState::Idle => cell.state = NodeState::Closing,
                _ => return,
            }
        }
        self.enqueue(
            WorkItem {
                rank: node.rank,
                timestamp: Timestamp::DONE,
                node: index,
                kind: WorkKind::Close,
            },
            node.executor,
        );
    }

    fn enqueue(self: &Arc<Self>, item: WorkItem, executor: usize) {
        {
            self.lock_inner().pending += 1;
        }
        {
            let mut queue = self.queues[executor]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.push(Reverse(item));
        }
        let weak = Arc::downgrade(self);
        if let Some(executors) = self.executors.get() {
            executors[executor].submit(Box::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.run_next(executor);
                }
            }));
        }
    }

    fn run_next(self: &Arc<Self>, executor: usize) {
        let item = {
            let mut queue = self.queues[executor]
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            queue.pop()
        };
        let Some(Reverse(item)) = item else {
            return;
        };
        let node = Arc::clone(&self.nodes[item.node]);
        match item.kind {
            // A drain converts pending Process work into the node's Close:
            // the node runs, but receives no further inputs.
            WorkKind::Process if self.is_draining() => self.run_close(&node),
            WorkKind::Process => self.run_process(&node, item.timestamp),
            WorkKind::Close => self.run_close(&node),
        }
        let idle = {
            let mut inner = self.lock_inner();
            inner.pending -= 1;
            inner.pending == 0
        };
        if idle {
            self.cond.notify_all();
        }
    }

    fn run_process(self: &Arc<Self>, node: &Arc<Node>, timestamp: Timestamp) {
        let inputs = handler::take_input_set(&node.inputs, timestamp);
        // popped inputs may have opened queue capacity
        self.notify_gate();

        let Some(env) = node.env.get() else {
            self.fail_node(node, CalculatorError::msg("node environment was not resolved"));
            return;
        };
        let headers = node.input_headers();
        let mut scratch = OutputScratch::new(Phase::Process, &node.cell().last_emitted);

        self.profile(|| ProfileEvent::InvocationStart {
            node: node.name.clone(),
            phase: ProfilePhase::Process,
            timestamp,
        });
        let result = {
            let mut guard = node
                .calculator
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.as_mut() {
                Some(calculator) => {
                    let mut ctx = CalculatorContext::new(
                        &node.name,
                        timestamp,
                        &inputs,
                        &headers,
                        &node.contract,
                        &env.side_packets,
                        &env.services,
                        &node.options,
                        &mut scratch,
                    );
                    calculator.process(&mut ctx)
                }
                None => Ok(()),
            }
        };
        self.profile(|| ProfileEvent::InvocationEnd {
            node: node.name.clone(),
            phase: ProfilePhase::Process,
            timestamp,
        });

        let flushed = result.and_then(|()| self.flush_outputs(node, &mut scratch));
        match flushed {
            Ok(consumers) => {
                {
                    let mut cell = node.cell();
                    cell.last_emitted = scratch.ports.iter().map(|p| p.last).collect();
                    cell.state = NodeState::Idle;
                }
                for consumer in consumers {
                    self.notify_node(consumer);
                }
                // more input may already be queued
                self.notify_node(node.index);
            }
            Err(error) => self.fail_node(node, error),
        }
    }

    fn run_close(self: &Arc<Self>, node: &Arc<Node>) {
        {
            let mut cell = node.cell();
            if cell.state == NodeState::Closed {
                return;
            }
            cell.state = NodeState::Closing;
        }

        let inputs = vec![Packet::empty(Timestamp::UNSTARTED); node.contract.inputs().len()];
        let headers = node.input_headers();
        let mut scratch = OutputScratch::new(Phase::Close, &node.cell().last_emitted);

        let has_calculator = {
            let guard = node
                .calculator
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.is_some()
        };
        if has_calculator && let Some(env) = node.env.get() {
            self.profile(|| ProfileEvent::InvocationStart {
                node: node.name.clone(),
                phase: ProfilePhase::Close,
                timestamp: Timestamp::DONE,
            });
            let result = {
                let mut guard = node
                    .calculator
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match guard.as_mut() {
                    Some(calculator) => {
                        let mut ctx = CalculatorContext::new(
                            &node.name,
                            Timestamp::UNSTARTED,
                            &inputs,
                            &headers,
                            &node.contract,
                            &env.side_packets,
                            &env.services,
                            &node.options,
                            &mut scratch,
                        );
                        calculator.close(&mut ctx)
                    }
                    None => Ok(()),
                }
            };
            self.profile(|| ProfileEvent::InvocationEnd {
                node: node.name.clone(),
                phase: ProfilePhase::Close,
                timestamp: Timestamp::DONE,
            });
            match result.and_then(|()| self.flush_outputs(node, &mut scratch)) {
                Ok(consumers) => {
                    let mut cell = node.cell();
                    cell.last_emitted = scratch.ports.iter().map(|p| p.last).collect();
                    drop(cell);
                    for consumer in consumers {
                        self.notify_node(consumer);
                    }
                }
                Err(error) => {
                    self.record_error(Error::Graph(GraphError::Node {
                        node: node.name.clone(),
                        source: error,
                    }));
                }
            }
        }

        // close the node's output ports regardless of how close went
        let mut consumers = BTreeSet::new();
        for output in &node.outputs {
            for edge in &output.edges {
                if edge.close() {
                    consumers.insert(edge.consumer());
                }
            }
        }

        // destroy private state
        *node
            .calculator
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        node.cell().state = NodeState::Closed;
        self.profile(|| ProfileEvent::NodeClosed {
            node: node.name.clone(),
        });
        tracing::debug!(node = %node.name, "node closed");

        for consumer in consumers {
            self.notify_node(consumer);
        }
        self.note_node_closed();
    }

    fn note_node_closed(self: &Arc<Self>) {
        let finished = {
            let mut inner = self.lock_inner();
            inner.closed_nodes += 1;
            if inner.closed_nodes == self.nodes.len() {
                inner.done = true;
                true
            } else {
                false
            }
        };
        if finished {
            tracing::info!("graph done");
            self.cond.notify_all();
            self.notify_gate();
        }
    }

    fn fail_node(self: &Arc<Self>, node: &Arc<Node>, error: CalculatorError) {
        {
            node.cell().state = NodeState::Failing;
        }
        self.record_error(Error::Graph(GraphError::Node {
            node: node.name.clone(),
            source: error,
        }));
        // the failing node was opened, so it still gets its close
        self.schedule_close(node.index);
    }

    /// Drain buffered emissions into the downstream channels. Returns the
    /// set of consumer nodes that saw a change.
    fn flush_outputs(
        self: &Arc<Self>,
        node: &Arc<Node>,
        scratch: &mut OutputScratch,
    ) -> Result<BTreeSet<usize>, CalculatorError> {
        let mut consumers = BTreeSet::new();
        for (index, port) in scratch.ports.iter_mut().enumerate() {
            let output = &node.outputs[index];
            for packet in port.packets.drain(..) {
                self.profile(|| ProfileEvent::PacketAdded {
                    stream: output.stream.to_string(),
                    timestamp: packet.timestamp(),
                });
                for edge in &output.edges {
                    match edge.add_packet(packet.clone()) {
                        Ok(AddOutcome::Queued) => {}
                        Ok(AddOutcome::DroppedOldest(dropped)) => {
                            self.profile(|| ProfileEvent::PacketDropped {
                                stream: output.stream.to_string(),
                                timestamp: dropped,
                            });
                        }
                        Err(error) => return Err(CalculatorError::Stream(error)),
                    }
                    consumers.insert(edge.consumer());
                }
            }
            if let Some(bound) = port.bound.take() {
                for edge in &output.edges {
                    if edge.set_bound(bound) {
                        consumers.insert(edge.consumer());
                    }
                }
            }
            if port.close {
                for edge in &output.edges {
                    if edge.close() {
                        consumers.insert(edge.consumer());
                    }
                }
            }
        }
        Ok(consumers)
    }
}
