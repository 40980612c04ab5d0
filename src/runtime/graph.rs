//! The whole runtime instance: topology, validation, lifecycle, ingress.
//!
//! `load` validates the configuration and resolves every contract without
//! running user code; `start` materializes channels, executors and nodes,
//! opens calculators in topological order, and hands control to the
//! scheduler. External producers then feed named input streams until they
//! close them (or the graph is cancelled).

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::config::{BackpressureMode, ExecutorConfig, GraphConfig};
use crate::core::{CalculatorContract, DeclaredType, Packet, PacketError, Timestamp};
use crate::error::Error;

use super::calculator::{Calculator, ContractRequest, FactoryFn, lookup_calculator};
use super::context::{CalculatorContext, ServiceSet, SidePacketSet};
use super::error::{CalculatorError, ConfigError, GraphError, StreamError};
use super::executor::{Executor, ThreadPoolExecutor};
use super::handler::HandlerPolicy;
use super::node::{Node, NodeEnv, OutputEdges};
use super::profile::{ProfileEvent, ProfileSink, Profiler};
use super::scheduler::SchedCore;
use super::stream::{AddOutcome, InputChannel};

const OBSERVER_INPUT_TAG: &str = "PACKET";
const GRAPH_INPUT: &str = "<graph input>";
const EXTERNAL: &str = "<external>";

/// Validated per-node plan, produced by `load`, materialized by `start`.
struct NodePlan {
    name: String,
    contract: CalculatorContract,
    policy: HandlerPolicy,
    executor: usize,
    options: serde_json::Value,
    /// Stream name per contract input port.
    input_streams: Vec<String>,
    /// Stream name per contract output port.
    output_streams: Vec<String>,
    /// Side-packet name per contract input side packet (None: optional,
    /// unbound).
    side_inputs: Vec<Option<String>>,
    /// Side-packet name per contract output side packet.
    side_outputs: Vec<String>,
    rank: usize,
    factory: FactoryFn,
}

struct Observer {
    stream: String,
    callback: Box<dyn FnMut(Packet) + Send>,
}

/// Internal sink node wrapping one user callback. Being an ordinary node
/// buys per-stream callback ordering and the `wait_until_done` barrier.
struct ObserverCalculator {
    callback: Box<dyn FnMut(Packet) + Send>,
}

impl Calculator for ObserverCalculator {
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        if let Some(packet) = ctx.inputs().get(0)
            && !packet.is_empty()
        {
            (self.callback)(packet.clone());
        }
        Ok(())
    }
}

struct SourceState {
    bound: Timestamp,
    closed: bool,
}

/// A graph input stream as seen by external producers.
struct SourceStream {
    name: Arc<str>,
    edges: Vec<Arc<InputChannel>>,
    state: Mutex<SourceState>,
}

impl SourceStream {
    fn lock_state(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Loaded,
    Started,
    CancelledBeforeStart,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph").finish_non_exhaustive()
    }
}

pub struct Graph {
    plans: Vec<NodePlan>,
    input_stream_names: Vec<String>,
    stream_names: HashSet<String>,
    executor_slots: Vec<(String, ExecutorConfig)>,
    backpressure: BackpressureMode,
    default_queue_cap: usize,
    side_producers: HashMap<String, String>,

    side_packets: Mutex<HashMap<String, Packet>>,
    headers: Mutex<HashMap<String, Packet>>,
    services: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    observers: Mutex<Vec<Observer>>,
    custom_executors: Mutex<HashMap<String, Arc<dyn Executor>>>,
    profiler_sink: Mutex<Option<(Arc<dyn ProfileSink>, usize)>>,

    core: OnceLock<Arc<SchedCore>>,
    sources: OnceLock<HashMap<String, Arc<SourceStream>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Graph {
    /// Parse the topology, resolve contracts and validate the graph. Runs
    /// no user calculator code; on error no partial graph is left behind.
    pub fn load(config: GraphConfig) -> Result<Graph, Error> {
        let mut executor_slots = vec![("default".to_string(), config.executor.clone())];
        for (name, cfg) in &config.executors {
            executor_slots.push((name.clone(), cfg.clone()));
        }

        // producer table: stream -> (producer name, declared type)
        let mut producers: HashMap<String, (String, DeclaredType)> = HashMap::new();
        let mut stream_names: HashSet<String> = HashSet::new();
        for stream in &config.input_streams {
            if !stream_names.insert(stream.clone()) {
                return Err(ConfigError::DuplicateProducer {
                    stream: stream.clone(),
                    first: GRAPH_INPUT.to_string(),
                    second: GRAPH_INPUT.to_string(),
                }
                .into());
            }
            producers.insert(stream.clone(), (GRAPH_INPUT.to_string(), DeclaredType::Any));
        }

        let mut names: HashSet<String> = HashSet::new();
        let mut plans: Vec<NodePlan> = Vec::with_capacity(config.nodes.len());

        for node_cfg in &config.nodes {
            if !names.insert(node_cfg.name.clone()) {
                return Err(ConfigError::DuplicateNodeName {
                    name: node_cfg.name.clone(),
                }
                .into());
            }
            let entry = lookup_calculator(&node_cfg.calculator).ok_or_else(|| {
                ConfigError::UnknownCalculator {
                    node: node_cfg.name.clone(),
                    calculator: node_cfg.calculator.clone(),
                }
            })?;
            let contract = (entry.contract)(&ContractRequest {
                node: &node_cfg.name,
                options: &node_cfg.options,
            })?;
            check_unique_tags(&node_cfg.name, &contract)?;

            // Data enters through graph input streams only; a node with no
            // inputs is legal solely as a side-packet generator.
            if contract.inputs().is_empty() && contract.output_side_packets().is_empty() {
                return Err(ConfigError::NoInputs {
                    node: node_cfg.name.clone(),
                }
                .into());
            }

            let policy = HandlerPolicy::resolve(
                &node_cfg.name,
                node_cfg.handler.as_ref(),
                contract.input_stream_handler(),
            )?;

            let executor = match &node_cfg.executor {
                None => 0,
                Some(name) => executor_slots
                    .iter()
                    .position(|(slot, _)| slot == name)
                    .ok_or_else(|| ConfigError::UnknownExecutor {
                        node: node_cfg.name.clone(),
                        executor: name.clone(),
                    })?,
            };

            // bindings: both directions must match the contract exactly
            for binding in &node_cfg.inputs {
                if contract.input_index(&binding.tag).is_none() {
                    return Err(ConfigError::UnknownTag {
                        node: node_cfg.name.clone(),
                        tag: binding.tag.clone(),
                    }
                    .into());
                }
            }
            for binding in &node_cfg.outputs {
                if contract.output_index(&binding.tag).is_none() {
                    return Err(ConfigError::UnknownTag {
                        node: node_cfg.name.clone(),
                        tag: binding.tag.clone(),
                    }
                    .into());
                }
            }
            let input_streams = contract
                .inputs()
                .iter()
                .map(|port| {
                    node_cfg
                        .inputs
                        .iter()
                        .find(|b| b.tag == port.tag)
                        .map(|b| b.stream.clone())
                        .ok_or_else(|| ConfigError::UnboundPort {
                            node: node_cfg.name.clone(),
                            tag: port.tag.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let output_streams = contract
                .outputs()
                .iter()
                .map(|port| {
                    node_cfg
                        .outputs
                        .iter()
                        .find(|b| b.tag == port.tag)
                        .map(|b| b.stream.clone())
                        .ok_or_else(|| ConfigError::UnboundPort {
                            node: node_cfg.name.clone(),
                            tag: port.tag.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            for binding in &node_cfg.input_side_packets {
                if !contract
                    .input_side_packets()
                    .iter()
                    .any(|s| s.tag == binding.tag)
                {
                    return Err(ConfigError::UnknownTag {
                        node: node_cfg.name.clone(),
                        tag: binding.tag.clone(),
                    }
                    .into());
                }
            }
            for binding in &node_cfg.output_side_packets {
                if !contract
                    .output_side_packets()
                    .iter()
                    .any(|s| s.tag == binding.tag)
                {
                    return Err(ConfigError::UnknownTag {
                        node: node_cfg.name.clone(),
                        tag: binding.tag.clone(),
                    }
                    .into());
                }
            }
            let side_inputs = contract
                .input_side_packets()
                .iter()
                .map(|spec| {
                    let bound = node_cfg
                        .input_side_packets
                        .iter()
                        .find(|b| b.tag == spec.tag)
                        .map(|b| b.name.clone());
                    match (bound, spec.optional) {
                        (Some(name), _) => Ok(Some(name)),
                        (None, true) => Ok(None),
                        (None, false) => Err(ConfigError::UnboundPort {
                            node: node_cfg.name.clone(),
                            tag: spec.tag.clone(),
                        }),
                    }
                })
                .collect::<Result<Vec<_>, _>>()?;
            let side_outputs = contract
                .output_side_packets()
                .iter()
                .map(|spec| {
                    node_cfg
                        .output_side_packets
                        .iter()
                        .find(|b| b.tag == spec.tag)
                        .map(|b| b.name.clone())
                        .ok_or_else(|| ConfigError::UnboundPort {
                            node: node_cfg.name.clone(),
                            tag: spec.tag.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;

            // register this node's stream productions
            for (port, stream) in contract.outputs().iter().zip(&output_streams) {
                if let Some((first, _)) = producers.get(stream) {
                    return Err(ConfigError::DuplicateProducer {
                        stream: stream.clone(),
                        first: first.clone(),
                        second: node_cfg.name.clone(),
                    }
                    .into());
                }
                stream_names.insert(stream.clone());
                producers.insert(stream.clone(), (node_cfg.name.clone(), port.declared));
            }

            plans.push(NodePlan {
                name: node_cfg.name.clone(),
                contract,
                policy,
                executor,
                options: node_cfg.options.clone(),
                input_streams,
                output_streams,
                side_inputs,
                side_outputs,
                rank: 0,
                factory: entry.factory,
            });
        }

        // every consumed stream has a producer of a compatible type
        for plan in &plans {
            for (port, stream) in plan.contract.inputs().iter().zip(&plan.input_streams) {
                let Some((producer, produced)) = producers.get(stream) else {
                    return Err(ConfigError::MissingProducer {
                        node: plan.name.clone(),
                        tag: port.tag.clone(),
                        stream: stream.clone(),
                    }
                    .into());
                };
                if !produced.compatible_with(&port.declared) {
                    return Err(ConfigError::TypeMismatch {
                        stream: stream.clone(),
                        producer: producer.clone(),
                        produced: produced.name(),
                        consumer: plan.name.clone(),
                        expected: port.declared.name(),
                    }
                    .into());
                }
            }
        }

        // side packets: single producer per name, compatible link types
        let mut side_producers: HashMap<String, (String, DeclaredType)> = HashMap::new();
        for plan in &plans {
            for (spec, name) in plan
                .contract
                .output_side_packets()
                .iter()
                .zip(&plan.side_outputs)
            {
                if let Some((first, _)) = side_producers.get(name) {
                    return Err(ConfigError::DuplicateSidePacketProducer {
                        name: name.clone(),
                        first: first.clone(),
                        second: plan.name.clone(),
                    }
                    .into());
                }
                side_producers.insert(name.clone(), (plan.name.clone(), spec.declared));
            }
        }
        for plan in &plans {
            for (spec, binding) in plan
                .contract
                .input_side_packets()
                .iter()
                .zip(&plan.side_inputs)
            {
                if let Some(name) = binding
                    && let Some((producer, produced)) = side_producers.get(name)
                    && !produced.compatible_with(&spec.declared)
                {
                    return Err(ConfigError::TypeMismatch {
                        stream: name.clone(),
                        producer: producer.clone(),
                        produced: produced.name(),
                        consumer: plan.name.clone(),
                        expected: spec.declared.name(),
                    }
                    .into());
                }
            }
        }

        assign_ranks(&mut plans, &producers)?;

        Ok(Graph {
            input_stream_names: config.input_streams.clone(),
            stream_names,
            executor_slots,
            backpressure: config.backpressure,
            default_queue_cap: config.default_queue_cap,
            side_producers: side_producers
                .into_iter()
                .map(|(name, (producer, _))| (name, producer))
                .collect(),
            plans,
            side_packets: Mutex::new(HashMap::new()),
            headers: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
            custom_executors: Mutex::new(HashMap::new()),
            profiler_sink: Mutex::new(None),
            core: OnceLock::new(),
            sources: OnceLock::new(),
            lifecycle: Mutex::new(Lifecycle::Loaded),
        })
    }

    // ---- pre-start configuration ----------------------------------------

    /// Supply external side packets. Frozen once `start` runs.
    pub fn set_side_packets(
        &self,
        packets: impl IntoIterator<Item = (String, Packet)>,
    ) -> Result<(), Error> {
        self.require_loaded()?;
        let mut map = self.lock(&self.side_packets);
        for (name, packet) in packets {
            map.insert(name, packet);
        }
        Ok(())
    }

    /// Attach header packets to named streams, visible to consumers via
    /// their invocation context.
    pub fn set_stream_headers(
        &self,
        headers: impl IntoIterator<Item = (String, Packet)>,
    ) -> Result<(), Error> {
        self.require_loaded()?;
        let mut map = self.lock(&self.headers);
        for (name, packet) in headers {
            if !self.stream_names.contains(&name) {
                return Err(GraphError::UnknownStream { stream: name }.into());
            }
            map.insert(name, packet);
        }
        Ok(())
    }

    /// Provide a service singleton requested by some contract.
    pub fn set_service(
        &self,
        name: impl Into<String>,
        service: Arc<dyn Any + Send + Sync>,
    ) -> Result<(), Error> {
        self.require_loaded()?;
        self.lock(&self.services).insert(name.into(), service);
        Ok(())
    }

    /// Replace a named executor slot with a caller-supplied implementation.
    pub fn set_executor(
        &self,
        name: impl Into<String>,
        executor: Arc<dyn Executor>,
    ) -> Result<(), Error> {
        self.require_loaded()?;
        let name = name.into();
        if !self.executor_slots.iter().any(|(slot, _)| *slot == name) {
            return Err(ConfigError::UnknownExecutor {
                node: "<graph>".to_string(),
                executor: name,
            }
            .into());
        }
        self.lock(&self.custom_executors).insert(name, executor);
        Ok(())
    }

    /// Install a profiling sink; events are delivered on a dedicated thread.
    pub fn set_profiler(
        &self,
        sink: Arc<dyn ProfileSink>,
        queue_capacity: usize,
    ) -> Result<(), Error> {
        self.require_loaded()?;
        *self.lock(&self.profiler_sink) = Some((sink, queue_capacity));
        Ok(())
    }

    /// Register a packet callback on any named stream. The runtime invokes
    /// it from an executor thread, in per-stream order; `wait_until_done`
    /// does not return before all pending callbacks finished.
    pub fn attach_observer(
        &self,
        stream: impl Into<String>,
        callback: impl FnMut(Packet) + Send + 'static,
    ) -> Result<(), Error> {
        self.require_loaded()?;
        let stream = stream.into();
        if !self.stream_names.contains(&stream) {
            return Err(GraphError::UnknownStream { stream }.into());
        }
        self.lock(&self.observers).push(Observer {
            stream,
            callback: Box::new(callback),
        });
        Ok(())
    }

    // ---- lifecycle -------------------------------------------------------

    /// Open every node in topological order and hand control to the
    /// scheduler. Returns once the graph is running.
    pub fn start(&self) -> Result<(), Error> {
        {
            let mut lifecycle = self.lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Loaded => *lifecycle = Lifecycle::Started,
                Lifecycle::Started => {
                    return Err(GraphError::precondition("graph already started").into());
                }
                Lifecycle::CancelledBeforeStart => {
                    return Err(GraphError::Cancelled.into());
                }
            }
        }

        let side_map = self.lock(&self.side_packets).clone();
        if let Err(error) = self.validate_start_requirements(&side_map) {
            // leave the graph loadable so the caller can supply what's missing
            *self.lock(&self.lifecycle) = Lifecycle::Loaded;
            return Err(error);
        }
        let observers = std::mem::take(&mut *self.lock(&self.observers));

        // channels, keyed by stream name
        let mut channels_by_stream: HashMap<String, Vec<Arc<InputChannel>>> = HashMap::new();
        let total_nodes = self.plans.len() + observers.len();
        let mut node_inputs: Vec<Vec<Arc<InputChannel>>> = Vec::with_capacity(total_nodes);

        for (index, plan) in self.plans.iter().enumerate() {
            let cap = plan.policy.queue_cap().or(if self.default_queue_cap > 0 {
                Some(self.default_queue_cap)
            } else {
                None
            });
            let mut inputs = Vec::with_capacity(plan.contract.inputs().len());
            for (port, stream) in plan.contract.inputs().iter().zip(&plan.input_streams) {
                let channel = Arc::new(InputChannel::new(
                    Arc::from(stream.as_str()),
                    index,
                    port.declared,
                    cap,
                    plan.policy.on_full(),
                ));
                channels_by_stream
                    .entry(stream.clone())
                    .or_default()
                    .push(Arc::clone(&channel));
                inputs.push(channel);
            }
            node_inputs.push(inputs);
        }
        for (offset, observer) in observers.iter().enumerate() {
            let channel = Arc::new(InputChannel::new(
                Arc::from(observer.stream.as_str()),
                self.plans.len() + offset,
                DeclaredType::Any,
                None,
                crate::core::OnFull::Block,
            ));
            channels_by_stream
                .entry(observer.stream.clone())
                .or_default()
                .push(Arc::clone(&channel));
            node_inputs.push(vec![channel]);
        }

        // headers
        {
            let headers = self.lock(&self.headers);
            for (stream, packet) in headers.iter() {
                if let Some(channels) = channels_by_stream.get(stream) {
                    for channel in channels {
                        channel.set_header(packet.clone());
                    }
                }
            }
        }

        // graph input streams
        let mut sources = HashMap::new();
        for stream in &self.input_stream_names {
            sources.insert(
                stream.clone(),
                Arc::new(SourceStream {
                    name: Arc::from(stream.as_str()),
                    edges: channels_by_stream.get(stream).cloned().unwrap_or_default(),
                    state: Mutex::new(SourceState {
                        bound: Timestamp::UNSTARTED,
                        closed: false,
                    }),
                }),
            );
        }

        // executors
        let custom = self.lock(&self.custom_executors).clone();
        let mut executors: Vec<Arc<dyn Executor>> = Vec::with_capacity(self.executor_slots.len());
        for (name, cfg) in &self.executor_slots {
            match custom.get(name) {
                Some(executor) => executors.push(Arc::clone(executor)),
                None => {
                    let pool =
                        ThreadPoolExecutor::new(&format!("sluice-{name}"), cfg).map_err(|err| {
                            GraphError::ExecutorSpawn {
                                name: name.clone(),
                                message: err.to_string(),
                            }
                        })?;
                    executors.push(Arc::new(pool));
                }
            }
        }

        // nodes
        let mut rank_order: Vec<usize> = (0..total_nodes).collect();
        let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(total_nodes);
        let mut node_inputs = node_inputs.into_iter();
        for (index, plan) in self.plans.iter().enumerate() {
            let inputs = node_inputs.next().unwrap_or_default();
            let outputs = plan
                .output_streams
                .iter()
                .map(|stream| OutputEdges {
                    stream: Arc::from(stream.as_str()),
                    edges: channels_by_stream.get(stream).cloned().unwrap_or_default(),
                })
                .collect();
            nodes.push(Arc::new(Node::new(
                index,
                plan.name.clone(),
                plan.rank,
                plan.contract.clone(),
                plan.policy,
                plan.executor,
                plan.options.clone(),
                inputs,
                outputs,
                (plan.factory)(),
            )));
        }
        for (offset, observer) in observers.into_iter().enumerate() {
            let index = self.plans.len() + offset;
            let mut contract = CalculatorContract::new();
            contract.input_any(OBSERVER_INPUT_TAG);
            let inputs = node_inputs.next().unwrap_or_default();
            nodes.push(Arc::new(Node::new(
                index,
                format!("__observer_{offset}_{}", observer.stream),
                self.plans.len() + offset,
                contract,
                HandlerPolicy::Immediate,
                0,
                serde_json::Value::Null,
                inputs,
                Vec::new(),
                Box::new(ObserverCalculator {
                    callback: observer.callback,
                }),
            )));
        }
        rank_order.sort_by_key(|&i| nodes[i].rank);

        let core = SchedCore::new(nodes, self.executor_slots.len());
        core.set_executors(executors);
        if let Some((sink, capacity)) = self.lock(&self.profiler_sink).take() {
            core.set_profiler(Profiler::new(sink, capacity));
        }
        let _ = self.core.set(Arc::clone(&core));
        let _ = self.sources.set(sources);

        // open in topological order; side packets produced by generators
        // become visible to later nodes
        let services = ServiceSet::new(self.lock(&self.services).clone());
        for &index in &rank_order {
            let node = Arc::clone(&core.nodes[index]);
            let env = match self.resolve_env(index, &services) {
                Ok(env) => env,
                Err(error) => {
                    return self.abort_start(&core, &node.name, error);
                }
            };
            let _ = node.env.set(env);
            match core.run_open(&node) {
                Ok(produced) => {
                    if index < self.plans.len() {
                        let plan = &self.plans[index];
                        let mut map = self.lock(&self.side_packets);
                        for (side_index, packet) in produced {
                            map.insert(plan.side_outputs[side_index].clone(), packet);
                        }
                    }
                }
                Err(error) => {
                    return self.abort_start(&core, &node.name, error);
                }
            }
        }

        core.start_running();
        tracing::info!(nodes = core.nodes.len(), "graph started");
        Ok(())
    }

    /// Synchronous wrapper: start, then wait for completion. Only useful
    /// for graphs driven entirely by generators, headers and side packets,
    /// or ones whose sources are closed by an observer callback.
    pub fn run(&self) -> Result<(), Error> {
        self.start()?;
        self.wait_until_done()
    }

    // ---- ingress / egress ------------------------------------------------

    /// Feed one packet into a graph input stream.
    pub fn add_packet_to_stream(&self, stream: &str, packet: Packet) -> Result<(), Error> {
        let core = self.running_core()?;
        let source = self.source(stream)?;

        let timestamp = packet.timestamp();
        if !timestamp.is_allowed_in_stream() {
            return Err(StreamError::InvalidTimestamp {
                stream: stream.to_string(),
                timestamp,
            }
            .into());
        }
        {
            let state = source.lock_state();
            if state.closed {
                return Err(StreamError::Closed {
                    stream: stream.to_string(),
                }
                .into());
            }
            if timestamp < state.bound {
                return Err(StreamError::TimestampRegression {
                    stream: stream.to_string(),
                    timestamp,
                    bound: state.bound,
                }
                .into());
            }
        }
        if let Some(tag) = packet.type_tag() {
            for edge in &source.edges {
                if !edge.declared().accepts(&tag) {
                    return Err(PacketError::TypeMismatch {
                        expected: edge.declared().name(),
                        actual: tag.name(),
                    }
                    .into());
                }
            }
        }

        // admission control
        let _gate = match self.backpressure {
            BackpressureMode::WaitTillNotFull => Some(core.block_till_not_full(&source.edges)?),
            BackpressureMode::AddIfNotFull => {
                if source
                    .edges
                    .iter()
                    .any(|edge| edge.gates_ingress() && edge.over_cap())
                {
                    return Err(GraphError::QueueFull {
                        stream: stream.to_string(),
                    }
                    .into());
                }
                None
            }
        };

        {
            let mut state = source.lock_state();
            state.bound = timestamp.next_allowed_in_stream();
        }
        let mut consumers = BTreeSet::new();
        for edge in &source.edges {
            match edge.add_packet(packet.clone()) {
                Ok(AddOutcome::Queued) => {}
                Ok(AddOutcome::DroppedOldest(dropped)) => {
                    core.profile(|| ProfileEvent::PacketDropped {
                        stream: source.name.to_string(),
                        timestamp: dropped,
                    });
                }
                Err(error) => return Err(error.into()),
            }
            consumers.insert(edge.consumer());
        }
        core.profile(|| ProfileEvent::PacketAdded {
            stream: source.name.to_string(),
            timestamp,
        });
        drop(_gate);

        for consumer in consumers {
            core.notify_node(consumer);
        }
        Ok(())
    }

    /// Publish "no packet below `bound` will be fed" without data.
    pub fn set_input_stream_timestamp_bound(
        &self,
        stream: &str,
        bound: Timestamp,
    ) -> Result<(), Error> {
        let core = self.running_core()?;
        let source = self.source(stream)?;
        {
            let mut state = source.lock_state();
            if state.closed {
                return Err(StreamError::Closed {
                    stream: stream.to_string(),
                }
                .into());
            }
            if bound <= state.bound {
                return Ok(());
            }
            state.bound = bound;
        }
        let mut consumers = BTreeSet::new();
        for edge in &source.edges {
            if edge.set_bound(bound) {
                consumers.insert(edge.consumer());
            }
        }
        for consumer in consumers {
            core.notify_node(consumer);
        }
        Ok(())
    }

    /// Close one graph input stream. Idempotent.
    pub fn close_input_stream(&self, stream: &str) -> Result<(), Error> {
        let core = self.started_core()?;
        let source = self.source(stream)?;
        {
            let mut state = source.lock_state();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.bound = Timestamp::DONE;
        }
        tracing::debug!(stream, "input stream closed");
        let mut consumers = BTreeSet::new();
        for edge in &source.edges {
            if edge.close() {
                consumers.insert(edge.consumer());
            }
        }
        for consumer in consumers {
            core.notify_node(consumer);
        }
        Ok(())
    }

    /// Close every graph input stream; the orderly-drain shutdown path.
    pub fn close_all_sources(&self) -> Result<(), Error> {
        for stream in &self.input_stream_names {
            self.close_input_stream(stream)?;
        }
        Ok(())
    }

    // ---- waiting and cancellation ---------------------------------------

    /// Block until no work is queued or in flight. More input may arrive
    /// afterwards.
    pub fn wait_until_idle(&self) -> Result<(), Error> {
        self.started_core()?.wait_until_idle()
    }

    /// Block until the graph fully closed; returns the first error, or
    /// `Cancelled` after `cancel()`.
    pub fn wait_until_done(&self) -> Result<(), Error> {
        if *self.lock(&self.lifecycle) == Lifecycle::CancelledBeforeStart {
            return Err(GraphError::Cancelled.into());
        }
        self.started_core()?.wait_until_done()
    }

    /// Abrupt stop: in-flight invocations finish, every opened node still
    /// gets `close`, no new `process` work is dispatched. Idempotent.
    pub fn cancel(&self) {
        {
            let mut lifecycle = self.lock(&self.lifecycle);
            if *lifecycle == Lifecycle::Loaded {
                *lifecycle = Lifecycle::CancelledBeforeStart;
                return;
            }
            if *lifecycle == Lifecycle::CancelledBeforeStart {
                return;
            }
        }
        if let Some(core) = self.core.get() {
            core.cancel();
        }
    }

    /// Dropped profiler events, if a profiler was installed.
    pub fn dropped_profile_events(&self) -> u64 {
        self.core.get().map_or(0, |core| core.profiler_dropped())
    }

    // ---- internals -------------------------------------------------------

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_loaded(&self) -> Result<(), Error> {
        match *self.lock(&self.lifecycle) {
            Lifecycle::Loaded => Ok(()),
            Lifecycle::Started => {
                Err(GraphError::precondition("graph already started").into())
            }
            Lifecycle::CancelledBeforeStart => Err(GraphError::Cancelled.into()),
        }
    }

    fn started_core(&self) -> Result<&Arc<SchedCore>, Error> {
        self.core
            .get()
            .ok_or_else(|| GraphError::precondition("graph has not been started").into())
    }

    /// Like `started_core`, additionally refusing ingress once the graph is
    /// cancelled, failed or done.
    fn running_core(&self) -> Result<&Arc<SchedCore>, Error> {
        let core = self.started_core()?;
        if core.is_cancelled() {
            return Err(GraphError::Cancelled.into());
        }
        if core.is_draining() || core.is_done() {
            return Err(GraphError::precondition("graph is shutting down").into());
        }
        Ok(core)
    }

    fn source(&self, stream: &str) -> Result<Arc<SourceStream>, Error> {
        self.sources
            .get()
            .and_then(|map| map.get(stream))
            .cloned()
            .ok_or_else(|| {
                GraphError::UnknownStream {
                    stream: stream.to_string(),
                }
                .into()
            })
    }

    /// Side-packet and service requirements are only checkable at start,
    /// when external supplies are known.
    fn validate_start_requirements(
        &self,
        side_map: &HashMap<String, Packet>,
    ) -> Result<(), Error> {
        let services = self.lock(&self.services);
        for plan in &self.plans {
            for (spec, binding) in plan
                .contract
                .input_side_packets()
                .iter()
                .zip(&plan.side_inputs)
            {
                let Some(name) = binding else { continue };
                let supplied = side_map.contains_key(name);
                let produced = self.side_producers.contains_key(name);
                if supplied && produced {
                    return Err(ConfigError::DuplicateSidePacketProducer {
                        name: name.clone(),
                        first: EXTERNAL.to_string(),
                        second: self.side_producers[name].clone(),
                    }
                    .into());
                }
                if !supplied && !produced {
                    if spec.optional {
                        continue;
                    }
                    return Err(ConfigError::MissingSidePacket {
                        node: plan.name.clone(),
                        tag: spec.tag.clone(),
                        name: name.clone(),
                    }
                    .into());
                }
                if supplied
                    && let Some(tag) = side_map[name].type_tag()
                    && !spec.declared.accepts(&tag)
                {
                    return Err(ConfigError::TypeMismatch {
                        stream: name.clone(),
                        producer: EXTERNAL.to_string(),
                        produced: tag.name(),
                        consumer: plan.name.clone(),
                        expected: spec.declared.name(),
                    }
                    .into());
                }
            }
            for service in plan.contract.services() {
                if !services.contains_key(service) {
                    return Err(ConfigError::MissingService {
                        node: plan.name.clone(),
                        service: service.clone(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Bind side packets for one node from the (possibly generator-updated)
    /// side map.
    fn resolve_env(&self, index: usize, services: &ServiceSet) -> Result<NodeEnv, CalculatorError> {
        if index >= self.plans.len() {
            // observer node
            return Ok(NodeEnv {
                side_packets: SidePacketSet::default(),
                services: services.clone(),
            });
        }
        let plan = &self.plans[index];
        let map = self.lock(&self.side_packets);
        let mut by_tag = HashMap::new();
        for (spec, binding) in plan
            .contract
            .input_side_packets()
            .iter()
            .zip(&plan.side_inputs)
        {
            let Some(name) = binding else { continue };
            match map.get(name) {
                Some(packet) => {
                    if let Some(tag) = packet.type_tag()
                        && !spec.declared.accepts(&tag)
                    {
                        return Err(CalculatorError::Packet(PacketError::TypeMismatch {
                            expected: spec.declared.name(),
                            actual: tag.name(),
                        }));
                    }
                    by_tag.insert(spec.tag.clone(), packet.clone());
                }
                None if spec.optional => {}
                None => {
                    return Err(CalculatorError::msg(format!(
                        "required side packet `{name}` was not produced before `{}` opened",
                        plan.name
                    )));
                }
            }
        }
        Ok(NodeEnv {
            side_packets: SidePacketSet::new(by_tag),
            services: services.clone(),
        })
    }

    fn abort_start(
        &self,
        core: &Arc<SchedCore>,
        node: &str,
        error: CalculatorError,
    ) -> Result<(), Error> {
        let error = Error::Graph(GraphError::Node {
            node: node.to_string(),
            source: error,
        });
        core.record_error(error.clone());
        core.close_all_sync();
        Err(error)
    }
}

fn check_unique_tags(node: &str, contract: &CalculatorContract) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for port in contract.inputs() {
        if !seen.insert(&port.tag) {
            return Err(ConfigError::DuplicateTag {
                node: node.to_string(),
                tag: port.tag.clone(),
            });
        }
    }
    seen.clear();
    for port in contract.outputs() {
        if !seen.insert(&port.tag) {
            return Err(ConfigError::DuplicateTag {
                node: node.to_string(),
                tag: port.tag.clone(),
            });
        }
    }
    seen.clear();
    for spec in contract
        .input_side_packets()
        .iter()
        .chain(contract.output_side_packets())
    {
        if !seen.insert(&spec.tag) {
            return Err(ConfigError::DuplicateTag {
                node: node.to_string(),
                tag: spec.tag.clone(),
            });
        }
    }
    Ok(())
}

/// Topological ranks via Kahn's algorithm over stream and side-packet
/// edges. Rejects cyclic graphs.
fn assign_ranks(
    plans: &mut [NodePlan],
    producers: &HashMap<String, (String, DeclaredType)>,
) -> Result<(), Error> {
    let index_by_name: HashMap<&str, usize> = plans
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.as_str(), i))
        .collect();

    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); plans.len()];
    let mut indegree = vec![0usize; plans.len()];

    let mut side_producer_index: HashMap<&str, usize> = HashMap::new();
    for (i, plan) in plans.iter().enumerate() {
        for name in &plan.side_outputs {
            side_producer_index.insert(name.as_str(), i);
        }
    }

    for (i, plan) in plans.iter().enumerate() {
        for stream in &plan.input_streams {
            if let Some((producer, _)) = producers.get(stream)
                && let Some(&p) = index_by_name.get(producer.as_str())
                && successors[p].insert(i)
            {
                indegree[i] += 1;
            }
        }
        for binding in plan.side_inputs.iter().flatten() {
            if let Some(&p) = side_producer_index.get(binding.as_str())
                && successors[p].insert(i)
            {
                indegree[i] += 1;
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..plans.len()).filter(|&i| indegree[i] == 0).collect();
    let mut next_rank = 0usize;
    let mut ranked = vec![false; plans.len()];
    while let Some(i) = queue.pop_front() {
        plans[i].rank = next_rank;
        ranked[i] = true;
        next_rank += 1;
        for &succ in &successors[i] {
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                queue.push_back(succ);
            }
        }
    }
    if next_rank != plans.len() {
        let mut cycle: Vec<String> = plans
            .iter()
            .enumerate()
            .filter(|(i, _)| !ranked[*i])
            .map(|(_, p)| p.name.clone())
            .collect();
        cycle.sort();
        return Err(ConfigError::Cycle { nodes: cycle }.into());
    }
    Ok(())
}
