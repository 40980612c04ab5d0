//! Graph lifecycle: orderly drain, cancellation, failure propagation,
//! API misuse statuses.

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use sluice::{
    Calculator, CalculatorContext, CalculatorContract, CalculatorError, ConfigError,
    ContractRequest, Graph, GraphConfig, GraphError, NodeConfig, Packet, StreamError, Timestamp,
    register_calculator,
};

type Recorder = Arc<Mutex<Vec<String>>>;
type StartSignal = Arc<(Sender<Timestamp>, Receiver<Timestamp>)>;

/// Sleeps per invocation and reports entry-point activity through side
/// packets, so tests can synchronize with the scheduler.
struct NapCalculator;

fn nap_contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    let mut contract = CalculatorContract::new();
    contract
        .input::<i64>("IN")
        .require_side_packet::<Recorder>("REC")
        .require_side_packet::<StartSignal>("STARTS");
    Ok(contract)
}

fn nap_factory() -> Box<dyn Calculator> {
    Box::new(NapCalculator)
}

impl Calculator for NapCalculator {
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        let t = ctx.input_timestamp();
        ctx.side_packets()
            .get("STARTS")
            .ok_or_else(|| CalculatorError::msg("signal missing"))?
            .value_as::<StartSignal>()?
            .0
            .send(t)
            .map_err(|_| CalculatorError::msg("signal receiver gone"))?;
        std::thread::sleep(Duration::from_millis(100));
        record(ctx, format!("process@{t}"))
    }

    fn close(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        record(ctx, "close".to_string())
    }
}

fn record(ctx: &CalculatorContext<'_>, entry: String) -> Result<(), CalculatorError> {
    ctx.side_packets()
        .get("REC")
        .ok_or_else(|| CalculatorError::msg("recorder missing"))?
        .value_as::<Recorder>()?
        .lock()
        .unwrap()
        .push(entry);
    Ok(())
}

/// Emits at a fixed timestamp, violating per-port monotonicity on the
/// second invocation.
struct RegressingCalculator {
    invocations: u32,
}

fn regressing_contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    let mut contract = CalculatorContract::new();
    contract.input::<i64>("IN").output::<i64>("OUT");
    Ok(contract)
}

fn regressing_factory() -> Box<dyn Calculator> {
    Box::new(RegressingCalculator { invocations: 0 })
}

impl Calculator for RegressingCalculator {
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        self.invocations += 1;
        let at = if self.invocations == 1 { 7 } else { 5 };
        ctx.outputs().tag("OUT")?.add(0i64, Timestamp::new(at))
    }
}

/// Two inputs, no outputs; keeps a graph alive while one source closes.
struct SinkPairCalculator;

fn sink_pair_contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    let mut contract = CalculatorContract::new();
    contract.input::<i64>("IN").input::<i64>("AUX");
    Ok(contract)
}

fn sink_pair_factory() -> Box<dyn Calculator> {
    Box::new(SinkPairCalculator)
}

impl Calculator for SinkPairCalculator {
    fn process(&mut self, _ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        Ok(())
    }
}

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        sluice::calculators::register_builtin();
        register_calculator("NapCalculator", nap_contract, nap_factory);
        register_calculator(
            "RegressingCalculator",
            regressing_contract,
            regressing_factory,
        );
        register_calculator("SinkPairCalculator", sink_pair_contract, sink_pair_factory);
    });
}

#[test]
fn orderly_drain_closes_everything_and_releases_packets() {
    setup();
    let config = GraphConfig::new().input_stream("in").node(
        NodeConfig::new("forward", "PassThroughCalculator")
            .input("IN", "in")
            .output("OUT", "out"),
    );
    let graph = Graph::load(config).unwrap();
    let observed = Arc::new(Mutex::new(0usize));
    {
        let observed = Arc::clone(&observed);
        graph
            .attach_observer("out", move |packet| {
                packet.value_as::<Arc<Vec<u8>>>().unwrap();
                *observed.lock().unwrap() += 1;
            })
            .unwrap();
    }
    graph.start().unwrap();

    let payload = Arc::new(vec![0u8; 64]);
    for i in 1..=3i64 {
        graph
            .add_packet_to_stream("in", Packet::new(Arc::clone(&payload), Timestamp::new(i)))
            .unwrap();
    }
    graph.close_all_sources().unwrap();
    graph.wait_until_done().unwrap();

    assert_eq!(*observed.lock().unwrap(), 3);
    // every queue drained, every calculator dropped: no packet leaks
    assert_eq!(Arc::strong_count(&payload), 1);
}

#[test]
fn cancel_lets_the_inflight_invocation_finish_then_closes() {
    setup();
    let config = GraphConfig::new().input_stream("in").node(
        NodeConfig::new("nap", "NapCalculator")
            .input("IN", "in")
            .input_side_packet("REC", "recorder")
            .input_side_packet("STARTS", "starts"),
    );
    let graph = Graph::load(config).unwrap();
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    let signal: StartSignal = Arc::new(crossbeam::channel::unbounded());
    graph
        .set_side_packets([
            (
                "recorder".to_string(),
                Packet::new(Arc::clone(&recorder), Timestamp::UNSTARTED),
            ),
            (
                "starts".to_string(),
                Packet::new(Arc::clone(&signal), Timestamp::UNSTARTED),
            ),
        ])
        .unwrap();
    graph.start().unwrap();

    for i in 1..=3i64 {
        graph
            .add_packet_to_stream("in", Packet::new(i, Timestamp::new(i)))
            .unwrap();
    }
    // wait for the second invocation to begin, then cancel mid-sleep
    signal.1.recv_timeout(Duration::from_secs(5)).unwrap();
    signal.1.recv_timeout(Duration::from_secs(5)).unwrap();
    graph.cancel();
    graph.cancel(); // idempotent

    let err = graph.wait_until_done().unwrap_err();
    assert!(err.is_cancelled());

    let records = recorder.lock().unwrap();
    // the in-flight second invocation completed, the third never ran,
    // and close was still called
    assert_eq!(
        *records,
        vec![
            "process@1".to_string(),
            "process@2".to_string(),
            "close".to_string(),
        ]
    );

    // ingress after cancellation is refused
    drop(records);
    let err = graph
        .add_packet_to_stream("in", Packet::new(9i64, Timestamp::new(9)))
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn emitting_backwards_fails_the_node_and_surfaces_the_first_error() {
    setup();
    let config = GraphConfig::new().input_stream("in").node(
        NodeConfig::new("regress", "RegressingCalculator")
            .input("IN", "in")
            .output("OUT", "out"),
    );
    let graph = Graph::load(config).unwrap();
    graph.start().unwrap();

    graph
        .add_packet_to_stream("in", Packet::new(1i64, Timestamp::new(1)))
        .unwrap();
    graph
        .add_packet_to_stream("in", Packet::new(2i64, Timestamp::new(2)))
        .unwrap();

    let err = graph.wait_until_done().unwrap_err();
    match err {
        sluice::Error::Graph(GraphError::Node { node, source }) => {
            assert_eq!(node, "regress");
            assert!(matches!(
                source,
                CalculatorError::Stream(StreamError::TimestampMonotonicity { .. })
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn lifecycle_misuse_is_reported_not_panicked() {
    setup();
    let config = GraphConfig::new()
        .input_stream("in")
        .input_stream("aux")
        .node(
            NodeConfig::new("sink", "SinkPairCalculator")
                .input("IN", "in")
                .input("AUX", "aux"),
        );
    let graph = Graph::load(config).unwrap();

    // before start
    let err = graph
        .add_packet_to_stream("in", Packet::new(1i64, Timestamp::new(1)))
        .unwrap_err();
    assert!(matches!(
        err,
        sluice::Error::Graph(GraphError::FailedPrecondition { .. })
    ));

    graph.start().unwrap();
    let err = graph.start().unwrap_err();
    assert!(matches!(
        err,
        sluice::Error::Graph(GraphError::FailedPrecondition { .. })
    ));

    // unknown stream
    let err = graph
        .add_packet_to_stream("nope", Packet::new(1i64, Timestamp::new(1)))
        .unwrap_err();
    assert!(matches!(
        err,
        sluice::Error::Graph(GraphError::UnknownStream { .. })
    ));

    // closed stream; `aux` stays open so the graph is still running
    graph.close_input_stream("in").unwrap();
    graph.close_input_stream("in").unwrap(); // idempotent
    let err = graph
        .add_packet_to_stream("in", Packet::new(1i64, Timestamp::new(1)))
        .unwrap_err();
    assert!(matches!(
        err,
        sluice::Error::Stream(StreamError::Closed { .. })
    ));

    graph.close_all_sources().unwrap();
    graph.wait_until_done().unwrap();
}

#[test]
fn cancel_before_start_reports_cancelled() {
    setup();
    let config = GraphConfig::new().input_stream("in").node(
        NodeConfig::new("forward", "PassThroughCalculator")
            .input("IN", "in")
            .output("OUT", "out"),
    );
    let graph = Graph::load(config).unwrap();
    graph.cancel();
    let err = graph.wait_until_done().unwrap_err();
    assert!(err.is_cancelled());
    let err = graph.start().unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn run_is_start_plus_wait_for_generator_only_graphs() {
    setup();
    let config = GraphConfig::new().node(
        NodeConfig::new("constant", "ConstantSidePacketCalculator")
            .output_side_packet("PACKET", "constant")
            .options(serde_json::json!({"value": 42})),
    );
    let graph = Graph::load(config).unwrap();
    graph.run().unwrap();
}
