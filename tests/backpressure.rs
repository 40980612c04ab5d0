//! Queue caps and admission control: blocking ingress, non-blocking
//! ingress, and the drop-oldest sub-policy.

use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use sluice::{
    BackpressureMode, Calculator, CalculatorContext, CalculatorContract, CalculatorError,
    ConfigError, ContractRequest, Executor, Graph, GraphConfig, HandlerChoice, InlineExecutor,
    NodeConfig, OnFull, Packet, Timestamp, register_calculator,
};

type Recorder = Arc<Mutex<Vec<i64>>>;

struct SlowCalculator;

fn slow_contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    let mut contract = CalculatorContract::new();
    contract
        .input::<i64>("IN")
        .output::<i64>("OUT")
        .require_side_packet::<Recorder>("REC");
    Ok(contract)
}

fn slow_factory() -> Box<dyn Calculator> {
    Box::new(SlowCalculator)
}

impl Calculator for SlowCalculator {
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        std::thread::sleep(Duration::from_millis(20));
        let packet = ctx.inputs().tag("IN")?;
        let value = *packet.value_as::<i64>()?;
        ctx.side_packets()
            .get("REC")
            .ok_or_else(|| CalculatorError::msg("recorder missing"))?
            .value_as::<Recorder>()?
            .lock()
            .unwrap()
            .push(value);
        let ts = ctx.input_timestamp();
        ctx.outputs().tag("OUT")?.add(value, ts)
    }
}

struct DrainCalculator;

fn drain_contract(_req: &ContractRequest<'_>) -> Result<CalculatorContract, ConfigError> {
    let mut contract = CalculatorContract::new();
    contract
        .input::<i64>("IN")
        .require_side_packet::<Recorder>("REC");
    Ok(contract)
}

fn drain_factory() -> Box<dyn Calculator> {
    Box::new(DrainCalculator)
}

impl Calculator for DrainCalculator {
    fn process(&mut self, ctx: &mut CalculatorContext<'_>) -> Result<(), CalculatorError> {
        let packet = ctx.inputs().tag("IN")?;
        if !packet.is_empty() {
            ctx.side_packets()
                .get("REC")
                .ok_or_else(|| CalculatorError::msg("recorder missing"))?
                .value_as::<Recorder>()?
                .lock()
                .unwrap()
                .push(*packet.value_as::<i64>()?);
        }
        Ok(())
    }
}

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        register_calculator("SlowCalculator", slow_contract, slow_factory);
        register_calculator("DrainCalculator", drain_contract, drain_factory);
    });
}

fn recorder_packet(recorder: &Recorder) -> (String, Packet) {
    (
        "recorder".to_string(),
        Packet::new(Arc::clone(recorder), Timestamp::UNSTARTED),
    )
}

#[test]
fn wait_till_not_full_blocks_the_producer_until_the_consumer_drains() {
    setup();
    let mut config = GraphConfig::new().input_stream("src").node(
        NodeConfig::new("slow", "SlowCalculator")
            .input("IN", "src")
            .output("OUT", "out")
            .input_side_packet("REC", "recorder"),
    );
    config.default_queue_cap = 2;
    config.backpressure = BackpressureMode::WaitTillNotFull;
    config.executor.workers = 2;

    let graph = Graph::load(config).unwrap();
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    graph.set_side_packets([recorder_packet(&recorder)]).unwrap();
    graph.start().unwrap();

    let started = Instant::now();
    for i in 0..10i64 {
        graph
            .add_packet_to_stream("src", Packet::new(i, Timestamp::new(i)))
            .unwrap();
    }
    let produce_elapsed = started.elapsed();

    graph.close_all_sources().unwrap();
    graph.wait_until_done().unwrap();

    // 10 packets through a cap-2 queue behind a 20ms consumer: the producer
    // must have been held back for most of the run
    assert!(
        produce_elapsed >= Duration::from_millis(60),
        "producer finished too fast: {produce_elapsed:?}"
    );
    assert_eq!(*recorder.lock().unwrap(), (0..10).collect::<Vec<i64>>());
}

#[test]
fn add_if_not_full_returns_queue_full_instead_of_blocking() {
    setup();
    let mut config = GraphConfig::new().input_stream("src").node(
        NodeConfig::new("drain", "DrainCalculator")
            .input("IN", "src")
            .input_side_packet("REC", "recorder"),
    );
    config.default_queue_cap = 1;
    config.backpressure = BackpressureMode::AddIfNotFull;

    let graph = Graph::load(config).unwrap();
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    graph.set_side_packets([recorder_packet(&recorder)]).unwrap();
    let inline = Arc::new(InlineExecutor::new());
    graph.set_executor("default", Arc::clone(&inline) as Arc<dyn Executor>).unwrap();
    graph.start().unwrap();

    graph
        .add_packet_to_stream("src", Packet::new(1i64, Timestamp::new(1)))
        .unwrap();
    // nothing polled yet, so the queue is still at its cap
    let err = graph
        .add_packet_to_stream("src", Packet::new(2i64, Timestamp::new(2)))
        .unwrap_err();
    assert!(matches!(
        err,
        sluice::Error::Graph(sluice::GraphError::QueueFull { .. })
    ));
    assert!(err.transience().is_retryable());

    inline.run_until_idle();
    graph
        .add_packet_to_stream("src", Packet::new(3i64, Timestamp::new(3)))
        .unwrap();
    graph.close_all_sources().unwrap();
    inline.run_until_idle();
    graph.wait_until_done().unwrap();

    assert_eq!(*recorder.lock().unwrap(), vec![1, 3]);
}

#[test]
fn fixed_size_drop_oldest_keeps_the_newest_packets() {
    setup();
    let config = GraphConfig::new().input_stream("src").node(
        NodeConfig::new("drain", "DrainCalculator")
            .input("IN", "src")
            .input_side_packet("REC", "recorder")
            .handler(HandlerChoice::fixed_size(2, OnFull::DropOldest)),
    );
    let graph = Graph::load(config).unwrap();
    let recorder: Recorder = Arc::new(Mutex::new(Vec::new()));
    graph.set_side_packets([recorder_packet(&recorder)]).unwrap();
    let inline = Arc::new(InlineExecutor::new());
    graph.set_executor("default", Arc::clone(&inline) as Arc<dyn Executor>).unwrap();
    graph.start().unwrap();

    for i in 1..=3i64 {
        graph
            .add_packet_to_stream("src", Packet::new(i, Timestamp::new(i)))
            .unwrap();
    }
    graph.close_all_sources().unwrap();
    inline.run_until_idle();
    graph.wait_until_done().unwrap();

    // the packet at t=1 was evicted when t=3 arrived
    assert_eq!(*recorder.lock().unwrap(), vec![2, 3]);
}
