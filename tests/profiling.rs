//! Profiler hook: engine events reach the sink off the critical path.

use std::sync::{Arc, Mutex, Once};

use sluice::{
    Graph, GraphConfig, NodeConfig, Packet, ProfileEvent, ProfileSink, Timestamp,
};

struct Recorder {
    events: Mutex<Vec<ProfileEvent>>,
}

impl ProfileSink for Recorder {
    fn on_event(&self, event: ProfileEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn setup() {
    static ONCE: Once = Once::new();
    ONCE.call_once(sluice::calculators::register_builtin);
}

#[test]
fn engine_events_are_delivered_to_the_sink() {
    setup();
    let config = GraphConfig::new().input_stream("in").node(
        NodeConfig::new("forward", "PassThroughCalculator")
            .input("IN", "in")
            .output("OUT", "out"),
    );
    let graph = Graph::load(config).unwrap();
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
    });
    graph.set_profiler(recorder.clone(), 256).unwrap();
    graph.start().unwrap();

    graph
        .add_packet_to_stream("in", Packet::new(1i64, Timestamp::new(1)))
        .unwrap();
    graph.close_all_sources().unwrap();
    graph.wait_until_done().unwrap();
    assert_eq!(graph.dropped_profile_events(), 0);
    drop(graph);

    // delivery is asynchronous; wait for the final event to land
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let delivered = recorder.events.lock().unwrap().iter().any(|e| {
            matches!(e, ProfileEvent::NodeClosed { node } if node == "forward")
        });
        if delivered || std::time::Instant::now() > deadline {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let events = recorder.events.lock().unwrap();
    let forward_opened = events
        .iter()
        .filter(|e| matches!(e, ProfileEvent::NodeOpened { node } if node == "forward"))
        .count();
    assert_eq!(forward_opened, 1);
    assert!(events.iter().any(|e| matches!(
        e,
        ProfileEvent::PacketAdded { stream, .. } if stream == "in"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ProfileEvent::InvocationStart { node, .. } if node == "forward"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ProfileEvent::InvocationEnd { node, .. } if node == "forward"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        ProfileEvent::NodeClosed { node } if node == "forward"
    )));
}
