//! Profiling hooks.
//!
//! The engine emits coarse events at node and stream boundaries. Delivery
//! happens on a dedicated thread behind a bounded channel so an installed
//! sink can never perturb the critical path; when the sink falls behind,
//! events are counted and dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam::channel::{Sender, TrySendError};

use crate::core::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProfilePhase {
    Open,
    Process,
    Close,
}

#[derive(Clone, Debug)]
pub enum ProfileEvent {
    NodeOpened {
        node: String,
    },
    NodeClosed {
        node: String,
    },
    InvocationStart {
        node: String,
        phase: ProfilePhase,
        timestamp: Timestamp,
    },
    InvocationEnd {
        node: String,
        phase: ProfilePhase,
        timestamp: Timestamp,
    },
    PacketAdded {
        stream: String,
        timestamp: Timestamp,
    },
    PacketDropped {
        stream: String,
        timestamp: Timestamp,
    },
}

/// Receives engine events on the profiler's delivery thread.
pub trait ProfileSink: Send + Sync {
    fn on_event(&self, event: ProfileEvent);
}

pub(crate) struct Profiler {
    tx: Option<Sender<ProfileEvent>>,
    handle: Option<JoinHandle<()>>,
    dropped: Arc<AtomicU64>,
}

impl Profiler {
    pub(crate) fn new(sink: Arc<dyn ProfileSink>, capacity: usize) -> Profiler {
        let (tx, rx) = crossbeam::channel::bounded::<ProfileEvent>(capacity.max(1));
        let handle = std::thread::Builder::new()
            .name("sluice-profiler".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    sink.on_event(event);
                }
            })
            .ok();
        Profiler {
            tx: Some(tx),
            handle,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn emit(&self, event: ProfileEvent) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    pub(crate) fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Profiler {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder {
        events: Mutex<Vec<ProfileEvent>>,
    }

    impl ProfileSink for Recorder {
        fn on_event(&self, event: ProfileEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn events_reach_the_sink_off_thread() {
        let recorder = Arc::new(Recorder {
            events: Mutex::new(Vec::new()),
        });
        let profiler = Profiler::new(recorder.clone(), 8);
        profiler.emit(ProfileEvent::NodeOpened {
            node: "n".to_string(),
        });
        profiler.emit(ProfileEvent::PacketAdded {
            stream: "s".to_string(),
            timestamp: Timestamp::new(1),
        });
        drop(profiler); // joins the delivery thread
        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ProfileEvent::NodeOpened { .. }));
    }
}
