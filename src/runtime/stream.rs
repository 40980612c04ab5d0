//! Per-edge packet channels.
//!
//! Every edge (producer port -> consumer port) is one channel: a FIFO of
//! packets plus the monotone `next_timestamp_bound`. The bound is how a
//! consumer learns that the absence of data at a timestamp is definitive.
//! An output port that feeds several consumers fans out to one channel per
//! consumer, which is what gives each reader its own cursor.
//!
//! Channels are passive: callers (ingress and the scheduler) decide whom to
//! notify after a mutation. The lock guards only the append/cursor update,
//! never user code.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::core::{DeclaredType, OnFull, Packet, Timestamp};

use super::error::StreamError;

/// What `add_packet` did with the queue.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    /// Queued (or, for an empty packet, only the bound advanced).
    Queued,
    /// Queue was at capacity; the oldest packet was evicted.
    DroppedOldest(Timestamp),
}

pub(crate) struct InputChannel {
    stream: Arc<str>,
    consumer: usize,
    declared: DeclaredType,
    cap: Option<usize>,
    on_full: OnFull,
    state: Mutex<ChannelState>,
}

struct ChannelState {
    queue: VecDeque<Packet>,
    bound: Timestamp,
    header: Option<Packet>,
    dropped: u64,
}

impl InputChannel {
    pub(crate) fn new(
        stream: Arc<str>,
        consumer: usize,
        declared: DeclaredType,
        cap: Option<usize>,
        on_full: OnFull,
    ) -> InputChannel {
        InputChannel {
            stream,
            consumer,
            declared,
            cap,
            on_full,
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                bound: Timestamp::UNSTARTED,
                header: None,
                dropped: 0,
            }),
        }
    }

    /// Index of the node reading this channel.
    pub(crate) fn consumer(&self) -> usize {
        self.consumer
    }

    pub(crate) fn declared(&self) -> DeclaredType {
        self.declared
    }

    /// Append a packet. Timestamps must be strictly increasing per channel;
    /// the bound advances past the packet. Empty packets advance the bound
    /// without queueing.
    pub(crate) fn add_packet(&self, packet: Packet) -> Result<AddOutcome, StreamError> {
        let timestamp = packet.timestamp();
        if !timestamp.is_allowed_in_stream() {
            return Err(StreamError::InvalidTimestamp {
                stream: self.stream.to_string(),
                timestamp,
            });
        }
        let mut state = self.lock_state();
        if state.bound == Timestamp::DONE {
            return Err(StreamError::Closed {
                stream: self.stream.to_string(),
            });
        }
        if timestamp < state.bound {
            return Err(StreamError::TimestampRegression {
                stream: self.stream.to_string(),
                timestamp,
                bound: state.bound,
            });
        }
        state.bound = timestamp.next_allowed_in_stream();
        if packet.is_empty() {
            return Ok(AddOutcome::Queued);
        }
        let mut outcome = AddOutcome::Queued;
        if let Some(cap) = self.cap
            && self.on_full == OnFull::DropOldest
            && state.queue.len() >= cap
            && let Some(evicted) = state.queue.pop_front()
        {
            state.dropped += 1;
            outcome = AddOutcome::DroppedOldest(evicted.timestamp());
        }
        state.queue.push_back(packet);
        Ok(outcome)
    }

    /// Publish "no packet will arrive before `bound`". Monotonic upward;
    /// lower or equal values are ignored. `DONE` closes the channel.
    ///
    /// Returns whether the bound actually moved.
    pub(crate) fn set_bound(&self, bound: Timestamp) -> bool {
        let mut state = self.lock_state();
        if bound <= state.bound {
            return false;
        }
        state.bound = bound;
        true
    }

    /// Close for appends forever.
    pub(crate) fn close(&self) -> bool {
        self.set_bound(Timestamp::DONE)
    }

    /// Head-of-queue timestamp and current bound, under one lock.
    pub(crate) fn cursor(&self) -> (Option<Timestamp>, Timestamp) {
        let state = self.lock_state();
        (state.queue.front().map(Packet::timestamp), state.bound)
    }

    pub(crate) fn peek(&self) -> Option<Packet> {
        self.lock_state().queue.front().cloned()
    }

    /// Pop the head iff it sits exactly at `timestamp`.
    pub(crate) fn pop_at(&self, timestamp: Timestamp) -> Option<Packet> {
        let mut state = self.lock_state();
        match state.queue.front() {
            Some(head) if head.timestamp() == timestamp => state.queue.pop_front(),
            _ => None,
        }
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// True while the queue is at or beyond its cap.
    pub(crate) fn over_cap(&self) -> bool {
        match self.cap {
            Some(cap) => self.lock_state().queue.len() >= cap,
            None => false,
        }
    }

    /// Whether external admission control should hold producers back for
    /// this queue. Drop-oldest queues shed load themselves.
    pub(crate) fn gates_ingress(&self) -> bool {
        self.cap.is_some() && self.on_full == OnFull::Block
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.lock_state().dropped
    }

    pub(crate) fn set_header(&self, header: Packet) {
        self.lock_state().header = Some(header);
    }

    pub(crate) fn header(&self) -> Option<Packet> {
        self.lock_state().header.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
