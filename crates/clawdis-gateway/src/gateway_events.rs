//! Event sequencing and resume/gap recovery.
//!
//! Each client instance has a monotonic sequence and a bounded ring of
//! recent frames. A reconnect supplies `lastSeq`: frames still buffered are
//! replayed; anything older than the ring produces a gap report so the
//! client refreshes its state instead of trusting a hole.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use clawdis_core::unix_time_ms;
use serde::Serialize;
use serde_json::Value;

/// Frames retained per instance for resume.
pub const EVENT_HISTORY_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, PartialEq)]
/// Public struct `EventFrame` used across Clawdis components.
pub struct EventFrame {
    pub seq: u64,
    pub event: String,
    pub payload: Value,
    pub ts: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Enumerates supported `ResumeOutcome` values.
pub enum ResumeOutcome {
    /// Client is new or asked for a fresh stream.
    Fresh,
    /// All requested frames are still buffered.
    Replay(Vec<EventFrame>),
    /// The ring no longer covers `lastSeq + 1`; replay resumes at the
    /// oldest retained frame after the reported gap.
    Gap {
        expected: u64,
        received: u64,
        replay: Vec<EventFrame>,
    },
}

#[derive(Debug)]
struct InstanceHistory {
    next_seq: u64,
    ring: VecDeque<EventFrame>,
    capacity: usize,
}

impl InstanceHistory {
    fn new(capacity: usize) -> Self {
        Self {
            next_seq: 1,
            ring: VecDeque::new(),
            capacity,
        }
    }

    fn record(&mut self, event: &str, payload: Value) -> EventFrame {
        let frame = EventFrame {
            seq: self.next_seq,
            event: event.to_string(),
            payload,
            ts: unix_time_ms(),
        };
        self.next_seq += 1;
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(frame.clone());
        frame
    }

    fn resume(&self, last_seq: u64) -> ResumeOutcome {
        let expected = last_seq + 1;
        if expected >= self.next_seq {
            return ResumeOutcome::Fresh;
        }
        let Some(oldest) = self.ring.front().map(|frame| frame.seq) else {
            return ResumeOutcome::Gap {
                expected,
                received: self.next_seq,
                replay: Vec::new(),
            };
        };
        if expected >= oldest {
            let replay = self
                .ring
                .iter()
                .filter(|frame| frame.seq >= expected)
                .cloned()
                .collect();
            ResumeOutcome::Replay(replay)
        } else {
            ResumeOutcome::Gap {
                expected,
                received: oldest,
                replay: self.ring.iter().cloned().collect(),
            }
        }
    }
}

#[derive(Debug)]
/// Per-instance event histories, shared across reconnects.
pub struct ResumeLedger {
    instances: Mutex<HashMap<String, InstanceHistory>>,
    capacity: usize,
}

impl Default for ResumeLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResumeLedger {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Stamps an event for one instance, assigning the next sequence.
    pub fn record(&self, instance_id: &str, event: &str, payload: Value) -> EventFrame {
        let mut instances = self.instances.lock().expect("resume ledger poisoned");
        let history = instances
            .entry(instance_id.to_string())
            .or_insert_with(|| InstanceHistory::new(self.capacity));
        history.record(event, payload)
    }

    /// Resolves a reconnect's `lastSeq` against the retained ring.
    pub fn resume(&self, instance_id: &str, last_seq: Option<u64>) -> ResumeOutcome {
        let instances = self.instances.lock().expect("resume ledger poisoned");
        match (instances.get(instance_id), last_seq) {
            (Some(history), Some(last_seq)) => history.resume(last_seq),
            _ => ResumeOutcome::Fresh,
        }
    }

    pub fn current_seq(&self, instance_id: &str) -> u64 {
        let instances = self.instances.lock().expect("resume ledger poisoned");
        instances
            .get(instance_id)
            .map(|history| history.next_seq.saturating_sub(1))
            .unwrap_or(0)
    }
}
