//! Bounded ring buffer of recently received channel events.
//!
//! A diagnostic surface, not part of the sync contract: the buffer is
//! injected where it is needed (no process-wide ambient state), holds at
//! most `capacity` events with the oldest evicted first, and is lost on
//! restart by design.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_DEBUG_CAPACITY: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct DebugEvent {
    pub received_at: DateTime<Utc>,
    pub event: String,
    pub data: Value,
}

pub struct DebugEventBuffer {
    capacity: usize,
    events: Mutex<VecDeque<DebugEvent>>,
}

impl Default for DebugEventBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUG_CAPACITY)
    }
}

impl DebugEventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DebugEvent>> {
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn post(&self, event: impl Into<String>, data: Value) {
        let mut events = self.lock();
        events.push_back(DebugEvent {
            received_at: Utc::now(),
            event: event.into(),
            data,
        });
        while events.len() > self.capacity {
            events.pop_front();
        }
    }

    /// Retained events, newest first.
    pub fn recent(&self) -> Vec<DebugEvent> {
        self.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn posts_are_retained_newest_first() {
        let buffer = DebugEventBuffer::default();
        buffer.post("agent.created", json!({"id": "a1"}));
        buffer.post("agent.updated", json!({"id": "a1"}));

        let recent = buffer.recent();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].event, "agent.updated");
        assert_eq!(recent[1].event, "agent.created");
    }

    #[test]
    fn overflow_keeps_exactly_the_newest_capacity_events() {
        let buffer = DebugEventBuffer::default();
        for i in 0..35 {
            buffer.post("tick", json!({"seq": i}));
        }

        let recent = buffer.recent();
        assert_eq!(recent.len(), DEFAULT_DEBUG_CAPACITY);
        // Newest first: 34 down to 15.
        assert_eq!(recent[0].data["seq"], 34);
        assert_eq!(recent[19].data["seq"], 15);
    }

    #[test]
    fn custom_capacity_is_honored() {
        let buffer = DebugEventBuffer::new(3);
        for i in 0..5 {
            buffer.post("tick", json!(i));
        }
        let recent = buffer.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].data, json!(4));
        assert_eq!(recent[2].data, json!(2));
    }

    #[test]
    fn reset_clears_everything() {
        let buffer = DebugEventBuffer::default();
        buffer.post("tick", json!(1));
        assert!(!buffer.is_empty());

        buffer.reset();
        assert!(buffer.is_empty());
        assert!(buffer.recent().is_empty());
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let buffer = DebugEventBuffer::new(0);
        buffer.post("tick", json!(1));
        buffer.post("tock", json!(2));
        let recent = buffer.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].event, "tock");
    }
}
