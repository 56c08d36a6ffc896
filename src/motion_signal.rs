//! Motion Signal (D): a one-slot rendezvous between the Motion Detector
//! Worker (E, producer) and the Event Processor Worker (F, consumer).
//!
//! Grounded on `examples/original_source/motion_event.py`'s `MotionEvent`
//! (a `threading.Event` plus a small data dict under a lock), realized here
//! as a condvar + `Option` slot - the idiomatic Rust equivalent of a
//! single-shot Python `Event` carrying a payload.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use chrono::{DateTime, Utc};
use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy)]
pub struct MotionEventData {
    pub event_id: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Slot {
    data: Option<MotionEventData>,
}

pub struct MotionSignal {
    slot: Mutex<Slot>,
    condvar: Condvar,
}

impl Default for MotionSignal {
    fn default() -> Self {
        MotionSignal::new()
    }
}

impl MotionSignal {
    pub fn new() -> Self {
        MotionSignal {
            slot: Mutex::new(Slot::default()),
            condvar: Condvar::new(),
        }
    }

    /// Called by E when motion is detected. Non-blocking. If a previous
    /// signal has not yet been consumed by F, it is overwritten and
    /// discarded with a warning - per spec, this is an accepted silent drop
    /// (the event record is still durable in the store and will be
    /// completed whenever the next signal arrives), not an error. In
    /// steady-state operation the cooldown guarantees this never happens.
    pub fn set(&self, event_id: u64, timestamp: DateTime<Utc>) {
        let mut slot = self.slot.lock().unwrap();
        if let Some(stale) = slot.data.replace(MotionEventData {
            event_id,
            timestamp,
        }) {
            log::warn!(
                "motion signal overwritten before being consumed: event_id={} dropped",
                stale.event_id
            );
        }
        self.condvar.notify_one();
    }

    /// Blocks until a signal is pending, then atomically consumes it.
    pub fn wait_and_consume(&self) -> MotionEventData {
        let mut slot = self.slot.lock().unwrap();
        loop {
            if let Some(data) = slot.data.take() {
                return data;
            }
            slot = self.condvar.wait(slot).unwrap();
        }
    }

    #[cfg(test)]
    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap().data.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_then_consume_roundtrips_payload() {
        let signal = MotionSignal::new();
        signal.set(42, Utc::now());
        let data = signal.wait_and_consume();
        assert_eq!(data.event_id, 42);
        assert!(!signal.is_pending());
    }

    #[test]
    fn overwrite_keeps_newest_value() {
        let signal = MotionSignal::new();
        signal.set(1, Utc::now());
        signal.set(2, Utc::now());
        let data = signal.wait_and_consume();
        assert_eq!(data.event_id, 2);
    }

    #[test]
    fn consumer_blocks_until_producer_signals() {
        let signal = Arc::new(MotionSignal::new());
        let producer = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            producer.set(7, Utc::now());
        });
        let data = signal.wait_and_consume();
        assert_eq!(data.event_id, 7);
        handle.join().unwrap();
    }
}
