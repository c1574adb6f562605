//! Operational counters, published snapshot-and-reset.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use lib::types::TriggerType;
use metrics::counter;

/// The global delta counters of the orchestrator. Time-based counters
/// accumulate microseconds.
#[derive(Default)]
pub struct DfoCounters {
    pub received_tokens: AtomicU64,
    pub sent_decisions: AtomicU64,
    pub received_decisions: AtomicU64,
    pub waiting_for_decision: AtomicU64,
    pub deciding_destination: AtomicU64,
    pub forwarding_decision: AtomicU64,
    pub waiting_for_token: AtomicU64,
    pub processing_token: AtomicU64,
}

impl DfoCounters {
    pub fn zero(&self) {
        for counter in self.all() {
            counter.store(0, Ordering::SeqCst);
        }
    }

    pub fn publish(&self) {
        for (name, counter) in [
            ("dfo.received_tokens", &self.received_tokens),
            ("dfo.sent_decisions", &self.sent_decisions),
            ("dfo.received_decisions", &self.received_decisions),
            ("dfo.waiting_for_decision_us", &self.waiting_for_decision),
            ("dfo.deciding_destination_us", &self.deciding_destination),
            ("dfo.forwarding_decision_us", &self.forwarding_decision),
            ("dfo.waiting_for_token_us", &self.waiting_for_token),
            ("dfo.processing_token_us", &self.processing_token),
        ] {
            counter!(name, counter.swap(0, Ordering::SeqCst));
        }
    }

    fn all(&self) -> [&AtomicU64; 8] {
        [
            &self.received_tokens,
            &self.sent_decisions,
            &self.received_decisions,
            &self.waiting_for_decision,
            &self.deciding_destination,
            &self.forwarding_decision,
            &self.waiting_for_token,
            &self.processing_token,
        ]
    }
}

#[derive(Default)]
pub struct TypeCounts {
    pub received: AtomicU64,
    pub completed: AtomicU64,
}

/// Per-trigger-type counters. The mutex only guards key insertion and bulk
/// publication; increments on an existing key go through the atomics.
#[derive(Default)]
pub struct TriggerCounters {
    counters: Mutex<BTreeMap<TriggerType, Arc<TypeCounts>>>,
}

impl TriggerCounters {
    pub fn counts_for(&self, trigger_type: TriggerType) -> Arc<TypeCounts> {
        self.counters
            .lock()
            .unwrap()
            .entry(trigger_type)
            .or_default()
            .clone()
    }

    pub fn publish(&self) {
        let counters = self.counters.lock().unwrap();
        for (trigger_type, counts) in counters.iter() {
            counter!(
                "dfo.trigger_decisions.received",
                counts.received.swap(0, Ordering::SeqCst),
                "type" => trigger_type.name()
            );
            counter!(
                "dfo.trigger_decisions.completed",
                counts.completed.swap(0, Ordering::SeqCst),
                "type" => trigger_type.name()
            );
        }
    }

    pub fn clear(&self) {
        self.counters.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_share_a_single_entry_per_type() {
        let counters = TriggerCounters::default();
        counters
            .counts_for(TriggerType::Timing)
            .received
            .fetch_add(1, Ordering::SeqCst);
        counters
            .counts_for(TriggerType::Timing)
            .received
            .fetch_add(1, Ordering::SeqCst);

        assert_eq!(
            2,
            counters
                .counts_for(TriggerType::Timing)
                .received
                .load(Ordering::SeqCst)
        );
        counters.clear();
        assert_eq!(
            0,
            counters
                .counts_for(TriggerType::Timing)
                .received
                .load(Ordering::SeqCst)
        );
    }

    #[test]
    fn zero_resets_every_delta() {
        let counters = DfoCounters::default();
        counters.sent_decisions.fetch_add(3, Ordering::SeqCst);
        counters.waiting_for_token.fetch_add(17, Ordering::SeqCst);
        counters.zero();
        assert_eq!(0, counters.sent_decisions.load(Ordering::SeqCst));
        assert_eq!(0, counters.waiting_for_token.load(Ordering::SeqCst));
    }
}
