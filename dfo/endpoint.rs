//! Per-endpoint occupancy tracking and the registry the assignment policy
//! walks.
//!
//! One [`EndpointState`] mirrors what the orchestrator knows about a single
//! downstream trigger record builder: its outstanding assignments, its
//! busy/free hysteresis, its error mask and its completion latencies. The
//! [`EndpointRegistry`] keeps the states in registration order together
//! with the round-robin cursor.

use std::collections::VecDeque;
use std::sync::atomic::{
    AtomicBool,
    AtomicU32,
    AtomicU64,
    AtomicUsize,
    Ordering,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use lib::types::{TriggerDecision, TriggerNumber};
use metrics::{counter, gauge};

use crate::issues::{self, Issue};

/// Latency samples kept per endpoint for windowed averages.
const LATENCY_HISTORY_LIMIT: usize = 100;

/// Hook applied to the endpoint metadata blob on every completion.
pub type MetadataFn = dyn Fn(&mut serde_json::Value) + Send + Sync;

/// The binding of a decision to an endpoint plus its dispatch timestamp.
/// Owned jointly by the orchestrator and the target endpoint until the
/// matching token arrives or the run is drained.
#[derive(Debug, Clone)]
pub struct AssignedTriggerDecision {
    pub decision: TriggerDecision,
    pub connection_name: String,
    pub assigned_at: Instant,
}

#[derive(Debug)]
pub struct EndpointState {
    connection_name: String,
    busy_threshold: AtomicUsize,
    free_threshold: AtomicUsize,
    is_busy_flag: AtomicBool,
    // A fresh endpoint has announced itself but not yet proven it can
    // complete work; it stays masked until its first real token.
    in_error: AtomicBool,
    assigned: Mutex<VecDeque<Arc<AssignedTriggerDecision>>>,
    latency_history: Mutex<VecDeque<(Instant, Duration)>>,
    metadata: Mutex<serde_json::Value>,

    // monitoring
    complete_counter: AtomicU32,
    min_complete_time: AtomicU64,
    max_complete_time: AtomicU64,
    last_published: Mutex<Instant>,
}

impl EndpointState {
    pub fn new(
        connection_name: impl Into<String>,
        busy_threshold: usize,
        free_threshold: usize,
    ) -> Result<Self, Issue> {
        if busy_threshold < free_threshold {
            return Err(Issue::ThresholdsNotConsistent {
                busy: busy_threshold,
                free: free_threshold,
            });
        }
        Ok(Self {
            connection_name: connection_name.into(),
            busy_threshold: AtomicUsize::new(busy_threshold),
            free_threshold: AtomicUsize::new(free_threshold),
            is_busy_flag: AtomicBool::new(false),
            in_error: AtomicBool::new(true),
            assigned: Mutex::new(VecDeque::new()),
            latency_history: Mutex::new(VecDeque::new()),
            metadata: Mutex::new(serde_json::Value::Null),
            complete_counter: AtomicU32::new(0),
            min_complete_time: AtomicU64::new(u64::MAX),
            max_complete_time: AtomicU64::new(0),
            last_published: Mutex::new(Instant::now()),
        })
    }

    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn busy_threshold(&self) -> usize {
        self.busy_threshold.load(Ordering::SeqCst)
    }

    pub fn free_threshold(&self) -> usize {
        self.free_threshold.load(Ordering::SeqCst)
    }

    /// Thresholds are live-reconfigurable between runs.
    pub fn set_thresholds(
        &self,
        busy_threshold: usize,
        free_threshold: usize,
    ) -> Result<(), Issue> {
        if busy_threshold < free_threshold {
            return Err(Issue::ThresholdsNotConsistent {
                busy: busy_threshold,
                free: free_threshold,
            });
        }
        self.busy_threshold.store(busy_threshold, Ordering::SeqCst);
        self.free_threshold.store(free_threshold, Ordering::SeqCst);
        Ok(())
    }

    /// An endpoint in error counts as busy for assignment and aggregate
    /// back-pressure purposes.
    pub fn is_busy(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
            || self.is_busy_flag.load(Ordering::SeqCst)
    }

    pub fn is_in_error(&self) -> bool {
        self.in_error.load(Ordering::SeqCst)
    }

    pub fn set_in_error(&self, in_error: bool) {
        self.in_error.store(in_error, Ordering::SeqCst);
    }

    pub fn used_slots(&self) -> usize {
        self.assigned.lock().unwrap().len()
    }

    /// Binds `decision` to this endpoint with the current timestamp. The
    /// assignment is not tracked until [`add_assignment`] confirms the
    /// forward succeeded.
    ///
    /// [`add_assignment`]: EndpointState::add_assignment
    pub fn make_assignment(
        &self,
        decision: TriggerDecision,
    ) -> Arc<AssignedTriggerDecision> {
        Arc::new(AssignedTriggerDecision {
            decision,
            connection_name: self.connection_name.clone(),
            assigned_at: Instant::now(),
        })
    }

    pub fn add_assignment(&self, assignment: Arc<AssignedTriggerDecision>) {
        let mut assigned = self.assigned.lock().unwrap();
        assigned.push_back(assignment);
        if assigned.len() >= self.busy_threshold.load(Ordering::SeqCst) {
            self.is_busy_flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn get_assignment(
        &self,
        trigger_number: TriggerNumber,
    ) -> Option<Arc<AssignedTriggerDecision>> {
        self.assigned
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.decision.trigger_number == trigger_number)
            .cloned()
    }

    pub fn extract_assignment(
        &self,
        trigger_number: TriggerNumber,
    ) -> Option<Arc<AssignedTriggerDecision>> {
        let mut assigned = self.assigned.lock().unwrap();
        let position = assigned
            .iter()
            .position(|a| a.decision.trigger_number == trigger_number)?;
        let assignment = assigned.remove(position);
        if assigned.len() <= self.free_threshold.load(Ordering::SeqCst) {
            self.is_busy_flag.store(false, Ordering::SeqCst);
        }
        assignment
    }

    /// Removes the assignment matched by `trigger_number` and records its
    /// completion latency.
    pub fn complete_assignment(
        &self,
        trigger_number: TriggerNumber,
        metadata_fn: Option<&MetadataFn>,
    ) -> Result<Arc<AssignedTriggerDecision>, Issue> {
        let assignment = self.extract_assignment(trigger_number).ok_or_else(
            || Issue::AssignedTriggerDecisionNotFound {
                trigger_number,
                connection_name: self.connection_name.clone(),
            },
        )?;

        let completed_at = Instant::now();
        let latency =
            completed_at.saturating_duration_since(assignment.assigned_at);
        {
            let mut history = self.latency_history.lock().unwrap();
            if history.len() == LATENCY_HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back((completed_at, latency));
        }

        let micros = latency.as_micros() as u64;
        self.complete_counter.fetch_add(1, Ordering::SeqCst);
        self.min_complete_time.fetch_min(micros, Ordering::SeqCst);
        self.max_complete_time.fetch_max(micros, Ordering::SeqCst);

        if let Some(metadata_fn) = metadata_fn {
            metadata_fn(&mut self.metadata.lock().unwrap());
        }

        Ok(assignment)
    }

    /// Removes and returns every outstanding assignment; the endpoint is
    /// no longer busy afterwards.
    pub fn flush(&self) -> Vec<Arc<AssignedTriggerDecision>> {
        let mut assigned = self.assigned.lock().unwrap();
        self.is_busy_flag.store(false, Ordering::SeqCst);
        assigned.drain(..).collect()
    }

    /// Arithmetic mean over the latency samples completed at or after
    /// `since`; zero when there are none.
    pub fn average_latency(&self, since: Instant) -> Duration {
        let history = self.latency_history.lock().unwrap();
        let mut total = Duration::ZERO;
        let mut samples = 0u32;
        for (completed_at, latency) in history.iter() {
            if *completed_at >= since {
                total += *latency;
                samples += 1;
            }
        }
        if samples == 0 {
            Duration::ZERO
        } else {
            total / samples
        }
    }

    pub fn metadata(&self) -> serde_json::Value {
        self.metadata.lock().unwrap().clone()
    }

    /// Snapshot-and-reset publication of the per-endpoint counters.
    pub fn publish_opmon(&self) {
        let endpoint = self.connection_name.clone();
        gauge!(
            "dfo.endpoint.outstanding_decisions",
            self.used_slots() as f64,
            "endpoint" => endpoint.clone()
        );
        gauge!(
            "dfo.endpoint.in_error",
            u8::from(self.is_in_error()) as f64,
            "endpoint" => endpoint.clone()
        );

        let completed = self.complete_counter.swap(0, Ordering::SeqCst);
        counter!(
            "dfo.endpoint.completed_decisions",
            u64::from(completed),
            "endpoint" => endpoint.clone()
        );

        let min = self.min_complete_time.swap(u64::MAX, Ordering::SeqCst);
        let max = self.max_complete_time.swap(0, Ordering::SeqCst);
        if completed > 0 {
            gauge!(
                "dfo.endpoint.min_completion_time_us",
                min as f64,
                "endpoint" => endpoint.clone()
            );
            gauge!(
                "dfo.endpoint.max_completion_time_us",
                max as f64,
                "endpoint" => endpoint.clone()
            );
        }

        let since = {
            let mut last = self.last_published.lock().unwrap();
            std::mem::replace(&mut *last, Instant::now())
        };
        gauge!(
            "dfo.endpoint.average_completion_time_us",
            self.average_latency(since).as_micros() as f64,
            "endpoint" => endpoint
        );
    }
}

/// Registration-ordered endpoint map plus the persistent round-robin
/// cursor. Reshaped only from the token callback (lazy registration) and
/// from scrap.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: IndexMap<String, Arc<EndpointState>>,
    last_assignment_cursor: Option<usize>,
}

impl EndpointRegistry {
    pub fn insert(&mut self, state: Arc<EndpointState>) {
        self.endpoints
            .insert(state.connection_name().to_owned(), state);
    }

    pub fn get(&self, connection_name: &str) -> Option<&Arc<EndpointState>> {
        self.endpoints.get(connection_name)
    }

    pub fn contains(&self, connection_name: &str) -> bool {
        self.endpoints.contains_key(connection_name)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EndpointState>> {
        self.endpoints.values()
    }

    pub fn clear(&mut self) {
        self.endpoints.clear();
        self.last_assignment_cursor = None;
    }

    pub fn reset_cursor(&mut self) {
        self.last_assignment_cursor = None;
    }

    /// Aggregate back-pressure state: busy iff every endpoint is busy.
    /// An empty registry has no capacity at all and reports busy.
    pub fn is_busy(&self) -> bool {
        self.endpoints.values().all(|endpoint| endpoint.is_busy())
    }

    pub fn is_drained(&self) -> bool {
        self.endpoints
            .values()
            .all(|endpoint| endpoint.used_slots() == 0)
    }

    pub fn used_slots(&self) -> usize {
        self.endpoints
            .values()
            .map(|endpoint| endpoint.used_slots())
            .sum()
    }

    /// Round-robin slot selection.
    ///
    /// The walk starts at the entry after the cursor and probes each entry
    /// at most once. Endpoints in error are skipped. The first non-busy
    /// endpoint wins; if every usable endpoint is busy the decision is
    /// force-assigned to the least occupied one seen during the walk
    /// (earliest wins a tie). `None` means no usable endpoint exists and
    /// the caller has to retry. The cursor moves only when an assignment
    /// is actually made.
    pub fn find_slot(
        &mut self,
        decision: &TriggerDecision,
    ) -> Option<Arc<AssignedTriggerDecision>> {
        let len = self.endpoints.len();
        if len == 0 {
            return None;
        }
        let start = match self.last_assignment_cursor {
            Some(cursor) => (cursor + 1) % len,
            None => 0,
        };

        let mut minimum: Option<(usize, usize)> = None;
        for probe in 0..len {
            let index = (start + probe) % len;
            let (_, endpoint) = self.endpoints.get_index(index).unwrap();

            if endpoint.is_in_error() {
                continue;
            }

            let slots = endpoint.used_slots();
            if minimum.map_or(true, |(_, least)| slots < least) {
                minimum = Some((index, slots));
            }

            if endpoint.is_busy() {
                continue;
            }

            let assignment = endpoint.make_assignment(decision.clone());
            self.last_assignment_cursor = Some(index);
            return Some(assignment);
        }

        // Every usable endpoint is busy: force-assign to the least loaded.
        if let Some((index, slots)) = minimum {
            let (name, endpoint) = self.endpoints.get_index(index).unwrap();
            issues::report(&Issue::AssignedToBusyApp {
                trigger_number: decision.trigger_number,
                connection_name: name.clone(),
                used_slots: slots,
            });
            let assignment = endpoint.make_assignment(decision.clone());
            self.last_assignment_cursor = Some(index);
            return Some(assignment);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(trigger_number: TriggerNumber) -> TriggerDecision {
        TriggerDecision {
            trigger_number,
            run_number: 42,
            trigger_type: 1,
            trigger_timestamp: trigger_number * 1000,
            components: vec![],
        }
    }

    fn live_endpoint(name: &str, busy: usize, free: usize) -> EndpointState {
        let endpoint = EndpointState::new(name, busy, free).unwrap();
        endpoint.set_in_error(false);
        endpoint
    }

    fn occupy(endpoint: &EndpointState, triggers: std::ops::Range<u64>) {
        for trigger_number in triggers {
            let assignment =
                endpoint.make_assignment(decision(trigger_number));
            endpoint.add_assignment(assignment);
        }
    }

    #[test]
    fn inconsistent_thresholds_are_rejected() {
        let err = EndpointState::new("trb-01", 2, 5).unwrap_err();
        assert_eq!("DFOThresholdsNotConsistent", err.name());

        let endpoint = EndpointState::new("trb-01", 5, 3).unwrap();
        assert!(endpoint.set_thresholds(1, 4).is_err());
        // The failed update must not have touched the thresholds.
        assert_eq!(5, endpoint.busy_threshold());
        assert_eq!(3, endpoint.free_threshold());
    }

    #[test]
    fn new_endpoint_starts_in_error_and_busy() {
        let endpoint = EndpointState::new("trb-01", 5, 3).unwrap();
        assert!(endpoint.is_in_error());
        assert!(endpoint.is_busy());
        endpoint.set_in_error(false);
        assert!(!endpoint.is_busy());
    }

    #[test]
    fn hysteresis_is_sticky_inside_the_band() {
        let endpoint = live_endpoint("trb-01", 5, 3);

        occupy(&endpoint, 1..5);
        assert_eq!(4, endpoint.used_slots());
        assert!(!endpoint.is_busy());

        occupy(&endpoint, 5..6);
        assert!(endpoint.is_busy());

        // 5 -> 4 stays busy: still above the free threshold.
        endpoint.extract_assignment(1).unwrap();
        assert_eq!(4, endpoint.used_slots());
        assert!(endpoint.is_busy());

        // 4 -> 3 crosses the free threshold.
        endpoint.extract_assignment(2).unwrap();
        assert!(!endpoint.is_busy());

        // Climbing back to 4 inside the band stays free.
        occupy(&endpoint, 6..7);
        assert_eq!(4, endpoint.used_slots());
        assert!(!endpoint.is_busy());
    }

    #[test]
    fn completion_matches_by_trigger_number_and_records_latency() {
        let endpoint = live_endpoint("trb-01", 5, 3);
        let before = Instant::now();
        occupy(&endpoint, 1..4);
        std::thread::sleep(Duration::from_millis(2));

        let completed = endpoint.complete_assignment(2, None).unwrap();
        assert_eq!(2, completed.decision.trigger_number);
        assert_eq!(2, endpoint.used_slots());
        assert!(endpoint.get_assignment(2).is_none());
        assert!(endpoint.average_latency(before) >= Duration::from_millis(2));
        // Samples completed before `since` are not averaged in.
        assert_eq!(
            Duration::ZERO,
            endpoint.average_latency(Instant::now() + Duration::from_secs(1))
        );

        let err = endpoint.complete_assignment(2, None).unwrap_err();
        assert_eq!("AssignedTriggerDecisionNotFound", err.name());
    }

    #[test]
    fn completion_applies_the_metadata_hook() {
        let endpoint = live_endpoint("trb-01", 5, 3);
        occupy(&endpoint, 1..2);

        endpoint
            .complete_assignment(
                1,
                Some(&|metadata: &mut serde_json::Value| {
                    *metadata = serde_json::json!({ "completed": 1 });
                }),
            )
            .unwrap();
        assert_eq!(
            serde_json::json!({ "completed": 1 }),
            endpoint.metadata()
        );
    }

    #[test]
    fn flush_returns_residuals_and_clears_busy() {
        let endpoint = live_endpoint("trb-01", 2, 1);
        occupy(&endpoint, 1..4);
        assert!(endpoint.is_busy());

        let residuals = endpoint.flush();
        assert_eq!(3, residuals.len());
        assert_eq!(0, endpoint.used_slots());
        assert!(!endpoint.is_busy());
    }

    #[test]
    fn average_latency_is_zero_without_samples() {
        let endpoint = live_endpoint("trb-01", 5, 3);
        assert_eq!(
            Duration::ZERO,
            endpoint.average_latency(Instant::now())
        );
    }

    fn registry_of(names: &[&str]) -> EndpointRegistry {
        let mut registry = EndpointRegistry::default();
        for name in names {
            registry
                .insert(Arc::new(live_endpoint(name, 5, 3)));
        }
        registry
    }

    #[test]
    fn round_robin_walks_in_registration_order() {
        let mut registry = registry_of(&["a", "b", "c"]);
        let mut order = vec![];
        for trigger_number in 1..=6 {
            let assignment =
                registry.find_slot(&decision(trigger_number)).unwrap();
            let endpoint =
                registry.get(&assignment.connection_name).unwrap().clone();
            endpoint.add_assignment(assignment.clone());
            order.push(assignment.connection_name.clone());
        }
        assert_eq!(vec!["a", "b", "c", "a", "b", "c"], order);
    }

    #[test]
    fn errored_endpoints_are_skipped_without_moving_the_cursor() {
        let mut registry = registry_of(&["a", "b"]);
        registry.get("a").unwrap().set_in_error(true);

        for trigger_number in 1..=2 {
            let assignment =
                registry.find_slot(&decision(trigger_number)).unwrap();
            assert_eq!("b", assignment.connection_name);
        }

        // With every endpoint in error there is nothing to probe and the
        // cursor stays where the last assignment left it.
        registry.get("b").unwrap().set_in_error(true);
        assert!(registry.find_slot(&decision(3)).is_none());
        registry.get("a").unwrap().set_in_error(false);
        let assignment = registry.find_slot(&decision(4)).unwrap();
        assert_eq!("a", assignment.connection_name);
    }

    #[test]
    fn all_busy_forces_the_least_occupied_earliest_endpoint() {
        let mut registry = registry_of(&["a", "b", "c"]);
        for (offset, name) in [(0u64, "a"), (10, "b"), (20, "c")] {
            let endpoint = registry.get(name).unwrap().clone();
            occupy(&endpoint, offset + 1..offset + 6);
            assert!(endpoint.is_busy());
        }
        // Give "b" and "c" equal (lower) occupancy; 4 slots is still inside
        // the hysteresis band so both stay busy. The walk starts at "a",
        // so "b" is encountered first with the minimum.
        registry.get("b").unwrap().extract_assignment(11).unwrap();
        registry.get("c").unwrap().extract_assignment(21).unwrap();
        assert!(registry.get("b").unwrap().is_busy());

        let assignment = registry.find_slot(&decision(99)).unwrap();
        assert_eq!("b", assignment.connection_name);
    }

    #[test]
    fn empty_registry_is_busy_and_has_no_slot() {
        let mut registry = EndpointRegistry::default();
        assert!(registry.is_busy());
        assert!(registry.is_drained());
        assert!(registry.find_slot(&decision(1)).is_none());
    }
}
