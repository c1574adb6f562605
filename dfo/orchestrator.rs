//! The dispatch and bookkeeping core.
//!
//! The orchestrator ingests trigger decisions from the upstream trigger,
//! assigns each one to a downstream trigger record builder, reconciles
//! completion tokens, and keeps the upstream informed of the aggregate
//! busy state. Both message paths run as independent callbacks installed
//! on start and removed on stop; lifecycle commands arrive on a control
//! path of their own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use lib::comms::{
    DataType,
    DynSender,
    IoRegistry,
    ModuleConfig,
    Receiver,
};
use lib::config::DfoConfig;
use lib::types::{
    unpack_trigger_types,
    RunNumber,
    TriggerDecision,
    TriggerDecisionToken,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::counters::{DfoCounters, TriggerCounters};
use crate::endpoint::{
    AssignedTriggerDecision,
    EndpointRegistry,
    EndpointState,
    MetadataFn,
};
use crate::inhibit::InhibitNotifier;
use crate::issues::{self, Issue};

/// The stop drain budget is spent in this many equal sub-waits.
const DRAIN_WAIT_STEPS: u32 = 20;
/// Pause between assignment attempts when no endpoint is usable.
const SATURATION_BACKOFF: Duration = Duration::from_micros(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Unconfigured,
    Configured,
    Running,
}

impl LifecycleState {
    fn name(&self) -> &'static str {
        match self {
            LifecycleState::Unconfigured => "unconfigured",
            LifecycleState::Configured => "configured",
            LifecycleState::Running => "running",
        }
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("command \"{command}\" is not allowed in the {state} state")]
    InvalidState {
        command: &'static str,
        state: &'static str,
    },
    #[error(transparent)]
    Issue(#[from] Issue),
}

/// Values captured from the configuration record at `configure` time.
#[derive(Debug, Clone, Copy)]
struct Settings {
    queue_timeout: Duration,
    stop_timeout: Duration,
    busy_threshold: usize,
    free_threshold: usize,
    td_send_retries: u32,
}

pub struct Orchestrator {
    name: String,
    state: Mutex<LifecycleState>,
    settings: RwLock<Option<Settings>>,
    run_number: AtomicU32,
    running: AtomicBool,

    td_receiver: Receiver<TriggerDecision>,
    token_receiver: Receiver<TriggerDecisionToken>,
    decision_senders: HashMap<String, DynSender<TriggerDecision>>,
    inhibit: InhibitNotifier,

    registry: RwLock<EndpointRegistry>,
    counters: DfoCounters,
    trigger_counters: TriggerCounters,

    last_td_received: Mutex<Instant>,
    last_token_received: Mutex<Instant>,

    metadata_fn: Option<Box<MetadataFn>>,
}

impl Orchestrator {
    /// Resolves the module's connections from the registry by data-type
    /// tag. Missing any required connection aborts initialization.
    pub fn init(
        name: impl Into<String>,
        module: &ModuleConfig,
        io: &mut IoRegistry,
    ) -> Result<Self, Issue> {
        let name = name.into();

        let mut td_uid = None;
        let mut token_uid = None;
        for input in &module.inputs {
            match input.data_type {
                DataType::TriggerDecision => td_uid = Some(input.uid.clone()),
                DataType::TriggerDecisionToken => {
                    token_uid = Some(input.uid.clone())
                }
                DataType::TriggerInhibit => {}
            }
        }

        let mut inhibit_sender = None;
        let mut decision_senders = HashMap::new();
        for output in &module.outputs {
            match output.data_type {
                DataType::TriggerInhibit => {
                    inhibit_sender = io.inhibit_sender(&output.uid);
                }
                DataType::TriggerDecision => {
                    if let Some(sender) = io.decision_sender(&output.uid) {
                        decision_senders.insert(output.uid.clone(), sender);
                    }
                }
                DataType::TriggerDecisionToken => {}
            }
        }

        let td_uid = td_uid.ok_or(Issue::MissingConnection {
            data_type: DataType::TriggerDecision,
            direction: "input",
        })?;
        let token_uid = token_uid.ok_or(Issue::MissingConnection {
            data_type: DataType::TriggerDecisionToken,
            direction: "input",
        })?;
        let inhibit_sender =
            inhibit_sender.ok_or(Issue::MissingConnection {
                data_type: DataType::TriggerInhibit,
                direction: "output",
            })?;
        let td_receiver = io.take_decision_receiver(&td_uid).ok_or(
            Issue::MissingConnection {
                data_type: DataType::TriggerDecision,
                direction: "input",
            },
        )?;
        let token_receiver = io.take_token_receiver(&token_uid).ok_or(
            Issue::MissingConnection {
                data_type: DataType::TriggerDecisionToken,
                direction: "input",
            },
        )?;

        let now = Instant::now();
        Ok(Self {
            name,
            state: Mutex::new(LifecycleState::Unconfigured),
            settings: RwLock::new(None),
            run_number: AtomicU32::new(0),
            running: AtomicBool::new(false),
            td_receiver,
            token_receiver,
            decision_senders,
            inhibit: InhibitNotifier::new(inhibit_sender),
            registry: RwLock::new(EndpointRegistry::default()),
            counters: DfoCounters::default(),
            trigger_counters: TriggerCounters::default(),
            last_td_received: Mutex::new(now),
            last_token_received: Mutex::new(now),
            metadata_fn: None,
        })
    }

    /// Installs a hook applied to an endpoint's metadata blob on every
    /// completion. Must be set before the orchestrator is shared.
    pub fn set_metadata_fn(&mut self, metadata_fn: Box<MetadataFn>) {
        self.metadata_fn = Some(metadata_fn);
    }

    pub fn configure(&self, config: &DfoConfig) -> Result<(), CommandError> {
        let mut state = self.state.lock().unwrap();
        if *state == LifecycleState::Running {
            return Err(CommandError::InvalidState {
                command: "conf",
                state: state.name(),
            });
        }
        if config.busy_threshold < config.free_threshold {
            return Err(Issue::ThresholdsNotConsistent {
                busy: config.busy_threshold,
                free: config.free_threshold,
            }
            .into());
        }

        *self.settings.write().unwrap() = Some(Settings {
            queue_timeout: Duration::from_millis(
                config.general_queue_timeout_ms,
            ),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            busy_threshold: config.busy_threshold,
            free_threshold: config.free_threshold,
            td_send_retries: config.td_send_retries,
        });

        // Endpoints registered in an earlier run pick up the new
        // thresholds.
        let registry = self.registry.read().unwrap();
        for endpoint in registry.iter() {
            endpoint
                .set_thresholds(config.busy_threshold, config.free_threshold)?;
        }

        *state = LifecycleState::Configured;
        debug!(
            name = %self.name,
            endpoints = registry.len(),
            "Configured"
        );
        Ok(())
    }

    pub async fn start(
        self: Arc<Self>,
        run_number: RunNumber,
    ) -> Result<(), CommandError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Configured {
                return Err(CommandError::InvalidState {
                    command: "start",
                    state: state.name(),
                });
            }
            *state = LifecycleState::Running;
        }

        self.counters.zero();
        self.run_number.store(run_number, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.inhibit.reset();
        self.registry.write().unwrap().reset_cursor();

        let now = Instant::now();
        *self.last_td_received.lock().unwrap() = now;
        *self.last_token_received.lock().unwrap() = now;

        // Observational readiness probes; a cold peer is not fatal here.
        debug!(
            sender = self.inhibit.sender().name(),
            ready = self.inhibit.sender().is_ready(),
            "Inhibit sender readiness"
        );
        for (uid, sender) in &self.decision_senders {
            debug!(sender = %uid, ready = sender.is_ready(), "Decision sender readiness");
        }

        let this = Arc::clone(&self);
        self.token_receiver
            .subscribe(move |token| {
                let this = Arc::clone(&this);
                async move { this.receive_trigger_complete_token(token).await }
            })
            .await;
        let this = Arc::clone(&self);
        self.td_receiver
            .subscribe(move |decision| {
                let this = Arc::clone(&this);
                async move { this.receive_trigger_decision(decision).await }
            })
            .await;

        info!(name = %self.name, run_number, "Started");
        Ok(())
    }

    /// Stops accepting new decisions immediately, waits out the drain
    /// budget for outstanding assignments, then flushes and reports every
    /// residual.
    pub async fn drain_stop(&self) -> Result<(), CommandError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Running {
                return Err(CommandError::InvalidState {
                    command: "drain_dataflow",
                    state: state.name(),
                });
            }
            *state = LifecycleState::Configured;
        }
        let settings = self.settings();

        self.running.store(false, Ordering::SeqCst);
        self.td_receiver.unsubscribe().await;

        let step_timeout = settings.stop_timeout / DRAIN_WAIT_STEPS;
        let mut step = 0;
        while !self.is_empty() && step < DRAIN_WAIT_STEPS {
            info!(
                name = %self.name,
                outstanding = self.used_slots(),
                "Stop delayed while waiting for outstanding trigger decisions"
            );
            tokio::time::sleep(step_timeout).await;
            step += 1;
        }

        self.token_receiver.unsubscribe().await;

        let run_number = self.run_number.load(Ordering::SeqCst);
        let mut remnants = Vec::new();
        {
            let registry = self.registry.read().unwrap();
            for endpoint in registry.iter() {
                remnants.extend(endpoint.flush());
            }
        }
        for remnant in &remnants {
            issues::report(&Issue::IncompleteTriggerDecision {
                trigger_number: remnant.decision.trigger_number,
                run_number,
            });
        }

        self.trigger_counters.clear();
        info!(name = %self.name, "Successfully stopped");
        Ok(())
    }

    pub fn scrap(&self) -> Result<(), CommandError> {
        let mut state = self.state.lock().unwrap();
        if *state != LifecycleState::Configured {
            return Err(CommandError::InvalidState {
                command: "scrap",
                state: state.name(),
            });
        }
        *state = LifecycleState::Unconfigured;
        self.registry.write().unwrap().clear();
        info!(name = %self.name, "Successfully scrapped");
        Ok(())
    }

    pub fn run_number(&self) -> RunNumber {
        self.run_number.load(Ordering::SeqCst)
    }

    /// True iff every registered endpoint is busy; an empty registry has
    /// no capacity and reports busy.
    pub fn is_busy(&self) -> bool {
        self.registry.read().unwrap().is_busy()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().unwrap().is_drained()
    }

    pub fn used_slots(&self) -> usize {
        self.registry.read().unwrap().used_slots()
    }

    pub fn endpoint(
        &self,
        connection_name: &str,
    ) -> Option<Arc<EndpointState>> {
        self.registry.read().unwrap().get(connection_name).cloned()
    }

    /// Snapshot-and-reset publication of every operational counter.
    pub fn publish_opmon(&self) {
        self.counters.publish();
        self.trigger_counters.publish();
        let registry = self.registry.read().unwrap();
        for endpoint in registry.iter() {
            endpoint.publish_opmon();
        }
    }

    pub(crate) async fn receive_trigger_decision(
        &self,
        decision: TriggerDecision,
    ) {
        trace!(
            trigger_number = decision.trigger_number,
            run_number = decision.run_number,
            "Received trigger decision"
        );
        let current_run = self.run_number.load(Ordering::SeqCst);
        if decision.run_number != current_run {
            issues::report(&Issue::RunNumberMismatch {
                received: decision.run_number,
                current: current_run,
                origin: "MLT".to_owned(),
                trigger_number: decision.trigger_number,
            });
            return;
        }

        let decision_received = Instant::now();
        self.counters
            .received_decisions
            .fetch_add(1, Ordering::SeqCst);
        for trigger_type in unpack_trigger_types(decision.trigger_type) {
            self.trigger_counters
                .counts_for(trigger_type)
                .received
                .fetch_add(1, Ordering::SeqCst);
        }

        let settings = self.settings();
        let mut decision_assigned = decision_received;
        loop {
            let assignment =
                self.registry.write().unwrap().find_slot(&decision);

            match assignment {
                None => {
                    // Every endpoint is errored or the registry is empty;
                    // hold the decision and keep the inhibit fresh while
                    // waiting for capacity.
                    issues::report(&Issue::UnableToAssign {
                        trigger_number: decision.trigger_number,
                    });
                    tokio::time::sleep(SATURATION_BACKOFF).await;
                    self.notify_trigger_if_needed().await;
                }
                Some(assignment) => {
                    decision_assigned = Instant::now();
                    if self.dispatch(&assignment, &settings).await {
                        if let Some(endpoint) = self
                            .endpoint(&assignment.connection_name)
                        {
                            endpoint.add_assignment(assignment.clone());
                        }
                        debug!(
                            trigger_number = decision.trigger_number,
                            connection = %assignment.connection_name,
                            "Assigned trigger decision"
                        );
                        break;
                    }
                    issues::report(&Issue::TrbAppUpdate {
                        connection_name: assignment.connection_name.clone(),
                        message: "could not forward the trigger decision"
                            .to_owned(),
                    });
                    if let Some(endpoint) =
                        self.endpoint(&assignment.connection_name)
                    {
                        endpoint.set_in_error(true);
                    }
                }
            }

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }

        self.notify_trigger_if_needed().await;

        let now = Instant::now();
        {
            let mut last = self.last_td_received.lock().unwrap();
            self.counters.waiting_for_decision.fetch_add(
                micros_between(*last, decision_received),
                Ordering::SeqCst,
            );
            *last = now;
        }
        self.counters.deciding_destination.fetch_add(
            micros_between(decision_received, decision_assigned),
            Ordering::SeqCst,
        );
        self.counters.forwarding_decision.fetch_add(
            micros_between(decision_assigned, now),
            Ordering::SeqCst,
        );
    }

    pub(crate) async fn receive_trigger_complete_token(
        &self,
        token: TriggerDecisionToken,
    ) {
        if token.is_registration() {
            self.register_endpoint(&token.decision_destination);
            return;
        }

        trace!(
            trigger_number = token.trigger_number,
            run_number = token.run_number,
            connection = %token.decision_destination,
            "Received trigger decision token"
        );
        let current_run = self.run_number.load(Ordering::SeqCst);
        if token.run_number != current_run {
            issues::report(&Issue::RunNumberMismatch {
                received: token.run_number,
                current: current_run,
                origin: format!(
                    "TRB at connection {}",
                    token.decision_destination
                ),
                trigger_number: token.trigger_number,
            });
            return;
        }

        let Some(endpoint) = self.endpoint(&token.decision_destination)
        else {
            issues::report(&Issue::UnknownTokenSource {
                connection_name: token.decision_destination.clone(),
            });
            return;
        };

        self.counters.received_tokens.fetch_add(1, Ordering::SeqCst);
        let callback_start = Instant::now();

        match endpoint.complete_assignment(
            token.trigger_number,
            self.metadata_fn.as_deref(),
        ) {
            Ok(assignment) => {
                for trigger_type in
                    unpack_trigger_types(assignment.decision.trigger_type)
                {
                    self.trigger_counters
                        .counts_for(trigger_type)
                        .completed
                        .fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(issue) => issues::report(&issue),
        }

        // A real token is the endpoint's proof of liveness.
        if endpoint.is_in_error() {
            let notice = Issue::TrbAppUpdate {
                connection_name: token.decision_destination.clone(),
                message: "has reconnected".to_owned(),
            };
            info!(issue = notice.name(), "{notice}");
            endpoint.set_in_error(false);
        }

        self.notify_trigger_if_needed().await;

        let now = Instant::now();
        {
            let mut last = self.last_token_received.lock().unwrap();
            self.counters.waiting_for_token.fetch_add(
                micros_between(*last, callback_start),
                Ordering::SeqCst,
            );
            *last = now;
        }
        self.counters.processing_token.fetch_add(
            micros_between(callback_start, now),
            Ordering::SeqCst,
        );
    }

    /// First contact from an unknown endpoint creates its state; a
    /// sentinel for a known endpoint is a reconnection and clears the
    /// error mask. A brand-new endpoint keeps its error mask until its
    /// first real token proves it can complete work.
    fn register_endpoint(&self, connection_name: &str) {
        let settings = self.settings();
        let mut registry = self.registry.write().unwrap();
        if let Some(endpoint) = registry.get(connection_name).cloned() {
            let notice = Issue::TrbAppUpdate {
                connection_name: connection_name.to_owned(),
                message: "has reconnected".to_owned(),
            };
            info!(issue = notice.name(), "{notice}");
            endpoint.set_in_error(false);
        } else {
            debug!(
                connection = connection_name,
                "Registering trigger record builder endpoint"
            );
            match EndpointState::new(
                connection_name,
                settings.busy_threshold,
                settings.free_threshold,
            ) {
                Ok(endpoint) => registry.insert(Arc::new(endpoint)),
                Err(issue) => issues::report(&issue),
            }
        }
    }

    /// Forwards the assignment's decision to its endpoint, by value, with
    /// the configured per-attempt timeout and retry budget.
    async fn dispatch(
        &self,
        assignment: &Arc<AssignedTriggerDecision>,
        settings: &Settings,
    ) -> bool {
        let Some(sender) =
            self.decision_senders.get(&assignment.connection_name)
        else {
            warn!(
                connection = %assignment.connection_name,
                "No trigger decision sender for endpoint"
            );
            return false;
        };

        let attempts = settings.td_send_retries.max(1);
        for _ in 0..attempts {
            let decision = assignment.decision.clone();
            match sender.send(decision, settings.queue_timeout).await {
                Ok(()) => {
                    self.counters
                        .sent_decisions
                        .fetch_add(1, Ordering::SeqCst);
                    trace!(
                        trigger_number = assignment.decision.trigger_number,
                        connection = %assignment.connection_name,
                        "Forwarded trigger decision"
                    );
                    return true;
                }
                Err(source) => {
                    issues::report(&Issue::OperationFailed {
                        target: assignment.connection_name.clone(),
                        source,
                    });
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }
        false
    }

    /// Re-evaluates the aggregate busy state under the inhibit lock and
    /// transmits it when it changed.
    pub(crate) async fn notify_trigger_if_needed(&self) {
        let settings = self.settings();
        self.inhibit
            .notify_if_needed(
                || self.registry.read().unwrap().is_busy(),
                self.run_number.load(Ordering::SeqCst),
                &self.running,
                settings.queue_timeout,
            )
            .await;
    }

    fn settings(&self) -> Settings {
        self.settings
            .read()
            .unwrap()
            .expect("settings are captured before callbacks are installed")
    }
}

fn micros_between(from: Instant, to: Instant) -> u64 {
    to.saturating_duration_since(from).as_micros() as u64
}
