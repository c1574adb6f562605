//! In-memory harness for exercising the orchestrator end to end: channels
//! stand in for the upstream trigger, the inhibit line and the trigger
//! record builders.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lib::comms::{
    ChannelSender,
    ConnectionDecl,
    DataType,
    IoRegistry,
    ModuleConfig,
    Receiver,
};
use lib::config::DfoConfig;
use lib::types::{
    TriggerDecision,
    TriggerDecisionToken,
    TriggerInhibit,
    TriggerNumber,
};
use tokio::sync::mpsc;

use crate::orchestrator::Orchestrator;

pub const TEST_RUN: u32 = 42;

pub fn test_config() -> DfoConfig {
    DfoConfig {
        general_queue_timeout_ms: 100,
        stop_timeout_ms: 4000,
        busy_threshold: 5,
        free_threshold: 3,
        td_send_retries: 3,
        metrics_interval_s: 10,
    }
}

pub fn decision(trigger_number: TriggerNumber) -> TriggerDecision {
    decision_for_run(trigger_number, TEST_RUN)
}

pub fn decision_for_run(
    trigger_number: TriggerNumber,
    run_number: u32,
) -> TriggerDecision {
    TriggerDecision {
        trigger_number,
        run_number,
        trigger_type: 1,
        trigger_timestamp: trigger_number * 1_000,
        components: vec![],
    }
}

pub struct TestHarness {
    pub orchestrator: Arc<Orchestrator>,
    pub decisions: mpsc::Sender<TriggerDecision>,
    pub tokens: mpsc::Sender<TriggerDecisionToken>,
    pub inhibits: mpsc::Receiver<TriggerInhibit>,
    pub trb_inboxes: HashMap<String, mpsc::Receiver<TriggerDecision>>,
}

impl TestHarness {
    /// Builds a configured (not yet started) orchestrator wired to one
    /// decision sender per named endpoint.
    pub fn new(endpoints: &[&str], config: DfoConfig) -> Self {
        let (decisions, td_rx) = mpsc::channel(64);
        let (tokens, token_rx) = mpsc::channel(64);
        let (inhibit_tx, inhibits) = mpsc::channel(64);

        let mut io = IoRegistry::default();
        io.add_decision_receiver("td_to_dfo", Receiver::new("td_to_dfo", td_rx));
        io.add_token_receiver("df_tokens", Receiver::new("df_tokens", token_rx));
        io.add_inhibit_sender(
            "df_busy_signal",
            Arc::new(ChannelSender::new("df_busy_signal", inhibit_tx)),
        );

        let mut module = ModuleConfig {
            inputs: vec![
                ConnectionDecl::new("td_to_dfo", DataType::TriggerDecision),
                ConnectionDecl::new(
                    "df_tokens",
                    DataType::TriggerDecisionToken,
                ),
            ],
            outputs: vec![ConnectionDecl::new(
                "df_busy_signal",
                DataType::TriggerInhibit,
            )],
        };

        let mut trb_inboxes = HashMap::new();
        for endpoint in endpoints {
            let (tx, rx) = mpsc::channel(64);
            io.add_decision_sender(
                *endpoint,
                Arc::new(ChannelSender::new(*endpoint, tx)),
            );
            module
                .outputs
                .push(ConnectionDecl::new(*endpoint, DataType::TriggerDecision));
            trb_inboxes.insert((*endpoint).to_owned(), rx);
        }

        let orchestrator =
            Arc::new(Orchestrator::init("dfo", &module, &mut io).unwrap());
        orchestrator.configure(&config).unwrap();

        Self {
            orchestrator,
            decisions,
            tokens,
            inhibits,
            trb_inboxes,
        }
    }

    pub fn with_endpoints(endpoints: &[&str]) -> Self {
        Self::new(endpoints, test_config())
    }

    pub async fn start(&self) {
        self.orchestrator.clone().start(TEST_RUN).await.unwrap();
    }

    /// Registers an endpoint and waits for it to become usable. The first
    /// sentinel creates the entry (still masked by the admission guard);
    /// the second takes the reconnection path and clears the mask.
    pub async fn register_endpoint(&self, endpoint: &str) {
        self.announce_endpoint(endpoint).await;
        self.tokens
            .send(TriggerDecisionToken::registration(endpoint))
            .await
            .unwrap();
        let orchestrator = self.orchestrator.clone();
        let endpoint = endpoint.to_owned();
        wait_until(move || {
            orchestrator
                .endpoint(&endpoint)
                .is_some_and(|e| !e.is_in_error())
        })
        .await;
    }

    /// Sends a single registration sentinel: the endpoint becomes known
    /// but stays behind the admission guard.
    pub async fn announce_endpoint(&self, endpoint: &str) {
        self.tokens
            .send(TriggerDecisionToken::registration(endpoint))
            .await
            .unwrap();
        let orchestrator = self.orchestrator.clone();
        let endpoint = endpoint.to_owned();
        wait_until(move || orchestrator.endpoint(&endpoint).is_some()).await;
    }

    pub async fn send_decision(&self, trigger_number: TriggerNumber) {
        self.decisions
            .send(decision(trigger_number))
            .await
            .unwrap();
    }

    pub async fn send_token(
        &self,
        endpoint: &str,
        trigger_number: TriggerNumber,
    ) {
        self.tokens
            .send(TriggerDecisionToken {
                run_number: TEST_RUN,
                trigger_number,
                decision_destination: endpoint.to_owned(),
            })
            .await
            .unwrap();
    }

    /// Next decision forwarded to the given endpoint, within a bounded
    /// wait.
    pub async fn expect_forwarded(&mut self, endpoint: &str) -> TriggerDecision {
        let inbox = self.trb_inboxes.get_mut(endpoint).unwrap();
        tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap_or_else(|_| {
                panic!("no decision forwarded to {endpoint} within 2s")
            })
            .unwrap()
    }

    pub async fn expect_inhibit(&mut self) -> TriggerInhibit {
        tokio::time::timeout(Duration::from_secs(2), self.inhibits.recv())
            .await
            .expect("no inhibit transmitted within 2s")
            .unwrap()
    }

    pub fn no_pending_inhibit(&mut self) -> bool {
        self.inhibits.try_recv().is_err()
    }
}

/// Polls `condition` until it holds, panicking after a bounded wait.
pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached within 2s");
}
