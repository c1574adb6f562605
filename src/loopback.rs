//! Standalone loopback topology.
//!
//! Wires the orchestrator to simulated trigger record builders and a
//! simulated trigger so the daemon exercises the full dispatch path
//! without external peers: each builder registers itself, echoes a token
//! per decision, and the trigger honors the inhibit line.

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
use lib::service::Shutdown;
use lib::types::{
    ComponentRequest,
    TriggerDecision,
    TriggerDecisionToken,
    TriggerInhibit,
};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info};

use crate::cli::CliOpts;

/// Simulated trigger record building latency.
const BUILD_LATENCY: Duration = Duration::from_millis(5);

/// Builds the module wiring and spawns the simulated peers.
pub(crate) fn wire(
    opts: &CliOpts,
    shutdown: Shutdown,
) -> (ModuleConfig, IoRegistry) {
    let (decision_tx, decision_rx) = mpsc::channel(64);
    let (token_tx, token_rx) = mpsc::channel(256);
    let (inhibit_tx, inhibit_rx) = mpsc::channel(8);

    let mut io = IoRegistry::default();
    io.add_decision_receiver("td_to_dfo", Receiver::new("td_to_dfo", decision_rx));
    io.add_token_receiver("df_tokens", Receiver::new("df_tokens", token_rx));
    io.add_inhibit_sender(
        "df_busy_signal",
        Arc::new(ChannelSender::new("df_busy_signal", inhibit_tx)),
    );

    let mut module = ModuleConfig {
        inputs: vec![
            ConnectionDecl::new("td_to_dfo", DataType::TriggerDecision),
            ConnectionDecl::new("df_tokens", DataType::TriggerDecisionToken),
        ],
        outputs: vec![ConnectionDecl::new(
            "df_busy_signal",
            DataType::TriggerInhibit,
        )],
    };

    for index in 0..opts.endpoints {
        let name = format!("trb-{index:02}");
        let (tx, rx) = mpsc::channel(64);
        io.add_decision_sender(
            name.clone(),
            Arc::new(ChannelSender::new(name.clone(), tx)),
        );
        module
            .outputs
            .push(ConnectionDecl::new(name.clone(), DataType::TriggerDecision));
        tokio::spawn(run_builder(name, rx, token_tx.clone()));
    }

    tokio::spawn(run_trigger(
        opts.run,
        Duration::from_millis(opts.trigger_interval_ms),
        decision_tx,
        inhibit_rx,
        shutdown,
    ));

    (module, io)
}

/// A fake trigger record builder: registers itself, then acknowledges
/// every decision after a fixed build latency.
async fn run_builder(
    name: String,
    mut inbox: mpsc::Receiver<TriggerDecision>,
    tokens: mpsc::Sender<TriggerDecisionToken>,
) {
    // Announce twice: the second sentinel clears the admission guard.
    for _ in 0..2 {
        if tokens
            .send(TriggerDecisionToken::registration(name.clone()))
            .await
            .is_err()
        {
            return;
        }
    }
    info!(endpoint = %name, "Simulated trigger record builder online");

    while let Some(decision) = inbox.recv().await {
        time::sleep(BUILD_LATENCY).await;
        let token = TriggerDecisionToken {
            run_number: decision.run_number,
            trigger_number: decision.trigger_number,
            decision_destination: name.clone(),
        };
        if tokens.send(token).await.is_err() {
            break;
        }
    }
    debug!(endpoint = %name, "Simulated trigger record builder offline");
}

/// A fake trigger: emits decisions at a fixed rate and pauses whenever
/// the orchestrator raises the inhibit.
async fn run_trigger(
    run_number: u32,
    interval: Duration,
    decisions: mpsc::Sender<TriggerDecision>,
    mut inhibits: mpsc::Receiver<TriggerInhibit>,
    mut shutdown: Shutdown,
) {
    let mut ticker = time::interval(interval);
    let mut trigger_number = 0u64;
    let mut inhibited = false;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if inhibited {
                    continue;
                }
                trigger_number += 1;
                let decision = TriggerDecision {
                    trigger_number,
                    run_number,
                    trigger_type: 1 << (trigger_number % 3),
                    trigger_timestamp: trigger_number * 1_000,
                    components: vec![ComponentRequest {
                        source_id: 0,
                        window_begin: trigger_number * 1_000,
                        window_end: trigger_number * 1_000 + 500,
                    }],
                };
                if decisions.send(decision).await.is_err() {
                    break;
                }
            }
            inhibit = inhibits.recv() => match inhibit {
                Some(inhibit) => {
                    info!(busy = inhibit.busy, "Trigger inhibit update");
                    inhibited = inhibit.busy;
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    debug!(emitted = trigger_number, "Simulated trigger stopped");
}
