//! Data Flow Orchestrator core.
//!
//! Receives trigger decisions, assigns them round-robin across the
//! registered trigger record builders, reconciles completion tokens and
//! back-pressures the upstream trigger when every builder is busy.

pub mod counters;
pub mod endpoint;
pub mod inhibit;
pub mod issues;
pub mod orchestrator;
pub mod test_helpers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use lib::comms::{IoRegistry, ModuleConfig};
use lib::service::ServiceContext;
use lib::types::RunNumber;
use tracing::info;

use crate::orchestrator::Orchestrator;

/// Brings an orchestrator through its lifecycle: init, configure, start,
/// then periodic metrics publication until the shutdown signal, then
/// drain-stop and scrap.
pub async fn start_dfo(
    mut context: ServiceContext,
    module: ModuleConfig,
    mut io: IoRegistry,
    run_number: RunNumber,
) -> Result<()> {
    let config = context.get_config();
    let orchestrator = Arc::new(Orchestrator::init(
        context.service_name().to_owned(),
        &module,
        &mut io,
    )?);
    orchestrator.configure(&config.dfo)?;
    orchestrator.clone().start(run_number).await?;

    let mut publish_interval = tokio::time::interval(Duration::from_secs(
        config.dfo.metrics_interval_s.max(1),
    ));
    loop {
        tokio::select! {
            _ = publish_interval.tick() => orchestrator.publish_opmon(),
            _ = context.recv_shutdown_signal() => break,
        }
    }

    orchestrator.drain_stop().await?;
    orchestrator.publish_opmon();
    orchestrator.scrap()?;
    info!("DFO service terminated");
    Ok(())
}
