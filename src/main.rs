mod cli;
mod loopback;
mod metric_defs;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use cli::LogFormat;
use colored::Colorize;
use lib::comms::{IoRegistry, ModuleConfig};
use lib::config::ConfigLoader;
use lib::service::{ServiceContext, Shutdown};
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::MetricKindMask;
use tokio::task::JoinSet;
use tokio::{select, time};
use tracing::{debug, error, info, trace, warn, Subscriber};
use tracing_subscriber::FmtSubscriber;

fn setup_logging_subscriber(
    f: &LogFormat,
) -> Box<dyn Subscriber + Send + Sync> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "dfod=debug,dfo=debug,lib=debug".into());

    let sub = FmtSubscriber::builder()
        .with_thread_names(true)
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(env_filter);

    match f {
        LogFormat::Pretty => Box::new(sub.pretty().finish()),
        LogFormat::Compact => Box::new(sub.compact().finish()),
        LogFormat::Json => Box::new(sub.json().finish()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = cli::CliOpts::parse();
    let shutdown = Shutdown::default();

    tracing::subscriber::set_global_default(setup_logging_subscriber(
        &opts.log_format,
    ))?;

    debug!("** {} **", "Data Flow Orchestrator".magenta());
    trace!(config = ?opts.config, "Loading configuration");
    let config_loader = Arc::new(ConfigLoader::from_path(&opts.config));

    // Load initial configuration
    let config = config_loader.load()?;

    // Configure Metric Exporter
    let prometheus_sockaddr: SocketAddr = format!(
        "{}:{}",
        config.main.prometheus_address, config.main.prometheus_port
    )
    .parse()?;
    info!("Prometheus HTTP listener on {:?}", prometheus_sockaddr);
    PrometheusBuilder::new()
        .idle_timeout(
            MetricKindMask::HISTOGRAM,
            // Remove a metric from registry if it was not updated for 2
            // minutes.
            Some(Duration::from_secs(120)),
        )
        .with_http_listener(prometheus_sockaddr)
        .install()
        .expect("failed to install Prometheus recorder");
    // Install metric definitions
    metric_defs::install_metrics();

    // Wire the standalone loopback topology and start the service.
    let (module, io) = loopback::wire(&opts, shutdown.clone());
    let mut services = JoinSet::new();
    services.spawn(spawn_dfo(
        ServiceContext::new(
            "dfo".to_owned(),
            config_loader.clone(),
            shutdown.clone(),
        ),
        module,
        io,
        opts.run,
    ));

    // Waiting for <C-c> to terminate
    let mut shutdown_listener = shutdown.clone();
    select! {
        _ = shutdown_listener.recv() => {
            warn!("Received shutdown signal from downstream services!");
        },
        _ = tokio::signal::ctrl_c() => {
            warn!("Received Ctrl+c signal (SIGINT)!");
            shutdown.broadcast_shutdown();
        }
    };

    // Give services 10 seconds to cleanly shutdown after the shutdown signal.
    info!("Waiting (10s) for services to shutdown cleanly...");
    if (time::timeout(Duration::from_secs(10), async {
        while services.join_next().await.is_some() {
            info!("Need to wait for {} services to terminate", services.len());
        }
    })
    .await)
        .is_err()
    {
        error!(
            "Timed out awaiting {} services to shutdown!",
            services.len()
        );
        services.shutdown().await;
        bail!("Some services were not terminated cleanly!");
    }
    info!("Bye!");

    Ok(())
}

async fn spawn_dfo(
    context: ServiceContext,
    module: ModuleConfig,
    io: IoRegistry,
    run_number: u32,
) {
    let mut shutdown_context = context.clone();
    info!(service = context.service_name(), "Starting service 'dfo'");
    match dfo::start_dfo(context, module, io, run_number).await {
        Ok(_) => info!("Service 'dfo' terminated!"),
        Err(e) => {
            error!("Failed to start 'dfo': {e}");
            shutdown_context.broadcast_shutdown();
        }
    }
}
