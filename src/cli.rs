use clap::Parser;

#[derive(clap::ValueEnum, Clone)]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Parser)]
#[command(version = "0.1")]
pub struct CliOpts {
    /// Sets the custom configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    #[arg(short, long, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Run number announced downstream and stamped on every decision.
    #[arg(short, long, default_value_t = 1)]
    pub run: u32,

    /// Simulated trigger record builder endpoints for standalone operation.
    #[arg(short, long, default_value_t = 2)]
    pub endpoints: usize,

    /// Interval between simulated trigger decisions.
    #[arg(short, long, default_value_t = 100)]
    pub trigger_interval_ms: u64,
}
