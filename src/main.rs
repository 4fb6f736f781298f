use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::{GatekeeperConfig, LogFormat, LoggingConfig};
use gatekeeper::context::RequestContext;
use gatekeeper::gateway::{format_window, AdmissionControl};

/// Operator tooling for the Gatekeeper admission layer.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Configuration file, overridden by GATEKEEPER__* environment variables
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log output format, defaults to the configured one
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and print it
    CheckConfig,
    /// Check that the configured store answers
    Ping,
    /// Run one rate limit admission for a key
    Admit {
        key: String,
        /// Override the configured limit
        #[arg(long)]
        limit: Option<u64>,
        /// Override the configured window
        #[arg(long)]
        window_ms: Option<u64>,
    },
    /// Clear the rate limit window of a key
    Reset { key: String },
    /// Show the stored circuit record of a resource
    Circuit { resource: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = GatekeeperConfig::load(cli.config.as_deref())?;

    let format = match cli.log_format {
        Some(LogFormatArg::Text) => LogFormat::Text,
        Some(LogFormatArg::Json) => LogFormat::Json,
        None => config.logging.format,
    };
    init_tracing(&config.logging, format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    if let Command::CheckConfig = cli.command {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let control = AdmissionControl::start(config).await?;
    let result = execute(&control, cli.command).await;
    control.shutdown().await;
    result
}

async fn execute(control: &AdmissionControl, command: Command) -> anyhow::Result<()> {
    let ctx = RequestContext::new();
    match command {
        Command::CheckConfig => {}
        Command::Ping => {
            control.store().ping().await?;
            println!(
                "{} store reachable ({:?} mode)",
                control.store().name(),
                control.mode()
            );
        }
        Command::Admit {
            key,
            limit,
            window_ms,
        } => {
            let defaults = control.limiter().config();
            let limit = limit.unwrap_or(defaults.limit);
            let window = window_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| defaults.window());

            let decision = control.limiter().admit(&ctx, &key, limit, window).await?;
            let output = json!({
                "key": key,
                "allowed": decision.allowed,
                "remaining": decision.remaining,
                "limit": decision.limit,
                "window": format_window(decision.window),
                "reset_time": decision.reset_epoch_secs(),
                "degraded": decision.degraded,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Reset { key } => {
            control.limiter().reset(&key).await?;
            println!("Cleared rate limit window for {}", key);
        }
        Command::Circuit { resource } => match control.breaker().snapshot(&resource).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("No circuit recorded for {}", resource),
        },
    }
    Ok(())
}

fn init_tracing(logging: &LoggingConfig, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.with_thread_ids(true).init(),
    }
}
