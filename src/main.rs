//! Command-line interface for tsdb-event-streamer

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use stream_types::StreamPosition;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tsdb_event_streamer::{Config, Overrides};

#[derive(Parser)]
#[command(name = "tsdb-event-streamer")]
#[command(about = "Streams TimescaleDB row changes from logical replication as change events")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream changes until interrupted
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Inspect or change the stored offset
    Offsets {
        #[command(subcommand)]
        command: OffsetsCommand,
    },
}

#[derive(Subcommand)]
enum OffsetsCommand {
    /// Print the confirmed position of the configured stream
    Show {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        overrides: OverrideArgs,
    },

    /// Store a new confirmed position (must not be below the current one)
    Set {
        #[command(flatten)]
        config: ConfigArgs,

        #[command(flatten)]
        overrides: OverrideArgs,

        /// Position in PostgreSQL LSN notation, e.g. 0/16B3748
        lsn: StreamPosition,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Path to the TOML config file; defaults apply when omitted
    #[arg(long, value_name = "PATH", env = "TSDB_STREAMER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct OverrideArgs {
    /// PostgreSQL connection string
    #[arg(long, env = "TSDB_STREAMER_CONNECTION_STRING")]
    connection_string: Option<String>,

    /// Logical replication slot name
    #[arg(long, env = "TSDB_STREAMER_SLOT")]
    slot: Option<String>,

    /// Publication name
    #[arg(long, env = "TSDB_STREAMER_PUBLICATION")]
    publication: Option<String>,

    /// Topic prefix (topics are prefix.schema.table)
    #[arg(long)]
    topic_prefix: Option<String>,

    /// Sink kind (stdout, memory)
    #[arg(long)]
    sink: Option<String>,
}

impl From<OverrideArgs> for Overrides {
    fn from(args: OverrideArgs) -> Self {
        Overrides {
            connection_string: args.connection_string,
            slot: args.slot,
            publication: args.publication,
            topic_prefix: args.topic_prefix,
            sink: args.sink,
        }
    }
}

fn load_config(path: Option<&Path>, overrides: OverrideArgs) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    Overrides::from(overrides).apply(&mut config)?;
    Ok(config)
}

/// Peeks at the config's `log_level` so logging is set up before the full
/// config is validated. `RUST_LOG` wins when set.
fn init_tracing(config_path: Option<&Path>) {
    let fallback = config_path
        .and_then(|path| Config::load(path).ok())
        .map(|config| config.log_level)
        .unwrap_or_else(|| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, overrides } => {
            init_tracing(config.config.as_deref());
            let config = load_config(config.config.as_deref(), overrides)?;

            let shutdown = CancellationToken::new();
            tokio::spawn(cancel_on_signal(shutdown.clone()));

            tsdb_event_streamer::run_stream(&config, shutdown).await?;
        }
        Commands::Offsets { command } => match command {
            OffsetsCommand::Show { config, overrides } => {
                init_tracing(config.config.as_deref());
                let config = load_config(config.config.as_deref(), overrides)?;
                let stream = config.stream_identity()?;
                match tsdb_event_streamer::show_offset(&config).await? {
                    Some(record) => println!(
                        "{}\t{}\t{}",
                        record.stream,
                        record.confirmed_position,
                        record.updated_at.to_rfc3339()
                    ),
                    None => println!("{stream}\tno offset stored"),
                }
            }
            OffsetsCommand::Set {
                config,
                overrides,
                lsn,
            } => {
                init_tracing(config.config.as_deref());
                let config = load_config(config.config.as_deref(), overrides)?;
                let record = tsdb_event_streamer::set_offset(&config, lsn).await?;
                println!("{}\t{}", record.stream, record.confirmed_position);
            }
        },
    }

    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    wait_for_signal().await;
    info!("Shutdown signal received, finishing the current transaction");
    shutdown.cancel();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
