mod validate_commands;

use std::path::{Path, PathBuf};

use {
    clap::{Parser, Subcommand},
    tokio::task::JoinSet,
    tokio_util::sync::CancellationToken,
    tracing::{error, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "tether", about = "tether: Discord ↔ LLM relay", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (default: ./tether.toml, then ~/.config/tether/).
    #[arg(long, global = true, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured bot (default when no subcommand is provided).
    Run,
    /// Validate the configuration file and report errors/warnings.
    Validate {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command {
        None | Some(Commands::Run) => {
            info!(version = env!("CARGO_PKG_VERSION"), "tether starting");
            run(cli.config.as_deref()).await
        },
        Some(Commands::Validate { verbose }) => {
            validate_commands::check(cli.config.as_deref(), verbose)
        },
    }
}

/// Run all bots until Ctrl-C or until every bot has stopped.
async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = tether_config::load_from(config_path)?;
    if config.bots.is_empty() {
        anyhow::bail!("no bots configured; add a [[bots]] entry to the config file");
    }

    let cancel = CancellationToken::new();
    let mut bots = JoinSet::new();
    for bot in config.bots {
        let providers = config.providers.clone();
        let cache = config.cache;
        let cancel = cancel.clone();
        bots.spawn(async move {
            let name = bot.name.clone();
            let result = tether_discord::run_bot(bot, &providers, cache, cancel).await;
            (name, result)
        });
    }

    let mut failures = 0usize;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                if let Err(e) = signal {
                    warn!(error = %e, "failed to listen for ctrl-c");
                }
                info!("shutting down");
                cancel.cancel();
            },
            joined = bots.join_next() => match joined {
                Some(Ok((name, Ok(())))) => info!(bot = %name, "bot stopped"),
                Some(Ok((name, Err(e)))) => {
                    failures += 1;
                    error!(bot = %name, error = %e, "bot failed");
                },
                Some(Err(e)) => {
                    failures += 1;
                    error!(error = %e, "bot task panicked");
                },
                None => break,
            },
        }
    }

    if failures > 0 && !cancel.is_cancelled() {
        anyhow::bail!("{failures} bot(s) failed");
    }
    Ok(())
}
