use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use histguard_cli::{app, load_config};
use histguard_history::{HistoryList, IntegrityMode};
use policy_sandbox::module_hash;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// histguard - history-aware bearer token validation
#[derive(Parser)]
#[command(author, version = long_version(), about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Metrics server port (set to 0 to disable)
    #[arg(long, default_value_t = 0)]
    metrics_port: u16,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo events API behind the validator
    Serve(ServeArgs),
    /// Print the content hash of a policy or update module
    PolicyHash(PolicyHashArgs),
    /// Print the digest of a single-object history envelope
    Digest(DigestArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Listen address, overrides the configuration
    #[arg(long)]
    listen: Option<std::net::SocketAddr>,
}

#[derive(Args)]
struct PolicyHashArgs {
    /// Module file (binary or text format)
    file: PathBuf,
}

#[derive(Args)]
struct DigestArgs {
    /// File holding `{"obj_id": [entries...]}`
    file: PathBuf,

    /// HMAC key as hex; without it a plain SHA-256 digest is printed
    #[arg(long)]
    key: Option<String>,
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("GIT_HASH"),
        ", built ",
        env!("BUILD_DATE"),
        ")"
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_json)?;

    let result = match cli.command {
        Commands::Serve(args) => cmd_serve(args, cli.config, cli.metrics_port).await,
        Commands::PolicyHash(args) => cmd_policy_hash(args),
        Commands::Digest(args) => cmd_digest(args),
    };

    if let Err(err) = result {
        error!("command failed: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_logging(level: &str, json: bool) -> Result<()> {
    let level: tracing::Level = level.parse().context("Invalid log level")?;
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
    Ok(())
}

async fn cmd_serve(args: ServeArgs, config: Option<PathBuf>, metrics_port: u16) -> Result<()> {
    let mut config = load_config(config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    histguard_cli::metrics::register_metrics();
    let _metrics_server = histguard_cli::metrics::spawn_metrics_server(metrics_port);

    info!("Starting histguard v{}", env!("CARGO_PKG_VERSION"));
    app::serve(&config).await
}

fn cmd_policy_hash(args: PolicyHashArgs) -> Result<()> {
    let bytes = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    println!("{}", module_hash(&bytes));
    Ok(())
}

fn cmd_digest(args: DigestArgs) -> Result<()> {
    let raw = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let list = HistoryList::from_json(&raw).context("not a history envelope")?;
    let digest = match args.key {
        Some(key) => {
            let key = hex::decode(key.trim()).context("--key is not hex")?;
            list.digest_with(IntegrityMode::Hmac, Some(&key))
                .map_err(|err| anyhow!("{err}"))?
        }
        None => list.digest(),
    };
    println!("{}", digest.to_hex());
    Ok(())
}
