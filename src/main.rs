//! Storage Reconciler CLI
//!
//! ```text
//! storage-reconciler --config cluster.yaml apply   --manifest resources.yaml --state state.json
//! storage-reconciler --config cluster.yaml refresh --state state.json
//! storage-reconciler --config cluster.yaml destroy --state state.json
//! storage-reconciler --config cluster.yaml import  --manifest resources.yaml --state state.json \
//!     --address svm.main --id 0b1c8a34-...
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_reconciler::{
    Diagnostics, Identity, Manifest, OperationContext, ProviderConfig, Reconciler, StateFile,
};

/// Exit code when every failure may succeed on a rerun (EX_TEMPFAIL)
const EXIT_RETRYABLE: i32 = 75;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Reconciler - declarative SVM, snapshot and replication management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Connection profiles and poll settings (YAML)
    #[arg(long, env = "STORAGE_RECONCILER_CONFIG", default_value = "storage-reconciler.yaml")]
    config: PathBuf,

    /// Password for profiles that do not set one
    #[arg(long, env = "STORAGE_RECONCILER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Time limit for each resource operation, in seconds
    #[arg(long, env = "OPERATION_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create, update and delete resources to match the manifest
    Apply {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, default_value = "state.json")]
        state: PathBuf,
    },
    /// Re-read every tracked resource
    Refresh {
        #[arg(long, default_value = "state.json")]
        state: PathBuf,
    },
    /// Delete every tracked resource
    Destroy {
        #[arg(long, default_value = "state.json")]
        state: PathBuf,
    },
    /// Track an existing backend object under a manifest address
    Import {
        #[arg(long)]
        manifest: PathBuf,
        #[arg(long, default_value = "state.json")]
        state: PathBuf,
        /// Manifest address to import into
        #[arg(long)]
        address: String,
        /// Backend identifier (uuid) of the object
        #[arg(long)]
        id: String,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Storage Reconciler");
    info!("  Version: {}", storage_reconciler::VERSION);
    info!("  Config: {}", args.config.display());

    let config = ProviderConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .with_default_password(args.password.as_deref());

    let mut reconciler = Reconciler::new(config);
    if let Some(secs) = args.timeout_secs {
        reconciler = reconciler.with_operation_timeout(Duration::from_secs(secs));
    }

    let token = CancellationToken::new();
    let run = OperationContext::new().with_cancellation(token.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling the running operation");
            token.cancel();
        }
    });

    let mut diagnostics = Diagnostics::new();

    match args.command {
        Command::Apply { manifest, state } => {
            let manifest = Manifest::load(&manifest)
                .with_context(|| format!("loading {}", manifest.display()))?;
            let mut tracked = StateFile::load(&state)?;
            let summary = reconciler
                .apply(&run, &manifest, &mut tracked, &mut diagnostics)
                .await;
            tracked.save(&state)?;
            println!("Apply complete: {}", summary);
        }
        Command::Refresh { state } => {
            let mut tracked = StateFile::load(&state)?;
            let summary = reconciler.refresh(&run, &mut tracked, &mut diagnostics).await;
            tracked.save(&state)?;
            println!("Refresh complete: {}", summary);
        }
        Command::Destroy { state } => {
            let mut tracked = StateFile::load(&state)?;
            let summary = reconciler.destroy(&run, &mut tracked, &mut diagnostics).await;
            tracked.save(&state)?;
            println!("Destroy complete: {}", summary);
        }
        Command::Import {
            manifest: manifest_path,
            state,
            address,
            id,
        } => {
            let manifest = Manifest::load(&manifest_path)
                .with_context(|| format!("loading {}", manifest_path.display()))?;
            let Some(entry) = manifest.entry(&address) else {
                bail!("{} is not an address in {}", address, manifest_path.display());
            };
            let mut tracked = StateFile::load(&state)?;
            if let Err(err) = reconciler
                .import(&run, entry, Identity::new(id), &mut tracked)
                .await
            {
                diagnostics.record(&address, err);
            } else {
                tracked.save(&state)?;
                println!("Imported {}", address);
            }
        }
    }

    if diagnostics.is_empty() {
        return Ok(());
    }
    for diagnostic in diagnostics.iter() {
        eprintln!("{}", diagnostic);
    }
    if diagnostics.has_errors() {
        let code = if diagnostics.all_retryable() { EXIT_RETRYABLE } else { 1 };
        std::process::exit(code);
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},hyper=warn,reqwest=warn,rustls=warn",
            level.to_string().to_lowercase()
        ))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
