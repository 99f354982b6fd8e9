//! Ceph Reconciler
//!
//! Applies and destroys declarative manifests of Ceph pools, RBD volumes and
//! snapshots, and reads or deletes single resources.
//!
//! ```text
//! ceph-reconciler apply cluster.yaml
//! ceph-reconciler destroy cluster.yaml --wait
//! ceph-reconciler read volume ceph1/rbd/vol1
//! ceph-reconciler delete snapshot ceph1/rbd/vol1@s1
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ceph_reconciler::manifest::{self, Manifest, Report};
use ceph_reconciler::{
    BackendFactory, BackendKind, Config, ConnectionRegistry, ReconcileMetrics, Reconciler,
    ResourceKind,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Ceph Reconciler - idempotent pool, volume and snapshot management
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, global = true, env = "CEPH_RECONCILER_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated cluster identifiers
    #[arg(long, global = true, env = "CEPH_CLUSTER")]
    cluster: Option<String>,

    /// Backend adapter (rbd-cli, memory)
    #[arg(long, global = true, env = "CEPH_BACKEND")]
    backend: Option<BackendKind>,

    /// Directory holding `<cluster>.conf` files
    #[arg(long, global = true, env = "CEPH_CONF_DIR")]
    conf_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    /// Write Prometheus metrics to stderr before exiting
    #[arg(long, global = true)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the tool version and the version of each configured cluster
    Version,

    /// Reconcile every resource of a manifest in order
    Apply {
        manifest: PathBuf,
    },

    /// Delete every resource of a manifest in reverse order
    Destroy {
        manifest: PathBuf,

        /// Retry volume deletion until it succeeds or the wait timeout elapses
        #[arg(long)]
        wait: bool,
    },

    /// Read one resource (pool, volume, snapshot)
    Read {
        kind: ResourceKind,
        id: String,
    },

    /// Delete one resource (pool, volume, snapshot)
    Delete {
        kind: ResourceKind,
        id: String,

        /// Retry volume deletion until it succeeds or the wait timeout elapses
        #[arg(long)]
        wait: bool,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting Ceph Reconciler");
    info!("  Version: {}", ceph_reconciler::VERSION);
    info!("  Backend: {}", config.backend);
    info!("  Clusters: {}", config.cluster);

    let connector = BackendFactory::connector(config.backend, &config.rbd_cli);
    let registry = ConnectionRegistry::new(connector);
    let metrics = ReconcileMetrics::new()?;
    let reconciler = Reconciler::new(registry.clone(), metrics.clone());

    let outcome = run(&args.command, &config, &reconciler).await;

    let closed = registry.teardown_all().await;
    info!("Closed {} cluster connection(s)", closed);

    if args.print_metrics {
        eprint!("{}", metrics.encode_text()?);
    }

    if !outcome? {
        std::process::exit(1);
    }
    Ok(())
}

/// Execute one subcommand. Returns whether it fully succeeded.
async fn run(command: &Command, config: &Config, reconciler: &Reconciler) -> anyhow::Result<bool> {
    match command {
        Command::Version => {
            let mut clusters = serde_json::Map::new();
            for cluster in config.clusters() {
                let version = reconciler
                    .version(&cluster)
                    .await
                    .with_context(|| format!("querying version of cluster '{}'", cluster))?;
                clusters.insert(cluster, version.into());
            }
            print_json(&serde_json::json!({
                "version": ceph_reconciler::VERSION,
                "clusters": clusters,
            }))?;
            Ok(true)
        }
        Command::Apply { manifest: path } => {
            let desired = load_manifest(path)?;
            report(manifest::apply(reconciler, &desired).await)
        }
        Command::Destroy { manifest: path, wait } => {
            let desired = load_manifest(path)?;
            let policy = config.wait_policy();
            let wait = wait.then_some(&policy);
            report(manifest::destroy(reconciler, &desired, wait).await)
        }
        Command::Read { kind, id } => {
            let observed = manifest::read_resource(reconciler, *kind, id).await?;
            print_json(&observed)?;
            Ok(true)
        }
        Command::Delete { kind, id, wait } => {
            let policy = config.wait_policy();
            let wait = wait.then_some(&policy);
            manifest::delete_resource(reconciler, *kind, id, wait).await?;
            print_json(&serde_json::json!({ "deleted": { "kind": kind, "id": id } }))?;
            Ok(true)
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(cluster) = &args.cluster {
        config.cluster = cluster.clone();
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }
    if let Some(conf_dir) = &args.conf_dir {
        config.rbd_cli.conf_dir = conf_dir.clone();
    }

    config.validate()?;
    Ok(config)
}

fn load_manifest(path: &Path) -> anyhow::Result<Manifest> {
    Manifest::load(path).with_context(|| format!("loading manifest {}", path.display()))
}

fn report(report: Report) -> anyhow::Result<bool> {
    print_json(&report)?;
    if let Some(failure) = &report.failed {
        warn!("stopped at {} '{}'", failure.kind, failure.id.as_deref().unwrap_or("-"));
    }
    Ok(report.is_success())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
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

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "tokio=warn".parse() {
        filter = filter.add_directive(directive);
    }

    // Logs go to stderr so stdout carries only JSON results
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
