//! # rusq - an etcd-shaped key/value engine over a relational database
//!
//! Process entry point: parses flags, initializes tracing, assembles the
//! engine and runs it until SIGTERM/SIGINT.

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use rusq::revlog::compact::CompactConfig;
use rusq::revlog::poll::PollConfig;
use rusq::server::{RusqServer, ServerConfig};
use rusq::store::{PoolConfig, TlsConfig};

/// An etcd-shaped key/value engine backed by SQLite, PostgreSQL or MySQL.
///
/// rusq persists a Kubernetes-style control plane's state in an ordinary
/// relational database while preserving etcd's revision, watch and lease
/// semantics. A gRPC frontend embeds this process's engine; run standalone
/// it maintains the log (polling, compaction, lease expiry) for clients
/// linked in-process.
#[derive(Parser, Debug)]
#[command(name = "rusq", version, about)]
struct Args {
    /// Backend URI. The scheme selects the driver:
    /// sqlite://, postgres:// or mysql://.
    #[arg(long, default_value = "sqlite://rusq.db")]
    datastore_endpoint: String,

    /// Name of the revision-log table.
    #[arg(long, default_value = "kine")]
    table_name: String,

    /// Apply schema migrations 0..n at startup.
    #[arg(long, default_value_t = 0)]
    schema_migration_level: usize,

    /// Maximum open connections in the pool.
    #[arg(long, default_value_t = 5)]
    pool_max_open: u32,

    /// Idle connections kept warm in the pool.
    #[arg(long, default_value_t = 2)]
    pool_max_idle: u32,

    /// Maximum connection lifetime in seconds (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    pool_max_lifetime: u64,

    /// Seconds between compaction passes.
    #[arg(long, default_value_t = 300)]
    compact_interval: u64,

    /// Revisions of history kept behind the current head.
    #[arg(long, default_value_t = 1000)]
    compact_retention: i64,

    /// Watch poll interval in milliseconds (clamped to 100..5000).
    #[arg(long, default_value_t = 500)]
    poll_interval: u64,

    /// Rows fetched per poll tick.
    #[arg(long, default_value_t = 500)]
    poll_batch_limit: i64,

    /// Seconds a missing revision may stay invisible before the poller
    /// skips it.
    #[arg(long, default_value_t = 5)]
    poll_commit_grace: u64,

    /// CA bundle for TLS to the backend.
    #[arg(long)]
    tls_ca: Option<String>,

    /// Client certificate for TLS to the backend.
    #[arg(long)]
    tls_cert: Option<String>,

    /// Client key for TLS to the backend.
    #[arg(long)]
    tls_key: Option<String>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level);

    let config = build_server_config(&args);
    info!(
        endpoint = %config.datastore_endpoint,
        table = %config.table_name,
        "starting rusq"
    );

    let server = RusqServer::new(config).await?;
    let shutdown = setup_signal_handlers();

    match server.run(shutdown).await {
        Ok(()) => {
            info!("server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("server error: {e:?}");
            Err(e)
        }
    }
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) {
    let env_filter = match log_level {
        "trace" | "debug" | "info" | "warn" | "error" => EnvFilter::new(log_level),
        _ => {
            eprintln!("Invalid log level: {log_level}. Using 'info'");
            EnvFilter::new("info")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

fn build_server_config(args: &Args) -> ServerConfig {
    ServerConfig {
        datastore_endpoint: args.datastore_endpoint.clone(),
        table_name: args.table_name.clone(),
        schema_migration_level: args.schema_migration_level,
        connection_pool: PoolConfig {
            max_open: args.pool_max_open,
            max_idle: args.pool_max_idle,
            max_lifetime: match args.pool_max_lifetime {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        },
        compact: CompactConfig {
            interval: Duration::from_secs(args.compact_interval),
            retention: args.compact_retention,
        },
        poll: PollConfig {
            interval: Duration::from_millis(args.poll_interval),
            batch_limit: args.poll_batch_limit,
            commit_grace: Duration::from_secs(args.poll_commit_grace),
        },
        tls: TlsConfig {
            ca: args.tls_ca.clone(),
            cert: args.tls_cert.clone(),
            key: args.tls_key.clone(),
        },
        ..ServerConfig::default()
    }
}

/// Resolves on SIGTERM or SIGINT.
fn setup_signal_handlers() -> impl std::future::Future<Output = ()> {
    async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }
}
