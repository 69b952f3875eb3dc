//! Main server module that orchestrates all subsystems.
//!
//! This module coordinates the initialization and execution of:
//! - Generic store and dialect over the configured backend
//! - The append-only revision log
//! - The watch broadcaster and its poll loop
//! - The log-structured key/value engine
//! - The lease manager, its expiry loop and cascade worker
//! - The background compactor
//!
//! An etcd-facing transport embeds this server and talks to it through
//! [`crate::backend::Backend`] and the lease manager handle.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::errors::Error;
use crate::kv::KvEngine;
use crate::lease::{LeaseConfig, LeaseExpireEvent, LeaseManager};
use crate::revlog::compact::{CompactConfig, Compactor};
use crate::revlog::poll::{PollConfig, Poller};
use crate::revlog::RevisionLog;
use crate::store::{PoolConfig, Store, TlsConfig};
use crate::watch::{Broadcaster, WatchConfig};

/// Capacity of the lease expiry channel.
const EXPIRE_QUEUE: usize = 1000;

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Backend URI; the scheme selects the driver.
    pub datastore_endpoint: String,

    /// Name of the revision-log table.
    pub table_name: String,

    /// Applies schema migrations `0..n` at startup.
    pub schema_migration_level: usize,

    pub connection_pool: PoolConfig,
    pub compact: CompactConfig,
    pub poll: PollConfig,
    pub watch: WatchConfig,
    pub lease: LeaseConfig,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            datastore_endpoint: "sqlite://rusq.db".to_string(),
            table_name: "kine".to_string(),
            schema_migration_level: 0,
            connection_pool: PoolConfig::default(),
            compact: CompactConfig::default(),
            poll: PollConfig::default(),
            watch: WatchConfig::default(),
            lease: LeaseConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

/// The assembled engine with its background tasks.
pub struct RusqServer {
    config: ServerConfig,
    backend: Arc<KvEngine>,
    lease_mgr: Arc<LeaseManager>,
    log: Arc<RevisionLog>,
    hub: Arc<Broadcaster>,
    shutdown_tx: watch::Sender<bool>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl RusqServer {
    /// Builds every subsystem and starts the long-lived tasks: one
    /// poller, one compactor, one lease-expiry loop, one lease index
    /// feed, one cascade worker.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        info!(
            endpoint = %config.datastore_endpoint,
            table = %config.table_name,
            "initializing rusq server"
        );

        let store = Store::connect(
            &config.datastore_endpoint,
            &config.table_name,
            &config.connection_pool,
            &config.tls,
        )
        .await?;
        store.setup(config.schema_migration_level).await?;
        debug!("backend schema ready");

        let log = RevisionLog::new(store);
        let hub = Broadcaster::new(log.clone(), config.watch.clone());

        // The live-stream head must be pinned before any subscriber can
        // attach, or an early watcher would misjudge its catch-up need.
        let head = log.current_revision().await?;
        hub.set_head(head);

        let backend = KvEngine::new(log.clone(), hub.clone());

        let (expire_tx, expire_rx) = mpsc::channel(EXPIRE_QUEUE);
        let lease_mgr = LeaseManager::new(expire_tx);

        // Leases do not survive a restart; rebuild the reverse index from
        // the live rows and give the ids a fresh deadline.
        let (_, live) = backend.list("", 0, 0).await?;
        let leased: Vec<(String, i64)> = live
            .into_iter()
            .filter(|kv| kv.lease != 0)
            .map(|kv| (kv.key, kv.lease))
            .collect();
        lease_mgr.hydrate(&leased, config.lease.recovered_ttl);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut background_tasks = Vec::new();

        let poller = Poller::new(log.clone(), hub.clone(), config.poll.clone());
        background_tasks.push(poller.run(shutdown_rx.clone()));

        let compactor = Compactor::new(log.clone(), config.compact.clone());
        background_tasks.push(compactor.run(shutdown_rx.clone()));

        let index_feed = hub.subscribe("", 0).await?;
        background_tasks.push(tokio::spawn(
            lease_mgr.clone().run_index(index_feed, shutdown_rx.clone()),
        ));

        background_tasks.push(tokio::spawn(
            lease_mgr.clone().run_expiry_loop(shutdown_rx.clone()),
        ));

        background_tasks.push(tokio::spawn(cascade_expirations(
            expire_rx,
            backend.clone(),
            shutdown_rx,
        )));

        info!(head, "rusq server initialization complete");
        Ok(Self {
            config,
            backend,
            lease_mgr,
            log,
            hub,
            shutdown_tx,
            background_tasks,
        })
    }

    /// Runs until `shutdown` resolves, then drains the background tasks.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
        info!("rusq server running");
        shutdown.await;
        self.stop().await;
        Ok(())
    }

    /// Flags every loop down and waits for in-flight work to finish.
    pub async fn stop(self) {
        info!("rusq server shutting down");
        let _ = self.shutdown_tx.send(true);
        for task in self.background_tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }
        info!("rusq server stopped");
    }

    /// The etcd-semantic operations handle.
    pub fn backend(&self) -> Arc<KvEngine> {
        self.backend.clone()
    }

    pub fn lease_manager(&self) -> Arc<LeaseManager> {
        self.lease_mgr.clone()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.hub.clone()
    }

    pub fn revision_log(&self) -> Arc<RevisionLog> {
        self.log.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Last observed poll latency, for operators.
    pub fn poll_latency(&self) -> Duration {
        self.log.last_poll_latency()
    }
}

/// Deletes the keys of expired leases through the engine, so watchers see
/// the DELETE events on the ordinary log path.
async fn cascade_expirations(
    mut expire_rx: mpsc::Receiver<LeaseExpireEvent>,
    backend: Arc<KvEngine>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            ev = expire_rx.recv() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };

        info!(
            lease_id = event.lease_id,
            key_count = event.keys.len(),
            "cascading lease expiry"
        );
        for key in &event.keys {
            match backend.delete(key, 0).await {
                Ok((rev, _)) => debug!(key, rev, "deleted expired key"),
                // Already gone; the index just lagged.
                Err(Error::NotFound) => {}
                Err(e) => warn!(key, error = %e, "failed to delete expired key"),
            }
        }
    }
    debug!("lease cascade worker stopped");
}
