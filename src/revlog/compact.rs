//! Background compaction of the revision log.
//!
//! Every interval the compactor trims history older than the retention
//! window, leaving each key's live row untouched regardless of age. The
//! deletion itself and the watermark bookkeeping live in
//! [`RevisionLog::compact_to`]; this task only decides the target.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::revlog::RevisionLog;

/// Compaction tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompactConfig {
    /// Pause between compaction passes.
    pub interval: Duration,

    /// Revisions of history to keep behind the current head.
    pub retention: i64,
}

impl Default for CompactConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retention: 1000,
        }
    }
}

/// Periodic compactor over the revision log.
pub struct Compactor {
    log: Arc<RevisionLog>,
    config: CompactConfig,
}

impl Compactor {
    pub fn new(log: Arc<RevisionLog>, config: CompactConfig) -> Self {
        Self { log, config }
    }

    /// Spawns the compaction loop. It runs until the shutdown flag flips.
    pub fn run(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.config.interval);
        debug!(interval = ?self.config.interval, retention = self.config.retention, "compactor started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.compact_once().await {
                warn!(error = %e, "compaction pass failed");
            }
        }
        debug!("compactor stopped");
    }

    async fn compact_once(&self) -> crate::errors::Result<()> {
        let current = self.log.current_revision().await?;
        let watermark = self.log.compact_revision().await?;
        let target = current - self.config.retention;
        if target <= watermark {
            return Ok(());
        }

        let reached = self.log.compact_to(target).await?;
        info!(current, watermark = reached, "compaction pass complete");
        Ok(())
    }
}
