//! The poll loop: turns row inserts into the ordered event stream.
//!
//! The backing databases offer no notification primitive, so the poller
//! reads `after(last_broadcast_id)` on an interval and feeds the
//! broadcaster. Databases also do not commit in id order: a row with id N
//! can land after N+1 is already visible. The poller therefore never
//! emits id k until every smaller id is present or has been missing
//! longer than the commit-grace window, at which point the hole is
//! treated as skipped. That rule is what keeps every watcher gap-free
//! and monotone.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backend::Event;
use crate::errors::Error;
use crate::revlog::{LogRow, RevisionLog};
use crate::watch::Broadcaster;

/// Hard bounds on the poll interval.
const INTERVAL_FLOOR: Duration = Duration::from_millis(100);
const INTERVAL_CEILING: Duration = Duration::from_secs(5);

/// Poll loop tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollConfig {
    /// Base tick interval, clamped to [100 ms, 5 s]. Each tick adds up to
    /// an eighth of jitter.
    pub interval: Duration,

    /// Rows fetched per tick.
    pub batch_limit: i64,

    /// How long a missing id may stay invisible before it is treated as
    /// skipped.
    pub commit_grace: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            batch_limit: 500,
            commit_grace: Duration::from_secs(5),
        }
    }
}

/// Background task feeding the broadcaster from the log.
pub struct Poller {
    log: Arc<RevisionLog>,
    hub: Arc<Broadcaster>,
    config: PollConfig,
}

impl Poller {
    pub fn new(log: Arc<RevisionLog>, hub: Arc<Broadcaster>, config: PollConfig) -> Self {
        Self { log, hub, config }
    }

    /// Spawns the poll loop. It runs until the shutdown flag flips.
    pub fn run(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
        })
    }

    async fn run_loop(self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.config.interval.clamp(INTERVAL_FLOOR, INTERVAL_CEILING);
        let max_jitter_ms = (interval.as_millis() / 8) as u64;

        // The live stream starts at the current head; watchers that need
        // history catch up from the log.
        let mut last = loop {
            match self.log.current_revision().await {
                Ok(rev) => break rev,
                Err(e) => {
                    warn!(error = %e, "poller cannot read current revision, retrying");
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        };
        self.hub.set_head(last);
        debug!(head = last, ?interval, "poller started");

        let mut gap_since: Option<Instant> = None;
        loop {
            let jitter = {
                let mut rng = rand::thread_rng();
                Duration::from_millis(rng.gen_range(0..=max_jitter_ms))
            };
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = sleep(interval + jitter) => {}
            }

            let tick_start = Instant::now();
            match self.log.after("", last, self.config.batch_limit).await {
                Ok(rows) => {
                    let (ready, new_last, skipped) = split_ready(
                        last,
                        rows,
                        &mut gap_since,
                        Instant::now(),
                        self.config.commit_grace,
                    );
                    if skipped > 0 {
                        warn!(skipped, "ids never became visible, treating as skipped");
                    }
                    if new_last > last {
                        let events: Vec<Event> = ready.iter().map(LogRow::to_event).collect();
                        self.hub.publish(&events, new_last);
                        last = new_last;
                    }
                }
                Err(Error::Compacted) => {
                    // Compaction overtook the broadcast head; resume there.
                    let watermark = self.log.compact_revision().await.unwrap_or(last);
                    warn!(last, watermark, "broadcast head fell below the watermark");
                    last = last.max(watermark);
                }
                Err(e) => {
                    // Transient; the next tick retries.
                    warn!(error = %e, "poll query failed");
                }
            }
            self.log.record_poll_latency(tick_start.elapsed());
        }
        debug!("poller stopped");
    }
}

/// Splits a polled batch into the emit-ready prefix and the new broadcast
/// head, enforcing the gap rule. `gap_since` persists across ticks: it
/// stamps when the oldest unresolved hole was first seen, and clears once
/// the hole fills or ages out. Returns the count of ids given up on.
fn split_ready(
    last: i64,
    rows: Vec<LogRow>,
    gap_since: &mut Option<Instant>,
    now: Instant,
    grace: Duration,
) -> (Vec<LogRow>, i64, u64) {
    let mut ready = Vec::with_capacity(rows.len());
    let mut expect = last + 1;
    let mut skipped: u64 = 0;

    for row in rows {
        if row.id < expect {
            continue;
        }
        if row.id == expect {
            ready.push(row);
            expect += 1;
            continue;
        }
        // Hole [expect, row.id): wait for the missing ids unless they have
        // exceeded the grace window.
        match *gap_since {
            None => {
                *gap_since = Some(now);
                return (ready, expect - 1, skipped);
            }
            Some(first_seen) if now.duration_since(first_seen) < grace => {
                return (ready, expect - 1, skipped);
            }
            Some(_) => {
                skipped += (row.id - expect) as u64;
                *gap_since = None;
                expect = row.id + 1;
                ready.push(row);
            }
        }
    }

    *gap_since = None;
    (ready, expect - 1, skipped)
}
