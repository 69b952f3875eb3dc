//! The append-only revision log.
//!
//! One table, one row per mutation. The id the database assigns on insert
//! is the cluster revision and the sole source of global ordering. A
//! distinguished bookkeeping row carries the compact watermark in its
//! `prev_revision` column; historical reads below the watermark fail with
//! `Compacted`.
//!
//! Compare-and-swap never takes a lock here: the unique index on
//! `(name, prev_revision)` makes the database itself the serializer, and
//! the store translates the resulting unique violation to `KeyExists`.

pub mod compact;
pub mod poll;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::backend::{Event, KeyValue};
use crate::dialect::COMPACT_REV_KEY;
use crate::errors::{Error, Result};
use crate::store::{Param, Store};

/// Revisions removed per compaction statement, bounding transaction size.
const COMPACT_BATCH: i64 = 1000;

/// One durable row of the log.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct LogRow {
    pub id: i64,
    pub name: String,
    pub created: i64,
    pub deleted: i64,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Option<Vec<u8>>,
    pub old_value: Option<Vec<u8>>,
}

impl LogRow {
    pub fn is_created(&self) -> bool {
        self.created != 0
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted != 0
    }

    /// The revision that created this row's incarnation of the key. A
    /// creation row cannot know its own id before insert, so it stores 0
    /// and resolves to its id on read.
    pub fn effective_create_revision(&self) -> i64 {
        if self.is_created() {
            self.id
        } else {
            self.create_revision
        }
    }

    /// The key/value pair this row materializes.
    pub fn to_key_value(&self) -> KeyValue {
        KeyValue {
            key: self.name.clone(),
            create_revision: self.effective_create_revision(),
            mod_revision: self.id,
            lease: self.lease,
            value: self.value.clone().unwrap_or_default(),
        }
    }

    /// The superseded incarnation, rebuilt from the in-lined old value.
    pub fn prev_key_value(&self) -> Option<KeyValue> {
        if self.prev_revision == 0 {
            return None;
        }
        Some(KeyValue {
            key: self.name.clone(),
            // A re-creation supersedes a tombstone from an earlier
            // incarnation whose create revision the row no longer knows.
            create_revision: if self.is_created() {
                0
            } else {
                self.create_revision
            },
            mod_revision: self.prev_revision,
            lease: 0,
            value: self.old_value.clone().unwrap_or_default(),
        })
    }

    pub fn to_event(&self) -> Event {
        Event {
            create: self.is_created(),
            delete: self.is_deleted(),
            kv: self.to_key_value(),
            prev_kv: self.prev_key_value(),
        }
    }
}

/// A list query also reports the revision it executed at, from the same
/// statement, so the pair is consistent.
#[derive(Debug, sqlx::FromRow)]
struct ListedRow {
    current_id: i64,
    id: i64,
    name: String,
    created: i64,
    deleted: i64,
    create_revision: i64,
    prev_revision: i64,
    lease: i64,
    value: Option<Vec<u8>>,
    old_value: Option<Vec<u8>>,
}

impl ListedRow {
    fn into_row(self) -> LogRow {
        LogRow {
            id: self.id,
            name: self.name,
            created: self.created,
            deleted: self.deleted,
            create_revision: self.create_revision,
            prev_revision: self.prev_revision,
            lease: self.lease,
            value: self.value,
            old_value: self.old_value,
        }
    }
}

/// Field set for one append.
#[derive(Clone, Debug, Default)]
pub struct AppendRecord {
    pub name: String,
    pub created: bool,
    pub deleted: bool,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: Vec<u8>,
    pub old_value: Vec<u8>,
}

/// The revision log over a generic store.
pub struct RevisionLog {
    store: Arc<Store>,
    /// Serializes compaction within the process; cross-process races are
    /// bounded by the monotone watermark update.
    compact_lock: Mutex<()>,
    last_poll_latency_us: AtomicU64,
}

impl RevisionLog {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            compact_lock: Mutex::new(()),
            last_poll_latency_us: AtomicU64::new(0),
        })
    }

    /// Appends one row, returning the assigned revision. Fails with
    /// `KeyExists` when `(name, prev_revision)` collides.
    pub async fn append(&self, rec: &AppendRecord) -> Result<i64> {
        let params = [
            Param::Str(rec.name.clone()),
            Param::I64(rec.created as i64),
            Param::I64(rec.deleted as i64),
            Param::I64(rec.create_revision),
            Param::I64(rec.prev_revision),
            Param::I64(rec.lease),
            Param::Bytes(rec.value.clone()),
            Param::Bytes(rec.old_value.clone()),
        ];
        self.store
            .insert(&self.store.dialect().insert_sql, &params)
            .await
    }

    /// Highest assigned revision, 0 on an empty log.
    pub async fn current_revision(&self) -> Result<i64> {
        self.store
            .fetch_i64(&self.store.dialect().current_revision_sql, &[])
            .await
    }

    /// The compact watermark, 0 before the first compaction.
    pub async fn compact_revision(&self) -> Result<i64> {
        self.store
            .fetch_i64(&self.store.dialect().compact_revision_sql, &[])
            .await
    }

    /// State of the keys matching `prefix` as of `revision` (0 = latest):
    /// for each name the row with the greatest id at or below the bound,
    /// tombstones omitted unless `include_deleted`. Returns the revision
    /// the query executed at alongside the rows, in name order.
    pub async fn list(
        &self,
        prefix: &str,
        limit: i64,
        revision: i64,
        include_deleted: bool,
    ) -> Result<(i64, Vec<LogRow>)> {
        self.check_compacted(revision).await?;

        let dialect = self.store.dialect();
        let (mut sql, mut params) = if revision > 0 {
            (
                dialect.list_revision_sql.clone(),
                vec![
                    Param::Str(like_pattern(prefix)),
                    Param::I64(revision),
                    Param::Bool(include_deleted),
                ],
            )
        } else {
            (
                dialect.list_current_sql.clone(),
                vec![
                    Param::Str(like_pattern(prefix)),
                    Param::Bool(include_deleted),
                ],
            )
        };
        if limit > 0 {
            sql.push_str(" LIMIT ?");
            params.push(Param::I64(limit));
        }

        let listed: Vec<ListedRow> = self.store.fetch_all(&sql, &params).await?;
        match listed.first() {
            Some(first) => {
                let current = first.current_id;
                Ok((current, listed.into_iter().map(ListedRow::into_row).collect()))
            }
            None => Ok((self.current_revision().await?, vec![])),
        }
    }

    /// Count of live keys under `prefix` as of `revision` (0 = latest),
    /// with the revision the count was taken at.
    pub async fn count(&self, prefix: &str, revision: i64) -> Result<(i64, i64)> {
        self.check_compacted(revision).await?;

        let dialect = self.store.dialect();
        let (sql, params) = if revision > 0 {
            (
                dialect.count_revision_sql.as_str(),
                vec![Param::Str(like_pattern(prefix)), Param::I64(revision)],
            )
        } else {
            (
                dialect.count_current_sql.as_str(),
                vec![Param::Str(like_pattern(prefix))],
            )
        };
        let rows: Vec<(i64, i64)> = self.store.fetch_all(sql, &params).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::Internal("count query returned no row".to_string()))
    }

    /// Every row with `id > start_revision` whose name matches `prefix`,
    /// in id order, up to `limit` rows (0 = unlimited). Fails with
    /// `Compacted` when the requested span has been purged.
    pub async fn after(&self, prefix: &str, start_revision: i64, limit: i64) -> Result<Vec<LogRow>> {
        let watermark = self.compact_revision().await?;
        if start_revision < watermark {
            return Err(Error::Compacted);
        }

        let mut sql = self.store.dialect().after_sql.clone();
        let mut params = vec![Param::Str(like_pattern(prefix)), Param::I64(start_revision)];
        if limit > 0 {
            sql.push_str(" LIMIT ?");
            params.push(Param::I64(limit));
        }
        self.store.fetch_all(&sql, &params).await
    }

    /// Compacts history up to `target`, in bounded chunks, advancing the
    /// watermark after each chunk. Rows survive only while live for their
    /// key. Returns the watermark actually reached.
    pub async fn compact_to(&self, target: i64) -> Result<i64> {
        let _guard = self.compact_lock.lock().await;

        let current = self.current_revision().await?;
        let target = target.min(current);
        let mut watermark = self.compact_revision().await?;
        if target <= watermark {
            return Ok(watermark);
        }

        let dialect = self.store.dialect();
        while watermark < target {
            let upto = (watermark + COMPACT_BATCH).min(target);
            let swept = self
                .store
                .execute(&dialect.compact_sql, &[Param::I64(upto), Param::I64(upto)])
                .await?;
            self.advance_watermark(upto).await?;
            debug!(upto, swept, "compacted log chunk");
            watermark = upto;
        }

        info!(watermark, "log compacted");
        Ok(watermark)
    }

    /// Table size in bytes, per the dialect's size query.
    pub async fn db_size(&self) -> Result<i64> {
        self.store
            .fetch_i64(&self.store.dialect().get_size_sql, &[])
            .await
    }

    pub fn record_poll_latency(&self, elapsed: Duration) {
        self.last_poll_latency_us
            .store(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn last_poll_latency(&self) -> Duration {
        Duration::from_micros(self.last_poll_latency_us.load(Ordering::Relaxed))
    }

    /// Advances the watermark row, appending it the first time around.
    /// There is exactly one bookkeeping row; every later compaction
    /// updates it in place.
    async fn advance_watermark(&self, upto: i64) -> Result<()> {
        let updated = self
            .store
            .execute(
                &self.store.dialect().update_watermark_sql,
                &[Param::I64(upto)],
            )
            .await?;
        if updated > 0 {
            return Ok(());
        }
        let rec = AppendRecord {
            name: COMPACT_REV_KEY.to_string(),
            prev_revision: upto,
            ..Default::default()
        };
        match self.append(&rec).await {
            Ok(_) => Ok(()),
            // Another instance wrote the same watermark first.
            Err(Error::KeyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// An explicit revision below the watermark is gone.
    async fn check_compacted(&self, revision: i64) -> Result<()> {
        if revision <= 0 {
            return Ok(());
        }
        let watermark = self.compact_revision().await?;
        if revision < watermark {
            return Err(Error::Compacted);
        }
        Ok(())
    }
}

/// LIKE pattern matching every name that begins with `prefix`.
fn like_pattern(prefix: &str) -> String {
    format!("{prefix}%")
}
