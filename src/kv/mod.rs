//! The log-structured key/value engine.
//!
//! Translates etcd semantics into appends and queries on the revision
//! log. No operation takes a lock: every conditional write is an insert
//! whose `(name, prev_revision)` pair the database guarantees unique, so
//! the backend itself serializes concurrent writers. Exactly one of two
//! racing writers inserts; the loser's unique violation arrives here as
//! `KeyExists`.
//!
//! Unconditional writes (`revision = 0`) retry translated conflicts
//! against a re-read of the live row; conditional writes surface them
//! unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::backend::{Backend, KeyValue};
use crate::errors::{Error, Result};
use crate::revlog::{AppendRecord, LogRow, RevisionLog};
use crate::watch::{Broadcaster, Watch};

pub struct KvEngine {
    log: Arc<RevisionLog>,
    hub: Arc<Broadcaster>,
}

impl KvEngine {
    pub fn new(log: Arc<RevisionLog>, hub: Arc<Broadcaster>) -> Arc<Self> {
        Arc::new(Self { log, hub })
    }

    /// The newest row for exactly `key`, tombstones included when asked.
    async fn head_row(&self, key: &str, include_deleted: bool) -> Result<(i64, Option<LogRow>)> {
        let (rev, rows) = self.log.list(key, 1, 0, include_deleted).await?;
        Ok((rev, rows.into_iter().find(|r| r.name == key)))
    }
}

#[async_trait]
impl Backend for KvEngine {
    async fn get(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>)> {
        let (rev, rows) = self.log.list(key, 1, revision, false).await?;
        let found = rows
            .into_iter()
            .find(|r| r.name == key)
            .map(|r| r.to_key_value());
        Ok((rev, found))
    }

    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64> {
        let (_, head) = self.head_row(key, true).await?;

        // A re-creation supersedes the tombstone, so two concurrent
        // creators collide on (name, tombstone id) exactly as two first
        // creators collide on (name, 0).
        let prev_revision = match head {
            Some(row) if !row.is_deleted() => return Err(Error::KeyExists),
            Some(row) => row.id,
            None => 0,
        };

        let rev = self
            .log
            .append(&AppendRecord {
                name: key.to_string(),
                created: true,
                deleted: false,
                create_revision: 0,
                prev_revision,
                lease,
                value: value.to_vec(),
                old_value: vec![],
            })
            .await?;
        debug!(key, rev, "created");
        Ok(rev)
    }

    async fn update(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        lease: i64,
    ) -> Result<(i64, KeyValue)> {
        loop {
            let (_, head) = self.head_row(key, false).await?;
            let Some(current) = head else {
                return Err(Error::NotFound);
            };
            if revision != 0 && current.id != revision {
                return Err(Error::KeyExists);
            }

            let create_revision = current.effective_create_revision();
            let result = self
                .log
                .append(&AppendRecord {
                    name: key.to_string(),
                    created: false,
                    deleted: false,
                    create_revision,
                    prev_revision: current.id,
                    lease,
                    value: value.to_vec(),
                    old_value: current.value.clone().unwrap_or_default(),
                })
                .await;

            match result {
                Ok(rev) => {
                    debug!(key, rev, "updated");
                    return Ok((
                        rev,
                        KeyValue {
                            key: key.to_string(),
                            create_revision,
                            mod_revision: rev,
                            lease,
                            value: value.to_vec(),
                        },
                    ));
                }
                // An unconditional write lost a race; take the new head.
                Err(Error::KeyExists) if revision == 0 => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete(&self, key: &str, revision: i64) -> Result<(i64, KeyValue)> {
        loop {
            let (_, head) = self.head_row(key, false).await?;
            let Some(current) = head else {
                return Err(Error::NotFound);
            };
            if revision != 0 && current.id != revision {
                return Err(Error::KeyExists);
            }

            let result = self
                .log
                .append(&AppendRecord {
                    name: key.to_string(),
                    created: false,
                    deleted: true,
                    create_revision: current.effective_create_revision(),
                    prev_revision: current.id,
                    lease: 0,
                    value: vec![],
                    old_value: current.value.clone().unwrap_or_default(),
                })
                .await;

            match result {
                Ok(rev) => {
                    debug!(key, rev, "deleted");
                    return Ok((rev, current.to_key_value()));
                }
                Err(Error::KeyExists) if revision == 0 => continue,
                Err(e) => return Err(e),
            }
        }
    }

    async fn list(
        &self,
        prefix: &str,
        limit: i64,
        revision: i64,
    ) -> Result<(i64, Vec<KeyValue>)> {
        let (rev, rows) = self.log.list(prefix, limit, revision, false).await?;
        Ok((rev, rows.iter().map(LogRow::to_key_value).collect()))
    }

    async fn count(&self, prefix: &str) -> Result<(i64, i64)> {
        self.log.count(prefix, 0).await
    }

    async fn watch(&self, prefix: &str, revision: i64) -> Result<Watch> {
        self.hub.subscribe(prefix, revision).await
    }

    async fn compact(&self, revision: i64) -> Result<i64> {
        self.log.compact_to(revision).await
    }

    async fn db_size(&self) -> Result<i64> {
        self.log.db_size().await
    }

    async fn current_revision(&self) -> Result<i64> {
        self.log.current_revision().await
    }

    async fn compact_revision(&self) -> Result<i64> {
        self.log.compact_revision().await
    }
}
