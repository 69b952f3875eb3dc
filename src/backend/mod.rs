//! The server contract: what an etcd-facing adapter consumes.
//!
//! The gRPC transport lives outside this crate; it binds to [`Backend`]
//! and to the lease manager. Revisions surfaced here are always log ids.

use async_trait::async_trait;

use crate::errors::Result;
use crate::watch::Watch;

/// A key with its value and revision metadata at some point in time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,

    /// Revision of the row that created the current incarnation of the key.
    pub create_revision: i64,

    /// Revision of the row carrying this value.
    pub mod_revision: i64,

    /// Lease id, 0 when unleased.
    pub lease: i64,

    pub value: Vec<u8>,
}

/// A single change to a key, in log order.
#[derive(Clone, Debug)]
pub struct Event {
    /// First appearance of the key, or re-appearance after a tombstone.
    pub create: bool,

    /// Tombstone: the key is absent from this revision onward.
    pub delete: bool,

    pub kv: KeyValue,

    /// The superseded incarnation, when one existed.
    pub prev_kv: Option<KeyValue>,
}

impl Event {
    /// The revision at which this event took effect.
    pub fn revision(&self) -> i64 {
        self.kv.mod_revision
    }
}

/// The etcd-semantic operations of the engine.
///
/// Reads at `revision = 0` observe the latest state; an explicit revision
/// is a point-in-time snapshot and fails with `Compacted` below the
/// watermark. Conditional writes carry the caller's base revision and fail
/// with `KeyExists` when it no longer names the live row.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Point read. Returns the current revision and the key's live value
    /// at `revision`, or `None` when absent there.
    async fn get(&self, key: &str, revision: i64) -> Result<(i64, Option<KeyValue>)>;

    /// Creates `key`, failing with `KeyExists` when it is live.
    async fn create(&self, key: &str, value: &[u8], lease: i64) -> Result<i64>;

    /// Replaces the value of `key`, conditional on `revision` naming the
    /// live row. Returns the new revision and the new incarnation.
    async fn update(
        &self,
        key: &str,
        value: &[u8],
        revision: i64,
        lease: i64,
    ) -> Result<(i64, KeyValue)>;

    /// Tombstones `key`. `revision = 0` deletes unconditionally (retrying
    /// translated conflicts internally); otherwise conditional like
    /// [`Backend::update`]. Returns the tombstone revision and the deleted
    /// incarnation.
    async fn delete(&self, key: &str, revision: i64) -> Result<(i64, KeyValue)>;

    /// Range read by prefix as of `revision`. Returns the current revision
    /// and up to `limit` live pairs (0 = unlimited), in key order.
    async fn list(&self, prefix: &str, limit: i64, revision: i64)
        -> Result<(i64, Vec<KeyValue>)>;

    /// Count of live keys under `prefix`, with the revision it was taken at.
    async fn count(&self, prefix: &str) -> Result<(i64, i64)>;

    /// Subscribes to ordered events for keys under `prefix`, starting
    /// strictly after `revision` (0 = from now).
    async fn watch(&self, prefix: &str, revision: i64) -> Result<Watch>;

    /// Compacts history up to `revision`, returning the new watermark.
    async fn compact(&self, revision: i64) -> Result<i64>;

    /// Backend size in bytes, per the dialect's size query.
    async fn db_size(&self) -> Result<i64>;

    /// Highest assigned revision.
    async fn current_revision(&self) -> Result<i64>;

    /// The compact watermark.
    async fn compact_revision(&self) -> Result<i64>;
}
