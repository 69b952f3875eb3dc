//! Driver dialects for the revision-log table.
//!
//! A [`Dialect`] is pure data: the parameterized SQL a driver understands,
//! its placeholder style, whether inserts report a last-insert id or need
//! `RETURNING`, and the error codes that carry meaning for the engine
//! (unique violations, retryable transients, idempotent DDL). The dialect
//! holds no state and performs no I/O; the store and the revision log
//! consume it.
//!
//! All queries are written with `?` placeholders; the store rewrites them
//! to `$n` when [`Placeholder::Dollar`] is declared.

pub mod mysql;
pub mod postgres;
pub mod sqlite;

use crate::errors::Error;

/// Name of the bookkeeping row whose `prev_revision` records the compact
/// watermark.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Placeholder style understood by the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Placeholder {
    /// `?`, positionally (SQLite, MySQL).
    Question,
    /// `$1`, `$2`, ... (PostgreSQL).
    Dollar,
}

/// SQL templates and driver capabilities for one backend.
///
/// Parameter order is documented per field; the revision log binds
/// accordingly.
#[derive(Clone, Debug)]
pub struct Dialect {
    pub placeholder: Placeholder,

    /// True when the driver reports the assigned row id on insert;
    /// false when `insert_sql` carries a `RETURNING id` clause instead.
    pub last_insert_id: bool,

    /// Params: name, created, deleted, create_revision, prev_revision,
    /// lease, value, old_value.
    pub insert_sql: String,

    /// No params. Returns `MAX(id)` or 0.
    pub current_revision_sql: String,

    /// No params. Returns the compact watermark or 0.
    pub compact_revision_sql: String,

    /// Params: name-pattern, include-deleted flag. First column is the
    /// current revision, then the row columns.
    pub list_current_sql: String,

    /// Params: name-pattern, revision bound, include-deleted flag.
    pub list_revision_sql: String,

    /// Params: name-pattern. Returns (current revision, live key count).
    pub count_current_sql: String,

    /// Params: name-pattern, revision bound.
    pub count_revision_sql: String,

    /// Params: name-pattern, start revision (exclusive). Rows in id order.
    pub after_sql: String,

    /// No params. Returns the table size in bytes.
    pub get_size_sql: String,

    /// Params: target revision, target revision (both union branches).
    pub compact_sql: String,

    /// Params: target revision. Advances the watermark row.
    pub update_watermark_sql: String,

    /// DDL creating the table and its indexes, including the load-bearing
    /// unique index on (name, prev_revision).
    pub schema: Vec<String>,

    /// Ordered migrations; `schema_migration_level = n` applies `0..n`.
    /// Empty strings keep the lists aligned across dialects.
    pub migrations: Vec<String>,

    /// Driver codes signalling a unique-index violation.
    pub unique_codes: &'static [&'static str],

    /// Driver codes worth retrying: serialization conflicts, lock
    /// contention, connection exhaustion.
    pub retry_codes: &'static [&'static str],

    /// Driver codes the schema setup may ignore (object already exists).
    pub setup_ok_codes: &'static [&'static str],
}

impl Dialect {
    /// Extracts the backend error code, if the error carries one.
    pub fn error_code(err: &sqlx::Error) -> Option<String> {
        match err {
            sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
            _ => None,
        }
    }

    /// Maps a driver error into the domain taxonomy: unique violations
    /// become [`Error::KeyExists`], everything else is surfaced as
    /// unavailable.
    pub fn translate(&self, err: sqlx::Error) -> Error {
        if let Some(code) = Self::error_code(&err) {
            if self.unique_codes.contains(&code.as_str()) {
                return Error::KeyExists;
            }
        }
        Error::Unavailable(err.to_string())
    }

    /// True when the error is a transient the store may retry.
    pub fn is_retryable(&self, err: &sqlx::Error) -> bool {
        match Self::error_code(err) {
            Some(code) => self.retry_codes.contains(&code.as_str()),
            None => matches!(err, sqlx::Error::PoolTimedOut),
        }
    }

    /// True when schema setup may ignore the error.
    pub fn is_setup_ok(&self, err: &sqlx::Error) -> bool {
        match Self::error_code(err) {
            Some(code) => self.setup_ok_codes.contains(&code.as_str()),
            None => false,
        }
    }
}

/// Row columns selected by every log query, qualified by the `kv` alias.
fn row_columns() -> &'static str {
    "kv.id, kv.name, kv.created, kv.deleted, kv.create_revision, \
     kv.prev_revision, kv.lease, kv.value, kv.old_value"
}

/// Builds the dialect-independent query set for `table`.
///
/// Dialect constructors start from these and override the driver-specific
/// members (insert return style, size query, compact statement, DDL).
pub(crate) struct BaseQueries {
    pub insert_sql: String,
    pub current_revision_sql: String,
    pub compact_revision_sql: String,
    pub list_current_sql: String,
    pub list_revision_sql: String,
    pub count_current_sql: String,
    pub count_revision_sql: String,
    pub after_sql: String,
    pub compact_sql: String,
    pub update_watermark_sql: String,
}

pub(crate) fn base_queries(table: &str) -> BaseQueries {
    let current_revision_sql = format!("SELECT COALESCE(MAX(id), 0) FROM {table}");

    // The newest id per matching name, optionally bounded by revision.
    // The watermark row is bookkeeping, not a key.
    let newest_per_name = |bounded: bool| {
        format!(
            "SELECT MAX(mkv.id) AS id FROM {table} AS mkv \
             WHERE mkv.name LIKE ? AND mkv.name != '{COMPACT_REV_KEY}'{bound} \
             GROUP BY mkv.name",
            bound = if bounded { " AND mkv.id <= ?" } else { "" },
        )
    };

    let list = |bounded: bool| {
        format!(
            "SELECT ({current_revision_sql}) AS current_id, {cols} \
             FROM {table} AS kv \
             JOIN ({newest}) AS maxkv ON maxkv.id = kv.id \
             WHERE kv.deleted = 0 OR ? \
             ORDER BY kv.name ASC",
            cols = row_columns(),
            newest = newest_per_name(bounded),
        )
    };

    let count = |bounded: bool| {
        format!(
            "SELECT ({current_revision_sql}) AS current_id, COUNT(*) \
             FROM {table} AS kv \
             JOIN ({newest}) AS maxkv ON maxkv.id = kv.id \
             WHERE kv.deleted = 0",
            newest = newest_per_name(bounded),
        )
    };

    BaseQueries {
        insert_sql: format!(
            "INSERT INTO {table} (name, created, deleted, create_revision, \
             prev_revision, lease, value, old_value) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        ),
        compact_revision_sql: format!(
            "SELECT COALESCE(MAX(prev_revision), 0) FROM {table} \
             WHERE name = '{COMPACT_REV_KEY}'"
        ),
        list_current_sql: list(false),
        list_revision_sql: list(true),
        count_current_sql: count(false),
        count_revision_sql: count(true),
        after_sql: format!(
            "SELECT {cols} FROM {table} AS kv \
             WHERE kv.name LIKE ? AND kv.id > ? \
             ORDER BY kv.id ASC",
            cols = row_columns(),
        ),
        // Superseded rows and tombstones at or below the target. The
        // watermark row must not contribute its prev_revision, or the row
        // carrying the target id would be swept with it.
        compact_sql: format!(
            "DELETE FROM {table} WHERE id IN ( \
             SELECT kp.prev_revision FROM {table} AS kp \
             WHERE kp.name != '{COMPACT_REV_KEY}' AND kp.prev_revision != 0 AND kp.id <= ? \
             UNION \
             SELECT kd.id FROM {table} AS kd \
             WHERE kd.deleted != 0 AND kd.id <= ?)"
        ),
        update_watermark_sql: format!(
            "UPDATE {table} SET prev_revision = ? WHERE name = '{COMPACT_REV_KEY}'"
        ),
        current_revision_sql,
    }
}
