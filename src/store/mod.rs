//! Generic store: a driver-agnostic query layer over the connection pool.
//!
//! Responsibilities, in order of appearance on every call path:
//! a bounded concurrent-query semaphore (watcher load must not overrun the
//! backend), placeholder rewriting with a lock-free cache, and a retry loop
//! for the small class of transient driver failures the dialect declares.
//! Unique-index violations are translated to the domain taxonomy here;
//! nothing above this layer sees a driver error.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{MySql, Pool, Postgres, Sqlite};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::dialect::{self, Dialect, Placeholder};
use crate::errors::{Error, Result};

const DEFAULT_MAX_CONCURRENT: usize = 64;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Connection pool bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 5,
            max_idle: 2,
            max_lifetime: None,
        }
    }
}

/// Transport security to the backend. Ignored for SQLite.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// Backend driver, selected by the endpoint scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Driver {
    Sqlite,
    Postgres,
    MySql,
}

impl Driver {
    /// Parses the scheme of a `datastore_endpoint` URI.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let scheme = endpoint.split(':').next().unwrap_or_default();
        match scheme {
            "sqlite" => Ok(Driver::Sqlite),
            "postgres" | "postgresql" => Ok(Driver::Postgres),
            "mysql" => Ok(Driver::MySql),
            other => Err(Error::Internal(format!(
                "unsupported datastore scheme {other:?} in endpoint"
            ))),
        }
    }

    /// The dialect for this driver and log table.
    pub fn dialect(&self, table: &str) -> Dialect {
        match self {
            Driver::Sqlite => dialect::sqlite::dialect(table),
            Driver::Postgres => dialect::postgres::dialect(table),
            Driver::MySql => dialect::mysql::dialect(table),
        }
    }
}

/// One bound parameter. Queries carry their parameters as a flat list and
/// every driver binds the same variants.
#[derive(Clone, Debug)]
pub enum Param {
    I64(i64),
    Bool(bool),
    Str(String),
    Bytes(Vec<u8>),
}

enum DbPool {
    Sqlite(Pool<Sqlite>),
    Postgres(Pool<Postgres>),
    MySql(Pool<MySql>),
}

/// Dispatches a block over the concrete pool. Each arm typechecks against
/// its own driver, so row decoding stays fully typed per backend.
macro_rules! with_pool {
    ($store:expr, $pool:ident => $body:expr) => {
        match &$store.pool {
            DbPool::Sqlite($pool) => $body,
            DbPool::Postgres($pool) => $body,
            DbPool::MySql($pool) => $body,
        }
    };
}

/// Binds a parameter list onto a query builder.
macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                Param::I64(v) => q.bind(*v),
                Param::Bool(v) => q.bind(*v),
                Param::Str(v) => q.bind(v.clone()),
                Param::Bytes(v) => q.bind(v.clone()),
            };
        }
        q
    }};
}

/// Re-evaluates `$op` until it succeeds, the error is not transient, or
/// the retry budget is spent. Backoff grows linearly with the attempt.
macro_rules! with_retry {
    ($store:expr, $op:expr) => {{
        let mut attempt: u32 = 0;
        loop {
            match $op {
                Ok(v) => break Ok(v),
                Err(e) if $store.dialect.is_retryable(&e) && attempt < $store.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "transient backend error, retrying");
                    sleep($store.retry_backoff * attempt).await;
                }
                Err(e) => break Err($store.dialect.translate(e)),
            }
        }
    }};
}

/// Rows a query result must decode into, for every supported driver.
pub trait FromAnyRow:
    for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow>
    + for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>
    + for<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow>
    + Send
    + Unpin
{
}

impl<T> FromAnyRow for T where
    T: for<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow>
        + for<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow>
        + for<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow>
        + Send
        + Unpin
{
}

pub struct Store {
    pool: DbPool,
    dialect: Dialect,
    queries: Semaphore,
    rewritten: DashMap<String, Arc<str>>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl Store {
    /// Connects to the backend named by `endpoint` and wraps the pool.
    pub async fn connect(
        endpoint: &str,
        table: &str,
        pool_cfg: &PoolConfig,
        tls: &TlsConfig,
    ) -> Result<Arc<Self>> {
        let driver = Driver::from_endpoint(endpoint)?;
        let dialect = driver.dialect(table);
        let pool = open_pool(driver, endpoint, pool_cfg, tls).await?;

        debug!(endpoint, table, ?driver, "connected to backend");

        Ok(Arc::new(Self {
            pool,
            dialect,
            queries: Semaphore::new(DEFAULT_MAX_CONCURRENT),
            rewritten: DashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }))
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    /// Creates the log table and indexes, then applies migrations
    /// `0..level`. Errors the dialect declares idempotent are ignored.
    pub async fn setup(&self, migration_level: usize) -> Result<()> {
        debug!("configuring log table schema and indexes");
        for stmt in &self.dialect.schema {
            self.run_ddl(stmt).await?;
        }
        for (i, stmt) in self.dialect.migrations.iter().enumerate() {
            if i >= migration_level {
                break;
            }
            if stmt.is_empty() {
                continue;
            }
            trace!(migration = i, "applying schema migration");
            self.run_ddl(stmt).await?;
        }
        Ok(())
    }

    async fn run_ddl(&self, stmt: &str) -> Result<()> {
        let res = with_pool!(self, pool => sqlx::query(stmt).execute(pool).await.map(|_| ()));
        match res {
            Ok(()) => Ok(()),
            Err(e) if self.dialect.is_setup_ok(&e) => Ok(()),
            Err(e) => Err(self.dialect.translate(e)),
        }
    }

    /// Executes a statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str, params: &[Param]) -> Result<u64> {
        let sql = self.rewrite(sql);
        let _permit = self.acquire().await?;
        with_retry!(self, self.try_execute(&sql, params).await)
    }

    /// Inserts one row and returns the id the database assigned, using the
    /// driver's last-insert report or the statement's `RETURNING` clause
    /// per the dialect capability.
    pub async fn insert(&self, sql: &str, params: &[Param]) -> Result<i64> {
        let sql = self.rewrite(sql);
        let _permit = self.acquire().await?;
        with_retry!(self, self.try_insert(&sql, params).await)
    }

    /// Fetches all rows of a query, decoded per driver.
    pub async fn fetch_all<T: FromAnyRow>(&self, sql: &str, params: &[Param]) -> Result<Vec<T>> {
        let sql = self.rewrite(sql);
        let _permit = self.acquire().await?;
        with_retry!(self, self.try_fetch_all::<T>(&sql, params).await)
    }

    /// Fetches a single signed-integer scalar.
    pub async fn fetch_i64(&self, sql: &str, params: &[Param]) -> Result<i64> {
        let sql = self.rewrite(sql);
        let _permit = self.acquire().await?;
        with_retry!(self, self.try_fetch_i64(&sql, params).await)
    }

    async fn try_execute(
        &self,
        sql: &str,
        params: &[Param],
    ) -> std::result::Result<u64, sqlx::Error> {
        with_pool!(self, pool => {
            bind_params!(sqlx::query(sql), params)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
        })
    }

    async fn try_insert(
        &self,
        sql: &str,
        params: &[Param],
    ) -> std::result::Result<i64, sqlx::Error> {
        match &self.pool {
            DbPool::Sqlite(pool) => bind_params!(sqlx::query(sql), params)
                .execute(pool)
                .await
                .map(|r| r.last_insert_rowid()),
            DbPool::MySql(pool) => bind_params!(sqlx::query(sql), params)
                .execute(pool)
                .await
                .map(|r| r.last_insert_id() as i64),
            DbPool::Postgres(pool) => {
                bind_params!(sqlx::query_scalar::<_, i64>(sql), params)
                    .fetch_one(pool)
                    .await
            }
        }
    }

    async fn try_fetch_all<T: FromAnyRow>(
        &self,
        sql: &str,
        params: &[Param],
    ) -> std::result::Result<Vec<T>, sqlx::Error> {
        with_pool!(self, pool => {
            bind_params!(sqlx::query_as::<_, T>(sql), params)
                .fetch_all(pool)
                .await
        })
    }

    async fn try_fetch_i64(
        &self,
        sql: &str,
        params: &[Param],
    ) -> std::result::Result<i64, sqlx::Error> {
        with_pool!(self, pool => {
            bind_params!(sqlx::query_scalar::<_, i64>(sql), params)
                .fetch_one(pool)
                .await
        })
    }

    async fn acquire(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.queries
            .acquire()
            .await
            .map_err(|_| Error::Internal("store closed".to_string()))
    }

    /// Rewrites `?` placeholders to the dialect's style, caching the result
    /// by template text. Reads are lock-free; each entry is written once.
    fn rewrite(&self, sql: &str) -> Arc<str> {
        if let Some(found) = self.rewritten.get(sql) {
            return found.clone();
        }
        let rewritten: Arc<str> = match self.dialect.placeholder {
            Placeholder::Question => Arc::from(sql),
            Placeholder::Dollar => Arc::from(number_placeholders(sql).as_str()),
        };
        self.rewritten.insert(sql.to_string(), rewritten.clone());
        rewritten
    }
}

/// Replaces each `?` outside a quoted literal with `$1`, `$2`, ...
fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 16);
    let mut n = 0;
    let mut in_literal = false;
    for ch in sql.chars() {
        match ch {
            '\'' => {
                in_literal = !in_literal;
                out.push(ch);
            }
            '?' if !in_literal => {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
            }
            _ => out.push(ch),
        }
    }
    out
}

async fn open_pool(
    driver: Driver,
    endpoint: &str,
    cfg: &PoolConfig,
    tls: &TlsConfig,
) -> Result<DbPool> {
    let connect_err = |e: sqlx::Error| Error::Unavailable(e.to_string());
    match driver {
        Driver::Sqlite => {
            let opts = SqliteConnectOptions::from_str(endpoint)
                .map_err(connect_err)?
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(Duration::from_secs(5));
            let pool = SqlitePoolOptions::new()
                .max_connections(cfg.max_open)
                .min_connections(cfg.max_idle)
                .max_lifetime(cfg.max_lifetime)
                .connect_with(opts)
                .await
                .map_err(connect_err)?;
            Ok(DbPool::Sqlite(pool))
        }
        Driver::Postgres => {
            let mut opts = PgConnectOptions::from_str(endpoint).map_err(connect_err)?;
            if let Some(ca) = &tls.ca {
                opts = opts.ssl_mode(PgSslMode::VerifyCa).ssl_root_cert(ca);
            }
            if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
                opts = opts.ssl_client_cert(cert).ssl_client_key(key);
            }
            let pool = PgPoolOptions::new()
                .max_connections(cfg.max_open)
                .min_connections(cfg.max_idle)
                .max_lifetime(cfg.max_lifetime)
                .connect_with(opts)
                .await
                .map_err(connect_err)?;
            Ok(DbPool::Postgres(pool))
        }
        Driver::MySql => {
            let mut opts = MySqlConnectOptions::from_str(endpoint).map_err(connect_err)?;
            if let Some(ca) = &tls.ca {
                opts = opts.ssl_mode(MySqlSslMode::VerifyCa).ssl_ca(ca);
            }
            if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
                opts = opts.ssl_client_cert(cert).ssl_client_key(key);
            }
            let pool = MySqlPoolOptions::new()
                .max_connections(cfg.max_open)
                .min_connections(cfg.max_idle)
                .max_lifetime(cfg.max_lifetime)
                .connect_with(opts)
                .await
                .map_err(connect_err)?;
            Ok(DbPool::MySql(pool))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert_params(name: &str) -> Vec<Param> {
        vec![
            Param::Str(name.to_string()),
            Param::I64(1),
            Param::I64(0),
            Param::I64(0),
            Param::I64(0),
            Param::I64(0),
            Param::Bytes(b"v".to_vec()),
            Param::Bytes(vec![]),
        ]
    }

    async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<Store> {
        let endpoint = format!("sqlite://{}/store.db", dir.path().display());
        let store = Store::connect(&endpoint, "kine", &PoolConfig::default(), &TlsConfig::default())
            .await
            .unwrap();
        store.setup(0).await.unwrap();
        store
    }

    #[test]
    fn test_driver_from_endpoint() {
        assert_eq!(
            Driver::from_endpoint("sqlite://state.db").unwrap(),
            Driver::Sqlite
        );
        assert_eq!(
            Driver::from_endpoint("postgres://u@h/db").unwrap(),
            Driver::Postgres
        );
        assert_eq!(
            Driver::from_endpoint("postgresql://u@h/db").unwrap(),
            Driver::Postgres
        );
        assert_eq!(
            Driver::from_endpoint("mysql://u@h/db").unwrap(),
            Driver::MySql
        );
        assert!(Driver::from_endpoint("etcd://nope").is_err());
    }

    #[test]
    fn test_number_placeholders() {
        assert_eq!(
            number_placeholders("SELECT * FROM t WHERE a = ? AND b = ?"),
            "SELECT * FROM t WHERE a = $1 AND b = $2"
        );
    }

    #[test]
    fn test_number_placeholders_skips_literals() {
        assert_eq!(
            number_placeholders("SELECT 'a?b' FROM t WHERE a = ?"),
            "SELECT 'a?b' FROM t WHERE a = $1"
        );
    }

    #[tokio::test]
    async fn test_sqlite_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        let sql = store.dialect().insert_sql.clone();
        let id = store.insert(&sql, &insert_params("/a")).await.unwrap();
        assert_eq!(id, 1);

        let rev_sql = store.dialect().current_revision_sql.clone();
        let rev = store.fetch_i64(&rev_sql, &[]).await.unwrap();
        assert_eq!(rev, 1);
    }

    #[tokio::test]
    async fn test_setup_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;
        store.setup(0).await.unwrap();
    }

    #[tokio::test]
    async fn test_unique_violation_translates_to_key_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = sqlite_store(&dir).await;

        let sql = store.dialect().insert_sql.clone();
        store.insert(&sql, &insert_params("/dup")).await.unwrap();
        let err = store.insert(&sql, &insert_params("/dup")).await.unwrap_err();
        assert!(matches!(err, Error::KeyExists), "got {err:?}");
    }
}
