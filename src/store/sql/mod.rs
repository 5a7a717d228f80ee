//! Relational backend over sqlx, for Postgres and MySQL/MariaDB.
//!
//! Two tables: `tokens` holds one row per credential (typed columns plus
//! the full record as a JSON blob and its hash), `app_config` holds one
//! row per `(section, key)`. Rows in the reserved `__storage__` section
//! of `app_config` are bookkeeping: whether each resource was ever
//! saved, which pools exist (so empty pools survive) and which config
//! sections exist (so empty sections survive). They are never returned
//! as configuration.

mod lock;
mod rows;
mod schema;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use tokio::sync::OnceCell;

use self::rows::{ConfigRow, ExistingRow, StoredRow, TokenRow, INT_COLUMNS, TOKEN_COLUMNS, USAGE_COLUMNS};
use super::{BackendKind, LockGuard, StorageBackend};
use crate::codec;
use crate::errors::Result;
use crate::models::config_doc::ConfigDocument;
use crate::models::token::{normalize_pools, normalize_token_id, TokenPools, TokenUpdate, UpdateKind};

pub const DEFAULT_POOL_SIZE: u32 = 30;
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(3600);

const DELETE_CHUNK: usize = 500;
const UPSERT_CHUNK: usize = 500;
const CONFIG_CHUNK: usize = 500;

const META_SECTION: &str = "__storage__";
const META_CONFIG_INITIALIZED: &str = "config_initialized";
const META_CONFIG_SECTIONS: &str = "config_sections";
const META_TOKENS_INITIALIZED: &str = "tokens_initialized";
const META_TOKEN_POOLS: &str = "token_pools";

const SELECT_META: &str = "SELECT key_name, value FROM app_config WHERE section = '__storage__'";
const DELETE_CONFIG: &str = "DELETE FROM app_config WHERE section <> '__storage__'";

/// Runs `$body` once per dialect with `$p` bound to the concrete pool and
/// `$db` aliased to the sqlx database type.
macro_rules! on_pool {
    ($pool:expr, |$p:ident, $db:ident| $body:expr) => {
        match $pool {
            SqlPool::Postgres($p) => {
                #[allow(dead_code)]
                type $db = sqlx::Postgres;
                $body
            }
            SqlPool::MySql($p) => {
                #[allow(dead_code)]
                type $db = sqlx::MySql;
                $body
            }
        }
    };
}

/// Replace one bookkeeping row inside an open transaction.
macro_rules! put_meta {
    ($db:ident, $tx:ident, $key:expr, $value:expr) => {{
        let mut qb = QueryBuilder::<$db>::new("DELETE FROM app_config WHERE section = ");
        qb.push_bind(META_SECTION).push(" AND key_name = ").push_bind($key);
        qb.build().execute(&mut *$tx).await?;

        let mut qb = QueryBuilder::<$db>::new("INSERT INTO app_config (section, key_name, value) VALUES (");
        qb.push_bind(META_SECTION)
            .push(", ")
            .push_bind($key)
            .push(", ")
            .push_bind($value)
            .push(")");
        qb.build().execute(&mut *$tx).await?;
    }};
}

/// Multi-row upserts inside an open transaction, `UPSERT_CHUNK` rows per
/// statement. `$tails` maps each update kind to its conflict clause.
macro_rules! upsert_chunks {
    ($db:ident, $tx:ident, $rows:expr, $tails:expr) => {{
        let (state, usage): (Vec<&(TokenRow, UpdateKind)>, Vec<&(TokenRow, UpdateKind)>) =
            $rows.iter().partition(|(_, kind)| *kind == UpdateKind::State);
        for (batch, tail) in [(state, &$tails.0), (usage, &$tails.1)] {
            for chunk in batch.chunks(UPSERT_CHUNK) {
                let mut qb = QueryBuilder::<$db>::new(insert_head());
                qb.push_values(chunk, |mut b, (row, _)| {
                    b.push_bind(row.token.clone())
                        .push_bind(row.pool_name.clone())
                        .push_bind(row.status.clone())
                        .push_bind(row.quota)
                        .push_bind(row.created_at)
                        .push_bind(row.last_used_at)
                        .push_bind(row.use_count)
                        .push_bind(row.fail_count)
                        .push_bind(row.last_fail_at)
                        .push_bind(row.last_fail_reason.clone())
                        .push_bind(row.last_sync_at)
                        .push_bind(row.tags.clone())
                        .push_bind(row.note.clone())
                        .push_bind(row.last_asset_clear_at)
                        .push_bind(row.data.clone())
                        .push_bind(row.data_hash.clone())
                        .push_bind(row.updated_at);
                });
                qb.push(tail.as_str());
                qb.build().execute(&mut *$tx).await?;
            }
        }
    }};
}

mod sql_text {
    use super::{Dialect, INT_COLUMNS, TOKEN_COLUMNS};

    pub fn select_tokens(dialect: Dialect) -> String {
        let columns: Vec<String> = [
            "token",
            "pool_name",
            "status",
            "quota",
            "created_at",
            "last_used_at",
            "use_count",
            "fail_count",
            "last_fail_at",
            "last_fail_reason",
            "last_sync_at",
            "tags",
            "note",
            "last_asset_clear_at",
            "data",
        ]
        .iter()
        .map(|c| {
            if INT_COLUMNS.contains(c) {
                format!("CAST({c} AS {}) AS {c}", dialect.bigint())
            } else {
                c.to_string()
            }
        })
        .collect();
        format!("SELECT {} FROM tokens ORDER BY pool_name, token", columns.join(", "))
    }

    pub fn insert_head() -> String {
        format!("INSERT INTO tokens ({}) ", TOKEN_COLUMNS.join(", "))
    }

    /// Conflict clause rewriting exactly `columns`.
    pub fn upsert_tail(dialect: Dialect, columns: &[&str]) -> String {
        match dialect {
            Dialect::Postgres => {
                let sets: Vec<String> = columns.iter().map(|c| format!("{c} = EXCLUDED.{c}")).collect();
                format!(" ON CONFLICT (token) DO UPDATE SET {}", sets.join(", "))
            }
            Dialect::MySql => {
                let sets: Vec<String> = columns.iter().map(|c| format!("{c} = VALUES({c})")).collect();
                format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", "))
            }
        }
    }
}

use sql_text::insert_head;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    fn bigint(&self) -> &'static str {
        match self {
            Dialect::Postgres => "BIGINT",
            Dialect::MySql => "SIGNED",
        }
    }
}

#[derive(Clone)]
pub enum SqlPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

impl SqlPool {
    pub fn dialect(&self) -> Dialect {
        match self {
            SqlPool::Postgres(_) => Dialect::Postgres,
            SqlPool::MySql(_) => Dialect::MySql,
        }
    }
}

/// How a save changes the set of known pool names.
enum PoolNames {
    Replace(BTreeSet<String>),
    Extend(BTreeSet<String>),
}

pub struct SqlStorage {
    pool: SqlPool,
    schema: OnceCell<()>,
    upsert_tails: (String, String),
}

impl SqlStorage {
    /// Connections are opened lazily; the first operation pays for them.
    pub fn postgres(options: PgConnectOptions, max_connections: u32) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(POOL_MAX_LIFETIME)
            .test_before_acquire(true)
            .connect_lazy_with(options);
        Self::from_pool(SqlPool::Postgres(pool))
    }

    pub fn mysql(options: MySqlConnectOptions, max_connections: u32) -> Self {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(POOL_MAX_LIFETIME)
            .test_before_acquire(true)
            .connect_lazy_with(options);
        Self::from_pool(SqlPool::MySql(pool))
    }

    pub fn from_pool(pool: SqlPool) -> Self {
        let dialect = pool.dialect();
        Self {
            upsert_tails: (
                sql_text::upsert_tail(dialect, &TOKEN_COLUMNS[1..]),
                sql_text::upsert_tail(dialect, USAGE_COLUMNS),
            ),
            pool,
            schema: OnceCell::new(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    /// Create tables, add missing columns and backfill legacy rows. Runs
    /// once; a failure is returned and retried on the next call.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.schema
            .get_or_try_init(|| schema::prepare(self))
            .await
            .inspect_err(|e| tracing::error!("SqlStorage: schema initialisation failed: {}", e))?;
        Ok(())
    }

    async fn read_meta(&self) -> Result<HashMap<String, String>> {
        let rows: Vec<(String, Option<String>)> = on_pool!(&self.pool, |pool, Db| {
            sqlx::query_as(SELECT_META).fetch_all(pool).await?
        });
        Ok(rows
            .into_iter()
            .filter_map(|(key, value)| value.map(|v| (key, v)))
            .collect())
    }

    async fn read_config(&self) -> Result<Option<ConfigDocument>> {
        let rows: Vec<ConfigRow> = on_pool!(&self.pool, |pool, Db| {
            sqlx::query_as("SELECT section, key_name, value FROM app_config")
                .fetch_all(pool)
                .await?
        });

        let mut meta = HashMap::new();
        let mut doc = ConfigDocument::new();
        for row in rows {
            if row.section == META_SECTION {
                if let Some(value) = row.value {
                    meta.insert(row.key_name, value);
                }
                continue;
            }
            let value = match row.value {
                Some(raw) => codec::loads::<Value>(&raw).unwrap_or(Value::String(raw)),
                None => Value::Null,
            };
            doc.entry(row.section).or_default().insert(row.key_name, value);
        }

        if doc.is_empty() && !meta.contains_key(META_CONFIG_INITIALIZED) {
            return Ok(None);
        }
        for section in name_list(meta.get(META_CONFIG_SECTIONS)) {
            doc.entry(section).or_default();
        }
        Ok(Some(doc))
    }

    async fn read_tokens(&self) -> Result<Option<TokenPools>> {
        let sql = sql_text::select_tokens(self.dialect());
        let rows: Vec<StoredRow> = on_pool!(&self.pool, |pool, Db| {
            sqlx::query_as(&sql).fetch_all(pool).await?
        });
        let meta = self.read_meta().await?;

        if rows.is_empty() && !meta.contains_key(META_TOKENS_INITIALIZED) {
            return Ok(None);
        }

        let mut pools = TokenPools::new();
        for pool_name in name_list(meta.get(META_TOKEN_POOLS)) {
            pools.entry(pool_name).or_default();
        }
        for row in rows {
            let pool_name = row.pool_name.clone();
            match row.into_record() {
                Ok(record) => pools.entry(pool_name).or_default().push(record),
                Err(e) => tracing::warn!(pool = %pool_name, "SqlStorage: skipping undecodable token row: {}", e),
            }
        }
        Ok(Some(pools))
    }

    async fn write_config(&self, rows: &[(String, String, String)], sections: String) -> Result<()> {
        on_pool!(&self.pool, |pool, Db| {
            let mut tx = pool.begin().await?;
            sqlx::query(DELETE_CONFIG).execute(&mut *tx).await?;
            for chunk in rows.chunks(CONFIG_CHUNK) {
                let mut qb = QueryBuilder::<Db>::new("INSERT INTO app_config (section, key_name, value) ");
                qb.push_values(chunk, |mut b, (section, key, value)| {
                    b.push_bind(section.clone())
                        .push_bind(key.clone())
                        .push_bind(value.clone());
                });
                qb.build().execute(&mut *tx).await?;
            }
            put_meta!(Db, tx, META_CONFIG_SECTIONS, sections);
            put_meta!(Db, tx, META_CONFIG_INITIALIZED, "1".to_string());
            tx.commit().await?;
        });
        Ok(())
    }

    /// Upsert without hash gating or bookkeeping.
    async fn upsert_rows(&self, rows: Vec<(TokenRow, UpdateKind)>) -> Result<()> {
        let tails = &self.upsert_tails;
        on_pool!(&self.pool, |pool, Db| {
            let mut tx = pool.begin().await?;
            upsert_chunks!(Db, tx, rows, tails);
            tx.commit().await?;
        });
        Ok(())
    }

    /// One transaction: delete, skip unchanged rows, upsert the rest,
    /// update the bookkeeping rows.
    async fn write_delta(
        &self,
        rows: BTreeMap<String, (TokenRow, UpdateKind)>,
        deleted: Vec<String>,
        pool_names: PoolNames,
    ) -> Result<(usize, usize)> {
        let tails = &self.upsert_tails;
        let ids: Vec<&String> = rows.keys().collect();

        on_pool!(&self.pool, |pool, Db| {
            let mut tx = pool.begin().await?;

            for chunk in deleted.chunks(DELETE_CHUNK) {
                let mut qb = QueryBuilder::<Db>::new("DELETE FROM tokens WHERE token IN (");
                let mut list = qb.separated(", ");
                for token in chunk {
                    list.push_bind(token.clone());
                }
                list.push_unseparated(")");
                qb.build().execute(&mut *tx).await?;
            }

            let mut stored: HashMap<String, (String, Option<String>)> = HashMap::new();
            for chunk in ids.chunks(UPSERT_CHUNK) {
                let mut qb =
                    QueryBuilder::<Db>::new("SELECT token, pool_name, data_hash FROM tokens WHERE token IN (");
                let mut list = qb.separated(", ");
                for token in chunk {
                    list.push_bind((*token).clone());
                }
                list.push_unseparated(")");
                let found: Vec<ExistingRow> = qb.build_query_as().fetch_all(&mut *tx).await?;
                for row in found {
                    stored.insert(row.token, (row.pool_name, row.data_hash));
                }
            }

            let changed: Vec<(TokenRow, UpdateKind)> = rows
                .into_values()
                .filter(|(row, _)| match stored.get(&row.token) {
                    Some((pool_name, Some(hash))) => {
                        *pool_name != row.pool_name || hash.trim() != row.data_hash
                    }
                    _ => true,
                })
                .collect();
            upsert_chunks!(Db, tx, changed, tails);

            let meta: Vec<(String, Option<String>)> = sqlx::query_as(SELECT_META).fetch_all(&mut *tx).await?;
            let meta: HashMap<String, String> = meta
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v)))
                .collect();
            let current: BTreeSet<String> = name_list(meta.get(META_TOKEN_POOLS)).into_iter().collect();
            let next = match pool_names {
                PoolNames::Replace(names) => names,
                PoolNames::Extend(names) => current.union(&names).cloned().collect(),
            };
            if next != current || !meta.contains_key(META_TOKEN_POOLS) {
                put_meta!(Db, tx, META_TOKEN_POOLS, codec::dumps(&next)?);
            }
            if !meta.contains_key(META_TOKENS_INITIALIZED) {
                put_meta!(Db, tx, META_TOKENS_INITIALIZED, "1".to_string());
            }

            tx.commit().await?;
            Ok::<_, crate::errors::StorageError>((changed.len(), deleted.len()))
        })
    }
}

/// Decode a bookkeeping JSON list of names; a missing or bad value is empty.
fn name_list(raw: Option<&String>) -> Vec<String> {
    raw.and_then(|raw| codec::loads::<Vec<String>>(raw).ok())
        .unwrap_or_default()
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl StorageBackend for SqlStorage {
    fn kind(&self) -> BackendKind {
        match self.dialect() {
            Dialect::Postgres => BackendKind::Postgres,
            Dialect::MySql => BackendKind::MySql,
        }
    }

    async fn try_load_config(&self) -> Result<Option<ConfigDocument>> {
        self.ensure_schema().await?;
        self.read_config().await
    }

    /// Schema failures propagate; only read failures become "absent".
    async fn load_config(&self) -> Result<Option<ConfigDocument>> {
        self.ensure_schema().await?;
        match self.read_config().await {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::error!("SqlStorage: failed to load config: {}", e);
                Ok(None)
            }
        }
    }

    async fn save_config(&self, doc: &ConfigDocument) -> Result<()> {
        self.ensure_schema().await?;

        let mut rows: Vec<(String, String, String)> = Vec::new();
        for (section, items) in doc {
            if section == META_SECTION {
                continue;
            }
            for (key, value) in items {
                rows.push((section.clone(), key.clone(), codec::dumps(value)?));
            }
        }
        let sections: Vec<&String> = doc.keys().filter(|s| *s != META_SECTION).collect();
        let sections = codec::dumps(&sections)?;

        self.write_config(&rows, sections)
            .await
            .inspect_err(|e| tracing::error!("SqlStorage: failed to save config: {}", e))
    }

    async fn try_load_tokens(&self) -> Result<Option<TokenPools>> {
        self.ensure_schema().await?;
        self.read_tokens().await
    }

    async fn load_tokens(&self) -> Result<Option<TokenPools>> {
        self.ensure_schema().await?;
        match self.read_tokens().await {
            Ok(pools) => Ok(pools),
            Err(e) => {
                tracing::error!("SqlStorage: failed to load tokens: {}", e);
                Ok(None)
            }
        }
    }

    /// Full replace, expressed as a delta: rows absent from `pools` are
    /// deleted, unchanged rows are skipped.
    async fn save_tokens(&self, pools: &TokenPools) -> Result<()> {
        self.ensure_schema().await?;
        let pools = normalize_pools(pools);
        let now = now_millis();

        let mut rows: BTreeMap<String, (TokenRow, UpdateKind)> = BTreeMap::new();
        for (pool_name, records) in &pools {
            for record in records {
                let row = TokenRow::from_record(record, pool_name, now)?;
                rows.insert(row.token.clone(), (row, UpdateKind::State));
            }
        }

        let existing: Vec<String> = on_pool!(&self.pool, |pool, Db| {
            sqlx::query_scalar::<_, String>("SELECT token FROM tokens").fetch_all(pool).await
        })
        .inspect_err(|e| tracing::error!("SqlStorage: failed to save tokens: {}", e))?;
        let deleted: Vec<String> = existing.into_iter().filter(|t| !rows.contains_key(t)).collect();

        let names = PoolNames::Replace(pools.keys().cloned().collect());
        let (updated, deleted) = self
            .write_delta(rows, deleted, names)
            .await
            .inspect_err(|e| tracing::error!("SqlStorage: failed to save tokens: {}", e))?;
        tracing::debug!(updated, deleted, "SqlStorage: tokens saved");
        Ok(())
    }

    async fn save_tokens_delta(&self, updated: &[TokenUpdate], deleted: &[String]) -> Result<()> {
        self.ensure_schema().await?;
        let deleted: HashSet<&str> = deleted
            .iter()
            .map(|t| normalize_token_id(t.trim()))
            .filter(|t| !t.is_empty())
            .collect();
        let now = now_millis();

        let mut rows: BTreeMap<String, (TokenRow, UpdateKind)> = BTreeMap::new();
        let mut pool_names = BTreeSet::new();
        for update in updated {
            let token = normalize_token_id(update.record.token.trim());
            let pool_name = update.record.pool_name.as_str();
            if token.is_empty() || pool_name.is_empty() || deleted.contains(token) {
                continue;
            }
            let row = TokenRow::from_record(&update.record, pool_name, now)?;
            pool_names.insert(pool_name.to_string());
            rows.insert(row.token.clone(), (row, update.kind));
        }
        if rows.is_empty() && deleted.is_empty() {
            return Ok(());
        }

        let deleted: Vec<String> = deleted.into_iter().map(str::to_string).collect();
        let (updated, deleted) = self
            .write_delta(rows, deleted, PoolNames::Extend(pool_names))
            .await
            .inspect_err(|e| tracing::error!("SqlStorage: failed to save token delta: {}", e))?;
        tracing::debug!(updated, deleted, "SqlStorage: token delta saved");
        Ok(())
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let release = lock::acquire(&self.pool, name, timeout).await.inspect_err(|e| {
            if e.is_lock_timeout() {
                tracing::warn!(lock = %name, ?timeout, "SqlStorage: lock acquisition timed out");
            }
        })?;
        Ok(LockGuard::new(name, release))
    }

    async fn verify_connection(&self) -> bool {
        on_pool!(&self.pool, |pool, Db| {
            sqlx::query("SELECT 1").execute(pool).await.is_ok()
        })
    }

    async fn close(&self) {
        on_pool!(&self.pool, |pool, Db| pool.close().await)
    }
}
