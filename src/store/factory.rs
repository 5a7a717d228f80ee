//! Backend selection. This is the only place that branches on the backend
//! kind; everything downstream holds an `Arc<dyn StorageBackend>`.
//!
//! The process builds exactly one backend at startup and passes it to
//! whoever needs it. Nothing here caches an instance.

use std::str::FromStr;
use std::sync::Arc;

use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use url::Url;

use super::local::LocalStorage;
use super::redis::RedisStorage;
use super::sql::SqlStorage;
use super::{BackendKind, StorageBackend};
use crate::config::Config;
use crate::errors::{Result, StorageError};

/// Query parameters carrying a TLS mode. The drivers take the mode as a
/// connect option, so these never reach them inside the URL.
const SSL_PARAM_KEYS: &[&str] = &["sslmode", "ssl-mode", "ssl"];

const PG_SCHEME_ALIASES: &[&str] = &["postgres", "postgresql", "pgsql", "postgresql+asyncpg", "postgres+asyncpg"];
const MYSQL_SCHEME_ALIASES: &[&str] = &["mysql", "mariadb", "mysql+aiomysql", "mariadb+aiomysql"];

/// TLS mode after alias resolution, already in the target driver's terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    /// Certificate chain and host name.
    VerifyFull,
}

impl SslMode {
    fn to_pg(self) -> PgSslMode {
        match self {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Allow => PgSslMode::Allow,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
            SslMode::VerifyCa => PgSslMode::VerifyCa,
            SslMode::VerifyFull => PgSslMode::VerifyFull,
        }
    }

    fn to_mysql(self) -> MySqlSslMode {
        match self {
            SslMode::Disable => MySqlSslMode::Disabled,
            SslMode::Allow | SslMode::Prefer => MySqlSslMode::Preferred,
            SslMode::Require => MySqlSslMode::Required,
            SslMode::VerifyCa => MySqlSslMode::VerifyCa,
            SslMode::VerifyFull => MySqlSslMode::VerifyIdentity,
        }
    }
}

/// A relational connection string with its TLS parameters lifted out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTarget {
    pub url: String,
    pub ssl_mode: Option<SslMode>,
}

/// Parse the backend kind directive. Unknown kinds are rejected rather
/// than falling back to local storage.
pub fn parse_kind(raw: &str) -> Result<BackendKind> {
    match raw.trim().to_lowercase().as_str() {
        "" | "local" => Ok(BackendKind::Local),
        "redis" => Ok(BackendKind::Redis),
        "mysql" | "mariadb" => Ok(BackendKind::MySql),
        "pgsql" | "postgres" | "postgresql" => Ok(BackendKind::Postgres),
        other => Err(StorageError::Config(format!("unknown storage type '{other}'"))),
    }
}

/// Rewrite scheme aliases to the form the driver expects (`postgres://`
/// or `mysql://`). Other URLs pass through unchanged.
pub fn normalize_sql_url(kind: BackendKind, url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let scheme = scheme.to_lowercase();
    match kind {
        BackendKind::Postgres if PG_SCHEME_ALIASES.contains(&scheme.as_str()) => format!("postgres://{rest}"),
        BackendKind::MySql if MYSQL_SCHEME_ALIASES.contains(&scheme.as_str()) => format!("mysql://{rest}"),
        _ => url.to_string(),
    }
}

/// Resolve a TLS mode alias. Case, spaces and `-`/`_` are ignored.
pub fn normalize_ssl_mode(kind: BackendKind, raw: &str) -> Result<SslMode> {
    let key: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == '_' { '-' } else { c })
        .collect();

    let mode = match key.as_str() {
        "disable" | "disabled" | "false" | "0" | "no" | "off" => Some(SslMode::Disable),
        "prefer" | "preferred" => Some(SslMode::Prefer),
        // MySQL has no "allow"; it degrades to preferred there.
        "allow" => Some(SslMode::Allow),
        "require" | "required" | "true" | "1" | "yes" | "on" => Some(SslMode::Require),
        "verify-ca" => Some(SslMode::VerifyCa),
        "verify-full" | "verify-identity" => Some(SslMode::VerifyFull),
        _ => None,
    };

    match (kind, mode) {
        (BackendKind::Postgres | BackendKind::MySql, Some(mode)) => Ok(mode),
        _ => Err(StorageError::Config(format!(
            "unsupported SSL mode '{raw}' for storage type '{kind}'"
        ))),
    }
}

/// Normalize the scheme and lift `sslmode` / `ssl-mode` / `ssl` out of the
/// query string. The first non-empty value wins; every occurrence is
/// removed. Other parameters keep their order.
pub fn prepare_sql_url(kind: BackendKind, url: &str) -> Result<SqlTarget> {
    let normalized = normalize_sql_url(kind, url);
    if !normalized.contains("://") {
        return Ok(SqlTarget {
            url: normalized,
            ssl_mode: None,
        });
    }

    let mut parsed = Url::parse(&normalized)
        .map_err(|e| StorageError::Config(format!("invalid storage URL: {e}")))?;

    let mut raw_mode: Option<String> = None;
    let mut kept: Vec<(String, String)> = Vec::new();
    for (key, value) in parsed.query_pairs() {
        if SSL_PARAM_KEYS.contains(&key.to_lowercase().as_str()) {
            if raw_mode.is_none() && !value.is_empty() {
                raw_mode = Some(value.into_owned());
            }
            continue;
        }
        kept.push((key.into_owned(), value.into_owned()));
    }

    if kept.is_empty() {
        parsed.set_query(None);
    } else {
        parsed.query_pairs_mut().clear().extend_pairs(&kept);
    }

    let ssl_mode = raw_mode.map(|m| normalize_ssl_mode(kind, &m)).transpose()?;
    Ok(SqlTarget {
        url: parsed.to_string(),
        ssl_mode,
    })
}

fn pg_options(target: &SqlTarget) -> Result<PgConnectOptions> {
    let mut options = PgConnectOptions::from_str(&target.url)
        .map_err(|e| StorageError::Config(format!("invalid postgres URL: {e}")))?;
    if let Some(mode) = target.ssl_mode {
        options = options.ssl_mode(mode.to_pg());
    }
    Ok(options)
}

fn mysql_options(target: &SqlTarget) -> Result<MySqlConnectOptions> {
    let mut options = MySqlConnectOptions::from_str(&target.url)
        .map_err(|e| StorageError::Config(format!("invalid mysql URL: {e}")))?;
    if let Some(mode) = target.ssl_mode {
        options = options.ssl_mode(mode.to_mysql());
    }
    Ok(options)
}

fn require_url(kind: BackendKind, url: &str) -> Result<()> {
    if url.trim().is_empty() {
        return Err(StorageError::Config(format!(
            "storage type '{kind}' requires SERVER_STORAGE_URL"
        )));
    }
    Ok(())
}

/// Construct the configured backend.
pub async fn build_storage(config: &Config) -> Result<Arc<dyn StorageBackend>> {
    let kind = parse_kind(&config.storage_type)?;
    tracing::info!(backend = %kind, "initialising storage backend");

    let storage: Arc<dyn StorageBackend> = match kind {
        BackendKind::Local => Arc::new(LocalStorage::new(&config.data_dir)),
        BackendKind::Redis => {
            require_url(kind, &config.storage_url)?;
            Arc::new(RedisStorage::connect(config.storage_url.trim()).await?)
        }
        BackendKind::Postgres => {
            require_url(kind, &config.storage_url)?;
            let target = prepare_sql_url(kind, config.storage_url.trim())?;
            Arc::new(SqlStorage::postgres(pg_options(&target)?, config.sql_pool_size))
        }
        BackendKind::MySql => {
            require_url(kind, &config.storage_url)?;
            let target = prepare_sql_url(kind, config.storage_url.trim())?;
            Arc::new(SqlStorage::mysql(mysql_options(&target)?, config.sql_pool_size))
        }
    };
    Ok(storage)
}
