use std::path::PathBuf;
use std::time::Duration;

use crate::store::sql::DEFAULT_POOL_SIZE;

#[derive(Debug, Clone)]
pub struct Config {
    /// Backend kind as written by the operator. Parsed (and rejected if
    /// unknown) by the storage factory.
    /// Set via SERVER_STORAGE_TYPE. Default: local.
    pub storage_type: String,
    /// Connection string for the redis and relational backends.
    pub storage_url: String,
    /// Root of the local backend, and the seed source for remote ones.
    pub data_dir: PathBuf,
    /// Default wait for named locks taken by the operator commands.
    /// Set via STORAGE_LOCK_TIMEOUT_SECS. Default: 10.
    pub lock_timeout: Duration,
    pub sql_pool_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_type: "local".into(),
            storage_url: String::new(),
            data_dir: PathBuf::from("./data"),
            lock_timeout: Duration::from_secs(10),
            sql_pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

pub fn load() -> Config {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from any key lookup. `load` passes the process
/// environment; tests pass a map.
pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Config {
    let defaults = Config::default();
    let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    Config {
        storage_type: non_empty("SERVER_STORAGE_TYPE")
            .map(|v| v.to_lowercase())
            .unwrap_or(defaults.storage_type),
        storage_url: non_empty("SERVER_STORAGE_URL").unwrap_or_default(),
        data_dir: non_empty("DATA_DIR")
            .map(|v| expand_home(&v))
            .unwrap_or(defaults.data_dir),
        lock_timeout: non_empty("STORAGE_LOCK_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.lock_timeout),
        sql_pool_size: non_empty("SQL_POOL_SIZE")
            .and_then(|v| v.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.sql_pool_size),
    }
}

fn expand_home(raw: &str) -> PathBuf {
    match raw.strip_prefix("~") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest.trim_start_matches('/')),
            None => PathBuf::from(raw),
        },
        _ => PathBuf::from(raw),
    }
}
