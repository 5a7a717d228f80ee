//! Local filesystem backend.
//!
//! Layout under the data directory:
//!
//! ```text
//! config.toml          sectioned key/value text, human-editable
//! token.json           {pool: [record, ...]}, written via token.tmp + rename
//! .locks/<name>.lock   advisory lock files
//! ```
//!
//! Locking has two layers. A per-name async mutex always serialises tasks
//! inside this process. On unix and windows an OS advisory lock on the
//! lock file (fs2) is taken on top of it, polled every 50 ms until the
//! caller's deadline. On any other target only the in-process mutex
//! applies and the backend is NOT safe to share between processes.
//! A lock file left behind by a crashed holder carries no OS lock and is
//! simply re-acquired.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;

use super::{BackendKind, LockGuard, LockRelease, StorageBackend};
use crate::errors::{Result, StorageError};
use crate::models::config_doc::ConfigDocument;
use crate::models::token::{normalize_pools, pools_from_value, TokenPools};

pub const CONFIG_FILE: &str = "config.toml";
pub const TOKEN_FILE: &str = "token.json";
pub const LOCK_DIR: &str = ".locks";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct LocalStorage {
    data_dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LocalStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: DashMap::new(),
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    pub fn token_path(&self) -> PathBuf {
        self.data_dir.join(TOKEN_FILE)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir.join(LOCK_DIR).join(format!("{safe}.lock"))
    }

    fn process_mutex(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(any(unix, windows))]
    async fn lock_file(&self, name: &str, deadline: Instant, timeout: Duration) -> Result<std::fs::File> {
        use fs2::FileExt;

        let path = self.lock_path(name);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&path)
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        let contended = fs2::lock_contended_error().raw_os_error();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(file),
                Err(e) if e.raw_os_error() == contended => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StorageError::lock_timeout(name, timeout));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

struct LocalRelease {
    _process: OwnedMutexGuard<()>,
    #[cfg(any(unix, windows))]
    file: std::fs::File,
}

impl Drop for LocalRelease {
    fn drop(&mut self) {
        #[cfg(any(unix, windows))]
        {
            let _ = fs2::FileExt::unlock(&self.file);
        }
    }
}

#[async_trait]
impl LockRelease for LocalRelease {
    async fn release(self: Box<Self>) {
        drop(self);
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn try_load_config(&self) -> Result<Option<ConfigDocument>> {
        let raw = match tokio::fs::read_to_string(self.config_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        parse_config_text(&raw).map(Some)
    }

    async fn save_config(&self, doc: &ConfigDocument) -> Result<()> {
        let text = render_config_text(doc);
        write_atomic(&self.config_path(), text.as_bytes())
            .await
            .inspect_err(|e| tracing::error!("LocalStorage: failed to save config: {}", e))
    }

    async fn try_load_tokens(&self) -> Result<Option<TokenPools>> {
        let raw = match tokio::fs::read(self.token_path()).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_slice::<Value>(&raw)?;
        pools_from_value(value).map(Some)
    }

    async fn save_tokens(&self, pools: &TokenPools) -> Result<()> {
        let body = serde_json::to_vec_pretty(&normalize_pools(pools))?;
        write_atomic(&self.token_path(), &body)
            .await
            .inspect_err(|e| tracing::error!("LocalStorage: failed to save tokens: {}", e))
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let deadline = Instant::now() + timeout;
        let mutex = self.process_mutex(name);

        let process = match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                tracing::warn!(lock = %name, ?timeout, "LocalStorage: lock acquisition timed out");
                return Err(StorageError::lock_timeout(name, timeout));
            }
        };

        #[cfg(any(unix, windows))]
        let release = {
            let file = self
                .lock_file(name, deadline, timeout)
                .await
                .inspect_err(|e| {
                    if e.is_lock_timeout() {
                        tracing::warn!(lock = %name, ?timeout, "LocalStorage: lock acquisition timed out");
                    }
                })?;
            LocalRelease { _process: process, file }
        };
        #[cfg(not(any(unix, windows)))]
        let release = {
            let _ = deadline;
            LocalRelease { _process: process }
        };

        Ok(LockGuard::new(name, Box::new(release)))
    }

    async fn verify_connection(&self) -> bool {
        tokio::fs::create_dir_all(&self.data_dir).await.is_ok()
    }

    async fn close(&self) {}
}

/// Write to a `.tmp` sibling, fsync, then rename over `path`. A crash
/// before the rename leaves the previous file untouched.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("tmp");

    if let Err(e) = write_synced(&temp_path, bytes).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }

    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e.into());
    }
    Ok(())
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

// ─── config text ────────────────────────────────────────────────────────

/// Render the document as `[section]` blocks of `key = value` lines.
/// Strings are double-quoted with escapes, booleans are bare, lists and
/// maps are written inline on one line. Null values have no textual form
/// and are omitted.
pub fn render_config_text(doc: &ConfigDocument) -> String {
    let mut out = String::new();
    for (section, items) in doc {
        out.push_str(&format!("[{}]\n", render_key(section)));
        for (key, value) in items {
            match render_value(value) {
                Some(rendered) => out.push_str(&format!("{} = {}\n", render_key(key), rendered)),
                None => tracing::debug!(section = %section, key = %key, "omitting null config value"),
            }
        }
        out.push('\n');
    }
    out
}

pub fn parse_config_text(raw: &str) -> Result<ConfigDocument> {
    let table: toml::Table = toml::from_str(raw)?;
    let mut doc = ConfigDocument::new();
    for (section, value) in table {
        match value {
            toml::Value::Table(items) => {
                let items: Map<String, Value> =
                    items.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect();
                doc.insert(section, items);
            }
            _ => tracing::warn!(key = %section, "ignoring config value outside any section"),
        }
    }
    Ok(doc)
}

fn render_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        quote(key)
    }
}

fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (None, Some(u), _) => u.to_string(),
            // `{:?}` keeps the fractional part ("1.0"), so floats stay floats.
            (None, None, Some(f)) => format!("{f:?}"),
            _ => n.to_string(),
        }),
        Value::String(s) => Some(quote(s)),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(render_value).collect();
            Some(format!("[{}]", parts.join(", ")))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map
                .iter()
                .filter_map(|(k, v)| render_value(v).map(|v| format!("{} = {}", render_key(k), v)))
                .collect();
            if parts.is_empty() {
                Some("{}".to_string())
            } else {
                Some(format!("{{ {} }}", parts.join(", ")))
            }
        }
    }
}

fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::from(i),
        toml::Value::Float(f) => serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(map) => Value::Object(map.into_iter().map(|(k, v)| (k, toml_to_json(v))).collect()),
    }
}
