//! Storage engine: one [`StorageBackend`] per process, chosen by
//! [`factory::build_storage`] and shared as an `Arc<dyn StorageBackend>`.
//!
//! Callers follow one discipline for the full-document resources:
//! acquire the named lock, read the current snapshot, compute the new one,
//! save, release. The delta path ([`StorageBackend::save_tokens_delta`])
//! may be called without the resource lock for single-token counter
//! updates; it cannot detect a concurrent full replace racing underneath.

pub mod factory;
pub mod local;
pub mod redis;
pub mod sql;

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;
use crate::models::config_doc::ConfigDocument;
use crate::models::token::{normalize_token_id, TokenPools, TokenUpdate};

/// Lock guarding read-modify-write of the configuration document.
pub const CONFIG_LOCK: &str = "config_save";
/// Lock guarding read-modify-write of the token pools.
pub const TOKENS_LOCK: &str = "tokens_save";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Local,
    Redis,
    MySql,
    Postgres,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Redis => "redis",
            BackendKind::MySql => "mysql",
            BackendKind::Postgres => "pgsql",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The contract every backend implements.
///
/// Reads return `Ok(None)` when the resource was never saved, which is
/// distinct from `Ok(Some(empty))`. `load_*` log read failures and report
/// them as `Ok(None)`; `try_load_*` return them. Anything that writes back
/// what it read must use `try_load_*`, or an unreadable store is taken
/// for an empty one and overwritten. Write failures always propagate.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn try_load_config(&self) -> Result<Option<ConfigDocument>>;

    async fn load_config(&self) -> Result<Option<ConfigDocument>> {
        match self.try_load_config().await {
            Ok(doc) => Ok(doc),
            Err(e) => {
                tracing::error!(backend = %self.kind(), "failed to load config: {}", e);
                Ok(None)
            }
        }
    }

    /// Full replace. Readers never observe a partially written document.
    async fn save_config(&self, doc: &ConfigDocument) -> Result<()>;

    async fn try_load_tokens(&self) -> Result<Option<TokenPools>>;

    async fn load_tokens(&self) -> Result<Option<TokenPools>> {
        match self.try_load_tokens().await {
            Ok(pools) => Ok(pools),
            Err(e) => {
                tracing::error!(backend = %self.kind(), "failed to load tokens: {}", e);
                Ok(None)
            }
        }
    }

    /// Full replace of every pool.
    async fn save_tokens(&self, pools: &TokenPools) -> Result<()>;

    /// Incremental save. The default materialises the delta as
    /// load-modify-save: correct, but not cheap. Nothing is written when
    /// the current snapshot cannot be read.
    async fn save_tokens_delta(&self, updated: &[TokenUpdate], deleted: &[String]) -> Result<()> {
        let mut pools = self.try_load_tokens().await?.unwrap_or_default();
        apply_delta(&mut pools, updated, deleted);
        self.save_tokens(&pools).await
    }

    /// Blocks until the named lock is held or `timeout` elapses, in which
    /// case it fails with [`StorageError::LockTimeout`](crate::errors::StorageError::LockTimeout).
    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard>;

    /// Non-authoritative health check.
    async fn verify_connection(&self) -> bool;

    /// Release backend resources. Idempotent.
    async fn close(&self);
}

/// Backend-specific release action for a held lock.
#[async_trait]
pub trait LockRelease: Send {
    /// Best-effort: a lock that already expired server-side must not
    /// surface an error here.
    async fn release(self: Box<Self>);
}

/// Scoped lock handle. Call [`LockGuard::release`] on the happy path; if
/// the guard is dropped instead (early return, `?`, panic, cancelled
/// task) release is scheduled on the current runtime.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    name: String,
    release: Option<Box<dyn LockRelease>>,
}

impl LockGuard {
    pub fn new(name: &str, release: Box<dyn LockRelease>) -> Self {
        Self {
            name: name.to_string(),
            release: Some(release),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn release(mut self) {
        if let Some(release) = self.release.take() {
            release.release().await;
            tracing::debug!(lock = %self.name, "lock released");
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(release) = self.release.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let name = std::mem::take(&mut self.name);
                handle.spawn(async move {
                    release.release().await;
                    tracing::debug!(lock = %name, "lock released on drop");
                });
            }
            // No runtime left: server-side expiry or session teardown
            // reclaims remote locks; local releasers free on drop.
            Err(_) => drop(release),
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("held", &self.release.is_some())
            .finish()
    }
}

/// Apply a delta to an in-memory snapshot: drop deleted tokens from every
/// pool, then replace or append each update in its target pool. A token
/// that moved pools is removed from its previous one.
pub fn apply_delta(pools: &mut TokenPools, updated: &[TokenUpdate], deleted: &[String]) {
    let deleted: HashSet<&str> = deleted.iter().map(|t| normalize_token_id(t)).collect();

    for update in updated {
        let token = normalize_token_id(&update.record.token);
        let pool_name = update.record.pool_name.as_str();
        if token.is_empty() || pool_name.is_empty() || deleted.contains(token) {
            continue;
        }
        for (name, members) in pools.iter_mut() {
            if name != pool_name {
                members.retain(|r| r.token != token);
            }
        }

        let mut record = update.record.clone();
        record.token = token.to_string();
        let members = pools.entry(pool_name.to_string()).or_default();
        match members.iter_mut().find(|r| r.token == token) {
            Some(slot) => *slot = record,
            None => members.push(record),
        }
    }

    if !deleted.is_empty() {
        for members in pools.values_mut() {
            members.retain(|r| !deleted.contains(r.token.as_str()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StorageError;
    use crate::models::token::TokenRecord;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// In-memory backend that only implements the required methods, so the
    /// trait's default delta path is what gets exercised.
    #[derive(Default)]
    struct MemoryStorage {
        tokens: Mutex<Option<TokenPools>>,
        saves: std::sync::atomic::AtomicUsize,
        unreadable: AtomicBool,
    }

    struct NoopRelease(Arc<AtomicBool>);

    #[async_trait]
    impl LockRelease for NoopRelease {
        async fn release(self: Box<Self>) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StorageBackend for MemoryStorage {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }
        async fn try_load_config(&self) -> Result<Option<ConfigDocument>> {
            Ok(None)
        }
        async fn save_config(&self, _doc: &ConfigDocument) -> Result<()> {
            Err(StorageError::Malformed("read-only".into()))
        }
        async fn try_load_tokens(&self) -> Result<Option<TokenPools>> {
            if self.unreadable.load(Ordering::SeqCst) {
                return Err(StorageError::Malformed("corrupt snapshot".into()));
            }
            Ok(self.tokens.lock().await.clone())
        }
        async fn save_tokens(&self, pools: &TokenPools) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.tokens.lock().await = Some(pools.clone());
            Ok(())
        }
        async fn acquire_lock(&self, name: &str, _timeout: Duration) -> Result<LockGuard> {
            Ok(LockGuard::new(name, Box::new(NoopRelease(Arc::new(AtomicBool::new(false))))))
        }
        async fn verify_connection(&self) -> bool {
            true
        }
        async fn close(&self) {}
    }

    fn rec(token: &str, pool: &str) -> TokenRecord {
        TokenRecord::new(token).in_pool(pool)
    }

    #[tokio::test]
    async fn test_default_delta_is_load_modify_save() {
        let storage = MemoryStorage::default();
        let mut pools = TokenPools::new();
        pools.insert("basic".into(), vec![rec("a", "basic"), rec("b", "basic")]);
        storage.save_tokens(&pools).await.unwrap();

        let mut a = rec("a", "basic");
        a.use_count = Some(7);
        storage
            .save_tokens_delta(&[a.into(), rec("c", "super").into()], &["b".to_string()])
            .await
            .unwrap();

        let loaded = storage.load_tokens().await.unwrap().unwrap();
        assert_eq!(loaded["basic"].len(), 1);
        assert_eq!(loaded["basic"][0].use_count, Some(7));
        assert_eq!(loaded["super"][0].token, "c");
        assert_eq!(storage.saves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_default_delta_refuses_to_write_over_unreadable_snapshot() {
        let storage = MemoryStorage::default();
        let mut pools = TokenPools::new();
        pools.insert("basic".into(), (0..50).map(|i| rec(&format!("t{i}"), "basic")).collect());
        storage.save_tokens(&pools).await.unwrap();
        storage.unreadable.store(true, Ordering::SeqCst);

        let err = storage
            .save_tokens_delta(&[rec("new", "basic").into()], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Malformed(_)));
        assert_eq!(storage.saves.load(Ordering::SeqCst), 1);
        assert!(storage.load_tokens().await.unwrap().is_none());

        storage.unreadable.store(false, Ordering::SeqCst);
        assert_eq!(storage.load_tokens().await.unwrap().unwrap()["basic"].len(), 50);
    }

    #[test]
    fn test_apply_delta_moves_token_between_pools() {
        let mut pools = TokenPools::new();
        pools.insert("basic".into(), vec![rec("a", "basic")]);
        pools.insert("super".into(), vec![]);

        apply_delta(&mut pools, &[rec("sso=a", "super").into()], &[]);

        assert!(pools["basic"].is_empty());
        assert_eq!(pools["super"].len(), 1);
        assert_eq!(pools["super"][0].token, "a");
    }

    #[test]
    fn test_apply_delta_delete_wins_over_update() {
        let mut pools = TokenPools::new();
        pools.insert("basic".into(), vec![rec("a", "basic")]);
        apply_delta(&mut pools, &[rec("a", "basic").into()], &["sso=a".to_string()]);
        assert!(pools["basic"].is_empty());
    }

    #[test]
    fn test_apply_delta_ignores_records_without_pool() {
        let mut pools = TokenPools::new();
        apply_delta(&mut pools, &[TokenRecord::new("a").into()], &[]);
        assert!(pools.is_empty());
    }

    #[tokio::test]
    async fn test_guard_release_runs_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let guard = LockGuard::new("x", Box::new(NoopRelease(flag.clone())));
        assert_eq!(guard.name(), "x");
        guard.release().await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_guard_drop_schedules_release() {
        let flag = Arc::new(AtomicBool::new(false));
        {
            let _guard = LockGuard::new("x", Box::new(NoopRelease(flag.clone())));
        }
        for _ in 0..50 {
            if flag.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(flag.load(Ordering::SeqCst));
    }
}
