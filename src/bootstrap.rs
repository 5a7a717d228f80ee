//! Startup helpers that sit one level above the storage contract: seeding
//! a fresh remote backend from the local data directory, and the locked
//! read-merge-save used for configuration updates.

use std::path::Path;
use std::time::Duration;

use crate::errors::{Result, StorageError};
use crate::models::config_doc::{deep_merge, ConfigDocument};
use crate::store::local::LocalStorage;
use crate::store::{BackendKind, StorageBackend, CONFIG_LOCK, TOKENS_LOCK};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeedReport {
    pub config_seeded: bool,
    pub tokens_seeded: bool,
}

/// Copy the local data directory into `storage` for every resource the
/// backend has never saved. An initialised resource is never touched,
/// and an empty local source is never written (it would only reset the
/// remote side).
///
/// An unreachable backend is refused up front, and the backend's current
/// state is read strictly: a read failure aborts instead of seeding over
/// data that could not be read.
pub async fn seed_from_local(storage: &dyn StorageBackend, data_dir: &Path, timeout: Duration) -> Result<SeedReport> {
    if storage.kind() == BackendKind::Local {
        return Ok(SeedReport::default());
    }
    if !storage.verify_connection().await {
        return Err(StorageError::Config(format!(
            "{} backend is unreachable; refusing to seed",
            storage.kind()
        )));
    }

    let local = LocalStorage::new(data_dir);
    let mut report = SeedReport::default();

    let guard = storage.acquire_lock(CONFIG_LOCK, timeout).await?;
    if storage.try_load_config().await?.is_none() {
        if let Some(doc) = local.load_config().await?.filter(|d| !d.is_empty()) {
            storage.save_config(&doc).await?;
            report.config_seeded = true;
            tracing::info!(backend = %storage.kind(), sections = doc.len(), "seeded config from local data dir");
        }
    }
    guard.release().await;

    let guard = storage.acquire_lock(TOKENS_LOCK, timeout).await?;
    if storage.try_load_tokens().await?.is_none() {
        if let Some(pools) = local.load_tokens().await?.filter(|p| !p.is_empty()) {
            storage.save_tokens(&pools).await?;
            report.tokens_seeded = true;
            let tokens: usize = pools.values().map(Vec::len).sum();
            tracing::info!(backend = %storage.kind(), pools = pools.len(), tokens, "seeded tokens from local data dir");
        }
    }
    guard.release().await;

    Ok(report)
}

/// Merge `patch` over the stored document under the config lock and save
/// the result. Returns what was saved. Nothing is written when the stored
/// document cannot be read.
pub async fn merge_config(
    storage: &dyn StorageBackend,
    patch: &ConfigDocument,
    timeout: Duration,
) -> Result<ConfigDocument> {
    let guard = storage.acquire_lock(CONFIG_LOCK, timeout).await?;
    let current = storage.try_load_config().await?.unwrap_or_default();
    let merged = deep_merge(&current, patch);
    storage.save_config(&merged).await?;
    guard.release().await;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config_doc::config_from_value;
    use serde_json::json;

    #[tokio::test]
    async fn test_merge_config_keeps_untouched_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let base = config_from_value(json!({"app": {"stream": true, "timeout": 30}})).unwrap();
        storage.save_config(&base).await.unwrap();

        let patch = config_from_value(json!({"app": {"timeout": 60}, "retry": {"max_retry": 3}})).unwrap();
        let merged = merge_config(&storage, &patch, Duration::from_secs(1)).await.unwrap();

        assert_eq!(merged["app"]["stream"], json!(true));
        assert_eq!(merged["app"]["timeout"], json!(60));
        let reloaded = storage.load_config().await.unwrap().unwrap();
        assert_eq!(reloaded, merged);
    }

    #[tokio::test]
    async fn test_merge_config_on_fresh_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let patch = config_from_value(json!({"app": {"stream": false}})).unwrap();
        merge_config(&storage, &patch, Duration::from_secs(1)).await.unwrap();
        assert_eq!(storage.load_config().await.unwrap().unwrap(), patch);
    }

    #[tokio::test]
    async fn test_merge_config_leaves_unreadable_document_alone() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let corrupt = "[app]\nstream = true\n[retry\n";
        std::fs::write(storage.config_path(), corrupt).unwrap();

        let patch = config_from_value(json!({"app": {"stream": false}})).unwrap();
        let err = merge_config(&storage, &patch, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, StorageError::Toml(_)));
        assert_eq!(std::fs::read_to_string(storage.config_path()).unwrap(), corrupt);
    }

    #[tokio::test]
    async fn test_seeding_a_local_backend_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());
        let report = seed_from_local(&storage, dir.path(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(report, SeedReport::default());
    }
}
