//! Key-value cache server backend.
//!
//! Layout (default namespace `grok2api`):
//!
//! ```text
//! grok2api:config              HASH  "section.key" -> JSON value
//! grok2api:pools               SET   pool names
//! grok2api:pool:<pool>         SET   token ids in that pool
//! grok2api:token:<token>       HASH  flattened record fields
//! grok2api:tokens:initialized  STRING marker: pools were saved at least once
//! grok2api:lock:<name>         STRING lock owner id (SET NX PX)
//! ```
//!
//! Config saves replace the whole hash inside one MULTI/EXEC, so a reader
//! sees either the old or the new document, never an empty window.
//! Section names may not contain `.`; keys may.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::{BackendKind, LockGuard, LockRelease, StorageBackend};
use crate::codec;
use crate::errors::{Result, StorageError};
use crate::models::config_doc::ConfigDocument;
use crate::models::token::{normalize_pools, normalize_token_id, TokenPools, TokenRecord, TokenUpdate};

pub const DEFAULT_NAMESPACE: &str = "grok2api";

/// Upper bound on how long an acquisition blocks, whatever the caller's
/// timeout. The lock's own expiry is set separately.
const MAX_BLOCKING_WAIT: Duration = Duration::from_secs(5);
const MIN_LOCK_TTL: Duration = Duration::from_secs(10);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Marks the config hash as initialised even when it holds no entries.
/// It has no dot, so readers never mistake it for a `section.key` field.
const CONFIG_MARKER_FIELD: &str = "__initialized__";
/// Stored next to the record fields; stripped on load.
const HASH_FIELD: &str = "data_hash";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

// Record fields stored as their raw string form; everything else that is
// not an integer column or `tags` is JSON-encoded.
const RAW_STRING_FIELDS: &[&str] = &["token", "status", "note", "last_fail_reason"];
const INT_FIELDS: &[&str] = &[
    "quota",
    "created_at",
    "last_used_at",
    "use_count",
    "fail_count",
    "last_fail_at",
    "last_sync_at",
    "last_asset_clear_at",
];

pub struct RedisStorage {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisStorage {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_namespace(url, DEFAULT_NAMESPACE).await
    }

    pub async fn connect_with_namespace(url: &str, namespace: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn config_key(&self) -> String {
        format!("{}:config", self.namespace)
    }

    fn pools_key(&self) -> String {
        format!("{}:pools", self.namespace)
    }

    fn pool_key(&self, pool_name: &str) -> String {
        format!("{}:pool:{}", self.namespace, pool_name)
    }

    fn token_key(&self, token: &str) -> String {
        format!("{}:token:{}", self.namespace, token)
    }

    fn tokens_marker_key(&self) -> String {
        format!("{}:tokens:initialized", self.namespace)
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}:lock:{}", self.namespace, name)
    }

    async fn read_config(&self) -> Result<Option<ConfigDocument>> {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> = conn.hgetall(self.config_key()).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        Ok(Some(unflatten_config(raw)))
    }

    async fn read_tokens(&self) -> Result<Option<TokenPools>> {
        let mut conn = self.conn.clone();
        let pool_names: HashSet<String> = conn.smembers(self.pools_key()).await?;
        if pool_names.is_empty() {
            let initialized: bool = conn.exists(self.tokens_marker_key()).await?;
            return Ok(initialized.then(TokenPools::new));
        }
        let pool_names: Vec<String> = pool_names.into_iter().collect();
        let members = self.pool_members(&pool_names).await?;

        let all_ids: Vec<&String> = members.values().flatten().collect();
        let mut lookup: HashMap<&str, TokenRecord> = HashMap::with_capacity(all_ids.len());
        if !all_ids.is_empty() {
            let mut pipe = redis::pipe();
            for id in &all_ids {
                pipe.hgetall(self.token_key(id));
            }
            let hashes: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
            for (id, fields) in all_ids.iter().zip(hashes) {
                if fields.is_empty() {
                    continue;
                }
                match unflatten_record(id, fields) {
                    Ok(record) => {
                        lookup.insert(id.as_str(), record);
                    }
                    Err(e) => tracing::warn!(token = %mask(id), "RedisStorage: skipping undecodable token: {}", e),
                }
            }
        }

        let mut pools = TokenPools::new();
        for (pool_name, ids) in &members {
            let mut records: Vec<TokenRecord> = ids
                .iter()
                .filter_map(|id| lookup.get(id.as_str()).cloned())
                .map(|r| r.in_pool(pool_name))
                .collect();
            records.sort_by(|a, b| a.token.cmp(&b.token));
            pools.insert(pool_name.clone(), records);
        }
        Ok(Some(pools))
    }

    /// One pipelined SMEMBERS per pool.
    async fn pool_members(&self, pool_names: &[String]) -> Result<BTreeMap<String, HashSet<String>>> {
        if pool_names.is_empty() {
            return Ok(BTreeMap::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for pool_name in pool_names {
            pipe.smembers(self.pool_key(pool_name));
        }
        let sets: Vec<HashSet<String>> = pipe.query_async(&mut conn).await?;
        Ok(pool_names.iter().cloned().zip(sets).collect())
    }

    async fn write_tokens(&self, pools: &TokenPools) -> Result<()> {
        let mut conn = self.conn.clone();
        let existing_pools: HashSet<String> = conn.smembers(self.pools_key()).await?;
        let existing_pools: Vec<String> = existing_pools.into_iter().collect();
        let existing_members = self.pool_members(&existing_pools).await?;

        let new_ids: HashSet<&str> = pools.values().flatten().map(|r| r.token.as_str()).collect();
        let stale: Vec<&String> = existing_members
            .values()
            .flatten()
            .filter(|id| !new_ids.contains(id.as_str()))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(self.tokens_marker_key(), 1).ignore();

        pipe.del(self.pools_key()).ignore();
        let pool_names: Vec<&String> = pools.keys().collect();
        if !pool_names.is_empty() {
            pipe.sadd(self.pools_key(), pool_names).ignore();
        }

        let all_pools: HashSet<&String> = existing_pools.iter().chain(pools.keys()).collect();
        for pool_name in all_pools {
            pipe.del(self.pool_key(pool_name)).ignore();
        }
        for (pool_name, records) in pools {
            let ids: Vec<&str> = records.iter().map(|r| r.token.as_str()).collect();
            if !ids.is_empty() {
                pipe.sadd(self.pool_key(pool_name), ids).ignore();
            }
        }

        for id in stale {
            pipe.del(self.token_key(id)).ignore();
        }
        for record in pools.values().flatten() {
            let key = self.token_key(&record.token);
            pipe.del(&key).ignore();
            pipe.hset_multiple(&key, &flatten_record(record)?).ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn write_delta(
        &self,
        latest: &BTreeMap<&str, &TokenRecord>,
        deleted: &HashSet<&str>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let existing_pools: HashSet<String> = conn.smembers(self.pools_key()).await?;

        let mut changed: Vec<(&str, TokenRecord, Vec<(String, String)>)> = Vec::new();
        if !latest.is_empty() {
            let mut hash_pipe = redis::pipe();
            let mut member_pipe = redis::pipe();
            for (token, record) in latest {
                hash_pipe.hget(self.token_key(token), HASH_FIELD);
                member_pipe.sismember(self.pool_key(&record.pool_name), *token);
            }
            let stored_hashes: Vec<Option<String>> = hash_pipe.query_async(&mut conn).await?;
            let is_member: Vec<bool> = member_pipe.query_async(&mut conn).await?;

            for (((token, record), stored), member) in latest.iter().zip(stored_hashes).zip(is_member) {
                let mut record = (*record).clone();
                record.token = token.to_string();
                let fields = flatten_record(&record)?;
                let new_hash = fields
                    .iter()
                    .find(|(k, _)| k == HASH_FIELD)
                    .map(|(_, v)| v.as_str());
                if member && stored.as_deref() == new_hash {
                    continue;
                }
                changed.push((*token, record, fields));
            }
        }
        if changed.is_empty() && deleted.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.set(self.tokens_marker_key(), 1).ignore();
        for token in deleted {
            for pool_name in &existing_pools {
                pipe.srem(self.pool_key(pool_name), *token).ignore();
            }
            pipe.del(self.token_key(token)).ignore();
        }
        for (token, record, fields) in &changed {
            for pool_name in existing_pools.iter().filter(|p| **p != record.pool_name) {
                pipe.srem(self.pool_key(pool_name), *token).ignore();
            }
            pipe.sadd(self.pools_key(), &record.pool_name).ignore();
            pipe.sadd(self.pool_key(&record.pool_name), *token).ignore();
            let key = self.token_key(token);
            pipe.del(&key).ignore();
            pipe.hset_multiple(&key, fields).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        tracing::debug!(updated = changed.len(), deleted = deleted.len(), "RedisStorage: token delta saved");
        Ok(())
    }
}

struct RedisRelease {
    conn: ConnectionManager,
    key: String,
    owner: String,
}

#[async_trait]
impl LockRelease for RedisRelease {
    async fn release(self: Box<Self>) {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(RELEASE_SCRIPT);
        let released: redis::RedisResult<i64> = script
            .key(&self.key)
            .arg(&self.owner)
            .invoke_async(&mut conn)
            .await;
        match released {
            Ok(0) => tracing::debug!(key = %self.key, "RedisStorage: lock already expired before release"),
            Ok(_) => {}
            Err(e) => tracing::debug!(key = %self.key, "RedisStorage: lock release failed: {}", e),
        }
    }
}

#[async_trait]
impl StorageBackend for RedisStorage {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn try_load_config(&self) -> Result<Option<ConfigDocument>> {
        self.read_config().await
    }

    async fn save_config(&self, doc: &ConfigDocument) -> Result<()> {
        let fields = flatten_config(doc)?;
        let key = self.config_key();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(&key).ignore();
        pipe.hset_multiple(&key, &fields).ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(StorageError::from)
            .inspect_err(|e| tracing::error!("RedisStorage: failed to save config: {}", e))
    }

    async fn try_load_tokens(&self) -> Result<Option<TokenPools>> {
        self.read_tokens().await
    }

    async fn save_tokens(&self, pools: &TokenPools) -> Result<()> {
        let pools = normalize_pools(pools);
        self.write_tokens(&pools)
            .await
            .inspect_err(|e| tracing::error!("RedisStorage: failed to save tokens: {}", e))
    }

    async fn save_tokens_delta(&self, updated: &[TokenUpdate], deleted: &[String]) -> Result<()> {
        let deleted: HashSet<&str> = deleted.iter().map(|t| normalize_token_id(t)).collect();

        // Last update per token wins; deletions beat updates.
        let mut latest: BTreeMap<&str, &TokenRecord> = BTreeMap::new();
        for update in updated {
            let token = normalize_token_id(&update.record.token);
            if token.is_empty() || update.record.pool_name.is_empty() || deleted.contains(token) {
                continue;
            }
            latest.insert(token, &update.record);
        }
        if latest.is_empty() && deleted.is_empty() {
            return Ok(());
        }
        self.write_delta(&latest, &deleted)
            .await
            .inspect_err(|e| tracing::error!("RedisStorage: failed to save token delta: {}", e))
    }

    async fn acquire_lock(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let key = self.lock_key(name);
        let owner = uuid::Uuid::new_v4().to_string();
        let ttl = timeout.max(MIN_LOCK_TTL);
        let wait = timeout.min(MAX_BLOCKING_WAIT);
        let deadline = Instant::now() + wait;

        let mut conn = self.conn.clone();
        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&owner)
                .arg("NX")
                .arg("PX")
                .arg(ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
            if acquired.is_some() {
                return Ok(LockGuard::new(
                    name,
                    Box::new(RedisRelease {
                        conn: self.conn.clone(),
                        key,
                        owner,
                    }),
                ));
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(lock = %name, ?wait, "RedisStorage: lock acquisition timed out");
                return Err(StorageError::lock_timeout(name, timeout));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn verify_connection(&self) -> bool {
        let mut conn = self.conn.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn close(&self) {
        // ConnectionManager tears its connection down when the last clone
        // is dropped; nothing to flush here.
        tracing::debug!("RedisStorage: closed");
    }
}

/// `section.key` → JSON value. Empty sections are kept as a `section.`
/// field so they survive a round-trip. Fields split on the first dot, so a
/// section name containing one is rejected; keys may contain dots.
pub fn flatten_config(doc: &ConfigDocument) -> Result<Vec<(String, String)>> {
    let mut fields = vec![(CONFIG_MARKER_FIELD.to_string(), "1".to_string())];
    for (section, items) in doc {
        if section.contains('.') {
            return Err(StorageError::Malformed(format!(
                "config section '{section}' contains '.', which this backend uses as the section separator"
            )));
        }
        if items.is_empty() {
            fields.push((format!("{section}."), "{}".to_string()));
            continue;
        }
        for (key, value) in items {
            fields.push((format!("{section}.{key}"), codec::dumps(value)?));
        }
    }
    Ok(fields)
}

pub fn unflatten_config(raw: HashMap<String, String>) -> ConfigDocument {
    let mut doc = ConfigDocument::new();
    for (composite, raw_value) in raw {
        let Some((section, key)) = composite.split_once('.') else {
            continue;
        };
        let items = doc.entry(section.to_string()).or_default();
        if key.is_empty() {
            continue;
        }
        let value = serde_json::from_str(&raw_value).unwrap_or(Value::String(raw_value));
        items.insert(key.to_string(), value);
    }
    doc
}

/// Flatten a record into hash fields: nulls dropped, `tags` as a JSON
/// list, integers in decimal, known text fields raw, unknown extras as
/// JSON. The content hash is appended under `data_hash`.
pub fn flatten_record(record: &TokenRecord) -> Result<Vec<(String, String)>> {
    let Value::Object(map) = serde_json::to_value(record)? else {
        return Err(StorageError::Malformed("token record did not serialize to an object".into()));
    };
    let mut fields = Vec::with_capacity(map.len() + 1);
    for (key, value) in map {
        let flat = match (key.as_str(), value) {
            (_, Value::Null) => continue,
            (k, Value::String(s)) if RAW_STRING_FIELDS.contains(&k) => s,
            (k, Value::Number(n)) if INT_FIELDS.contains(&k) => n.to_string(),
            (_, other) => codec::dumps(&other)?,
        };
        fields.push((key, flat));
    }
    fields.push((HASH_FIELD.to_string(), record.content_hash()?));
    Ok(fields)
}

pub fn unflatten_record(token_id: &str, fields: HashMap<String, String>) -> Result<TokenRecord> {
    let mut map = Map::with_capacity(fields.len());
    for (key, raw) in fields {
        if key == HASH_FIELD {
            continue;
        }
        // Known fields go in as strings; the record's deserializers coerce
        // integers and JSON-encoded tags.
        let value = if RAW_STRING_FIELDS.contains(&key.as_str())
            || INT_FIELDS.contains(&key.as_str())
            || key == "tags"
        {
            Value::String(raw)
        } else {
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        };
        map.insert(key, value);
    }
    map.entry("token").or_insert_with(|| Value::String(token_id.to_string()));
    TokenRecord::from_value(Value::Object(map))
}

fn mask(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{prefix}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::config_doc::config_from_value;
    use crate::models::token::TokenStatus;
    use serde_json::json;

    #[test]
    fn test_config_flatten_round_trip() {
        let doc = config_from_value(json!({
            "app": {"stream": true, "api_key": "k", "tags": ["a"]},
            "empty": {}
        }))
        .unwrap();
        let fields = flatten_config(&doc).unwrap();
        assert!(fields.iter().any(|(k, v)| k == "app.stream" && v == "true"));
        assert!(fields.iter().any(|(k, v)| k == "app.api_key" && v == "\"k\""));

        let back = unflatten_config(fields.into_iter().collect());
        assert_eq!(back, doc);
    }

    #[test]
    fn test_empty_config_is_still_initialized() {
        let fields = flatten_config(&ConfigDocument::new()).unwrap();
        assert_eq!(fields.len(), 1);
        assert!(unflatten_config(fields.into_iter().collect()).is_empty());
    }

    #[test]
    fn test_dotted_section_name_is_rejected() {
        let doc = config_from_value(json!({"grok.v2": {"base_url": "x"}})).unwrap();
        let err = flatten_config(&doc).unwrap_err();
        assert!(matches!(err, StorageError::Malformed(_)));

        let doc = config_from_value(json!({"grok": {"v2.base_url": "x"}})).unwrap();
        let back = unflatten_config(flatten_config(&doc).unwrap().into_iter().collect());
        assert_eq!(back, doc);
    }

    #[test]
    fn test_legacy_raw_string_values_load() {
        let mut raw = HashMap::new();
        raw.insert("app.api_key".to_string(), "not-json".to_string());
        raw.insert("nodot".to_string(), "x".to_string());
        let doc = unflatten_config(raw);
        assert_eq!(doc["app"]["api_key"], json!("not-json"));
        assert_eq!(doc.len(), 1);
    }

    #[test]
    fn test_record_flatten_round_trip() {
        let mut record = TokenRecord::new("abc");
        record.status = TokenStatus::Cooling;
        record.quota = Some(5);
        record.tags = vec!["nsfw".into()];
        record.last_fail_reason = Some("429".into());
        record.extra.insert("plan".into(), json!("pro"));
        record.extra.insert("weight".into(), json!(3));

        let fields = flatten_record(&record).unwrap();
        let get = |k: &str| fields.iter().find(|(f, _)| f == k).map(|(_, v)| v.clone());
        assert_eq!(get("status").as_deref(), Some("cooling"));
        assert_eq!(get("quota").as_deref(), Some("5"));
        assert_eq!(get("tags").as_deref(), Some("[\"nsfw\"]"));
        assert_eq!(get("last_fail_reason").as_deref(), Some("429"));
        assert!(get("created_at").is_none());
        assert_eq!(get(HASH_FIELD), Some(record.content_hash().unwrap()));

        let back = unflatten_record("abc", fields.into_iter().collect()).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_legacy_hash_with_qualified_status() {
        let mut fields = HashMap::new();
        fields.insert("token".to_string(), "abc".to_string());
        fields.insert("status".to_string(), "TokenStatus.active".to_string());
        fields.insert("use_count".to_string(), "None".to_string());
        let record = unflatten_record("abc", fields).unwrap();
        assert_eq!(record.status, TokenStatus::Active);
        assert_eq!(record.use_count, None);
    }
}
