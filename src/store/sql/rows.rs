//! Mapping between token records and `tokens` table rows.

use serde_json::{Map, Value};

use crate::codec;
use crate::errors::Result;
use crate::models::token::{normalize_token_id, parse_tags, TokenRecord};

/// Column list shared by every insert and upsert, in bind order.
pub(super) const TOKEN_COLUMNS: &[&str] = &[
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
    "data_hash",
    "updated_at",
];

/// Columns a usage update is allowed to touch on conflict. `data` is left
/// alone, so `data_hash` then names the last record written rather than
/// the blob; the next full save of any other content is never skipped.
pub(super) const USAGE_COLUMNS: &[&str] = &[
    "pool_name",
    "status",
    "quota",
    "last_used_at",
    "use_count",
    "fail_count",
    "last_fail_at",
    "last_fail_reason",
    "last_sync_at",
    "data_hash",
    "updated_at",
];

/// Typed columns that are `INT`/`BIGINT` in the table. Selected through a
/// cast so both dialects decode them as `i64`.
pub(super) const INT_COLUMNS: &[&str] = &[
    "quota",
    "created_at",
    "last_used_at",
    "use_count",
    "fail_count",
    "last_fail_at",
    "last_sync_at",
    "last_asset_clear_at",
];

/// A record ready to be bound into an insert.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct TokenRow {
    pub token: String,
    pub pool_name: String,
    pub status: String,
    pub quota: Option<i64>,
    pub created_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub use_count: Option<i64>,
    pub fail_count: Option<i64>,
    pub last_fail_at: Option<i64>,
    pub last_fail_reason: Option<String>,
    pub last_sync_at: Option<i64>,
    pub tags: String,
    pub note: String,
    pub last_asset_clear_at: Option<i64>,
    pub data: String,
    pub data_hash: String,
    pub updated_at: i64,
}

impl TokenRow {
    pub fn from_record(record: &TokenRecord, pool_name: &str, updated_at: i64) -> Result<Self> {
        let mut record = record.clone();
        record.token = normalize_token_id(record.token.trim()).to_string();
        let data = codec::dumps_sorted(&record)?;
        let data_hash = codec::sha256_hex(&data);

        Ok(Self {
            pool_name: pool_name.to_string(),
            status: record.status.as_str().to_string(),
            quota: record.quota,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            use_count: record.use_count,
            fail_count: record.fail_count,
            last_fail_at: record.last_fail_at,
            last_fail_reason: record.last_fail_reason.clone(),
            last_sync_at: record.last_sync_at,
            tags: codec::dumps(&record.tags)?,
            note: record.note.clone(),
            last_asset_clear_at: record.last_asset_clear_at,
            data,
            data_hash,
            updated_at,
            token: record.token,
        })
    }
}

/// A `tokens` row as read back. Every typed column may be NULL on rows
/// written by older versions.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub(super) struct StoredRow {
    pub token: String,
    pub pool_name: String,
    pub status: Option<String>,
    pub quota: Option<i64>,
    pub created_at: Option<i64>,
    pub last_used_at: Option<i64>,
    pub use_count: Option<i64>,
    pub fail_count: Option<i64>,
    pub last_fail_at: Option<i64>,
    pub last_fail_reason: Option<String>,
    pub last_sync_at: Option<i64>,
    pub tags: Option<String>,
    pub note: Option<String>,
    pub last_asset_clear_at: Option<i64>,
    pub data: Option<String>,
}

impl StoredRow {
    /// Typed columns are authoritative. The blob only contributes
    /// attributes that have no column, except on legacy rows (NULL
    /// `status`) where it also fills the NULL typed columns.
    pub fn into_record(self) -> Result<TokenRecord> {
        let legacy = self.status.is_none();
        let mut map = Map::new();
        map.insert("token".into(), Value::String(self.token));

        let ints = [
            ("quota", self.quota),
            ("created_at", self.created_at),
            ("last_used_at", self.last_used_at),
            ("use_count", self.use_count),
            ("fail_count", self.fail_count),
            ("last_fail_at", self.last_fail_at),
            ("last_sync_at", self.last_sync_at),
            ("last_asset_clear_at", self.last_asset_clear_at),
        ];
        for (key, value) in ints {
            if let Some(v) = value {
                map.insert(key.into(), Value::from(v));
            }
        }
        if let Some(status) = self.status {
            map.insert("status".into(), Value::String(status));
        }
        if let Some(reason) = self.last_fail_reason {
            map.insert("last_fail_reason".into(), Value::String(reason));
        }
        if let Some(note) = self.note {
            map.insert("note".into(), Value::String(note));
        }
        if let Some(tags) = self.tags {
            let tags = parse_tags(Value::String(tags));
            map.insert("tags".into(), Value::from(tags));
        }

        if let Some(raw) = self.data.filter(|d| !d.is_empty()) {
            match codec::loads::<Value>(&raw) {
                Ok(Value::Object(blob)) => {
                    for (key, value) in blob {
                        if !legacy && TOKEN_COLUMNS.contains(&key.as_str()) {
                            continue;
                        }
                        if map.get(&key).map_or(true, Value::is_null) {
                            map.insert(key, value);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("SqlStorage: ignoring undecodable token blob: {}", e),
            }
        }

        Ok(TokenRecord::from_value(Value::Object(map))?.in_pool(&self.pool_name))
    }
}

/// Pre-image used to decide whether an upsert can be skipped.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct ExistingRow {
    pub token: String,
    pub pool_name: String,
    pub data_hash: Option<String>,
}

/// A row from the legacy backfill scan.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct LegacyRow {
    pub token: String,
    pub pool_name: String,
    pub data: Option<String>,
}

impl LegacyRow {
    /// Rebuild the typed columns from the blob alone.
    pub fn into_token_row(self, updated_at: i64) -> Result<Option<TokenRow>> {
        let Some(raw) = self.data.filter(|d| !d.is_empty()) else {
            return Ok(None);
        };
        let Value::Object(mut blob) = codec::loads::<Value>(&raw)? else {
            return Ok(None);
        };
        blob.insert("token".into(), Value::String(self.token));
        let record = TokenRecord::from_value(Value::Object(blob))?;
        TokenRow::from_record(&record, &self.pool_name, updated_at).map(Some)
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(super) struct ConfigRow {
    pub section: String,
    pub key_name: String,
    pub value: Option<String>,
}
