//! Credential records as persisted by every backend.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::codec;
use crate::errors::Result;

/// Prefix some callers paste in front of the raw credential.
pub const SSO_PREFIX: &str = "sso=";

/// Pool name → members. Pools are the only index: a record outside every
/// pool does not exist.
pub type TokenPools = BTreeMap<String, Vec<TokenRecord>>;

pub fn normalize_token_id(raw: &str) -> &str {
    raw.strip_prefix(SSO_PREFIX).unwrap_or(raw)
}

/// Lifecycle state. The business meaning of each state belongs to the
/// token-pool manager; storage only keeps the plain lowercase value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum TokenStatus {
    #[default]
    Active,
    Cooling,
    Exhausted,
    Expired,
    Disabled,
    Other(String),
}

impl TokenStatus {
    /// Accepts the plain value or the enum-qualified `TokenStatus.active`
    /// form some callers produce.
    pub fn parse(raw: &str) -> Self {
        let owned;
        let value = match raw.strip_prefix("TokenStatus.") {
            Some(rest) => {
                owned = rest.to_lowercase();
                owned.as_str()
            }
            None => raw,
        };
        match value {
            "active" => TokenStatus::Active,
            "cooling" => TokenStatus::Cooling,
            "exhausted" => TokenStatus::Exhausted,
            "expired" => TokenStatus::Expired,
            "disabled" => TokenStatus::Disabled,
            other => TokenStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TokenStatus::Active => "active",
            TokenStatus::Cooling => "cooling",
            TokenStatus::Exhausted => "exhausted",
            TokenStatus::Expired => "expired",
            TokenStatus::Disabled => "disabled",
            TokenStatus::Other(s) => s,
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TokenStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TokenStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| TokenStatus::parse(&s)).unwrap_or_default())
    }
}

/// One credential and its operational metadata.
///
/// `pool_name` is never written inside the record body: the pool map key
/// is authoritative and loaders fill it back in. Attributes this crate
/// does not know about are kept in `extra` so they survive a round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(deserialize_with = "de_token")]
    pub token: String,
    #[serde(default, skip_serializing)]
    pub pool_name: String,
    #[serde(default)]
    pub status: TokenStatus,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub quota: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub created_at: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub last_used_at: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub use_count: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub fail_count: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub last_fail_at: Option<i64>,
    #[serde(default)]
    pub last_fail_reason: Option<String>,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub last_sync_at: Option<i64>,
    #[serde(default, deserialize_with = "de_tags")]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "de_note")]
    pub note: String,
    #[serde(default, deserialize_with = "de_opt_int")]
    pub last_asset_clear_at: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenRecord {
    pub fn new(token: &str) -> Self {
        Self {
            token: normalize_token_id(token.trim()).to_string(),
            pool_name: String::new(),
            status: TokenStatus::Active,
            quota: None,
            created_at: None,
            last_used_at: None,
            use_count: None,
            fail_count: None,
            last_fail_at: None,
            last_fail_reason: None,
            last_sync_at: None,
            tags: Vec::new(),
            note: String::new(),
            last_asset_clear_at: None,
            extra: Map::new(),
        }
    }

    pub fn in_pool(mut self, pool_name: &str) -> Self {
        self.pool_name = pool_name.to_string();
        self
    }

    /// Hash of the canonical serialization. Pool membership is not part of
    /// the hash; callers compare it separately.
    pub fn content_hash(&self) -> Result<String> {
        codec::content_hash(self)
    }

    /// Decode one record from loosely-typed JSON: either a bare token
    /// string or a full object.
    pub fn from_value(value: Value) -> Result<Self> {
        let input: TokenInput = serde_json::from_value(value)?;
        Ok(input.into_record())
    }
}

/// What callers may hand in at the boundary: a bare identifier or a full
/// object with arbitrary extra fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TokenInput {
    Bare(String),
    Full(TokenRecord),
}

impl TokenInput {
    pub fn into_record(self) -> TokenRecord {
        match self {
            TokenInput::Bare(token) => TokenRecord::new(&token),
            TokenInput::Full(record) => record,
        }
    }
}

/// How much of a record a delta entry rewrites on backends that can
/// update columns selectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateKind {
    /// Full record rewrite.
    #[default]
    State,
    /// Counters, timestamps and status only.
    Usage,
}

/// One entry on the delta path. `record.pool_name` names the target pool.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenUpdate {
    pub record: TokenRecord,
    pub kind: UpdateKind,
}

impl TokenUpdate {
    pub fn usage(record: TokenRecord) -> Self {
        Self {
            record,
            kind: UpdateKind::Usage,
        }
    }
}

impl From<TokenRecord> for TokenUpdate {
    fn from(record: TokenRecord) -> Self {
        Self {
            record,
            kind: UpdateKind::State,
        }
    }
}

/// Decode a `{pool: [record | "token"]}` document. A record that fails to
/// decode is skipped with a warning so one corrupt entry cannot hide the
/// rest of the pool.
pub fn pools_from_value(value: Value) -> Result<TokenPools> {
    let Value::Object(map) = value else {
        return Err(crate::errors::StorageError::Malformed(
            "token document must be an object of pools".into(),
        ));
    };

    let mut pools = TokenPools::new();
    for (pool_name, members) in map {
        let Value::Array(items) = members else {
            tracing::warn!(pool = %pool_name, "skipping pool whose members are not a list");
            continue;
        };
        let mut records = Vec::with_capacity(items.len());
        for item in items {
            match TokenRecord::from_value(item) {
                Ok(record) => records.push(record.in_pool(&pool_name)),
                Err(e) => tracing::warn!(pool = %pool_name, "skipping undecodable token record: {}", e),
            }
        }
        pools.insert(pool_name, records);
    }
    Ok(pools)
}

/// Make every record's `pool_name` and `token` agree with the canonical
/// form before it is written.
pub fn normalize_pools(pools: &TokenPools) -> TokenPools {
    pools
        .iter()
        .map(|(pool_name, records)| {
            let records = records
                .iter()
                .filter(|r| !normalize_token_id(&r.token).is_empty())
                .map(|r| {
                    let mut r = r.clone();
                    r.token = normalize_token_id(&r.token).to_string();
                    r.pool_name = pool_name.clone();
                    r
                })
                .collect();
            (pool_name.clone(), records)
        })
        .collect()
}

fn de_token<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(normalize_token_id(raw.trim()).to_string())
}

fn de_note<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// Accepts integers, integral floats and numeric strings; "None"/"" are null.
fn de_opt_int<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<i64>, D::Error> {
    use serde::de::Error;

    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("not an integer: {n}"))),
        Some(Value::String(s)) => {
            let s = s.trim();
            if s.is_empty() || s == "None" || s == "null" {
                return Ok(None);
            }
            s.parse::<i64>()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("not an integer: {s}")))
        }
        Some(other) => Err(D::Error::custom(format!("not an integer: {other}"))),
    }
}

fn de_tags<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    Ok(parse_tags(Option::<Value>::deserialize(deserializer)?.unwrap_or(Value::Null)))
}

/// Tags arrive as a list, a JSON-encoded list, or a single bare label.
/// Anything else decodes to an empty list.
pub fn parse_tags(value: Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::Array(items)) => parse_tags(Value::Array(items)),
            Ok(_) => vec![s],
            Err(_) if s.trim_start().starts_with('[') => Vec::new(),
            Err(_) => vec![s],
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sso_prefix_is_stripped_on_decode() {
        let r = TokenRecord::from_value(json!({"token": "sso=abc", "status": "active", "quota": 5})).unwrap();
        assert_eq!(r.token, "abc");
        assert_eq!(r.status, TokenStatus::Active);
        assert_eq!(r.quota, Some(5));
    }

    #[test]
    fn test_bare_string_becomes_minimal_record() {
        let r = TokenRecord::from_value(json!("sso=xyz")).unwrap();
        assert_eq!(r.token, "xyz");
        assert_eq!(r.status, TokenStatus::Active);
        assert!(r.tags.is_empty());
        assert_eq!(r.note, "");
    }

    #[test]
    fn test_qualified_status_is_reduced() {
        assert_eq!(TokenStatus::parse("TokenStatus.COOLING"), TokenStatus::Cooling);
        assert_eq!(TokenStatus::parse("expired"), TokenStatus::Expired);
        assert_eq!(TokenStatus::parse("weird").as_str(), "weird");
        let v = serde_json::to_value(TokenStatus::parse("TokenStatus.active")).unwrap();
        assert_eq!(v, json!("active"));
    }

    #[test]
    fn test_unknown_fields_survive_in_extra() {
        let r = TokenRecord::from_value(json!({"token": "a", "plan": "pro", "weight": 3})).unwrap();
        assert_eq!(r.extra.get("plan"), Some(&json!("pro")));

        let back = serde_json::to_value(&r).unwrap();
        assert_eq!(back["plan"], json!("pro"));
        assert_eq!(back["weight"], json!(3));
        assert!(back.get("pool_name").is_none());
    }

    #[test]
    fn test_loose_integers() {
        let r = TokenRecord::from_value(json!({
            "token": "a", "quota": "12", "use_count": 3.0, "fail_count": "None", "note": null
        }))
        .unwrap();
        assert_eq!(r.quota, Some(12));
        assert_eq!(r.use_count, Some(3));
        assert_eq!(r.fail_count, None);
        assert_eq!(r.note, "");
    }

    #[test]
    fn test_tag_normalisation() {
        assert_eq!(parse_tags(json!(["nsfw", "x"])), vec!["nsfw", "x"]);
        assert_eq!(parse_tags(json!("[\"nsfw\"]")), vec!["nsfw"]);
        assert_eq!(parse_tags(json!("nsfw")), vec!["nsfw"]);
        assert!(parse_tags(json!("[broken")).is_empty());
        assert!(parse_tags(Value::Null).is_empty());
    }

    #[test]
    fn test_content_hash_ignores_pool_membership() {
        let a = TokenRecord::new("abc").in_pool("pool_a");
        let b = TokenRecord::new("abc").in_pool("pool_b");
        assert_eq!(a.content_hash().unwrap(), b.content_hash().unwrap());

        let mut c = a.clone();
        c.use_count = Some(1);
        assert_ne!(a.content_hash().unwrap(), c.content_hash().unwrap());
    }

    #[test]
    fn test_pools_from_value_skips_corrupt_entries() {
        let pools = pools_from_value(json!({
            "pool_a": [{"token": "a"}, {"token": 42}, "b"],
            "pool_b": []
        }))
        .unwrap();
        let a = &pools["pool_a"];
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(|r| r.pool_name == "pool_a"));
        assert!(pools["pool_b"].is_empty());
    }
}
