use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config file parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A named lock could not be acquired within the caller's timeout.
    /// Never retried internally; retry policy belongs to the caller.
    #[error("could not acquire lock '{name}' within {timeout:?}")]
    LockTimeout { name: String, timeout: Duration },

    #[error("invalid storage configuration: {0}")]
    Config(String),

    #[error("malformed data: {0}")]
    Malformed(String),
}

impl StorageError {
    pub fn lock_timeout(name: &str, timeout: Duration) -> Self {
        StorageError::LockTimeout {
            name: name.to_string(),
            timeout,
        }
    }

    /// `true` when the failure means "someone else holds the lock" rather
    /// than "the backend is unreachable".
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StorageError::LockTimeout { .. })
    }
}
