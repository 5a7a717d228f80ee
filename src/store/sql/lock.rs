//! Database-side named locks. Both dialects tie the lock to one database
//! session, so the acquiring connection is held out of the pool until
//! release. If that session dies the database frees the lock.

use std::time::Duration;

use async_trait::async_trait;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{Connection, MySql, Postgres};
use tokio::time::Instant;

use super::SqlPool;
use crate::errors::{Result, StorageError};
use crate::store::LockRelease;

const PG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `GET_LOCK` name: `g2a:` plus the first 24 hex chars of SHA-1. Other
/// processes already on the database take the same names.
pub fn mysql_lock_name(name: &str) -> String {
    let digest = hex::encode(Sha1::digest(name.as_bytes()));
    format!("g2a:{}", &digest[..24])
}

/// Advisory lock key: first 8 bytes of SHA-256, big-endian, signed.
pub fn pg_lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head)
}

/// `GET_LOCK` takes whole seconds.
fn whole_seconds(timeout: Duration) -> i64 {
    let secs = timeout.as_secs() as i64;
    if timeout.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

pub(super) async fn acquire(pool: &SqlPool, name: &str, timeout: Duration) -> Result<Box<dyn LockRelease>> {
    match pool {
        SqlPool::MySql(pool) => {
            let lock_name = mysql_lock_name(name);
            let mut conn = pool.acquire().await?;
            let got: Option<i64> = sqlx::query_scalar("SELECT GET_LOCK(?, ?)")
                .bind(&lock_name)
                .bind(whole_seconds(timeout))
                .fetch_one(&mut *conn)
                .await?;
            if got != Some(1) {
                return Err(StorageError::lock_timeout(name, timeout));
            }
            Ok(Box::new(MySqlRelease { conn, lock_name }))
        }
        SqlPool::Postgres(pool) => {
            let key = pg_lock_key(name);
            let deadline = Instant::now() + timeout;
            let mut conn = pool.acquire().await?;
            loop {
                let got: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await?;
                if got {
                    return Ok(Box::new(PgRelease { conn, key }));
                }
                let now = Instant::now();
                if now >= deadline {
                    return Err(StorageError::lock_timeout(name, timeout));
                }
                tokio::time::sleep(PG_POLL_INTERVAL.min(deadline - now)).await;
            }
        }
    }
}

struct MySqlRelease {
    conn: PoolConnection<MySql>,
    lock_name: String,
}

#[async_trait]
impl LockRelease for MySqlRelease {
    async fn release(self: Box<Self>) {
        let MySqlRelease { mut conn, lock_name } = *self;
        let released = sqlx::query("SELECT RELEASE_LOCK(?)")
            .bind(&lock_name)
            .execute(&mut *conn)
            .await;
        if let Err(e) = released {
            tracing::debug!(lock = %lock_name, "SqlStorage: lock release failed: {}", e);
            // Closing the session frees whatever it still holds.
            let _ = conn.detach().close().await;
        }
    }
}

struct PgRelease {
    conn: PoolConnection<Postgres>,
    key: i64,
}

#[async_trait]
impl LockRelease for PgRelease {
    async fn release(self: Box<Self>) {
        let PgRelease { mut conn, key } = *self;
        let released = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await;
        if let Err(e) = released {
            tracing::debug!(key, "SqlStorage: lock release failed: {}", e);
            let _ = conn.detach().close().await;
        }
    }
}
