//! Table creation and in-place migration. Every step is idempotent; it
//! runs once per process before the first read or write. Only failing to
//! create the tables is fatal: column and backfill problems are logged.

use super::rows::{LegacyRow, TokenRow};
use super::{now_millis, SqlPool, SqlStorage};
use crate::errors::Result;
use crate::models::token::UpdateKind;

const CREATE_TOKENS: &str = "CREATE TABLE IF NOT EXISTS tokens (
    token VARCHAR(512) PRIMARY KEY,
    pool_name VARCHAR(64) NOT NULL,
    status VARCHAR(16),
    quota INT,
    created_at BIGINT,
    last_used_at BIGINT,
    use_count INT,
    fail_count INT,
    last_fail_at BIGINT,
    last_fail_reason TEXT,
    last_sync_at BIGINT,
    tags TEXT,
    note TEXT,
    last_asset_clear_at BIGINT,
    data TEXT,
    data_hash CHAR(64),
    updated_at BIGINT
)";

const CREATE_APP_CONFIG: &str = "CREATE TABLE IF NOT EXISTS app_config (
    section VARCHAR(64) NOT NULL,
    key_name VARCHAR(64) NOT NULL,
    value TEXT,
    PRIMARY KEY (section, key_name)
)";

/// Columns added after the first release. Tables created by older
/// versions gain them on startup.
pub const MIGRATED_COLUMNS: &[(&str, &str)] = &[
    ("status", "VARCHAR(16)"),
    ("quota", "INT"),
    ("created_at", "BIGINT"),
    ("last_used_at", "BIGINT"),
    ("use_count", "INT"),
    ("fail_count", "INT"),
    ("last_fail_at", "BIGINT"),
    ("last_fail_reason", "TEXT"),
    ("last_sync_at", "BIGINT"),
    ("tags", "TEXT"),
    ("note", "TEXT"),
    ("last_asset_clear_at", "BIGINT"),
    ("data", "TEXT"),
    ("data_hash", "CHAR(64)"),
    ("updated_at", "BIGINT"),
];

/// Rows written before the typed columns existed. Every current write
/// sets `status` and `data_hash`; `quota` and `created_at` may be NULL on
/// healthy rows and must not select them.
const LEGACY_ROWS: &str = "SELECT token, pool_name, data FROM tokens \
     WHERE data IS NOT NULL AND (status IS NULL OR data_hash IS NULL)";

pub(super) async fn prepare(storage: &SqlStorage) -> Result<()> {
    create_tables(&storage.pool).await?;
    backfill_legacy_rows(storage).await;
    tracing::info!(dialect = ?storage.dialect(), "SqlStorage: schema ready");
    Ok(())
}

async fn create_tables(pool: &SqlPool) -> Result<()> {
    match pool {
        SqlPool::Postgres(pool) => {
            sqlx::query(CREATE_TOKENS).execute(pool).await?;
            sqlx::query(CREATE_APP_CONFIG).execute(pool).await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_tokens_pool ON tokens (pool_name)")
                .execute(pool)
                .await?;
            for (column, ty) in MIGRATED_COLUMNS {
                let sql = format!("ALTER TABLE tokens ADD COLUMN IF NOT EXISTS {column} {ty}");
                if let Err(e) = sqlx::query(&sql).execute(pool).await {
                    tracing::warn!(column, "SqlStorage: failed to add column: {}", e);
                }
            }
            for sql in [
                "ALTER TABLE tokens ALTER COLUMN token TYPE VARCHAR(512)",
                "ALTER TABLE tokens ALTER COLUMN data TYPE TEXT",
            ] {
                if let Err(e) = sqlx::query(sql).execute(pool).await {
                    tracing::debug!("SqlStorage: column widening skipped: {}", e);
                }
            }
        }
        SqlPool::MySql(pool) => {
            sqlx::query(CREATE_TOKENS).execute(pool).await?;
            sqlx::query(CREATE_APP_CONFIG).execute(pool).await?;
            // No IF NOT EXISTS for indexes here; a duplicate-name error is expected.
            if let Err(e) = sqlx::query("CREATE INDEX idx_tokens_pool ON tokens (pool_name)")
                .execute(pool)
                .await
            {
                tracing::debug!("SqlStorage: index creation skipped: {}", e);
            }
            for (column, ty) in MIGRATED_COLUMNS {
                let sql = format!("ALTER TABLE tokens ADD COLUMN {column} {ty}");
                match sqlx::query(&sql).execute(pool).await {
                    Ok(_) => tracing::info!(column, "SqlStorage: added missing column"),
                    Err(e) if is_duplicate_column(&e) => {}
                    Err(e) => tracing::warn!(column, "SqlStorage: failed to add column: {}", e),
                }
            }
            for sql in [
                "ALTER TABLE tokens MODIFY token VARCHAR(512)",
                "ALTER TABLE tokens MODIFY data TEXT",
            ] {
                if let Err(e) = sqlx::query(sql).execute(pool).await {
                    tracing::debug!("SqlStorage: column widening skipped: {}", e);
                }
            }
        }
    }
    Ok(())
}

fn is_duplicate_column(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("42S21") || db.message().contains("Duplicate column")
        }
        _ => false,
    }
}

/// Rows written when only the blob existed get their typed columns
/// rebuilt from it. Failures are logged; the blob overlay on load keeps
/// such rows readable either way.
async fn backfill_legacy_rows(storage: &SqlStorage) {
    let legacy: Result<Vec<LegacyRow>> = match &storage.pool {
        SqlPool::Postgres(pool) => sqlx::query_as::<_, LegacyRow>(LEGACY_ROWS).fetch_all(pool).await,
        SqlPool::MySql(pool) => sqlx::query_as::<_, LegacyRow>(LEGACY_ROWS).fetch_all(pool).await,
    }
    .map_err(Into::into);

    let legacy = match legacy {
        Ok(rows) if rows.is_empty() => return,
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("SqlStorage: legacy row scan failed: {}", e);
            return;
        }
    };

    let now = now_millis();
    let mut rows: Vec<(TokenRow, UpdateKind)> = Vec::with_capacity(legacy.len());
    for row in legacy {
        match row.into_token_row(now) {
            Ok(Some(row)) => rows.push((row, UpdateKind::State)),
            Ok(None) => {}
            Err(e) => tracing::warn!("SqlStorage: skipping legacy row: {}", e),
        }
    }
    if rows.is_empty() {
        return;
    }

    let count = rows.len();
    match storage.upsert_rows(rows).await {
        Ok(()) => tracing::info!(rows = count, "SqlStorage: backfilled legacy token rows"),
        Err(e) => tracing::warn!("SqlStorage: legacy backfill failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sql::rows::TOKEN_COLUMNS;

    #[test]
    fn test_every_migrated_column_is_written() {
        for (column, _) in MIGRATED_COLUMNS {
            assert!(TOKEN_COLUMNS.contains(column), "{column} is never bound");
        }
        assert_eq!(MIGRATED_COLUMNS.len() + 2, TOKEN_COLUMNS.len());
    }

    #[test]
    fn test_backfill_only_selects_rows_without_typed_state() {
        assert!(LEGACY_ROWS.contains("status IS NULL"));
        assert!(LEGACY_ROWS.contains("data_hash IS NULL"));
        for nullable in ["quota", "created_at", "use_count"] {
            assert!(!LEGACY_ROWS.contains(nullable), "{nullable} selects healthy rows");
        }
    }

    #[test]
    fn test_create_statement_declares_every_column() {
        for column in TOKEN_COLUMNS {
            assert!(CREATE_TOKENS.contains(&format!("    {column} ")), "{column} missing");
        }
    }
}
