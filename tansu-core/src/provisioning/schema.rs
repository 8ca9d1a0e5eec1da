//! `__SchemaVersion` table API (spec §3, §4.2).

use chrono::{DateTime, Utc};
use serde_json::Value;

#[cfg(feature = "database")]
use sqlx::PgPool;

use crate::error::{Error, Result};

/// A single row of `__SchemaVersion`: the current version of a database is
/// the row with the maximum `applied_at`.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    pub id: i64,
    pub database_name: String,
    pub version: i64,
    pub applied_at: DateTime<Utc>,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub exists: bool,
    pub matches: bool,
    pub current: Option<i64>,
}

#[cfg(feature = "database")]
pub async fn ensure_schema_version_table(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS __SchemaVersion (
            id BIGSERIAL PRIMARY KEY,
            database_name TEXT NOT NULL,
            version BIGINT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            description TEXT,
            metadata JSONB
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Internal(format!("ensure __SchemaVersion table: {e}")))?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS schema_version_db_applied_idx
         ON __SchemaVersion (database_name, applied_at DESC)",
    )
    .execute(pool)
    .await
    .map_err(|e| Error::Internal(format!("ensure __SchemaVersion index: {e}")))?;

    Ok(())
}

#[cfg(feature = "database")]
pub async fn record_schema_version(
    pool: &PgPool,
    version: i64,
    description: Option<&str>,
    metadata: Option<Value>,
) -> Result<()> {
    let database_name: String = sqlx::query_scalar("SELECT current_database()")
        .fetch_one(pool)
        .await
        .map_err(|e| Error::Internal(format!("resolve current_database: {e}")))?;

    sqlx::query(
        "INSERT INTO __SchemaVersion (database_name, version, description, metadata)
         VALUES ($1, $2, $3, $4)",
    )
    .bind(&database_name)
    .bind(version)
    .bind(description)
    .bind(metadata)
    .execute(pool)
    .await
    .map_err(|e| Error::Internal(format!("record schema version: {e}")))?;

    Ok(())
}

#[cfg(feature = "database")]
pub async fn get_current_version(pool: &PgPool) -> Result<Option<SchemaVersion>> {
    let row = sqlx::query_as::<_, SchemaVersionRow>(
        "SELECT id, database_name, version, applied_at, description, metadata
         FROM __SchemaVersion
         ORDER BY applied_at DESC
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .map_err(|e| Error::Internal(format!("get current schema version: {e}")))?;

    Ok(row.map(Into::into))
}

#[cfg(feature = "database")]
#[derive(sqlx::FromRow)]
struct SchemaVersionRow {
    id: i64,
    database_name: String,
    version: i64,
    applied_at: DateTime<Utc>,
    description: Option<String>,
    metadata: Option<Value>,
}

#[cfg(feature = "database")]
impl From<SchemaVersionRow> for SchemaVersion {
    fn from(r: SchemaVersionRow) -> Self {
        Self {
            id: r.id,
            database_name: r.database_name,
            version: r.version,
            applied_at: r.applied_at,
            description: r.description,
            metadata: r.metadata,
        }
    }
}

/// `(exists, matches, current)` against `expected`.
#[cfg(feature = "database")]
pub async fn validate(pool: &PgPool, expected: i64) -> Result<ValidationResult> {
    match get_current_version(pool).await? {
        Some(v) => Ok(ValidationResult { exists: true, matches: v.version == expected, current: Some(v.version) }),
        None => Ok(ValidationResult { exists: false, matches: false, current: None }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_result_no_rows_means_not_exists() {
        let r = ValidationResult { exists: false, matches: false, current: None };
        assert!(!r.exists);
        assert!(!r.matches);
        assert!(r.current.is_none());
    }

    #[test]
    fn validation_result_version_mismatch() {
        let r = ValidationResult { exists: true, matches: false, current: Some(3) };
        assert!(r.exists);
        assert!(!r.matches);
        assert_eq!(r.current, Some(3));
    }
}
