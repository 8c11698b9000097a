//! Cache Repository
//!
//! Handles all database operations on cache records.

use relay_core::domain::cache::CacheRecord;
use sqlx::SqlitePool;

/// Find a record by id
pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<CacheRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, CacheRow>(
        r#"
        SELECT id, key, version, complete, used_at
        FROM caches
        WHERE id = ?
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find the record for a key/version pair, complete or not
pub async fn find_by_key_version(
    pool: &SqlitePool,
    key: &str,
    version: &str,
) -> Result<Option<CacheRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, CacheRow>(
        r#"
        SELECT id, key, version, complete, used_at
        FROM caches
        WHERE key = ? AND version = ?
        "#,
    )
    .bind(key)
    .bind(version)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find a complete record matching key and version exactly
pub async fn find_complete(
    pool: &SqlitePool,
    key: &str,
    version: &str,
) -> Result<Option<CacheRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, CacheRow>(
        r#"
        SELECT id, key, version, complete, used_at
        FROM caches
        WHERE key = ? AND version = ? AND complete = 1
        "#,
    )
    .bind(key)
    .bind(version)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Find the newest complete record whose key starts with `prefix`
///
/// Compared with `substr` rather than `LIKE`, which is case-insensitive in
/// SQLite and treats `%`/`_` in keys as wildcards.
pub async fn find_complete_by_prefix(
    pool: &SqlitePool,
    prefix: &str,
    version: &str,
) -> Result<Option<CacheRecord>, sqlx::Error> {
    let row = sqlx::query_as::<_, CacheRow>(
        r#"
        SELECT id, key, version, complete, used_at
        FROM caches
        WHERE substr(key, 1, length(?)) = ? AND version = ? AND complete = 1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(prefix)
    .bind(prefix)
    .bind(version)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|r| r.into()))
}

/// Insert a new incomplete record
///
/// Returns `None` when a record for the pair already exists (a concurrent
/// reservation won the race).
pub async fn insert(
    pool: &SqlitePool,
    key: &str,
    version: &str,
    used_at: i64,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        r#"
        INSERT INTO caches (key, version, complete, used_at)
        VALUES (?, ?, 0, ?)
        ON CONFLICT(key, version) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(key)
    .bind(version)
    .bind(used_at)
    .fetch_optional(pool)
    .await
}

/// Set the completeness flag, refreshing the last-used timestamp
pub async fn update_complete(
    pool: &SqlitePool,
    id: i64,
    complete: bool,
    used_at: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE caches
        SET complete = ?, used_at = ?
        WHERE id = ?
        "#,
    )
    .bind(complete)
    .bind(used_at)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Refresh the last-used timestamp
pub async fn update_used_at(pool: &SqlitePool, id: i64, used_at: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE caches SET used_at = ? WHERE id = ?")
        .bind(used_at)
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Incomplete records not touched since `before`
pub async fn find_idle_incomplete(
    pool: &SqlitePool,
    before: i64,
) -> Result<Vec<CacheRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, CacheRow>(
        r#"
        SELECT id, key, version, complete, used_at
        FROM caches
        WHERE complete = 0 AND used_at < ?
        ORDER BY id ASC
        "#,
    )
    .bind(before)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Records of any completeness not touched since `before`
pub async fn find_unused_since(
    pool: &SqlitePool,
    before: i64,
) -> Result<Vec<CacheRecord>, sqlx::Error> {
    let rows = sqlx::query_as::<_, CacheRow>(
        r#"
        SELECT id, key, version, complete, used_at
        FROM caches
        WHERE used_at < ?
        ORDER BY id ASC
        "#,
    )
    .bind(before)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(|r| r.into()).collect())
}

/// Delete a record by id
pub async fn delete(pool: &SqlitePool, id: i64) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM caches WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct CacheRow {
    id: i64,
    key: String,
    version: String,
    complete: bool,
    used_at: i64,
}

impl From<CacheRow> for CacheRecord {
    fn from(row: CacheRow) -> Self {
        CacheRecord {
            id: row.id,
            key: row.key,
            version: row.version,
            complete: row.complete,
            used_at: row.used_at,
        }
    }
}
