//! Generic key/value accessors for small pieces of process state that
//! belong to no larger entity: the backfill cursor, the circuit-breaker
//! triple, and the EMA telemetry fields.
//!
//! Per-key locking is not required: each key is owned by exactly one
//! component.

use super::Db;
use crate::error::DbError;

impl Db {
    /// Reads a raw KV value.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if the key is unset.
    pub async fn kv_get(&self, key: &str) -> Result<String, DbError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM kv WHERE key = $1")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        value.ok_or(DbError::NotFound)
    }

    /// Reads a raw KV value, returning `None` instead of
    /// [`DbError::NotFound`] when unset — convenient for optional telemetry
    /// fields that are absent until first observation.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn kv_get_opt(&self, key: &str) -> Result<Option<String>, DbError> {
        match self.kv_get(key).await {
            Ok(v) => Ok(Some(v)),
            Err(DbError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes a raw KV value, creating the key if absent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn kv_set(&self, key: &str, value: &str) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = $2",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Deletes a KV key. A no-op (not an error) if it was already absent.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn kv_delete(&self, key: &str) -> Result<(), DbError> {
        sqlx::query("DELETE FROM kv WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
