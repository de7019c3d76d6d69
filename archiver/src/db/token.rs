//! OAuth token accessors, keyed by `(provider, channel)`.

use chrono::{DateTime, Utc};

use super::types::OAuthTokenRow;
use super::Db;
use crate::error::DbError;

impl Db {
    /// Fetches a token row by `(provider, channel)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no such row exists.
    pub async fn get_token(&self, provider: &str, channel: &str) -> Result<OAuthTokenRow, DbError> {
        let row = sqlx::query_as::<_, OAuthTokenRow>(
            "SELECT * FROM oauth_tokens WHERE provider = $1 AND channel = $2",
        )
        .bind(provider)
        .bind(channel)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or(DbError::NotFound)
    }

    /// Inserts or fully replaces a token row. Used both by the initial
    /// out-of-band authorization write and by refresh write-backs.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_token(
        &self,
        provider: &str,
        channel: &str,
        ciphertext: &str,
        refresh_ciphertext: &str,
        expiry: DateTime<Utc>,
        scope: &str,
        encryption_version: i16,
        key_id: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO oauth_tokens (
                provider, channel, ciphertext, refresh_ciphertext,
                expiry, scope, encryption_version, key_id, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            ON CONFLICT (provider, channel) DO UPDATE SET
                ciphertext         = $3,
                refresh_ciphertext = $4,
                expiry             = $5,
                scope              = $6,
                encryption_version = $7,
                key_id             = $8,
                updated_at         = now()
            "#,
        )
        .bind(provider)
        .bind(channel)
        .bind(ciphertext)
        .bind(refresh_ciphertext)
        .bind(expiry)
        .bind(scope)
        .bind(encryption_version)
        .bind(key_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Lists every token row, used by the one-shot key-migration tool.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn list_tokens(&self) -> Result<Vec<OAuthTokenRow>, DbError> {
        let rows = sqlx::query_as::<_, OAuthTokenRow>("SELECT * FROM oauth_tokens")
            .fetch_all(self.pool())
            .await?;
        Ok(rows)
    }
}
