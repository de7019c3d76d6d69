//! Chat-message accessors: `InsertChat` and the reconciliation `RebindChat`
//! bulk rebind.

use chrono::{DateTime, Utc};

use super::types::NewChatMessage;
use super::Db;
use crate::error::DbError;

impl Db {
    /// Inserts a single chat message, indexed by `(vod_id, absolute_timestamp)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn insert_chat(&self, msg: &NewChatMessage) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO chat_messages (
                vod_id, username, text, badges, emotes, color,
                reply_to_id, reply_to_username, reply_to_text,
                absolute_timestamp, relative_timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&msg.vod_id)
        .bind(&msg.username)
        .bind(&msg.text)
        .bind(&msg.badges)
        .bind(&msg.emotes)
        .bind(&msg.color)
        .bind(&msg.reply_to_id)
        .bind(&msg.reply_to_username)
        .bind(&msg.reply_to_text)
        .bind(msg.absolute_timestamp)
        .bind(msg.relative_timestamp)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Rebinds every chat row recorded under `placeholder_id` to `real_id`,
    /// shifting `relative_timestamp` by `shift_seconds` and clamping any
    /// result below zero up to zero. A single statement, so readers never
    /// observe a half-rebound state.
    ///
    /// Idempotent: once no row has `vod_id = placeholder_id`, re-running
    /// this is a no-op (affects zero rows).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn rebind_chat(
        &self,
        placeholder_id: &str,
        real_id: &str,
        shift_seconds: f64,
    ) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            UPDATE chat_messages
            SET vod_id = $2,
                relative_timestamp = GREATEST(relative_timestamp + $3, 0)
            WHERE vod_id = $1
            "#,
        )
        .bind(placeholder_id)
        .bind(real_id)
        .bind(shift_seconds)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Counts rows still bound to `placeholder_id`, used to detect whether
    /// a shift would clamp any timestamp to zero (for logging).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn count_chat_for_vod(&self, vod_id: &str) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE vod_id = $1")
            .bind(vod_id)
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    /// Lists chat rows for a VOD ordered by `(vod_id, absolute_timestamp)`,
    /// mostly useful to tests verifying the reconciliation round-trip.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn list_chat_for_vod(
        &self,
        vod_id: &str,
    ) -> Result<Vec<(DateTime<Utc>, f64)>, DbError> {
        let rows: Vec<(DateTime<Utc>, f64)> = sqlx::query_as(
            "SELECT absolute_timestamp, relative_timestamp FROM chat_messages \
             WHERE vod_id = $1 ORDER BY absolute_timestamp ASC",
        )
        .bind(vod_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
