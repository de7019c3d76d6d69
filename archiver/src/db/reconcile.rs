//! The single code path that mutates a placeholder VOD's identity and its
//! chat rows' `vod_id` — reconciliation is the only writer of either.

use chrono::{DateTime, Utc};

use super::Db;
use crate::error::DbError;

impl Db {
    /// Runs the three-step reconciliation procedure in one transaction:
    /// upsert the real VOD row, rebind every chat row from `placeholder_id`
    /// to `real_upstream_id` with the given timestamp shift (clamped at
    /// zero), then delete the placeholder row. Idempotent: if the
    /// placeholder is already gone, the rebind and delete both affect zero
    /// rows and this returns `Ok(0)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection or serialization
    /// failure; the whole procedure rolls back together.
    pub async fn reconcile_placeholder(
        &self,
        channel: &str,
        placeholder_id: &str,
        real_upstream_id: &str,
        real_title: &str,
        real_duration_seconds: i64,
        real_stream_start_time: DateTime<Utc>,
        shift_seconds: f64,
    ) -> Result<u64, DbError> {
        let mut tx = self.pool().begin().await.map_err(DbError::from)?;

        sqlx::query(
            r#"
            INSERT INTO vods (channel, upstream_vod_id, title, stream_start_time, duration_seconds)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (channel, upstream_vod_id) DO UPDATE SET
                title             = $3,
                duration_seconds  = $5,
                updated_at        = now()
            "#,
        )
        .bind(channel)
        .bind(real_upstream_id)
        .bind(real_title)
        .bind(real_stream_start_time)
        .bind(real_duration_seconds)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?;

        let rebound = sqlx::query(
            r#"
            UPDATE chat_messages
            SET vod_id = $2,
                relative_timestamp = GREATEST(relative_timestamp + $3, 0)
            WHERE vod_id = $1
            "#,
        )
        .bind(placeholder_id)
        .bind(real_upstream_id)
        .bind(shift_seconds)
        .execute(&mut *tx)
        .await
        .map_err(DbError::from)?
        .rows_affected();

        sqlx::query("DELETE FROM vods WHERE channel = $1 AND upstream_vod_id = $2")
            .bind(channel)
            .bind(placeholder_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::from)?;

        tx.commit().await.map_err(DbError::from)?;
        Ok(rebound)
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end in `tests/reconciliation.rs` against a live
    // database gated on `DATABASE_URL`, since the behavior under test spans
    // both `vods` and `chat_messages` inside one transaction.
}
