//! VOD accessors: `Upsert`, `NextProcessable`, `ClaimForDownload`, progress
//! coalescing, and outcome recording.

use chrono::{DateTime, Utc};

use super::types::{DownloadState, Vod, VodUpsert};
use super::Db;
use crate::error::DbError;
use crate::ids::VodRowId;

impl Db {
    /// Inserts a VOD row, or updates an existing one keyed on
    /// `(channel, upstream_vod_id)`, leaving any `None` field in `upsert`
    /// untouched on the existing row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection or serialization
    /// failure.
    pub async fn upsert_vod(&self, upsert: &VodUpsert) -> Result<Vod, DbError> {
        let row = sqlx::query_as::<_, Vod>(
            r#"
            INSERT INTO vods (channel, upstream_vod_id, title, stream_start_time, duration_seconds)
            VALUES ($1, $2, COALESCE($3, ''), COALESCE($4, now()), COALESCE($5, 0))
            ON CONFLICT (channel, upstream_vod_id) DO UPDATE SET
                title             = COALESCE($3, vods.title),
                stream_start_time = COALESCE($4, vods.stream_start_time),
                duration_seconds  = COALESCE($5, vods.duration_seconds),
                updated_at        = now()
            RETURNING *
            "#,
        )
        .bind(&upsert.channel)
        .bind(&upsert.upstream_vod_id)
        .bind(&upsert.title)
        .bind(upsert.stream_start_time)
        .bind(upsert.duration_seconds)
        .fetch_one(self.pool())
        .await?;
        Ok(row)
    }

    /// Same as [`Db::upsert_vod`], but a no-op (`DO NOTHING`) on conflict —
    /// used by catalog backfill, which must never clobber processing state
    /// written by the pipeline in the meantime.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection or serialization
    /// failure. Returns [`DbError::Conflict`] if the row already existed
    /// (nothing was inserted).
    pub async fn insert_vod_if_absent(&self, upsert: &VodUpsert) -> Result<Vod, DbError> {
        let row = sqlx::query_as::<_, Vod>(
            r#"
            INSERT INTO vods (channel, upstream_vod_id, title, stream_start_time, duration_seconds)
            VALUES ($1, $2, COALESCE($3, ''), COALESCE($4, now()), COALESCE($5, 0))
            ON CONFLICT (channel, upstream_vod_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(&upsert.channel)
        .bind(&upsert.upstream_vod_id)
        .bind(&upsert.title)
        .bind(upsert.stream_start_time)
        .bind(upsert.duration_seconds)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or(DbError::Conflict)
    }

    /// Returns the highest-priority unprocessed VOD for `channel` whose last
    /// failure (if any) is older than `retry_cooldown`, or `None` if the
    /// queue is empty.
    ///
    /// Tie-break order: `priority DESC, stream_start_time ASC, id ASC` — the
    /// row-id tie-break guarantees deterministic ordering for tests.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection or serialization
    /// failure.
    pub async fn next_processable(
        &self,
        channel: &str,
        retry_cooldown: chrono::Duration,
    ) -> Result<Option<Vod>, DbError> {
        self.next_processable_excluding(channel, retry_cooldown, &[]).await
    }

    /// Same as [`Db::next_processable`], but skips any row whose id appears
    /// in `excluded` — used by the scheduling loop to fall through to the
    /// next candidate within a single cycle after a claim conflict, instead
    /// of repeatedly proposing the same top-priority row.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection or serialization
    /// failure.
    pub async fn next_processable_excluding(
        &self,
        channel: &str,
        retry_cooldown: chrono::Duration,
        excluded: &[i64],
    ) -> Result<Option<Vod>, DbError> {
        let cooldown_floor = Utc::now() - retry_cooldown;
        let row = sqlx::query_as::<_, Vod>(
            r#"
            SELECT * FROM vods
            WHERE channel = $1
              AND NOT processed
              AND (last_error IS NULL OR updated_at < $2)
              AND NOT (id = ANY($3))
            ORDER BY priority DESC, stream_start_time ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(channel)
        .bind(cooldown_floor)
        .bind(excluded)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Atomically transitions `download_state` from `idle`/`error` to
    /// `downloading`. Fails with [`DbError::Conflict`] if another worker
    /// already claimed the row (or it is not in a claimable state).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Conflict`] if the row could not be claimed, or
    /// [`DbError::Transient`] on connection failure.
    pub async fn claim_for_download(&self, id: VodRowId) -> Result<Vod, DbError> {
        let row = sqlx::query_as::<_, Vod>(
            r#"
            UPDATE vods
            SET download_state = 'downloading', updated_at = now()
            WHERE id = $1 AND download_state IN ('idle', 'error')
            RETURNING *
            "#,
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or(DbError::Conflict)
    }

    /// Resets VODs stuck in `downloading`/`processing` for longer than
    /// `stale_after` back to `error`, so [`Db::claim_for_download`] can pick
    /// them up again. A row only lands in one of those two states while a
    /// worker holds it; if that worker crashed without recording an outcome,
    /// nothing else ever moves it, and it would otherwise block the channel's
    /// queue forever since it's still the top-priority unprocessed row.
    ///
    /// Matches on `updated_at` rather than `progress_updated_at`, since an
    /// upload in progress doesn't touch the latter at all.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn reclaim_stale_leases(
        &self,
        channel: &str,
        stale_after: chrono::Duration,
    ) -> Result<u64, DbError> {
        let stale_floor = Utc::now() - stale_after;
        let result = sqlx::query(
            r#"
            UPDATE vods
            SET download_state = 'error',
                last_error = 'reclaimed: stale lease past timeout',
                updated_at = now()
            WHERE channel = $1
              AND download_state IN ('downloading', 'processing')
              AND updated_at < $2
            "#,
        )
        .bind(channel)
        .bind(stale_floor)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    /// Persists in-progress download counters. Callers are expected to
    /// coalesce calls themselves (e.g. at most once per second) — this
    /// accessor does not rate-limit.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn update_progress(
        &self,
        id: VodRowId,
        downloaded_bytes: i64,
        downloaded_total: Option<i64>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE vods
            SET downloaded_bytes = $2, downloaded_total = $3, progress_updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(downloaded_bytes)
        .bind(downloaded_total)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Marks the VOD's download as complete, setting `downloaded_path` and
    /// moving to the `processing` state so the upload phase can run.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn record_download_success(
        &self,
        id: VodRowId,
        downloaded_path: &str,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE vods
            SET download_state = 'processing', downloaded_path = $2,
                last_error = NULL, retry_count = 0, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(downloaded_path)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Marks final processing success: sets `processed = true` and, if the
    /// VOD was uploaded, its `republish_url`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn record_success(
        &self,
        id: VodRowId,
        republish_url: Option<&str>,
    ) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE vods
            SET processed = true, download_state = 'done', republish_url = $2,
                last_error = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(republish_url)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Records a failure: sets `download_state = error`, stores the error
    /// text, and increments `retry_count`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn record_failure(&self, id: VodRowId, error_text: &str) -> Result<(), DbError> {
        sqlx::query(
            r#"
            UPDATE vods
            SET download_state = 'error', last_error = $2,
                retry_count = retry_count + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(error_text)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Sets a VOD's scheduling priority. User-driven only — the engine
    /// itself never calls this on its own initiative.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no such row exists, or
    /// [`DbError::Transient`] on connection failure.
    pub async fn set_priority(&self, id: VodRowId, priority: i32) -> Result<(), DbError> {
        let result = sqlx::query("UPDATE vods SET priority = $2, updated_at = now() WHERE id = $1")
            .bind(id.0)
            .bind(priority)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Fetches a VOD by its internal row id.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no such row exists.
    pub async fn get_vod(&self, id: VodRowId) -> Result<Vod, DbError> {
        let row = sqlx::query_as::<_, Vod>("SELECT * FROM vods WHERE id = $1")
            .bind(id.0)
            .fetch_optional(self.pool())
            .await?;
        row.ok_or(DbError::NotFound)
    }

    /// Fetches a VOD by `(channel, upstream_vod_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::NotFound`] if no such row exists.
    pub async fn get_vod_by_upstream_id(
        &self,
        channel: &str,
        upstream_vod_id: &str,
    ) -> Result<Vod, DbError> {
        let row = sqlx::query_as::<_, Vod>(
            "SELECT * FROM vods WHERE channel = $1 AND upstream_vod_id = $2",
        )
        .bind(channel)
        .bind(upstream_vod_id)
        .fetch_optional(self.pool())
        .await?;
        row.ok_or(DbError::NotFound)
    }

    /// Finds a leftover placeholder row for `channel`, if any. Used on
    /// startup to detect that the auto-orchestrator crashed mid-stream: a
    /// live session with no live process behind it. At most one is
    /// expected: a placeholder is never left pending while a new live
    /// session starts.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn find_placeholder_vod(&self, channel: &str) -> Result<Option<Vod>, DbError> {
        let row = sqlx::query_as::<_, Vod>(
            "SELECT * FROM vods WHERE channel = $1 AND upstream_vod_id LIKE 'live-%' LIMIT 1",
        )
        .bind(channel)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// Lists VODs eligible for retention consideration: those with a
    /// `downloaded_path` set, ordered newest-first, which is the order the
    /// `KEEP_COUNT` policy needs.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn list_downloaded_vods(&self, channel: &str) -> Result<Vec<Vod>, DbError> {
        let rows = sqlx::query_as::<_, Vod>(
            r#"
            SELECT * FROM vods
            WHERE channel = $1 AND downloaded_path IS NOT NULL
            ORDER BY stream_start_time DESC
            "#,
        )
        .bind(channel)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Clears `downloaded_path` after the retention worker removes the file
    /// from disk. Does not touch `processed` or the DB row otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn clear_downloaded_path(&self, id: VodRowId) -> Result<(), DbError> {
        sqlx::query("UPDATE vods SET downloaded_path = NULL WHERE id = $1")
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Counts uploads recorded (via `republish_url` being set) within the
    /// trailing 24 hours, for enforcing the back-catalog daily upload quota.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn count_uploads_since(&self, since: DateTime<Utc>) -> Result<i64, DbError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM vods WHERE republish_url IS NOT NULL AND updated_at >= $1",
        )
        .bind(since)
        .fetch_one(self.pool())
        .await?;
        Ok(count)
    }

    /// Deletes a placeholder row by its internal id, the final step of
    /// reconciliation.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Transient`] on connection failure.
    pub async fn delete_vod(&self, id: VodRowId) -> Result<(), DbError> {
        sqlx::query("DELETE FROM vods WHERE id = $1")
            .bind(id.0)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn state_label(state: DownloadState) -> &'static str {
    state.as_str()
}
