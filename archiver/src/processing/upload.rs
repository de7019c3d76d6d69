//! The upload phase: retry wrapper around the optional [`Uploader`]
//! adapter, back-catalog daily quota enforcement, and autoclean.

use std::path::Path;
use std::time::Duration;

use archiver_log::log;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::adapters::Uploader;
use crate::db::types::Vod;
use crate::db::Db;
use crate::error::{classify, DbError, Severity};

/// Outcome of the upload phase for a single VOD.
pub enum UploadOutcome {
    /// Uploaded, or skipped because no uploader is configured — either way
    /// the VOD is done processing.
    Done { republish_url: Option<String> },
    /// Deferred: the daily quota for back-catalog uploads was hit. The VOD
    /// is left in `processing` state and retried on a later cycle.
    QuotaExceeded,
    Fatal { message: String },
    Exhausted { message: String },
}

/// Whether `vod` counts as back-catalog for quota/autoclean purposes.
#[must_use]
pub fn is_back_catalog(vod: &Vod, keep_newer_than_days: i64) -> bool {
    let cutoff = Utc::now() - chrono::Duration::days(keep_newer_than_days);
    vod.stream_start_time < cutoff
}

/// Runs the upload phase for a downloaded VOD.
///
/// `shutdown` is checked before each attempt and raced against the
/// per-attempt backoff sleep, so a shutdown signal interrupts a retry loop
/// instead of running it to exhaustion.
///
/// # Errors
///
/// Returns [`DbError`] if the daily-quota check fails to query the
/// database.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    uploader: Option<&dyn Uploader>,
    db: &Db,
    vod: &Vod,
    local_path: &Path,
    max_attempts: u32,
    backoff_base: Duration,
    daily_limit: u32,
    keep_newer_than_days: i64,
    shutdown: &CancellationToken,
) -> Result<UploadOutcome, DbError> {
    let Some(uploader) = uploader else {
        return Ok(UploadOutcome::Done { republish_url: None });
    };

    if is_back_catalog(vod, keep_newer_than_days) {
        let since: DateTime<Utc> = Utc::now() - chrono::Duration::hours(24);
        let uploaded_today = db.count_uploads_since(since).await?;
        if uploaded_today >= i64::from(daily_limit) {
            log::info!(
                "back-catalog daily upload quota ({daily_limit}) reached, deferring {}",
                vod.upstream_vod_id,
            );
            return Ok(UploadOutcome::QuotaExceeded);
        }
    }

    let mut last_error = String::new();
    for attempt in 0..max_attempts {
        if shutdown.is_cancelled() {
            return Ok(UploadOutcome::Exhausted {
                message: "shutdown requested".into(),
            });
        }

        match uploader.upload(local_path, &vod.title, vod.stream_start_time).await {
            Ok(url) => {
                return Ok(UploadOutcome::Done { republish_url: Some(url) });
            }
            Err(message) => {
                let severity = classify(&message);
                last_error = message;
                if severity == Severity::Fatal {
                    return Ok(UploadOutcome::Fatal { message: last_error });
                }
                if attempt + 1 >= max_attempts {
                    break;
                }
                let jitter_max = (backoff_base.as_millis() as u64).max(1);
                let wait = backoff_base * 2_u32.saturating_pow(attempt)
                    + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_max));
                log::warn!(
                    "upload attempt {} for {} failed ({}, {}): retrying in {:?}",
                    attempt + 1, vod.upstream_vod_id, severity, last_error, wait,
                );
                tokio::select! {
                    () = shutdown.cancelled() => {
                        return Ok(UploadOutcome::Exhausted { message: last_error });
                    }
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    Ok(UploadOutcome::Exhausted { message: last_error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::{DownloadState, Vod};
    use crate::ids::VodRowId;

    fn sample_vod(stream_start_time: DateTime<Utc>) -> Vod {
        Vod {
            id: VodRowId(1),
            channel: "acme".into(),
            upstream_vod_id: "123".into(),
            title: "test".into(),
            stream_start_time,
            duration_seconds: 60,
            download_state: DownloadState::Processing,
            downloaded_bytes: 0,
            downloaded_total: None,
            downloaded_path: None,
            republish_url: None,
            processed: false,
            priority: 0,
            last_error: None,
            retry_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            progress_updated_at: None,
        }
    }

    #[test]
    fn recent_vod_is_not_back_catalog() {
        let v = sample_vod(Utc::now());
        assert!(!is_back_catalog(&v, 7));
    }

    #[test]
    fn old_vod_is_back_catalog() {
        let v = sample_vod(Utc::now() - chrono::Duration::days(30));
        assert!(is_back_catalog(&v, 7));
    }
}
