//! Retention: periodically frees local disk space for VODs already safe to
//! remove, without ever touching their database row beyond clearing the
//! `downloaded_path` pointer.

use std::collections::HashSet;

use archiver_log::log;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::db::types::Vod;
use crate::db::Db;
use crate::ids::VodRowId;

/// Retention policy configuration for one channel.
#[derive(Clone, Debug)]
pub struct RetentionConfig {
    pub channel: String,
    pub interval: std::time::Duration,
    pub keep_days: Option<i64>,
    pub keep_count: Option<u32>,
    pub dry_run: bool,
}

#[derive(Default)]
struct Summary {
    cleaned: u32,
    skipped: u32,
    errors: u32,
    bytes_freed: i64,
}

/// Runs the retention worker on a ticker until `shutdown` fires.
pub async fn run(db: Db, config: RetentionConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                log::info!("retention worker for {} shutting down", config.channel);
                return;
            }
            _ = ticker.tick() => {
                run_once(&db, &config).await;
            }
        }
    }
}

async fn run_once(db: &Db, config: &RetentionConfig) {
    match sweep(db, config).await {
        Ok(summary) => {
            log::info!(
                "retention sweep for {}: cleaned={} skipped={} errors={} bytes_freed={}{}",
                config.channel, summary.cleaned, summary.skipped, summary.errors,
                summary.bytes_freed,
                if config.dry_run { " (dry-run)" } else { "" },
            );
        }
        Err(e) => {
            log::error!("retention sweep failed for {}: {}", config.channel, e);
        }
    }
}

async fn sweep(db: &Db, config: &RetentionConfig) -> anyhow::Result<Summary> {
    let mut summary = Summary::default();

    if config.keep_days.is_none() && config.keep_count.is_none() {
        return Ok(summary);
    }

    let vods = db.list_downloaded_vods(&config.channel).await?;
    let keep_set = compute_keep_set(&vods, config);

    let protect_floor = Utc::now() - chrono::Duration::hours(1);

    for vod in &vods {
        if keep_set.contains(&vod.id) {
            continue;
        }
        let Some(path) = &vod.downloaded_path else {
            continue;
        };

        if is_actively_processing(vod) || vod.updated_at > protect_floor {
            summary.skipped += 1;
            continue;
        }

        if config.dry_run {
            log::info!("retention (dry-run) would delete {} for {}", path, vod.upstream_vod_id);
            summary.cleaned += 1;
            continue;
        }

        match tokio::fs::metadata(path).await {
            Ok(meta) => summary.bytes_freed += meta.len() as i64,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                log::warn!("retention could not stat {}: {}", path, e);
            }
        }

        let removed = match tokio::fs::remove_file(path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                log::warn!("retention failed to delete {}: {}", path, e);
                summary.errors += 1;
                false
            }
        };

        if removed {
            if let Err(e) = db.clear_downloaded_path(vod.id).await {
                log::error!("clearing downloaded_path for {}: {}", vod.upstream_vod_id, e);
                summary.errors += 1;
            } else {
                summary.cleaned += 1;
            }
        }
    }

    Ok(summary)
}

fn is_actively_processing(vod: &Vod) -> bool {
    use crate::db::types::DownloadState;
    matches!(vod.download_state, DownloadState::Downloading | DownloadState::Processing)
}

/// The union of the keep-by-age and keep-by-count policies. `vods` must
/// already be ordered newest-first (as [`Db::list_downloaded_vods`]
/// returns).
fn compute_keep_set(vods: &[Vod], config: &RetentionConfig) -> HashSet<VodRowId> {
    let mut keep = HashSet::new();

    if let Some(days) = config.keep_days {
        let cutoff: DateTime<Utc> = Utc::now() - chrono::Duration::days(days);
        for vod in vods {
            if vod.stream_start_time >= cutoff {
                keep.insert(vod.id);
            }
        }
    }

    if let Some(count) = config.keep_count {
        for vod in vods.iter().take(count as usize) {
            keep.insert(vod.id);
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::types::DownloadState;

    fn sample(id: i64, days_ago: i64) -> Vod {
        Vod {
            id: VodRowId(id),
            channel: "acme".into(),
            upstream_vod_id: id.to_string(),
            title: "t".into(),
            stream_start_time: Utc::now() - chrono::Duration::days(days_ago),
            duration_seconds: 60,
            downloaded_path: Some(format!("/data/{id}.mp4")),
            download_state: DownloadState::Done,
            retry_count: 0,
            last_error: None,
            downloaded_bytes: 0,
            downloaded_total: None,
            progress_updated_at: None,
            processed: true,
            republish_url: None,
            priority: 0,
            created_at: Utc::now(),
            updated_at: Utc::now() - chrono::Duration::days(days_ago),
        }
    }

    #[test]
    fn keep_set_is_union_of_age_and_count() {
        let vods = vec![sample(1, 1), sample(2, 10), sample(3, 40), sample(4, 100)];
        let config = RetentionConfig {
            channel: "acme".into(),
            interval: std::time::Duration::from_secs(1),
            keep_days: Some(5),
            keep_count: Some(3),
            dry_run: false,
        };
        let keep = compute_keep_set(&vods, &config);
        // keep_days=5 keeps id=1; keep_count=3 keeps the first three
        // (newest-first: 1, 2, 3).
        assert!(keep.contains(&VodRowId(1)));
        assert!(keep.contains(&VodRowId(2)));
        assert!(keep.contains(&VodRowId(3)));
        assert!(!keep.contains(&VodRowId(4)));
    }

    #[test]
    fn no_policy_keeps_nothing_eligible() {
        let config = RetentionConfig {
            channel: "acme".into(),
            interval: std::time::Duration::from_secs(1),
            keep_days: None,
            keep_count: None,
            dry_run: false,
        };
        let vods = vec![sample(1, 1)];
        assert!(compute_keep_set(&vods, &config).is_empty());
    }
}
