//! Catalog backfill: on a ticker, paginate the video API and upsert VOD
//! rows, advancing a persistent cursor so the job is interruptible and
//! idempotent.

use std::sync::Arc;

use archiver_log::log;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::db::types::VodUpsert;
use crate::db::Db;
use crate::video_api::{VideoApi, VideoApiError};

const CURSOR_KEY: &str = "backfill_cursor";

/// Wait applied to a `429` with no `Retry-After` hint.
const DEFAULT_RATE_LIMIT_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

/// Upper bound on rate-limit retries for a single page fetch, so a
/// persistently rate-limited API fails the pass instead of looping forever.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Configuration for one channel's backfill loop.
#[derive(Clone, Debug)]
pub struct BackfillConfig {
    pub channel: String,
    pub channel_id: String,
    pub interval: std::time::Duration,
    pub max_count: Option<u32>,
    pub max_age_days: Option<i64>,
}

/// Runs the backfill loop: one immediate pass at startup, then on
/// `config.interval` until cancelled.
pub async fn run(db: Db, video_api: Arc<dyn VideoApi>, config: BackfillConfig, token: CancellationToken) {
    run_once(&db, video_api.as_ref(), &config).await;

    let mut ticker = tokio::time::interval(config.interval);
    ticker.tick().await; // first tick fires immediately; already consumed above.
    loop {
        tokio::select! {
            () = token.cancelled() => {
                log::info!("catalog backfill for {} shutting down", config.channel);
                return;
            }
            _ = ticker.tick() => {
                run_once(&db, video_api.as_ref(), &config).await;
            }
        }
    }
}

async fn run_once(db: &Db, video_api: &dyn VideoApi, config: &BackfillConfig) {
    if let Err(e) = backfill_pass(db, video_api, config).await {
        log::error!("catalog backfill pass failed for {}: {}", config.channel, e);
    }
}

async fn backfill_pass(
    db: &Db,
    video_api: &dyn VideoApi,
    config: &BackfillConfig,
) -> anyhow::Result<()> {
    let mut cursor = db.kv_get_opt(&cursor_key(config)).await?;
    let mut ingested = 0_u32;
    let age_cutoff = config
        .max_age_days
        .map(|days| Utc::now() - chrono::Duration::days(days));

    loop {
        let page = fetch_page_with_rate_limit_retry(video_api, &config.channel_id, cursor.as_deref())
            .await
            .map_err(|e| anyhow::anyhow!("listing videos: {e}"))?;

        for video in &page.items {
            if let Some(cutoff) = age_cutoff {
                if video.stream_start_time < cutoff {
                    log::info!(
                        "catalog backfill for {} stopping at age cutoff ({})",
                        config.channel, video.id,
                    );
                    return Ok(());
                }
            }

            let upsert = VodUpsert {
                channel: config.channel.clone(),
                upstream_vod_id: video.id.clone(),
                title: Some(video.title.clone()),
                stream_start_time: Some(video.stream_start_time),
                duration_seconds: Some(video.duration_seconds),
            };
            match db.insert_vod_if_absent(&upsert).await {
                Ok(_) | Err(crate::error::DbError::Conflict) => {}
                Err(e) => return Err(e.into()),
            }
            ingested += 1;

            if let Some(max) = config.max_count {
                if ingested >= max {
                    log::info!(
                        "catalog backfill for {} reached per-run max ({})",
                        config.channel, max,
                    );
                    return Ok(());
                }
            }
        }

        cursor = page.next_cursor;
        if let Some(c) = &cursor {
            db.kv_set(&cursor_key(config), c).await?;
        } else {
            break;
        }
    }

    Ok(())
}

fn cursor_key(config: &BackfillConfig) -> String {
    format!("{CURSOR_KEY}:{}", config.channel)
}

/// Fetches one page, sleeping and retrying up to [`MAX_RATE_LIMIT_RETRIES`]
/// times on a `429`, honoring its `Retry-After` hint when present.
async fn fetch_page_with_rate_limit_retry(
    video_api: &dyn VideoApi,
    channel_id: &str,
    cursor: Option<&str>,
) -> Result<crate::video_api::VideoPage, VideoApiError> {
    for attempt in 0..=MAX_RATE_LIMIT_RETRIES {
        match video_api.list_videos(channel_id, cursor).await {
            Ok(page) => return Ok(page),
            Err(VideoApiError::RateLimited(hint)) if attempt < MAX_RATE_LIMIT_RETRIES => {
                let wait = hint.unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
                log::warn!("catalog backfill rate limited, retrying in {wait:?}");
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
    unreachable!("loop always returns before exhausting its range")
}
