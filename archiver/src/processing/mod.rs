//! The processing pipeline: the per-channel scheduling loop that claims a
//! queued VOD, runs it through the download and upload phases, and feeds
//! outcomes back into the circuit breaker and EMA telemetry.

pub mod breaker;
pub mod download;
pub mod upload;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use archiver_log::log;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapters::{Downloader, Uploader};
use crate::db::Db;
use crate::error::DbError;
use breaker::{Admission, BreakerConfig};
use download::CancelRegistry;

/// Configuration the scheduling loop needs from the CLI options.
#[derive(Clone, Debug)]
pub struct ProcessingConfig {
    pub channel: String,
    pub data_dir: PathBuf,
    pub tick_interval: Duration,
    pub retry_cooldown: chrono::Duration,
    pub stale_lease_timeout: chrono::Duration,
    pub max_concurrent_downloads: usize,
    pub download_max_attempts: u32,
    pub download_backoff_base: Duration,
    pub upload_max_attempts: u32,
    pub upload_backoff_base: Duration,
    pub backfill_upload_daily_limit: u32,
    pub retain_keep_newer_than_days: i64,
    pub backfill_autoclean: bool,
    pub breaker: BreakerConfig,
    pub shutdown_grace_period: Duration,
}

const EMA_ALPHA: f64 = 0.2;

/// Runs the processing pipeline until `shutdown` fires.
pub async fn run(
    db: Db,
    downloader: Arc<dyn Downloader>,
    uploader: Option<Arc<dyn Uploader>>,
    config: ProcessingConfig,
    shutdown: CancellationToken,
) {
    let tickets = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
    let cancel_registry = CancelRegistry::new();
    let mut in_flight: JoinSet<()> = JoinSet::new();

    let mut ticker = tokio::time::interval(config.tick_interval);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                log::info!(
                    "processing pipeline for {} shutting down, waiting up to {:?} for {} in-flight job(s)",
                    config.channel, config.shutdown_grace_period, in_flight.len(),
                );
                let grace = tokio::time::timeout(config.shutdown_grace_period, async {
                    while in_flight.join_next().await.is_some() {}
                });
                if grace.await.is_err() {
                    log::warn!(
                        "processing pipeline for {} hit shutdown grace period with {} job(s) still running",
                        config.channel, in_flight.len(),
                    );
                }
                return;
            }
            _ = ticker.tick() => {
                // Reap finished jobs so `in_flight.len()` stays accurate and
                // panics surface in the log instead of vanishing silently.
                while let Some(result) = in_flight.try_join_next() {
                    if let Err(e) = result {
                        log::error!("processing job for {} panicked: {}", config.channel, e);
                    }
                }
                if let Err(e) = run_cycle(
                    &db,
                    Arc::clone(&downloader),
                    uploader.clone(),
                    &config,
                    &tickets,
                    &cancel_registry,
                    &shutdown,
                    &mut in_flight,
                ).await {
                    log::error!("processing cycle failed for {}: {}", config.channel, e);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_cycle(
    db: &Db,
    downloader: Arc<dyn Downloader>,
    uploader: Option<Arc<dyn Uploader>>,
    config: &ProcessingConfig,
    tickets: &Arc<Semaphore>,
    cancel_registry: &CancelRegistry,
    shutdown: &CancellationToken,
    in_flight: &mut JoinSet<()>,
) -> Result<(), DbError> {
    let admission = breaker::admit(db, &config.channel, config.breaker).await?;
    let probe = match admission {
        Admission::Blocked => return Ok(()),
        Admission::Proceed { probe } => probe,
    };

    if let Ok(reclaimed) = db.reclaim_stale_leases(&config.channel, config.stale_lease_timeout).await {
        if reclaimed > 0 {
            log::warn!(
                "reclaimed {reclaimed} stale lease(s) for {} past the {:?} timeout",
                config.channel, config.stale_lease_timeout,
            );
        }
    }

    let mut excluded = Vec::new();
    loop {
        let Some(vod) = db
            .next_processable_excluding(&config.channel, config.retry_cooldown, &excluded)
            .await?
        else {
            return Ok(());
        };

        let Ok(permit) = Arc::clone(tickets).try_acquire_owned() else {
            // All download tickets busy; try again next tick.
            return Ok(());
        };

        let vod = match db.claim_for_download(vod.id).await {
            Ok(vod) => vod,
            Err(DbError::Conflict) => {
                // Another worker claimed it first; try the next candidate
                // instead of leaving the whole cycle idle.
                drop(permit);
                excluded.push(vod.id.0);
                continue;
            }
            Err(e) => {
                drop(permit);
                return Err(e);
            }
        };

        let db = db.clone();
        let downloader = Arc::clone(&downloader);
        let uploader = uploader.clone();
        let config = config.clone();
        let cancel_registry = cancel_registry.clone();
        let shutdown = shutdown.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            process_one(
                &db,
                downloader.as_ref(),
                uploader.as_deref(),
                &vod,
                &config,
                &cancel_registry,
                &shutdown,
                probe,
            )
            .await;
        });

        return Ok(());
    }
}

#[allow(clippy::too_many_arguments)]
async fn process_one(
    db: &Db,
    downloader: &dyn Downloader,
    uploader: Option<&dyn Uploader>,
    vod: &crate::db::types::Vod,
    config: &ProcessingConfig,
    cancel_registry: &CancelRegistry,
    shutdown: &CancellationToken,
    probe: bool,
) {
    let cycle_started = std::time::Instant::now();

    let local_path = match &vod.downloaded_path {
        Some(existing) => PathBuf::from(existing),
        None => {
            let outcome = download::run(
                downloader,
                db,
                vod,
                &config.data_dir,
                config.download_max_attempts,
                config.download_backoff_base,
                cancel_registry,
                shutdown,
            )
            .await;

            match outcome {
                download::DownloadOutcome::Success { path, elapsed } => {
                    if let Err(e) = db
                        .record_download_success(vod.id, &path.to_string_lossy())
                        .await
                    {
                        log::error!("recording download success for {}: {}", vod.upstream_vod_id, e);
                    }
                    update_ema(db, "avg_download_ms", elapsed.as_millis() as f64).await;
                    path
                }
                download::DownloadOutcome::Fatal { message } => {
                    record_failure(db, vod, &message).await;
                    let _ = breaker::record_outcome(db, &config.channel, config.breaker, probe, false).await;
                    return;
                }
                download::DownloadOutcome::Exhausted { message } => {
                    record_failure(db, vod, &message).await;
                    let _ = breaker::record_outcome(db, &config.channel, config.breaker, probe, false).await;
                    return;
                }
            }
        }
    };

    let upload_started = std::time::Instant::now();
    let upload_result = upload::run(
        uploader,
        db,
        vod,
        &local_path,
        config.upload_max_attempts,
        config.upload_backoff_base,
        config.backfill_upload_daily_limit,
        config.retain_keep_newer_than_days,
        shutdown,
    )
    .await;

    match upload_result {
        Ok(upload::UploadOutcome::Done { republish_url }) => {
            if let Err(e) = db.record_success(vod.id, republish_url.as_deref()).await {
                log::error!("recording success for {}: {}", vod.upstream_vod_id, e);
            }
            update_ema(db, "avg_upload_ms", upload_started.elapsed().as_millis() as f64).await;
            update_ema(db, "avg_total_ms", cycle_started.elapsed().as_millis() as f64).await;

            if republish_url.is_some()
                && config.backfill_autoclean
                && upload::is_back_catalog(vod, config.retain_keep_newer_than_days)
            {
                if let Err(e) = tokio::fs::remove_file(&local_path).await {
                    log::warn!("autoclean failed to remove {}: {}", local_path.display(), e);
                } else if let Err(e) = db.clear_downloaded_path(vod.id).await {
                    log::error!("clearing downloaded_path for {}: {}", vod.upstream_vod_id, e);
                }
            }

            let _ = breaker::record_outcome(db, &config.channel, config.breaker, probe, true).await;
        }
        Ok(upload::UploadOutcome::QuotaExceeded) => {
            // Left in `processing` state; picked up again next cycle. Not a
            // failure, so the breaker is untouched.
        }
        Ok(upload::UploadOutcome::Fatal { message } | upload::UploadOutcome::Exhausted { message }) => {
            record_failure(db, vod, &message).await;
            let _ = breaker::record_outcome(db, &config.channel, config.breaker, probe, false).await;
        }
        Err(e) => {
            log::error!("upload quota check failed for {}: {}", vod.upstream_vod_id, e);
        }
    }
}

async fn record_failure(db: &Db, vod: &crate::db::types::Vod, message: &str) {
    log::error!("processing failed for {}: {}", vod.upstream_vod_id, message);
    if let Err(e) = db.record_failure(vod.id, message).await {
        log::error!("recording failure for {}: {}", vod.upstream_vod_id, e);
    }
}

/// Updates an exponential moving average telemetry field in KV, seeding it
/// on first observation (no prior value) rather than blending from zero.
async fn update_ema(db: &Db, key: &str, sample_ms: f64) {
    let prior: Option<f64> = match db.kv_get_opt(key).await {
        Ok(v) => v.and_then(|s| s.parse().ok()),
        Err(e) => {
            log::warn!("reading EMA key {key}: {e}");
            None
        }
    };
    let updated = match prior {
        Some(prior) => EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * prior,
        None => sample_ms,
    };
    if let Err(e) = db.kv_set(key, &updated.to_string()).await {
        log::warn!("writing EMA key {key}: {e}");
    }
    if let Err(e) = db.kv_set("job_vod_process_last", &chrono::Utc::now().to_rfc3339()).await {
        log::warn!("writing job_vod_process_last: {e}");
    }
}
