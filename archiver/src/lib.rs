//! VOD lifecycle archiver: captures a channel's live stream as chat, waits
//! for the platform to publish the corresponding VOD, reconciles the two,
//! and runs every VOD through a download/upload pipeline with retention.

#![deny(
    broken_intra_doc_links,
    missing_debug_implementations,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code
)]
#![warn(
    deprecated_in_future,
    unreachable_pub,
    unused_import_braces,
    unused_labels,
    unused_lifetimes,
    unused_qualifications
)]

pub mod adapters;
pub mod backfill;
pub mod chat;
pub mod cli;
pub mod db;
pub mod error;
pub mod ids;
pub mod processing;
pub mod retention;
pub mod secret;
pub mod token;
pub mod video_api;

use std::mem;
use std::sync::Arc;

use archiver_log::log;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio_util::sync::CancellationToken;

pub use cli::Failure;

use adapters::{ProcessChatTransport, ProcessDownloader, ProcessUploader};
use chat::AutoOrchestrator;
use db::Db;
use processing::breaker::BreakerConfig;
use processing::ProcessingConfig;
use retention::RetentionConfig;
use secret::SecretStore;
use token::{OAuthTokenRefresher, TokenLifecycle};
use video_api::HttpVideoApi;

/// Parses configuration, initializes logging, and blocks until shutdown
/// (`SIGINT`/`SIGTERM`).
///
/// # Errors
///
/// If startup failed (bad DSN, unreadable data dir, misconfigured
/// encryption, ...). The actual error is written to the logs.
pub fn run() -> Result<(), Failure> {
    let cfg = cli::Opts::from_args();

    // This guard should be held until the end of the program for the
    // logger to remain present in global context.
    mem::forget(archiver_log::init(Some(cfg.log_level())));

    tokio::runtime::Runtime::new()
        .map_err(|e| log::error!("failed to start async runtime: {}", e))?
        .block_on(run_engine(cfg))
}

async fn run_engine(cfg: cli::Opts) -> Result<(), Failure> {
    let db = Db::connect(&cfg.db_dsn)
        .await
        .map_err(|e| log::error!("failed to connect to database: {}", e))?;

    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .map_err(|e| log::error!("failed to create data dir {}: {}", cfg.data_dir.display(), e))?;

    let secret_store = Arc::new(build_secret_store(&cfg).await.map_err(|e| log::error!("{}", e))?);

    let video_api: Arc<dyn video_api::VideoApi> =
        Arc::new(HttpVideoApi::new(cfg.twitch_client_id.clone(), cfg.twitch_client_secret.clone()));

    let channel_id = video_api
        .resolve_channel(&cfg.twitch_channel)
        .await
        .map_err(|e| log::error!("failed to resolve channel '{}': {}", cfg.twitch_channel, e))?;

    let root_cancel = CancellationToken::new();
    let mut workers = Vec::new();

    workers.push(tokio::spawn(backfill::run(
        db.clone(),
        Arc::clone(&video_api),
        backfill::BackfillConfig {
            channel: cfg.twitch_channel.clone(),
            channel_id: channel_id.clone(),
            interval: cfg.vod_catalog_backfill_interval,
            max_count: cfg.vod_catalog_max,
            max_age_days: cfg.vod_catalog_max_age_days,
        },
        root_cancel.clone(),
    )));

    if cfg.chat_auto_start {
        let transport = Arc::new(ProcessChatTransport::new(
            cfg.chat_bridge_binary_path.clone(),
            cfg.twitch_channel.clone(),
            cfg.twitch_bot_username.clone(),
            cfg.twitch_oauth_token.clone(),
        ));
        let orchestrator = AutoOrchestrator::new(
            db.clone(),
            Arc::clone(&video_api),
            transport,
            cfg.twitch_channel.clone(),
            channel_id.clone(),
            cfg.chat_auto_poll_interval,
            cfg.vod_reconcile_delay,
        );
        workers.push(tokio::spawn(orchestrator.run(root_cancel.clone())));
    }

    let uploader: Option<Arc<dyn adapters::Uploader>> =
        if !cfg.yt_client_id.is_empty() && !cfg.yt_client_secret.is_empty() {
            let refresher: Arc<dyn token::TokenRefresher> = Arc::new(OAuthTokenRefresher::new(
                cfg.yt_token_endpoint.clone(),
                cfg.yt_client_id.clone(),
                cfg.yt_client_secret.clone(),
            ));
            let tokens = Arc::new(TokenLifecycle::new(
                db.clone(),
                Arc::clone(&secret_store),
                refresher,
                "upload-target",
                cfg.twitch_channel.clone(),
                std::time::Duration::from_secs(5 * 60),
                std::time::Duration::from_secs(15 * 60),
                std::time::Duration::from_secs(10 * 60),
            ));
            let tokens_for_worker = Arc::clone(&tokens);
            workers.push(tokio::spawn(async move {
                tokens_for_worker.run(root_cancel.clone()).await;
            }));
            Some(Arc::new(ProcessUploader::new(cfg.upload_binary_path.clone(), tokens)) as Arc<dyn adapters::Uploader>)
        } else {
            log::info!("upload target not configured (YT_CLIENT_ID/YT_CLIENT_SECRET unset); uploads disabled");
            None
        };

    let downloader: Arc<dyn adapters::Downloader> = Arc::new(ProcessDownloader::new(
        cfg.download_binary_path.clone(),
        cfg.twitch_cookies_path.clone(),
        cfg.download_rate_limit.clone(),
    ));

    let processing_config = ProcessingConfig {
        channel: cfg.twitch_channel.clone(),
        data_dir: cfg.data_dir.clone(),
        tick_interval: cfg.vod_process_interval,
        retry_cooldown: chrono::Duration::from_std(cfg.processing_retry_cooldown).unwrap_or_default(),
        stale_lease_timeout: chrono::Duration::from_std(cfg.processing_stale_lease_timeout).unwrap_or_default(),
        max_concurrent_downloads: cfg.max_concurrent_downloads,
        download_max_attempts: cfg.download_max_attempts,
        download_backoff_base: cfg.download_backoff_base,
        upload_max_attempts: cfg.upload_max_attempts,
        upload_backoff_base: cfg.upload_backoff_base,
        backfill_upload_daily_limit: cfg.backfill_upload_daily_limit,
        retain_keep_newer_than_days: cfg.retain_keep_newer_than_days,
        backfill_autoclean: cfg.backfill_autoclean != 0,
        breaker: BreakerConfig {
            failure_threshold: cfg.circuit_failure_threshold,
            open_cooldown: chrono::Duration::from_std(cfg.circuit_open_cooldown).unwrap_or_default(),
        },
        shutdown_grace_period: cfg.shutdown_grace_period,
    };
    workers.push(tokio::spawn(processing::run(
        db.clone(),
        downloader,
        uploader,
        processing_config,
        root_cancel.clone(),
    )));

    workers.push(tokio::spawn(retention::run(
        db.clone(),
        RetentionConfig {
            channel: cfg.twitch_channel.clone(),
            interval: cfg.retention_interval,
            keep_days: cfg.retention_keep_days,
            keep_count: cfg.retention_keep_count,
            dry_run: cfg.retention_dry_run,
        },
        root_cancel.clone(),
    )));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, stopping workers");
    root_cancel.cancel();

    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}

async fn build_secret_store(cfg: &cli::Opts) -> anyhow::Result<SecretStore> {
    let aead_key = cfg
        .encryption_key
        .as_ref()
        .map(|b64| decode_aead_key(b64))
        .transpose()?;

    let kms: Option<(Arc<dyn secret::Kms>, String)> = if let Some(key_id) = &cfg.kms_key_id {
        #[cfg(feature = "kms")]
        {
            let aws_cfg = aws_config::load_from_env().await;
            let client = aws_sdk_kms::Client::new(&aws_cfg);
            Some((Arc::new(secret::kms::AwsKms::new(client)) as Arc<dyn secret::Kms>, key_id.clone()))
        }
        #[cfg(not(feature = "kms"))]
        {
            anyhow::bail!(
                "KMS_KEY_ID set to '{}' but this binary was built without the 'kms' feature",
                key_id,
            );
        }
    } else {
        None
    };

    Ok(SecretStore::new(aead_key, kms))
}

fn decode_aead_key(b64: &str) -> anyhow::Result<[u8; 32]> {
    let bytes = BASE64.decode(b64)?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| anyhow::anyhow!("ENCRYPTION_KEY must decode to 32 bytes, got {}", v.len()))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
