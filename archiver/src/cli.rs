//! CLI (command line interface) and environment-variable configuration
//! surface.

use std::{fmt, path::PathBuf, str::FromStr as _, time::Duration};

use anyhow::anyhow;
use archiver_log::slog;
use structopt::StructOpt;

/// CLI (command line interface) of the archiver engine.
#[derive(Clone, Debug, StructOpt)]
#[structopt(about = "VOD lifecycle archiver")]
pub struct Opts {
    /// Debug mode: shortcut for `--verbose=DEBG`.
    #[structopt(short, long, help = "Enables debug mode")]
    pub debug: bool,

    /// Verbosity level of the engine logs.
    #[structopt(
        short,
        long,
        parse(try_from_str = Self::parse_log_level),
        help = "Logs verbosity level: \
                OFF | CRIT | ERRO | WARN | INFO | DEBG | TRCE"
    )]
    pub verbose: Option<slog::Level>,

    /// Database connection string.
    #[structopt(
        long,
        env = "DB_DSN",
        default_value = "postgres://localhost/archiver",
        help = "Database connection string"
    )]
    pub db_dsn: String,

    /// Root directory for downloaded files.
    #[structopt(
        long,
        env = "DATA_DIR",
        default_value = "./data",
        help = "Root directory for downloaded files"
    )]
    pub data_dir: PathBuf,

    /// Channel login this instance archives.
    #[structopt(
        long,
        env = "TWITCH_CHANNEL",
        default_value = "",
        help = "Channel login to archive"
    )]
    pub twitch_channel: String,

    /// Grace period the engine waits for in-flight downloads/uploads to
    /// finish after a shutdown signal before returning anyway.
    #[structopt(
        long,
        env = "SHUTDOWN_GRACE_PERIOD",
        parse(try_from_str = parse_duration),
        default_value = "30s",
        help = "Bounded grace period for in-flight work to finish on shutdown"
    )]
    pub shutdown_grace_period: Duration,

    /// Chat bot username used to join the channel's chat.
    #[structopt(
        long,
        env = "TWITCH_BOT_USERNAME",
        default_value = "",
        help = "Chat bot username"
    )]
    pub twitch_bot_username: String,

    /// OAuth token the chat bot authenticates with.
    #[structopt(
        long,
        env = "TWITCH_OAUTH_TOKEN",
        default_value = "",
        help = "Chat bot OAuth token"
    )]
    pub twitch_oauth_token: String,

    /// Client id used to acquire a video-API application token.
    #[structopt(
        long,
        env = "TWITCH_CLIENT_ID",
        default_value = "",
        help = "Video-API client id"
    )]
    pub twitch_client_id: String,

    /// Client secret used to acquire a video-API application token.
    #[structopt(
        long,
        env = "TWITCH_CLIENT_SECRET",
        default_value = "",
        help = "Video-API client secret"
    )]
    pub twitch_client_secret: String,

    /// Path to a mounted cookies file passed to the default downloader for
    /// authenticated content.
    #[structopt(
        long,
        env = "TWITCH_COOKIES_PATH",
        help = "Path to a cookies file for the default downloader"
    )]
    pub twitch_cookies_path: Option<PathBuf>,

    /// Path to the external content-fetching tool the default downloader
    /// shells out to.
    #[structopt(
        long,
        env = "DOWNLOAD_BINARY_PATH",
        default_value = "yt-dlp",
        help = "Path to the external downloader binary"
    )]
    pub download_binary_path: PathBuf,

    /// Path to the external chat-bridge binary the default chat transport
    /// shells out to.
    #[structopt(
        long,
        env = "CHAT_BRIDGE_BINARY_PATH",
        default_value = "chat-bridge",
        help = "Path to the external chat-bridge binary"
    )]
    pub chat_bridge_binary_path: PathBuf,

    /// Path to the external republish tool the default uploader shells out
    /// to.
    #[structopt(
        long,
        env = "UPLOAD_BINARY_PATH",
        default_value = "vod-uploader",
        help = "Path to the external uploader binary"
    )]
    pub upload_binary_path: PathBuf,

    /// Upload adapter OAuth client id.
    #[structopt(long, env = "YT_CLIENT_ID", default_value = "", help = "Upload adapter client id")]
    pub yt_client_id: String,

    /// Upload adapter OAuth client secret.
    #[structopt(
        long,
        env = "YT_CLIENT_SECRET",
        default_value = "",
        help = "Upload adapter client secret"
    )]
    pub yt_client_secret: String,

    /// Upload adapter OAuth redirect URI.
    #[structopt(
        long,
        env = "YT_REDIRECT_URI",
        default_value = "",
        help = "Upload adapter redirect URI"
    )]
    pub yt_redirect_uri: String,

    /// Upload adapter OAuth scopes, space-separated.
    #[structopt(long, env = "YT_SCOPES", default_value = "", help = "Upload adapter OAuth scopes")]
    pub yt_scopes: String,

    /// Upload adapter OAuth token refresh endpoint.
    #[structopt(
        long,
        env = "YT_TOKEN_ENDPOINT",
        default_value = "https://oauth2.googleapis.com/token",
        help = "Upload adapter OAuth token refresh endpoint"
    )]
    pub yt_token_endpoint: String,

    /// Enables the live-chat auto-orchestrator. When disabled, chat capture
    /// (if used at all) is bound to a single fixed VOD id outside this
    /// process's control.
    #[structopt(
        long,
        env = "CHAT_AUTO_START",
        help = "Enables the chat auto-orchestrator"
    )]
    pub chat_auto_start: bool,

    /// Live-status polling cadence for the auto-orchestrator.
    #[structopt(
        long,
        env = "CHAT_AUTO_POLL_INTERVAL",
        parse(try_from_str = parse_duration),
        default_value = "30s",
        help = "Live-status polling cadence"
    )]
    pub chat_auto_poll_interval: Duration,

    /// Grace delay between the stream going offline and entering the
    /// reconciliation state.
    #[structopt(
        long,
        env = "VOD_RECONCILE_DELAY",
        parse(try_from_str = parse_duration),
        default_value = "1min",
        help = "Delay before reconciliation begins after going offline"
    )]
    pub vod_reconcile_delay: Duration,

    /// Catalog-backfill ticker interval.
    #[structopt(
        long,
        env = "VOD_CATALOG_BACKFILL_INTERVAL",
        parse(try_from_str = parse_duration),
        default_value = "6h",
        help = "Catalog backfill ticker interval"
    )]
    pub vod_catalog_backfill_interval: Duration,

    /// Per-run maximum number of VODs to upsert during backfill.
    #[structopt(
        long,
        env = "VOD_CATALOG_MAX",
        help = "Per-run maximum VODs to ingest during backfill"
    )]
    pub vod_catalog_max: Option<u32>,

    /// Stop backfilling once a VOD older than this many days is reached.
    #[structopt(
        long,
        env = "VOD_CATALOG_MAX_AGE_DAYS",
        help = "Maximum VOD age in days to backfill"
    )]
    pub vod_catalog_max_age_days: Option<i64>,

    /// Processing pipeline cycle interval.
    #[structopt(
        long,
        env = "VOD_PROCESS_INTERVAL",
        parse(try_from_str = parse_duration),
        default_value = "1min",
        help = "Processing pipeline cycle interval"
    )]
    pub vod_process_interval: Duration,

    /// Floor below which a VOD that just failed is not re-picked.
    #[structopt(
        long,
        env = "PROCESSING_RETRY_COOLDOWN",
        parse(try_from_str = parse_duration),
        default_value = "600s",
        help = "Per-VOD retry cooldown floor"
    )]
    pub processing_retry_cooldown: Duration,

    /// How long a VOD may sit in `downloading`/`processing` with no progress
    /// before the scheduler assumes the worker that claimed it crashed and
    /// reclaims it for another attempt.
    #[structopt(
        long,
        env = "PROCESSING_STALE_LEASE_TIMEOUT",
        parse(try_from_str = parse_duration),
        default_value = "30min",
        help = "Stale claim timeout before a stuck VOD is reclaimed"
    )]
    pub processing_stale_lease_timeout: Duration,

    /// Maximum number of concurrent downloads.
    #[structopt(
        long,
        env = "MAX_CONCURRENT_DOWNLOADS",
        default_value = "1",
        help = "Maximum concurrent downloads"
    )]
    pub max_concurrent_downloads: usize,

    /// Optional bandwidth cap passed through to the default downloader.
    #[structopt(
        long,
        env = "DOWNLOAD_RATE_LIMIT",
        help = "Optional download bandwidth cap (adapter-specific units)"
    )]
    pub download_rate_limit: Option<String>,

    /// Maximum download attempts before giving up for this cycle.
    #[structopt(
        long,
        env = "DOWNLOAD_MAX_ATTEMPTS",
        default_value = "5",
        help = "Maximum download attempts"
    )]
    pub download_max_attempts: u32,

    /// Base backoff duration for download retries.
    #[structopt(
        long,
        env = "DOWNLOAD_BACKOFF_BASE",
        parse(try_from_str = parse_duration),
        default_value = "2s",
        help = "Base backoff for download retries"
    )]
    pub download_backoff_base: Duration,

    /// Maximum upload attempts before deferring to the next cycle.
    #[structopt(
        long,
        env = "UPLOAD_MAX_ATTEMPTS",
        default_value = "5",
        help = "Maximum upload attempts"
    )]
    pub upload_max_attempts: u32,

    /// Base backoff duration for upload retries.
    #[structopt(
        long,
        env = "UPLOAD_BACKOFF_BASE",
        parse(try_from_str = parse_duration),
        default_value = "2s",
        help = "Base backoff for upload retries"
    )]
    pub upload_backoff_base: Duration,

    /// Daily quota of uploads for back-catalog VODs.
    #[structopt(
        long,
        env = "BACKFILL_UPLOAD_DAILY_LIMIT",
        default_value = "10",
        help = "Daily upload quota for back-catalog VODs"
    )]
    pub backfill_upload_daily_limit: u32,

    /// Consecutive-failure threshold before the circuit breaker opens.
    /// Unset disables the breaker entirely.
    #[structopt(
        long,
        env = "CIRCUIT_FAILURE_THRESHOLD",
        help = "Consecutive failures before the breaker opens (unset disables it)"
    )]
    pub circuit_failure_threshold: Option<u32>,

    /// Cooldown the breaker stays open for before probing again.
    #[structopt(
        long,
        env = "CIRCUIT_OPEN_COOLDOWN",
        parse(try_from_str = parse_duration),
        default_value = "5min",
        help = "Breaker open cooldown"
    )]
    pub circuit_open_cooldown: Duration,

    /// Retention: keep VODs newer than this many days.
    #[structopt(long, env = "RETENTION_KEEP_DAYS", help = "Retention keep-by-age policy, in days")]
    pub retention_keep_days: Option<i64>,

    /// Retention: keep this many most-recent VODs regardless of age.
    #[structopt(long, env = "RETENTION_KEEP_COUNT", help = "Retention keep-by-count policy")]
    pub retention_keep_count: Option<u32>,

    /// Retention worker tick interval.
    #[structopt(
        long,
        env = "RETENTION_INTERVAL",
        parse(try_from_str = parse_duration),
        default_value = "6h",
        help = "Retention worker tick interval"
    )]
    pub retention_interval: Duration,

    /// Retention dry-run mode: log intent without deleting files.
    #[structopt(long, env = "RETENTION_DRY_RUN", help = "Retention dry-run mode")]
    pub retention_dry_run: bool,

    /// Age beyond which a VOD is considered back-catalog for upload-quota
    /// and auto-clean purposes.
    #[structopt(
        long,
        env = "RETAIN_KEEP_NEWER_THAN_DAYS",
        default_value = "7",
        help = "Age in days beyond which a VOD is back-catalog"
    )]
    pub retain_keep_newer_than_days: i64,

    /// Automatically delete a back-catalog VOD's local file once uploaded.
    #[structopt(
        long,
        env = "BACKFILL_AUTOCLEAN",
        default_value = "1",
        help = "Auto-delete back-catalog files after successful upload"
    )]
    pub backfill_autoclean: u8,

    /// Base64-encoded 32-byte key for direct-AEAD secret encryption
    /// (encryption version 1).
    #[structopt(
        long,
        env = "ENCRYPTION_KEY",
        help = "Base64 32-byte key for direct-AEAD secret encryption"
    )]
    pub encryption_key: Option<String>,

    /// KMS key id. When set, envelope encryption (version 2) is used for
    /// new writes, taking precedence over `ENCRYPTION_KEY`.
    #[structopt(long, env = "KMS_KEY_ID", help = "KMS key id for envelope encryption")]
    pub kms_key_id: Option<String>,
}

impl Opts {
    /// Parses CLI [`Opts`] from command line arguments and environment.
    ///
    /// Prints the error message and quits the program in case of failure.
    #[inline]
    #[must_use]
    pub fn from_args() -> Self {
        <Self as StructOpt>::from_args()
    }

    /// Resolves the effective log level, honoring `--debug` as a shortcut
    /// for `--verbose=DEBG` when no explicit level was given.
    #[must_use]
    pub fn log_level(&self) -> slog::Level {
        self.verbose.unwrap_or(if self.debug {
            slog::Level::Debug
        } else {
            slog::Level::Info
        })
    }

    /// Parses [`slog::Level`] from the given string.
    ///
    /// # Errors
    ///
    /// If [`slog::Level`] failed to parse from the string.
    pub fn parse_log_level(lvl: &str) -> Result<slog::Level, anyhow::Error> {
        #[allow(clippy::map_err_ignore)]
        slog::Level::from_str(lvl).map_err(|_| {
            anyhow!(
                "'{}' is invalid verbosity level, allowed levels are: \
                 OFF | CRIT | ERRO | WARN | INFO | DEBG | TRCE",
                lvl,
            )
        })
    }
}

/// Parses a human-readable duration (`"30s"`, `"6h"`, `"1min"`, …).
fn parse_duration(s: &str) -> Result<Duration, anyhow::Error> {
    humantime::parse_duration(s).map_err(|e| anyhow!("invalid duration '{}': {}", s, e))
}

/// Error type indicating non-zero process exit code.
pub struct Failure;

impl fmt::Debug for Failure {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "")
    }
}

impl From<()> for Failure {
    #[inline]
    fn from(_: ()) -> Self {
        Self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("6h").unwrap(), Duration::from_secs(6 * 3600));
        assert_eq!(parse_duration("1min").unwrap(), Duration::from_secs(60));
    }
}
