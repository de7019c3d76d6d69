//! Row types shared across the persistence accessors.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Row};

use crate::error::DbError;
use crate::ids::VodRowId;

/// `vods.download_state` enumeration.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownloadState {
    Idle,
    Downloading,
    Processing,
    Done,
    Error,
}

impl DownloadState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub(crate) fn parse(s: &str) -> Result<Self, DbError> {
        Ok(match s {
            "idle" => Self::Idle,
            "downloading" => Self::Downloading,
            "processing" => Self::Processing,
            "done" => Self::Done,
            "error" => Self::Error,
            other => {
                return Err(DbError::Transient(format!(
                    "unrecognized download_state '{other}'"
                )))
            }
        })
    }
}

/// A `vods` row.
#[derive(Clone, Debug)]
pub struct Vod {
    pub id: VodRowId,
    pub channel: String,
    pub upstream_vod_id: String,
    pub title: String,
    pub stream_start_time: DateTime<Utc>,
    pub duration_seconds: i64,
    pub downloaded_path: Option<String>,
    pub download_state: DownloadState,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub downloaded_bytes: i64,
    pub downloaded_total: Option<i64>,
    pub progress_updated_at: Option<DateTime<Utc>>,
    pub processed: bool,
    pub republish_url: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for Vod {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let state_str: String = row.try_get("download_state")?;
        let download_state = DownloadState::parse(&state_str).map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: "download_state".into(),
                source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            }
        })?;
        Ok(Self {
            id: VodRowId(row.try_get("id")?),
            channel: row.try_get("channel")?,
            upstream_vod_id: row.try_get("upstream_vod_id")?,
            title: row.try_get("title")?,
            stream_start_time: row.try_get("stream_start_time")?,
            duration_seconds: row.try_get("duration_seconds")?,
            downloaded_path: row.try_get("downloaded_path")?,
            download_state,
            retry_count: row.try_get("retry_count")?,
            last_error: row.try_get("last_error")?,
            downloaded_bytes: row.try_get("downloaded_bytes")?,
            downloaded_total: row.try_get("downloaded_total")?,
            progress_updated_at: row.try_get("progress_updated_at")?,
            processed: row.try_get("processed")?,
            republish_url: row.try_get("republish_url")?,
            priority: row.try_get("priority")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Input to [`super::Db::upsert_vod`]. `None` fields are left untouched on
/// conflict with an existing row.
#[derive(Clone, Debug, Default)]
pub struct VodUpsert {
    pub channel: String,
    pub upstream_vod_id: String,
    pub title: Option<String>,
    pub stream_start_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
}

/// A `chat_messages` row to be inserted.
#[derive(Clone, Debug)]
pub struct NewChatMessage {
    pub vod_id: String,
    pub username: String,
    pub text: String,
    pub badges: String,
    pub emotes: String,
    pub color: Option<String>,
    pub reply_to_id: Option<String>,
    pub reply_to_username: Option<String>,
    pub reply_to_text: Option<String>,
    pub absolute_timestamp: DateTime<Utc>,
    pub relative_timestamp: f64,
}

/// Encryption scheme a stored secret payload was written under.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EncryptionVersion {
    Plaintext = 0,
    DirectAead = 1,
    Envelope = 2,
}

impl EncryptionVersion {
    pub(crate) fn from_i16(v: i16) -> Result<Self, DbError> {
        Ok(match v {
            0 => Self::Plaintext,
            1 => Self::DirectAead,
            2 => Self::Envelope,
            other => {
                return Err(DbError::Transient(format!(
                    "unrecognized encryption_version {other}"
                )))
            }
        })
    }
}

/// An `oauth_tokens` row.
#[derive(Clone, Debug)]
pub struct OAuthTokenRow {
    pub provider: String,
    pub channel: String,
    pub ciphertext: String,
    pub refresh_ciphertext: String,
    pub expiry: DateTime<Utc>,
    pub scope: String,
    pub encryption_version: EncryptionVersion,
    pub key_id: String,
    pub updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for OAuthTokenRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let version_raw: i16 = row.try_get("encryption_version")?;
        let encryption_version = EncryptionVersion::from_i16(version_raw).map_err(|e| {
            sqlx::Error::ColumnDecode {
                index: "encryption_version".into(),
                source: Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            }
        })?;
        Ok(Self {
            provider: row.try_get("provider")?,
            channel: row.try_get("channel")?,
            ciphertext: row.try_get("ciphertext")?,
            refresh_ciphertext: row.try_get("refresh_ciphertext")?,
            expiry: row.try_get("expiry")?,
            scope: row.try_get("scope")?,
            encryption_version,
            key_id: row.try_get("key_id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
