//! Video-API client: paged VOD listing, live-status lookup, and channel
//! resolution over the upstream video platform's HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio::time::Instant;

use archiver_log::log;

/// Minimum delay enforced between consecutive page requests.
const MIN_REQUEST_GAP: Duration = Duration::from_millis(1200);

/// App-token is refetched once less than this remains before expiry.
const APP_TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// A single page of `ListVideos`.
#[derive(Clone, Debug)]
pub struct VideoPage {
    pub items: Vec<VideoSummary>,
    pub next_cursor: Option<String>,
}

/// One upstream VOD as returned by `ListVideos`.
#[derive(Clone, Debug)]
pub struct VideoSummary {
    pub id: String,
    pub title: String,
    pub stream_start_time: DateTime<Utc>,
    pub duration_seconds: i64,
}

/// Result of `IsLive`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LiveStatus {
    pub live: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// Failure taxonomy for video-API calls.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VideoApiError {
    /// Caller should retry after the given hint (if any).
    #[error("rate limited{}", .0.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimited(Option<Duration>),

    /// The app token could not be used or refreshed; a restart may be
    /// required for recovery.
    #[error("unauthorized")]
    Unauthorized,

    /// Network or server-side failure worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// Not retryable (bad request, unknown channel, etc).
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Capability interface over the upstream video platform, injected as a
/// dependency so tests can substitute a fake without touching the network.
#[async_trait]
pub trait VideoApi: Send + Sync {
    async fn resolve_channel(&self, login: &str) -> Result<String, VideoApiError>;
    async fn list_videos(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
    ) -> Result<VideoPage, VideoApiError>;
    async fn is_live(&self, channel_id: &str) -> Result<LiveStatus, VideoApiError>;
}

struct AppToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Production [`VideoApi`] implementation over `reqwest`.
pub struct HttpVideoApi {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    app_token: Mutex<Option<AppToken>>,
    last_request_at: Mutex<Option<Instant>>,
}

impl HttpVideoApi {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            app_token: Mutex::new(None),
            last_request_at: Mutex::new(None),
        }
    }

    async fn pace(&self) {
        let mut last = self.last_request_at.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_GAP {
                tokio::time::sleep(MIN_REQUEST_GAP - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Returns a valid app token, refreshing it first if it is near expiry.
    /// Concurrent callers coalesce on the same refresh (single-flight: the
    /// lock is held across the HTTP call).
    async fn app_token(&self) -> Result<String, VideoApiError> {
        let mut guard = self.app_token.lock().await;
        let needs_refresh = match guard.as_ref() {
            Some(t) => t.expires_at - Utc::now() < chrono::Duration::from_std(APP_TOKEN_REFRESH_MARGIN).unwrap_or_default(),
            None => true,
        };
        if needs_refresh {
            let fresh = self.fetch_app_token().await?;
            *guard = Some(fresh);
        }
        Ok(guard.as_ref().expect("just set").token.clone())
    }

    async fn fetch_app_token(&self) -> Result<AppToken, VideoApiError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            access_token: String,
            expires_in: i64,
        }

        let resp = self
            .http
            .post("https://id.twitch.tv/oauth2/token")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .map_err(|e| VideoApiError::Transient(e.to_string()))?;

        classify_response(&resp)?;

        let body: Resp = resp
            .json()
            .await
            .map_err(|e| VideoApiError::Transient(format!("decoding app token response: {e}")))?;
        Ok(AppToken {
            token: body.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        })
    }
}

/// Classifies a response's status, consuming `resp`'s headers (but not its
/// body) to turn a `429`'s `Retry-After` hint, if present, into a concrete
/// wait duration.
fn classify_response(resp: &reqwest::Response) -> Result<(), VideoApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    match status.as_u16() {
        401 | 403 => Err(VideoApiError::Unauthorized),
        429 => Err(VideoApiError::RateLimited(retry_after(resp))),
        s if (500..600).contains(&s) => {
            Err(VideoApiError::Transient(format!("http {s}")))
        }
        s => Err(VideoApiError::Permanent(format!("http {s}"))),
    }
}

/// Parses a `Retry-After` header, which is either a delta in seconds or an
/// HTTP-date, per RFC 7231 §7.1.3.
fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    let raw = resp.headers().get(reqwest::header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(secs) = raw.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let remaining = at.with_timezone(&Utc) - Utc::now();
    remaining.to_std().ok()
}

#[async_trait]
impl VideoApi for HttpVideoApi {
    async fn resolve_channel(&self, login: &str) -> Result<String, VideoApiError> {
        self.pace().await;
        let token = self.app_token().await?;

        #[derive(serde::Deserialize)]
        struct User {
            id: String,
        }
        #[derive(serde::Deserialize)]
        struct UsersResp {
            data: Vec<User>,
        }

        let resp = self
            .http
            .get("https://api.twitch.tv/helix/users")
            .query(&[("login", login)])
            .bearer_auth(&token)
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(|e| VideoApiError::Transient(e.to_string()))?;
        classify_response(&resp)?;
        let body: UsersResp = resp
            .json()
            .await
            .map_err(|e| VideoApiError::Transient(format!("decoding users response: {e}")))?;
        body.data
            .into_iter()
            .next()
            .map(|u| u.id)
            .ok_or_else(|| VideoApiError::Permanent(format!("no such channel '{login}'")))
    }

    async fn list_videos(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
    ) -> Result<VideoPage, VideoApiError> {
        self.pace().await;
        let token = self.app_token().await?;

        #[derive(serde::Deserialize)]
        struct Video {
            id: String,
            title: String,
            created_at: DateTime<Utc>,
            duration: String,
        }
        #[derive(serde::Deserialize)]
        struct Pagination {
            cursor: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct VideosResp {
            data: Vec<Video>,
            pagination: Pagination,
        }

        let mut query = vec![("user_id", channel_id), ("type", "archive"), ("first", "20")];
        if let Some(c) = cursor {
            query.push(("after", c));
        }

        let resp = self
            .http
            .get("https://api.twitch.tv/helix/videos")
            .query(&query)
            .bearer_auth(&token)
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(|e| VideoApiError::Transient(e.to_string()))?;
        classify_response(&resp)?;
        let body: VideosResp = resp
            .json()
            .await
            .map_err(|e| VideoApiError::Transient(format!("decoding videos response: {e}")))?;

        let items = body
            .data
            .into_iter()
            .filter_map(|v| {
                match parse_duration(&v.duration) {
                    Ok(secs) => Some(VideoSummary {
                        id: v.id,
                        title: v.title,
                        stream_start_time: v.created_at,
                        duration_seconds: secs,
                    }),
                    Err(e) => {
                        log::warn!("skipping video {} with unparseable duration: {}", v.id, e);
                        None
                    }
                }
            })
            .collect();

        Ok(VideoPage {
            items,
            next_cursor: body.pagination.cursor,
        })
    }

    async fn is_live(&self, channel_id: &str) -> Result<LiveStatus, VideoApiError> {
        self.pace().await;
        let token = self.app_token().await?;

        #[derive(serde::Deserialize)]
        struct Stream {
            started_at: DateTime<Utc>,
        }
        #[derive(serde::Deserialize)]
        struct StreamsResp {
            data: Vec<Stream>,
        }

        let resp = self
            .http
            .get("https://api.twitch.tv/helix/streams")
            .query(&[("user_id", channel_id)])
            .bearer_auth(&token)
            .header("Client-Id", &self.client_id)
            .send()
            .await
            .map_err(|e| VideoApiError::Transient(e.to_string()))?;
        classify_response(&resp)?;
        let body: StreamsResp = resp
            .json()
            .await
            .map_err(|e| VideoApiError::Transient(format!("decoding streams response: {e}")))?;

        Ok(match body.data.into_iter().next() {
            Some(s) => LiveStatus {
                live: true,
                started_at: Some(s.started_at),
            },
            None => LiveStatus::default(),
        })
    }
}

/// Parses upstream duration strings of the form `<n>h<m>m<s>s` into whole
/// seconds, tolerating missing components (`"45m"`, `"7s"`).
///
/// # Errors
///
/// Returns an error on the empty string or a string matching none of the
/// components.
pub fn parse_duration(s: &str) -> Result<i64, String> {
    static RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").expect("valid regex"));

    if s.is_empty() {
        return Err("empty duration string".into());
    }
    let caps = RE
        .captures(s)
        .ok_or_else(|| format!("unrecognized duration format '{s}'"))?;
    if caps.iter().skip(1).all(|c| c.is_none()) {
        return Err(format!("unrecognized duration format '{s}'"));
    }
    let hours: i64 = caps.get(1).map_or(Ok(0), |m| m.as_str().parse()).map_err(|e| format!("{e}"))?;
    let minutes: i64 = caps.get(2).map_or(Ok(0), |m| m.as_str().parse()).map_err(|e| format!("{e}"))?;
    let seconds: i64 = caps.get(3).map_or(Ok(0), |m| m.as_str().parse()).map_err(|e| format!("{e}"))?;
    Ok(hours * 3600 + minutes * 60 + seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_duration() {
        assert_eq!(parse_duration("3h2m15s").unwrap(), 10935);
    }

    #[test]
    fn parses_partial_durations() {
        assert_eq!(parse_duration("45m").unwrap(), 2700);
        assert_eq!(parse_duration("7s").unwrap(), 7);
    }

    #[test]
    fn empty_string_errors() {
        assert!(parse_duration("").is_err());
    }

    fn fake_response(status: u16, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut builder = http::Response::builder().status(status);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        reqwest::Response::from(builder.body(Vec::new()).expect("building fake response"))
    }

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            classify_response(&fake_response(401, &[])),
            Err(VideoApiError::Unauthorized)
        ));
        assert!(matches!(
            classify_response(&fake_response(429, &[])),
            Err(VideoApiError::RateLimited(None))
        ));
        assert!(matches!(
            classify_response(&fake_response(502, &[])),
            Err(VideoApiError::Transient(_))
        ));
        assert!(classify_response(&fake_response(200, &[])).is_ok());
    }

    #[test]
    fn rate_limit_honors_retry_after_seconds() {
        let resp = fake_response(429, &[("retry-after", "30")]);
        match classify_response(&resp) {
            Err(VideoApiError::RateLimited(Some(d))) => assert_eq!(d, Duration::from_secs(30)),
            other => panic!("expected RateLimited(Some(30s)), got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_without_retry_after_is_none() {
        assert!(matches!(
            classify_response(&fake_response(429, &[])),
            Err(VideoApiError::RateLimited(None))
        ));
    }
}
