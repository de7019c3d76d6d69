//! Capability interfaces the rest of the engine depends on, injected
//! explicitly at construction time rather than reached for as globals —
//! `Downloader`, `Uploader`, `ChatTransport`. `VideoApi` and `Kms` live in
//! their own modules ([`crate::video_api`], [`crate::secret::kms`]) since
//! each has a substantial production implementation attached.
//!
//! Default implementations here shell out or connect over the network the
//! same way the old FFmpeg/SRS process supervision did: spawn, pipe stdio,
//! `kill_on_drop(true)`, and a task that classifies the exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use archiver_log::log;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt as _, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// Observed download progress. `total` is `None` until the adapter knows
/// the final size.
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

/// Callback an adapter invokes as progress samples arrive. Boxed so both
/// the default process-based adapter and test fakes can share the same
/// signature without a generic parameter leaking into the trait.
pub type ProgressSink = Arc<dyn Fn(Progress) + Send + Sync>;

/// Everything a download attempt needs, bundled so the trait signature
/// stays stable as the contract grows.
pub struct DownloadCtx {
    pub upstream_vod_id: String,
    pub data_dir: PathBuf,
    pub cancel: CancellationToken,
    pub progress: ProgressSink,
}

/// Given `(upstream_vod_id, destination_directory)`, produces a file on
/// disk and returns its path. Implementations must support resume (an
/// existing partial file at the chosen path continues rather than
/// restarts) and honor `ctx.cancel`.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(&self, ctx: DownloadCtx) -> Result<PathBuf, String>;
}

/// Given `(file_path, title, stream_start_time)`, returns a canonical URL
/// on the republish target.
#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(
        &self,
        path: &Path,
        title: &str,
        stream_start_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<String, String>;
}

/// A single chat message as delivered by the transport, before the
/// recorder attaches timestamps.
#[derive(Clone, Debug)]
pub struct ChatEvent {
    pub username: String,
    pub text: String,
    pub badges: String,
    pub emotes: String,
    pub color: Option<String>,
    pub reply_to: Option<ReplyTo>,
}

/// The triple a chat reply references.
#[derive(Clone, Debug)]
pub struct ReplyTo {
    pub id: String,
    pub username: String,
    pub text: String,
}

/// A connected chat session the recorder pulls events from.
#[async_trait]
pub trait ChatSession: Send {
    /// Waits for the next message. Returns an error on transport loss,
    /// after which the recorder reconnects with backoff.
    async fn recv(&mut self) -> Result<ChatEvent, String>;
}

/// Connects to the chat transport for `(channel, bot_credential)`, bound to
/// a `(channel, bot_credential)` pair; the core is told only "a message
/// arrived".
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChatSession>, String>;
}

/// Default [`Downloader`]: shells out to an external content-fetching tool,
/// following the spawn-and-observe shape of the old FFmpeg supervisor
/// (kill-on-drop, piped stdio, a task classifying the exit).
pub struct ProcessDownloader {
    binary_path: PathBuf,
    cookies_path: Option<PathBuf>,
    rate_limit: Option<String>,
}

impl ProcessDownloader {
    #[must_use]
    pub fn new(
        binary_path: PathBuf,
        cookies_path: Option<PathBuf>,
        rate_limit: Option<String>,
    ) -> Self {
        Self {
            binary_path,
            cookies_path,
            rate_limit,
        }
    }
}

#[async_trait]
impl Downloader for ProcessDownloader {
    async fn download(&self, ctx: DownloadCtx) -> Result<PathBuf, String> {
        let dest = ctx.data_dir.join(format!("{}.mp4", ctx.upstream_vod_id));

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--continue") // resume a partial file rather than restart
            .arg("--output")
            .arg(&dest)
            .arg(&ctx.upstream_vod_id)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(cookies) = &self.cookies_path {
            let _ = cmd.arg("--cookies").arg(cookies);
        }
        if let Some(limit) = &self.rate_limit {
            let _ = cmd.arg("--limit-rate").arg(limit);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn downloader: {e}"))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let progress = ctx.progress.clone();
        let vod_id = ctx.upstream_vod_id.clone();
        let reader = async move {
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(p) = parse_progress_line(&line) {
                    progress(p);
                }
            }
            let _ = vod_id; // retained for future structured logging
        };

        tokio::select! {
            () = ctx.cancel.cancelled() => {
                log::info!("download of {} cancelled", ctx.upstream_vod_id);
                Err("cancelled".to_owned())
            }
            status = child.wait() => {
                reader.await;
                let status = status.map_err(|e| format!("waiting for downloader: {e}"))?;
                if status.success() {
                    Ok(dest)
                } else {
                    Err(format!("downloader exited with {status}"))
                }
            }
        }
    }
}

/// Default [`Uploader`]: shells out to an external republish tool, passing
/// a fresh access token obtained from a [`crate::token::TokenLifecycle`] on
/// the command line. The tool prints the published URL as its only stdout
/// line on success.
pub struct ProcessUploader {
    binary_path: PathBuf,
    tokens: Arc<crate::token::TokenLifecycle>,
}

impl ProcessUploader {
    #[must_use]
    pub fn new(binary_path: PathBuf, tokens: Arc<crate::token::TokenLifecycle>) -> Self {
        Self { binary_path, tokens }
    }
}

#[async_trait]
impl Uploader for ProcessUploader {
    async fn upload(
        &self,
        path: &Path,
        title: &str,
        stream_start_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<String, String> {
        let access_token = self
            .tokens
            .access_token()
            .await
            .map_err(|e| format!("fetching upload access token: {e}"))?;

        let output = Command::new(&self.binary_path)
            .arg("--access-token")
            .arg(&access_token)
            .arg("--title")
            .arg(title)
            .arg("--recorded-at")
            .arg(stream_start_time.to_rfc3339())
            .arg(path)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| format!("failed to spawn uploader: {e}"))?;

        if !output.status.success() {
            return Err(format!(
                "uploader exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            ));
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_owned();
        if url.is_empty() {
            return Err("uploader produced no output url".to_owned());
        }
        Ok(url)
    }
}

/// A chat event as emitted by the default chat-bridge process, one JSON
/// object per line.
#[derive(Deserialize)]
struct WireChatEvent {
    username: String,
    text: String,
    #[serde(default)]
    badges: String,
    #[serde(default)]
    emotes: String,
    color: Option<String>,
    reply_to_id: Option<String>,
    reply_to_username: Option<String>,
    reply_to_text: Option<String>,
}

/// Default [`ChatTransport`]: shells out to an external chat-bridge binary
/// that authenticates with the bot credential and emits one JSON chat event
/// per stdout line. Keeps the platform-specific chat protocol (IRC or
/// otherwise) out of the core, mirroring [`ProcessDownloader`]'s
/// spawn-and-observe shape.
pub struct ProcessChatTransport {
    binary_path: PathBuf,
    channel: String,
    bot_username: String,
    oauth_token: String,
}

impl ProcessChatTransport {
    #[must_use]
    pub fn new(
        binary_path: PathBuf,
        channel: impl Into<String>,
        bot_username: impl Into<String>,
        oauth_token: impl Into<String>,
    ) -> Self {
        Self {
            binary_path,
            channel: channel.into(),
            bot_username: bot_username.into(),
            oauth_token: oauth_token.into(),
        }
    }
}

#[async_trait]
impl ChatTransport for ProcessChatTransport {
    async fn connect(&self) -> Result<Box<dyn ChatSession>, String> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("--channel")
            .arg(&self.channel)
            .arg("--username")
            .arg(&self.bot_username)
            .arg("--oauth-token")
            .arg(&self.oauth_token)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("failed to spawn chat bridge: {e}"))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let lines = BufReader::new(stdout).lines();
        Ok(Box::new(ProcessChatSession { _child: child, lines }))
    }
}

struct ProcessChatSession {
    // Never read again, but holding it keeps the child alive and lets
    // `kill_on_drop` tear it down when the session is dropped.
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl ChatSession for ProcessChatSession {
    async fn recv(&mut self) -> Result<ChatEvent, String> {
        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| format!("chat bridge read error: {e}"))?
                .ok_or_else(|| "chat bridge exited".to_owned())?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let wire: WireChatEvent = serde_json::from_str(line)
                .map_err(|e| format!("malformed chat bridge line: {e}"))?;
            let reply_to = match (wire.reply_to_id, wire.reply_to_username, wire.reply_to_text) {
                (Some(id), Some(username), Some(text)) => Some(ReplyTo { id, username, text }),
                _ => None,
            };
            return Ok(ChatEvent {
                username: wire.username,
                text: wire.text,
                badges: wire.badges,
                emotes: wire.emotes,
                color: wire.color,
                reply_to,
            });
        }
    }
}

/// Parses a `yt-dlp`-style progress line
/// (`"[download]  42.0% of 100.00MiB"`) into bytes. Best-effort: unparseable
/// lines are simply not counted as progress samples.
fn parse_progress_line(line: &str) -> Option<Progress> {
    let line = line.trim();
    if !line.starts_with("[download]") {
        return None;
    }
    let percent_str = line
        .split_whitespace()
        .find(|tok| tok.ends_with('%'))?
        .trim_end_matches('%');
    let percent: f64 = percent_str.parse().ok()?;

    let total_str = line.split("of").nth(1)?.split_whitespace().next()?;
    let total_bytes = parse_size(total_str);

    let downloaded_bytes = total_bytes.map(|t| ((t as f64) * percent / 100.0) as u64);
    Some(Progress {
        downloaded_bytes: downloaded_bytes.unwrap_or(0),
        total_bytes,
    })
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (num_part, mult): (&str, u64) = if let Some(n) = s.strip_suffix("GiB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("MiB") {
        (n, 1024 * 1024)
    } else if let Some(n) = s.strip_suffix("KiB") {
        (n, 1024)
    } else if let Some(n) = s.strip_suffix('B') {
        (n, 1)
    } else {
        return None;
    };
    num_part.trim().parse::<f64>().ok().map(|v| (v * mult as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_lines() {
        let p = parse_progress_line("[download]  50.0% of 100.00MiB").unwrap();
        assert_eq!(p.total_bytes, Some(100 * 1024 * 1024));
        assert_eq!(p.downloaded_bytes, 50 * 1024 * 1024);
    }

    #[test]
    fn ignores_unrelated_lines() {
        assert!(parse_progress_line("some other output").is_none());
    }
}
