//! Chat recorder and auto-orchestrator: the two cooperating loops that
//! capture live chat under a placeholder VOD id and later reconcile it to
//! the real, upstream-assigned one.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use archiver_log::log;
use backoff::backoff::Backoff as _;
use backoff::ExponentialBackoff;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::adapters::ChatTransport;
use crate::db::types::NewChatMessage;
use crate::db::Db;
use crate::ids::UpstreamVodId;
use crate::video_api::{VideoApi, VideoApiError};

/// Wait applied to a `429` with no `Retry-After` hint.
const DEFAULT_RATE_LIMIT_WAIT: StdDuration = StdDuration::from_secs(30);

/// Window within which a candidate real VOD's `started_at` must fall of the
/// placeholder's observed start time to be considered a match.
const CANDIDATE_WINDOW: chrono::Duration = chrono::Duration::minutes(10);

/// How long the orchestrator keeps retrying reconciliation before giving up
/// and abandoning the placeholder.
const RECONCILE_WINDOW: StdDuration = StdDuration::from_secs(15 * 60);

/// Connects to the chat transport and persists every message under
/// `vod_id` (which may be a placeholder), reconnecting on loss with capped
/// exponential backoff. Exits when `cancel` fires.
pub async fn record(
    db: Db,
    transport: Arc<dyn ChatTransport>,
    vod_id: String,
    stream_start_time: DateTime<Utc>,
    cancel: CancellationToken,
) {
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    };

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut session = match transport.connect().await {
            Ok(session) => {
                backoff.reset();
                session
            }
            Err(e) => {
                let wait = backoff.next_backoff().unwrap_or(StdDuration::from_secs(30));
                log::warn!(
                    "chat transport connect failed for {}: {} (retrying in {:?})",
                    vod_id, e, wait,
                );
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(wait) => {}
                }
                continue;
            }
        };

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => return,
                msg = session.recv() => msg,
            };
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("chat session lost for {}: {}", vod_id, e);
                    break;
                }
            };

            let now = Utc::now();
            let relative = (now - stream_start_time).num_milliseconds() as f64 / 1000.0;
            let message = NewChatMessage {
                vod_id: vod_id.clone(),
                username: event.username,
                text: event.text,
                badges: event.badges,
                emotes: event.emotes,
                color: event.color,
                reply_to_id: event.reply_to.as_ref().map(|r| r.id.clone()),
                reply_to_username: event.reply_to.as_ref().map(|r| r.username.clone()),
                reply_to_text: event.reply_to.as_ref().map(|r| r.text.clone()),
                absolute_timestamp: now,
                relative_timestamp: relative.max(0.0),
            };
            if let Err(e) = db.insert_chat(&message).await {
                log::error!("failed to persist chat message for {}: {}", vod_id, e);
            }
        }
    }
}

/// Sleeps the hinted `Retry-After` duration (or [`DEFAULT_RATE_LIMIT_WAIT`]
/// if the API gave no hint), racing the sleep against `token` so a shutdown
/// isn't delayed by it.
async fn rate_limited_wait(hint: Option<StdDuration>, token: &CancellationToken) {
    let wait = hint.unwrap_or(DEFAULT_RATE_LIMIT_WAIT);
    log::warn!("video API rate limited, waiting {:?}", wait);
    tokio::select! {
        () = token.cancelled() => {}
        () = tokio::time::sleep(wait) => {}
    }
}

/// In-memory state of the auto-orchestrator's poller.
enum State {
    Idle,
    Recording {
        placeholder_id: String,
        observed_start_time: DateTime<Utc>,
        recorder_cancel: CancellationToken,
    },
    Reconciling {
        placeholder_id: String,
        observed_start_time: DateTime<Utc>,
        deadline: DateTime<Utc>,
    },
}

/// Drives the Idle → Recording → Reconciling → Idle state machine described
/// in the chat-recorder component design.
pub struct AutoOrchestrator {
    db: Db,
    video_api: Arc<dyn VideoApi>,
    transport: Arc<dyn ChatTransport>,
    channel: String,
    channel_id: String,
    poll_interval: StdDuration,
    reconcile_delay: StdDuration,
    state: State,
}

impl AutoOrchestrator {
    #[must_use]
    pub fn new(
        db: Db,
        video_api: Arc<dyn VideoApi>,
        transport: Arc<dyn ChatTransport>,
        channel: String,
        channel_id: String,
        poll_interval: StdDuration,
        reconcile_delay: StdDuration,
    ) -> Self {
        Self {
            db,
            video_api,
            transport,
            channel,
            channel_id,
            poll_interval,
            reconcile_delay,
            state: State::Idle,
        }
    }

    /// Runs the poller loop until `token` is cancelled. On startup, checks
    /// for a placeholder row left behind by a crash and, if found, resumes
    /// directly in `Reconciling` — never `Recording`, since no live session
    /// is actually active.
    pub async fn run(mut self, token: CancellationToken) {
        if let Some(resumed) = self.find_orphaned_placeholder().await {
            log::warn!(
                "resuming orphaned placeholder {} in Reconciling state after restart",
                resumed.0,
            );
            self.state = State::Reconciling {
                placeholder_id: resumed.0,
                observed_start_time: resumed.1,
                deadline: Utc::now() + chrono::Duration::from_std(RECONCILE_WINDOW).unwrap_or_default(),
            };
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    if let State::Recording { recorder_cancel, .. } = &self.state {
                        recorder_cancel.cancel();
                    }
                    log::info!("chat auto-orchestrator for {} shutting down", self.channel);
                    return;
                }
                _ = ticker.tick() => {
                    self.tick(&token).await;
                }
            }
        }
    }

    async fn find_orphaned_placeholder(&self) -> Option<(String, DateTime<Utc>)> {
        match self.db.find_placeholder_vod(&self.channel).await {
            Ok(Some(row)) => Some((row.upstream_vod_id, row.stream_start_time)),
            Ok(None) => None,
            Err(e) => {
                log::error!(
                    "failed to check for an orphaned placeholder in {}: {}",
                    self.channel, e,
                );
                None
            }
        }
    }

    async fn tick(&mut self, token: &CancellationToken) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.tick_idle(token).await,
            State::Recording {
                placeholder_id,
                observed_start_time,
                recorder_cancel,
            } => {
                self.tick_recording(placeholder_id, observed_start_time, recorder_cancel, token)
                    .await;
            }
            State::Reconciling {
                placeholder_id,
                observed_start_time,
                deadline,
            } => {
                self.tick_reconciling(placeholder_id, observed_start_time, deadline, token)
                    .await;
            }
        }
    }

    async fn tick_idle(&mut self, token: &CancellationToken) {
        let live = match self.video_api.is_live(&self.channel_id).await {
            Ok(status) => status,
            Err(VideoApiError::RateLimited(hint)) => {
                rate_limited_wait(hint, token).await;
                self.state = State::Idle;
                return;
            }
            Err(e) => {
                log::warn!("is_live check failed for {}: {}", self.channel, e);
                self.state = State::Idle;
                return;
            }
        };
        if !live.live {
            self.state = State::Idle;
            return;
        }
        let observed_start_time = live.started_at.unwrap_or_else(Utc::now);
        let placeholder_id = UpstreamVodId::placeholder(observed_start_time.timestamp()).0;

        let upsert = crate::db::types::VodUpsert {
            channel: self.channel.clone(),
            upstream_vod_id: placeholder_id.clone(),
            title: Some(String::new()),
            stream_start_time: Some(observed_start_time),
            duration_seconds: Some(0),
        };
        if let Err(e) = self.db.upsert_vod(&upsert).await {
            log::error!("failed to create placeholder VOD {}: {}", placeholder_id, e);
            self.state = State::Idle;
            return;
        }

        let recorder_cancel = CancellationToken::new();
        tokio::spawn(record(
            self.db.clone(),
            self.transport.clone(),
            placeholder_id.clone(),
            observed_start_time,
            recorder_cancel.clone(),
        ));
        log::info!("started chat recording for placeholder {}", placeholder_id);

        self.state = State::Recording {
            placeholder_id,
            observed_start_time,
            recorder_cancel,
        };
    }

    async fn tick_recording(
        &mut self,
        placeholder_id: String,
        observed_start_time: DateTime<Utc>,
        recorder_cancel: CancellationToken,
        token: &CancellationToken,
    ) {
        let live = match self.video_api.is_live(&self.channel_id).await {
            Ok(status) => status,
            Err(VideoApiError::RateLimited(hint)) => {
                rate_limited_wait(hint, token).await;
                self.state = State::Recording {
                    placeholder_id,
                    observed_start_time,
                    recorder_cancel,
                };
                return;
            }
            Err(e) => {
                log::warn!("is_live check failed for {}: {}", self.channel, e);
                self.state = State::Recording {
                    placeholder_id,
                    observed_start_time,
                    recorder_cancel,
                };
                return;
            }
        };
        if live.live {
            self.state = State::Recording {
                placeholder_id,
                observed_start_time,
                recorder_cancel,
            };
            return;
        }

        recorder_cancel.cancel();
        log::info!(
            "stream for {} went offline; waiting {:?} before reconciling {}",
            self.channel, self.reconcile_delay, placeholder_id,
        );
        tokio::select! {
            () = token.cancelled() => {}
            () = tokio::time::sleep(self.reconcile_delay) => {}
        }

        self.state = State::Reconciling {
            placeholder_id,
            observed_start_time,
            deadline: Utc::now() + chrono::Duration::from_std(RECONCILE_WINDOW).unwrap_or_default(),
        };
    }

    async fn tick_reconciling(
        &mut self,
        placeholder_id: String,
        observed_start_time: DateTime<Utc>,
        deadline: DateTime<Utc>,
        token: &CancellationToken,
    ) {
        let page = match self.video_api.list_videos(&self.channel_id, None).await {
            Ok(page) => page,
            Err(VideoApiError::RateLimited(hint)) => {
                rate_limited_wait(hint, token).await;
                self.state = State::Reconciling {
                    placeholder_id,
                    observed_start_time,
                    deadline,
                };
                return;
            }
            Err(e) => {
                log::warn!("listing videos during reconciliation failed: {}", e);
                self.state = State::Reconciling {
                    placeholder_id,
                    observed_start_time,
                    deadline,
                };
                return;
            }
        };

        if let Some(candidate) = select_candidate(&page.items, observed_start_time) {
            let shift = (candidate.stream_start_time - observed_start_time).num_milliseconds() as f64
                / 1000.0;
            match self
                .db
                .reconcile_placeholder(
                    &self.channel,
                    &placeholder_id,
                    &candidate.id,
                    &candidate.title,
                    candidate.duration_seconds,
                    candidate.stream_start_time,
                    -shift,
                )
                .await
            {
                Ok(rebound) => {
                    log::info!(
                        "reconciled placeholder {} to {} ({} chat rows rebound, shift {:.1}s)",
                        placeholder_id, candidate.id, rebound, -shift,
                    );
                }
                Err(e) => {
                    log::error!("reconciliation of {} failed: {}", placeholder_id, e);
                }
            }
            self.state = State::Idle;
            return;
        }

        if Utc::now() >= deadline {
            log::warn!(
                "reconciliation window for {} expired without a match; abandoning placeholder",
                placeholder_id,
            );
            self.state = State::Idle;
            return;
        }

        self.state = State::Reconciling {
            placeholder_id,
            observed_start_time,
            deadline,
        };
    }
}

/// Picks the upstream VOD whose `stream_start_time` is closest to
/// `observed_start_time`, not in the future, and within
/// [`CANDIDATE_WINDOW`]. Returns `None` if no candidate qualifies.
fn select_candidate(
    candidates: &[crate::video_api::VideoSummary],
    observed_start_time: DateTime<Utc>,
) -> Option<&crate::video_api::VideoSummary> {
    let now = Utc::now();
    let window_ms = CANDIDATE_WINDOW.num_milliseconds();
    candidates
        .iter()
        .filter(|v| v.stream_start_time <= now)
        .filter(|v| {
            (v.stream_start_time - observed_start_time).num_milliseconds().abs() <= window_ms
        })
        .min_by_key(|v| (v.stream_start_time - observed_start_time).num_milliseconds().abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_api::VideoSummary;

    fn video(id: &str, start: DateTime<Utc>) -> VideoSummary {
        VideoSummary {
            id: id.to_owned(),
            title: "t".into(),
            stream_start_time: start,
            duration_seconds: 3600,
        }
    }

    #[test]
    fn selects_closest_candidate_within_window() {
        let observed = Utc::now() - chrono::Duration::minutes(20);
        let far = video("far", observed - chrono::Duration::minutes(9));
        let close = video("close", observed - chrono::Duration::seconds(3));
        let candidates = vec![far, close];
        let picked = select_candidate(&candidates, observed).unwrap();
        assert_eq!(picked.id, "close");
    }

    #[test]
    fn rejects_candidates_outside_window() {
        let observed = Utc::now() - chrono::Duration::minutes(30);
        let too_far = video("too-far", observed - chrono::Duration::minutes(11));
        assert!(select_candidate(&[too_far], observed).is_none());
    }

    #[test]
    fn rejects_future_candidates() {
        let observed = Utc::now();
        let future = video("future", observed + chrono::Duration::minutes(1));
        assert!(select_candidate(&[future], observed).is_none());
    }
}
