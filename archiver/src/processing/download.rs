//! The download phase: per-attempt adapter invocation, progress
//! persistence, cancellation, and the wrapper retry policy.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use archiver_log::log;
use rand::Rng;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::adapters::{DownloadCtx, Downloader, Progress, ProgressSink};
use crate::db::types::Vod;
use crate::db::Db;
use crate::error::{classify, Severity};
use crate::ids::VodRowId;

/// Registry of per-VOD cancellation handles so an external request can
/// abort an in-flight download attempt. Cancellation leaves the partial
/// file on disk so resumption is possible on retry.
#[derive(Clone, Debug, Default)]
pub struct CancelRegistry {
    handles: Arc<Mutex<HashMap<i64, CancellationToken>>>,
}

impl CancelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the in-flight attempt for `vod_id`, if any is registered.
    pub async fn cancel(&self, vod_id: VodRowId) {
        if let Some(token) = self.handles.lock().await.get(&vod_id.0) {
            token.cancel();
        }
    }

    async fn register(&self, vod_id: VodRowId) -> CancellationToken {
        let token = CancellationToken::new();
        let _ = self.handles.lock().await.insert(vod_id.0, token.clone());
        token
    }

    async fn unregister(&self, vod_id: VodRowId) {
        let _ = self.handles.lock().await.remove(&vod_id.0);
    }
}

/// Outcome of the whole retrying download phase.
pub enum DownloadOutcome {
    Success { path: PathBuf, elapsed: Duration },
    Fatal { message: String },
    Exhausted { message: String },
}

/// Runs the download phase for `vod`: up to `max_attempts`, with
/// `base · 2^n + jitter[0, base)` backoff between attempts, aborting
/// immediately on a [`Severity::Fatal`] classification.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    downloader: &dyn Downloader,
    db: &Db,
    vod: &Vod,
    data_dir: &Path,
    max_attempts: u32,
    backoff_base: Duration,
    cancel_registry: &CancelRegistry,
    shutdown: &CancellationToken,
) -> DownloadOutcome {
    let started = Instant::now();
    let mut last_error = String::new();

    for attempt in 0..max_attempts {
        if shutdown.is_cancelled() {
            return DownloadOutcome::Exhausted {
                message: "shutdown requested".into(),
            };
        }

        let cancel = cancel_registry.register(vod.id).await;
        let result = attempt_once(downloader, db, vod, data_dir, cancel).await;
        cancel_registry.unregister(vod.id).await;

        match result {
            Ok(path) => {
                return DownloadOutcome::Success {
                    path,
                    elapsed: started.elapsed(),
                };
            }
            Err(message) => {
                let severity = classify(&message);
                last_error = message;
                if severity == Severity::Fatal {
                    return DownloadOutcome::Fatal { message: last_error };
                }
                if attempt + 1 >= max_attempts {
                    break;
                }
                let jitter_max = (backoff_base.as_millis() as u64).max(1);
                let wait = backoff_base * 2_u32.saturating_pow(attempt)
                    + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_max));
                log::warn!(
                    "download attempt {} for {} failed ({}, {}): retrying in {:?}",
                    attempt + 1, vod.upstream_vod_id, severity, last_error, wait,
                );
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(wait) => {}
                }
            }
        }
    }

    DownloadOutcome::Exhausted { message: last_error }
}

async fn attempt_once(
    downloader: &dyn Downloader,
    db: &Db,
    vod: &Vod,
    data_dir: &Path,
    cancel: CancellationToken,
) -> Result<PathBuf, String> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Progress>();
    let sink: ProgressSink = Arc::new(move |p| {
        let _ = tx.send(p);
    });

    let db2 = db.clone();
    let vod_id = vod.id;
    let persister = tokio::spawn(async move {
        let mut last_persisted = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap_or_else(Instant::now);
        let mut final_progress: Option<Progress> = None;
        while let Some(p) = rx.recv().await {
            final_progress = Some(p);
            if last_persisted.elapsed() >= Duration::from_secs(1) {
                let _ = db2
                    .update_progress(vod_id, p.downloaded_bytes as i64, p.total_bytes.map(|t| t as i64))
                    .await;
                last_persisted = Instant::now();
            }
        }
        if let Some(p) = final_progress {
            let _ = db2
                .update_progress(vod_id, p.downloaded_bytes as i64, p.total_bytes.map(|t| t as i64))
                .await;
        }
    });

    let ctx = DownloadCtx {
        upstream_vod_id: vod.upstream_vod_id.clone(),
        data_dir: data_dir.to_path_buf(),
        cancel,
        progress: sink,
    };
    let result = downloader.download(ctx).await;
    let _ = persister.await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_round_trips() {
        let registry = CancelRegistry::new();
        let id = VodRowId(1);
        let token = registry.register(id).await;
        assert!(!token.is_cancelled());
        registry.cancel(id).await;
        assert!(token.is_cancelled());
        registry.unregister(id).await;
    }
}
