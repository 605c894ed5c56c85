use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    engine::{
        ProbeKind, ProgressSink, ProgressUpdate, RetrieveRequest, SharedEngine, probe_guarded,
    },
    error::EngineError,
    models::{DownloadPreferences, DownloadState, MediaInfo, Task, TaskAction, TaskState},
    registry::TaskRegistry,
};

/// Drives a single execution attempt of one task:
/// `Idle -> FetchingInfo -> ReadyWithInfo -> Running -> Completed`, ending in
/// `Error` or `Canceled` when the attempt fails or is aborted.
///
/// Writes go through [`TaskRegistry::update`] and are dropped once the task is
/// removed, once a newer attempt owns the task, or once the task has left the
/// active states. After cancellation only `Canceled` may still be written.
pub struct TaskRunner {
    task: Task,
    attempt: u32,
    preferences: DownloadPreferences,
    registry: Arc<TaskRegistry>,
    engine: SharedEngine,
    cancel: CancellationToken,
    probe_timeout: Option<Duration>,
}

type AttemptResult = Result<String, (TaskAction, EngineError)>;

impl TaskRunner {
    pub fn new(
        task: Task,
        attempt: u32,
        preferences: DownloadPreferences,
        registry: Arc<TaskRegistry>,
        engine: SharedEngine,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task,
            attempt,
            preferences,
            registry,
            engine,
            cancel,
            probe_timeout: None,
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.probe_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let outcome = self.drive().await;
        self.finish(outcome);
    }

    async fn drive(&self) -> AttemptResult {
        if self.cancel.is_cancelled() || !self.transition(DownloadState::FetchingInfo) {
            return Err((TaskAction::FetchInfo, EngineError::Canceled));
        }
        let info = self
            .probe()
            .await
            .map_err(|e| (TaskAction::FetchInfo, e))?;

        let owned = self.apply(false, |state| {
            state.view_state.merge(&info);
            state.download_state = DownloadState::ReadyWithInfo;
            true
        });
        let running = DownloadState::Running {
            progress: 0.0,
            rate_bytes_per_sec: None,
            eta_secs: None,
        };
        if !owned || !self.transition(running) {
            return Err((TaskAction::Download, EngineError::Canceled));
        }

        let request = RetrieveRequest {
            task_id: self.task.id,
            url: self.task.url.clone(),
            preferences: self.preferences.clone(),
        };
        let retrieval = self
            .engine
            .retrieve(request, self.progress_sink(), self.cancel.clone());
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Canceled),
            result = retrieval => result,
        };
        result.map_err(|e| (TaskAction::Download, e))
    }

    async fn probe(&self) -> Result<MediaInfo, EngineError> {
        probe_guarded(
            self.engine.as_ref(),
            &self.task.url,
            ProbeKind::SingleVideo,
            self.probe_timeout,
            &self.cancel,
        )
        .await
    }

    fn finish(&self, outcome: AttemptResult) {
        let next = match outcome {
            _ if self.cancel.is_cancelled() => DownloadState::Canceled,
            Ok(file_path) => DownloadState::Completed { file_path },
            Err((_, err)) if err.is_cancellation() => DownloadState::Canceled,
            Err((action, err)) => {
                warn!(task = %self.task.id, action = action.as_str(), "task failed: {err}");
                DownloadState::Error {
                    message: err.to_string(),
                    action,
                }
            }
        };
        info!(task = %self.task.id, attempt = self.attempt, state = next.as_str(), "task attempt finished");
        self.transition(next);
    }

    /// Returns false when this runner no longer owns the task.
    fn transition(&self, next: DownloadState) -> bool {
        debug!(task = %self.task.id, state = next.as_str(), "task transition");
        let allow_after_cancel = next == DownloadState::Canceled;
        self.apply(allow_after_cancel, |state| {
            if state.download_state == next {
                return false;
            }
            state.download_state = next;
            true
        })
    }

    fn apply<F>(&self, allow_after_cancel: bool, f: F) -> bool
    where
        F: FnOnce(&mut TaskState) -> bool,
    {
        let mut owned = false;
        self.registry.update(self.task.id, |state| {
            if !accepts_write(state, self.attempt, &self.cancel, allow_after_cancel) {
                return false;
            }
            owned = true;
            f(state)
        });
        owned
    }

    fn progress_sink(&self) -> ProgressSink {
        let registry = self.registry.clone();
        let id = self.task.id;
        let attempt = self.attempt;
        let cancel = self.cancel.clone();
        ProgressSink::new(move |update: ProgressUpdate| {
            registry.update(id, |state| {
                if !accepts_write(state, attempt, &cancel, false) {
                    return false;
                }
                let DownloadState::Running { progress, .. } = state.download_state else {
                    return false;
                };
                let next = DownloadState::Running {
                    progress: update.ratio.clamp(0.0, 1.0).max(progress),
                    rate_bytes_per_sec: update.rate_bytes_per_sec,
                    eta_secs: update.eta_secs,
                };
                if state.download_state == next {
                    return false;
                }
                state.download_state = next;
                true
            });
        })
    }
}

/// A runner may only touch its own attempt while the task is still active.
/// The cancellation check happens under the registry lock, so any write that
/// races with `cancel()` either lands before the `Canceled` state or not at all.
fn accepts_write(
    state: &TaskState,
    attempt: u32,
    cancel: &CancellationToken,
    allow_after_cancel: bool,
) -> bool {
    state.attempt == attempt
        && state.download_state.is_active()
        && (allow_after_cancel || !cancel.is_cancelled())
}
