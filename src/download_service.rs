use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use chrono::Utc;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Settings,
    engine::SharedEngine,
    error::AppError,
    models::{
        DownloadPreferences, DownloadState, OperationLog, Task, TaskEntry, TaskFilter, TaskId,
        TaskListSnapshot, TaskState,
    },
    registry::TaskRegistry,
    runner::TaskRunner,
};

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub probe_timeout: Option<Duration>,
    pub log_capacity: usize,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            probe_timeout: None,
            log_capacity: 300,
        }
    }
}

impl From<&Settings> for ServiceOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            probe_timeout: settings.probe_timeout(),
            log_capacity: settings.operation_log_capacity,
        }
    }
}

/// Public task API: submit, cancel, remove and restart.
///
/// None of the operations wait for the retrieval itself; each one mutates the
/// registry and returns, leaving the long-running work to spawned runners.
pub struct DownloadService {
    registry: Arc<TaskRegistry>,
    engine: SharedEngine,
    options: ServiceOptions,
    submissions: Mutex<HashMap<TaskId, Submission>>,
    logs: Mutex<Vec<OperationLog>>,
}

struct Submission {
    preferences: DownloadPreferences,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl DownloadService {
    pub fn new(registry: Arc<TaskRegistry>, engine: SharedEngine, options: ServiceOptions) -> Self {
        Self {
            registry,
            engine,
            options,
            submissions: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Registers one `Idle` task per url and starts a runner for each.
    /// Must be called from within a Tokio runtime.
    pub fn submit(&self, urls: &[String], preferences: DownloadPreferences) -> Result<Vec<Task>> {
        if urls.is_empty() {
            return Err(AppError::InvalidInput("no urls submitted".to_string()).into());
        }
        if urls.iter().any(|u| u.trim().is_empty()) {
            return Err(AppError::InvalidInput("empty url in submission".to_string()).into());
        }

        let mut created = Vec::with_capacity(urls.len());
        for url in urls {
            let task = Task::new(url.trim());
            self.registry.upsert(task.clone(), TaskState::idle(&task));
            self.start_attempt(task.clone(), 1, preferences.clone());
            self.push_log("submit", format!("task {} created for {}", task.id, task.url));
            created.push(task);
        }
        info!(count = created.len(), "tasks submitted");
        Ok(created)
    }

    pub fn cancel(&self, id: TaskId) -> Result<()> {
        let entry = self
            .registry
            .entry(id)
            .ok_or_else(|| AppError::TaskNotFound(id.to_string()))?;
        if entry.state.download_state.is_terminal() {
            return Ok(());
        }

        if let Some(token) = self.cancel_token(id) {
            token.cancel();
        }
        let canceled = self.registry.update(id, |state| {
            if !state.download_state.is_active() {
                return false;
            }
            state.download_state = DownloadState::Canceled;
            true
        });
        if canceled {
            info!(task = %id, "task canceled");
            self.push_log("cancel", format!("canceled task {id}"));
        }
        Ok(())
    }

    /// Cancels any in-flight work, then drops the task. Removing an unknown
    /// task is a no-op.
    pub fn remove(&self, id: TaskId) -> Result<()> {
        let submission = self
            .submissions
            .lock()
            .expect("submissions mutex poisoned")
            .remove(&id);
        if let Some(submission) = submission {
            submission.cancel.cancel();
        }
        if self.registry.remove(id).is_some() {
            info!(task = %id, "task removed");
            self.push_log("remove", format!("removed task {id}"));
        }
        Ok(())
    }

    /// Starts a fresh attempt for a task in `Error` or `Canceled`, reusing its
    /// identity, url and preferences. Any other state is rejected with
    /// [`AppError::NotRestartable`] and left untouched.
    pub fn restart(&self, id: TaskId) -> Result<()> {
        let entry = self
            .registry
            .entry(id)
            .ok_or_else(|| AppError::TaskNotFound(id.to_string()))?;

        let mut attempt = None;
        let mut rejected_state = entry.state.download_state.as_str();
        self.registry.update(id, |state| {
            if !state.download_state.is_restartable() {
                rejected_state = state.download_state.as_str();
                return false;
            }
            state.attempt += 1;
            state.download_state = DownloadState::Idle;
            attempt = Some(state.attempt);
            true
        });
        let Some(attempt) = attempt else {
            return Err(AppError::NotRestartable {
                task_id: id.to_string(),
                state: rejected_state.to_string(),
            }
            .into());
        };

        let preferences = self
            .submissions
            .lock()
            .expect("submissions mutex poisoned")
            .get(&id)
            .map(|s| s.preferences.clone())
            .unwrap_or_default();
        self.start_attempt(entry.task, attempt, preferences);
        info!(task = %id, attempt, "task restarted");
        self.push_log("restart", format!("restarted task {id}, attempt={attempt}"));
        Ok(())
    }

    pub fn tasks(&self) -> Vec<TaskEntry> {
        self.registry.get()
    }

    pub fn list_tasks(&self, filter: TaskFilter) -> Vec<TaskEntry> {
        self.registry
            .get()
            .into_iter()
            .filter(|e| filter.matches(&e.state.download_state))
            .collect()
    }

    pub fn task(&self, id: TaskId) -> Result<TaskEntry> {
        self.registry
            .entry(id)
            .ok_or_else(|| AppError::TaskNotFound(id.to_string()).into())
    }

    pub fn snapshot(&self) -> Arc<TaskListSnapshot> {
        self.registry.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TaskListSnapshot>> {
        self.registry.subscribe()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Plain-text report for a failed task, suitable for pasting into a bug report.
    pub fn error_report(&self, id: TaskId) -> Result<String> {
        let entry = self.task(id)?;
        let DownloadState::Error { message, action } = &entry.state.download_state else {
            return Err(AppError::InvalidInput(format!(
                "task {id} has no error (state: {})",
                entry.state.download_state.as_str()
            ))
            .into());
        };
        Ok(format!(
            "{} {}\nURL: {}\nAction: {}\n{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            entry.task.url,
            action.as_str(),
            message
        ))
    }

    pub fn active_count(&self) -> usize {
        self.registry
            .snapshot()
            .entries
            .iter()
            .filter(|e| e.state.download_state.is_active())
            .count()
    }

    /// Cancels every in-flight runner and waits for all of them to exit.
    pub async fn shutdown(&self) {
        let handles = {
            let mut submissions = self.submissions.lock().expect("submissions mutex poisoned");
            submissions
                .values_mut()
                .filter_map(|s| {
                    s.cancel.cancel();
                    s.handle.take()
                })
                .collect::<Vec<_>>()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!("task runner ended abnormally: {err}");
            }
        }
        self.push_log("shutdown", "all runners stopped".to_string());
    }

    pub fn list_operation_logs(&self, limit: usize) -> Vec<OperationLog> {
        let logs = self.logs.lock().expect("operation logs mutex poisoned");
        let start = logs.len().saturating_sub(limit);
        logs[start..].to_vec()
    }

    pub fn clear_operation_logs(&self) {
        self.logs
            .lock()
            .expect("operation logs mutex poisoned")
            .clear();
    }

    fn start_attempt(&self, task: Task, attempt: u32, preferences: DownloadPreferences) {
        let id = task.id;
        let cancel = CancellationToken::new();
        let handle = TaskRunner::new(
            task,
            attempt,
            preferences.clone(),
            self.registry.clone(),
            self.engine.clone(),
            cancel.clone(),
        )
        .with_probe_timeout(self.options.probe_timeout)
        .spawn();

        let previous = self
            .submissions
            .lock()
            .expect("submissions mutex poisoned")
            .insert(
                id,
                Submission {
                    preferences,
                    cancel,
                    handle: Some(handle),
                },
            );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        // A concurrent remove may have run between the registry write and the
        // insert above; its runner exits on its first write, drop the leftovers.
        if !self.registry.contains(id) {
            let orphan = self
                .submissions
                .lock()
                .expect("submissions mutex poisoned")
                .remove(&id);
            if let Some(orphan) = orphan {
                orphan.cancel.cancel();
            }
        }
    }

    fn cancel_token(&self, id: TaskId) -> Option<CancellationToken> {
        self.submissions
            .lock()
            .expect("submissions mutex poisoned")
            .get(&id)
            .map(|s| s.cancel.clone())
    }

    fn push_log(&self, action: &str, message: String) {
        let entry = OperationLog {
            ts: Utc::now().timestamp(),
            action: action.to_string(),
            message,
        };
        let capacity = self.options.log_capacity.max(1);
        let mut guard = self.logs.lock().expect("operation logs mutex poisoned");
        guard.push(entry);
        if guard.len() > capacity {
            let drain = guard.len() - capacity;
            guard.drain(0..drain);
        }
    }
}
