use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{ProbeKind, ProgressSink, ProgressUpdate, RetrievalEngine, RetrieveRequest},
    error::EngineError,
    events::EventEmitter,
    models::{DownloadState, MediaInfo, PlaylistEntry, TaskId, TaskListSnapshot},
    registry::TaskRegistry,
};

#[derive(Clone)]
pub enum ProbeScript {
    Info(MediaInfo),
    Fail(String),
    Hang,
}

#[derive(Clone)]
pub enum RetrieveScript {
    Complete { steps: Vec<f32>, path: String },
    Fail { steps: Vec<f32>, message: String },
    /// Reports `steps`, then waits for cancellation. With `fault_on_cancel`
    /// the engine answers the cancellation with a failure instead.
    HoldUntilCanceled { steps: Vec<f32>, fault_on_cancel: bool },
}

#[derive(Default)]
pub struct MockEngine {
    probes: Mutex<HashMap<String, ProbeScript>>,
    retrieves: Mutex<HashMap<String, VecDeque<RetrieveScript>>>,
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<RetrieveRequest>>,
}

impl MockEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_probe(&self, url: &str, script: ProbeScript) {
        self.probes
            .lock()
            .expect("probes mutex")
            .insert(url.to_string(), script);
    }

    pub fn on_retrieve(&self, url: &str, script: RetrieveScript) {
        self.retrieves
            .lock()
            .expect("retrieves mutex")
            .entry(url.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls mutex").clone()
    }

    /// Every retrieve request received, in call order.
    pub fn requests(&self) -> Vec<RetrieveRequest> {
        self.requests.lock().expect("requests mutex").clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn call(&self, name: String) {
        self.calls.lock().expect("calls mutex").push(name);
    }
}

pub fn info_for(url: &str) -> MediaInfo {
    MediaInfo {
        title: Some(format!("title of {url}")),
        uploader: Some("uploader".to_string()),
        webpage_url: Some(url.to_string()),
        ..MediaInfo::default()
    }
}

pub fn playlist_for(url: &str, urls: &[&str]) -> MediaInfo {
    MediaInfo {
        title: Some(format!("playlist {url}")),
        entries: urls
            .iter()
            .map(|u| PlaylistEntry {
                url: u.to_string(),
                title: None,
            })
            .collect(),
        ..MediaInfo::default()
    }
}

fn report_steps(progress: &ProgressSink, steps: &[f32]) {
    for step in steps {
        progress.report(ProgressUpdate::ratio(*step));
    }
}

#[async_trait]
impl RetrievalEngine for MockEngine {
    async fn probe(&self, url: &str, kind: ProbeKind) -> Result<MediaInfo, EngineError> {
        let tag = match kind {
            ProbeKind::SingleVideo => "probe",
            ProbeKind::Playlist => "probe_playlist",
        };
        self.call(format!("{tag}:{url}"));
        let script = self.probes.lock().expect("probes mutex").get(url).cloned();
        tokio::task::yield_now().await;
        match script {
            None => Ok(info_for(url)),
            Some(ProbeScript::Info(info)) => Ok(info),
            Some(ProbeScript::Fail(message)) => Err(EngineError::Probe(message)),
            Some(ProbeScript::Hang) => std::future::pending().await,
        }
    }

    async fn retrieve(
        &self,
        request: RetrieveRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        self.call(format!("retrieve:{}", request.url));
        self.requests
            .lock()
            .expect("requests mutex")
            .push(request.clone());
        let script = self
            .retrieves
            .lock()
            .expect("retrieves mutex")
            .get_mut(&request.url)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| RetrieveScript::Complete {
                steps: vec![0.25, 0.5, 1.0],
                path: format!("/downloads/{}.mp4", request.task_id),
            });
        match script {
            RetrieveScript::Complete { steps, path } => {
                report_steps(&progress, &steps);
                tokio::task::yield_now().await;
                Ok(path)
            }
            RetrieveScript::Fail { steps, message } => {
                report_steps(&progress, &steps);
                Err(EngineError::Retrieve(message))
            }
            RetrieveScript::HoldUntilCanceled {
                steps,
                fault_on_cancel,
            } => {
                report_steps(&progress, &steps);
                cancel.cancelled().await;
                if fault_on_cancel {
                    Err(EngineError::Retrieve("connection reset".to_string()))
                } else {
                    Err(EngineError::Canceled)
                }
            }
        }
    }
}

/// Keeps every emitted snapshot so tests can inspect full transition chains.
#[derive(Default)]
pub struct RecordingEmitter {
    snapshots: Mutex<Vec<TaskListSnapshot>>,
}

impl RecordingEmitter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Distinct consecutive state names a task went through.
    pub fn states_of(&self, id: TaskId) -> Vec<&'static str> {
        let snapshots = self.snapshots.lock().expect("snapshots mutex");
        let mut out: Vec<&'static str> = Vec::new();
        for state in snapshots.iter().filter_map(|s| s.state_of(id)) {
            if out.last() != Some(&state.as_str()) {
                out.push(state.as_str());
            }
        }
        out
    }

    pub fn progress_of(&self, id: TaskId) -> Vec<f32> {
        self.snapshots
            .lock()
            .expect("snapshots mutex")
            .iter()
            .filter_map(|s| match s.state_of(id) {
                Some(DownloadState::Running { progress, .. }) => Some(*progress),
                _ => None,
            })
            .collect()
    }

    /// Waits until every snapshot the registry has published so far has been
    /// delivered to this emitter.
    pub async fn caught_up(&self, registry: &TaskRegistry) {
        let target = registry.snapshot().revision;
        let wait = async {
            while self.revisions().last().copied().unwrap_or(0) < target {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("emitter never caught up with the registry");
    }

    pub fn revisions(&self) -> Vec<u64> {
        self.snapshots
            .lock()
            .expect("snapshots mutex")
            .iter()
            .map(|s| s.revision)
            .collect()
    }
}

impl EventEmitter for RecordingEmitter {
    fn emit_task_update(&self, snapshot: &TaskListSnapshot) -> Result<()> {
        self.snapshots
            .lock()
            .expect("snapshots mutex")
            .push(snapshot.clone());
        Ok(())
    }
}

/// Waits until the task's state satisfies `pred`, failing after five seconds.
pub async fn wait_for_state<F>(registry: &TaskRegistry, id: TaskId, pred: F) -> DownloadState
where
    F: Fn(Option<&DownloadState>) -> bool,
{
    let mut rx = registry.subscribe();
    let wait = async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                let state = snapshot.state_of(id);
                if pred(state) {
                    return state.cloned().unwrap_or(DownloadState::Idle);
                }
            }
            rx.changed().await.expect("registry dropped");
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for task state")
}

pub async fn wait_for_kind(registry: &TaskRegistry, id: TaskId, kind: &str) -> DownloadState {
    wait_for_state(registry, id, |s| s.map(DownloadState::as_str) == Some(kind)).await
}
