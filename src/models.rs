use std::{fmt, str::FromStr, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Identity of one submitted retrieval request. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub time_created: DateTime<Utc>,
}

impl Task {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            url: url.into(),
            time_created: Utc::now(),
        }
    }
}

/// The operation a task was performing when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    FetchInfo,
    Download,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchInfo => "fetch_info",
            Self::Download => "download",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DownloadState {
    Idle,
    FetchingInfo,
    ReadyWithInfo,
    Running {
        /// Ratio in `0.0..=1.0`.
        progress: f32,
        rate_bytes_per_sec: Option<u64>,
        eta_secs: Option<u64>,
    },
    Completed {
        file_path: String,
    },
    Error {
        message: String,
        action: TaskAction,
    },
    Canceled,
}

impl DownloadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingInfo => "fetching_info",
            Self::ReadyWithInfo => "ready_with_info",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Canceled => "canceled",
        }
    }

    /// Error and Canceled tasks can be started again as a fresh attempt.
    pub fn is_restartable(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Canceled)
    }

    pub fn is_removable(&self) -> bool {
        self.is_restartable() || matches!(self, Self::Completed { .. })
    }

    pub fn is_terminal(&self) -> bool {
        self.is_removable()
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn progress(&self) -> Option<f32> {
        match self {
            Self::Running { progress, .. } => Some(*progress),
            Self::Completed { .. } => Some(1.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub resolution: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub tbr: Option<f64>,
    pub abr: Option<f64>,
    pub file_size: Option<u64>,
    pub file_size_approx: Option<u64>,
}

impl MediaFormat {
    pub fn is_audio_only(&self) -> bool {
        let no_video = matches!(self.vcodec.as_deref(), None | Some("none"));
        let has_audio = !matches!(self.acodec.as_deref(), None | Some("none"));
        no_video && has_audio
    }

    pub fn has_video(&self) -> bool {
        !matches!(self.vcodec.as_deref(), None | Some("none"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistEntry {
    pub url: String,
    pub title: Option<String>,
}

/// Result of a metadata probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
    pub file_size_approx: Option<u64>,
    pub video_formats: Vec<MediaFormat>,
    pub audio_only_formats: Vec<MediaFormat>,
    pub extractor_key: Option<String>,
    pub webpage_url: Option<String>,
    pub entries: Vec<PlaylistEntry>,
}

impl MediaInfo {
    pub fn is_playlist(&self) -> bool {
        !self.entries.is_empty()
    }
}

/// Descriptive metadata of a task, filled in as it becomes known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub url: String,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub thumbnail_url: Option<String>,
    pub duration_secs: Option<f64>,
    pub file_size_approx: Option<u64>,
    pub video_formats: Vec<MediaFormat>,
    pub audio_only_formats: Vec<MediaFormat>,
    pub extractor_key: Option<String>,
}

impl ViewState {
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Known fields are only ever replaced by newer known values.
    pub fn merge(&mut self, info: &MediaInfo) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }
        take(&mut self.title, &info.title);
        take(&mut self.uploader, &info.uploader);
        take(&mut self.thumbnail_url, &info.thumbnail_url);
        take(&mut self.duration_secs, &info.duration_secs);
        take(&mut self.file_size_approx, &info.file_size_approx);
        take(&mut self.extractor_key, &info.extractor_key);
        if !info.video_formats.is_empty() {
            self.video_formats = info.video_formats.clone();
        }
        if !info.audio_only_formats.is_empty() {
            self.audio_only_formats = info.audio_only_formats.clone();
        }
        if let Some(url) = info.webpage_url.as_ref().filter(|u| !u.is_empty()) {
            self.url = url.clone();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskState {
    pub download_state: DownloadState,
    pub view_state: ViewState,
    /// Execution attempt counter, bumped on every restart.
    pub attempt: u32,
}

impl TaskState {
    pub fn idle(task: &Task) -> Self {
        Self {
            download_state: DownloadState::Idle,
            view_state: ViewState::for_url(&task.url),
            attempt: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadPreferences {
    pub extract_audio: bool,
    pub download_subtitle: bool,
    pub create_thumbnail: bool,
    pub format_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task: Task,
    pub state: TaskState,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskListSnapshot {
    /// Incremented on every registry mutation.
    pub revision: u64,
    /// Oldest first. Entries are shared with the registry and later snapshots.
    pub entries: Vec<Arc<TaskEntry>>,
}

impl TaskListSnapshot {
    pub fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        self.entries
            .iter()
            .find(|e| e.task.id == id)
            .map(Arc::as_ref)
    }

    pub fn state_of(&self, id: TaskId) -> Option<&DownloadState> {
        self.get(id).map(|e| &e.state.download_state)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskFilter {
    #[default]
    All,
    Downloading,
    Canceled,
    Finished,
}

impl TaskFilter {
    pub const ALL: [TaskFilter; 4] = [Self::All, Self::Downloading, Self::Canceled, Self::Finished];

    pub fn matches(&self, state: &DownloadState) -> bool {
        match self {
            Self::All => true,
            Self::Downloading => state.is_active(),
            Self::Canceled => state.is_restartable(),
            Self::Finished => matches!(state, DownloadState::Completed { .. }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    pub ts: i64,
    pub action: String,
    pub message: String,
}
