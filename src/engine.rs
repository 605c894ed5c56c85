use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::EngineError,
    models::{DownloadPreferences, MediaFormat, MediaInfo, PlaylistEntry, TaskId},
};

const PROGRESS_PREFIX: &str = "__progress__";
const FILEPATH_PREFIX: &str = "__filepath__";
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    SingleVideo,
    Playlist,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub ratio: f32,
    pub rate_bytes_per_sec: Option<u64>,
    pub eta_secs: Option<u64>,
}

impl ProgressUpdate {
    pub fn ratio(ratio: f32) -> Self {
        Self {
            ratio,
            rate_bytes_per_sec: None,
            eta_secs: None,
        }
    }
}

/// Callback handed to an engine for progress reporting.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(ProgressUpdate) + Send + Sync>);

impl ProgressSink {
    pub fn new(f: impl Fn(ProgressUpdate) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn report(&self, update: ProgressUpdate) {
        (self.0)(update)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieveRequest {
    pub task_id: TaskId,
    pub url: String,
    pub preferences: DownloadPreferences,
}

/// Boundary to whatever actually fetches media.
///
/// `retrieve` must report non-decreasing ratios through `progress` and return
/// `EngineError::Canceled` promptly once `cancel` fires.
#[async_trait]
pub trait RetrievalEngine: Send + Sync {
    async fn probe(&self, url: &str, kind: ProbeKind) -> Result<MediaInfo, EngineError>;
    async fn retrieve(
        &self,
        request: RetrieveRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<String, EngineError>;
}

pub type SharedEngine = Arc<dyn RetrievalEngine>;

/// Probes `url`, giving up with `Canceled` once `cancel` fires and with
/// `Timeout` once `limit` elapses.
pub async fn probe_guarded(
    engine: &dyn RetrievalEngine,
    url: &str,
    kind: ProbeKind,
    limit: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<MediaInfo, EngineError> {
    let probe = engine.probe(url, kind);
    let guarded = async {
        match limit {
            Some(limit) => tokio::time::timeout(limit, probe)
                .await
                .map_err(|_| EngineError::Timeout(limit))?,
            None => probe.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(EngineError::Canceled),
        result = guarded => result,
    }
}

pub struct YtDlpEngine {
    bin: PathBuf,
    download_dir: PathBuf,
}

impl YtDlpEngine {
    pub fn new(bin: impl Into<PathBuf>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            download_dir: download_dir.into(),
        }
    }

    pub fn bin(&self) -> &Path {
        &self.bin
    }

    fn command(&self) -> Result<Command, EngineError> {
        let is_bare_name = self.bin.components().count() == 1;
        if !is_bare_name && !self.bin.exists() {
            return Err(EngineError::ToolMissing(self.bin.display().to_string()));
        }
        let mut command = Command::new(&self.bin);
        command.stdin(Stdio::null()).kill_on_drop(true);
        Ok(command)
    }

    fn spawn_error(&self, err: std::io::Error) -> EngineError {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::ToolMissing(self.bin.display().to_string())
        } else {
            EngineError::Io(err)
        }
    }
}

#[async_trait]
impl RetrievalEngine for YtDlpEngine {
    async fn probe(&self, url: &str, kind: ProbeKind) -> Result<MediaInfo, EngineError> {
        let mut command = self.command()?;
        command
            .arg("--dump-single-json")
            .arg("--no-warnings")
            .arg(match kind {
                ProbeKind::SingleVideo => "--no-playlist",
                ProbeKind::Playlist => "--flat-playlist",
            })
            .arg("--")
            .arg(url);
        debug!(url, ?kind, "probing media info");

        let output = command.output().await.map_err(|e| self.spawn_error(e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = tail_lines(stderr.lines(), STDERR_TAIL_LINES);
            return Err(EngineError::Probe(if detail.is_empty() {
                format!("yt-dlp exited with {}", output.status)
            } else {
                detail
            }));
        }
        let value: Value = serde_json::from_slice(&output.stdout)?;
        Ok(parse_media_info(&value))
    }

    async fn retrieve(
        &self,
        request: RetrieveRequest,
        progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<String, EngineError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        let mut command = self.command()?;
        command
            .args(build_download_args(&request, &self.download_dir))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = command.spawn().map_err(|e| self.spawn_error(e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Retrieve("yt-dlp stdout unavailable".to_string()))?;
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(collect_tail(s)));

        let mut lines = BufReader::new(stdout).lines();
        let mut output_path = None;
        let mut best_ratio = 0.0_f32;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(EngineError::Canceled);
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if let Some(mut update) = parse_progress_line(&line) {
                        // Separate video/audio streams each report 0..1.
                        if update.ratio < best_ratio {
                            update.ratio = best_ratio;
                        }
                        best_ratio = update.ratio;
                        progress.report(update);
                    } else if let Some(path) = parse_output_path(&line) {
                        output_path = Some(path);
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(EngineError::Canceled);
            }
            status = child.wait() => status?,
        };
        let stderr_tail = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if !status.success() {
            return Err(EngineError::Retrieve(if stderr_tail.is_empty() {
                format!("yt-dlp exited with {status}")
            } else {
                stderr_tail
            }));
        }
        output_path
            .ok_or_else(|| EngineError::Retrieve("yt-dlp did not report an output file".to_string()))
    }
}

pub fn build_download_args(request: &RetrieveRequest, download_dir: &Path) -> Vec<String> {
    let mut args = vec![
        "--newline".to_string(),
        "--progress".to_string(),
        "--no-warnings".to_string(),
        "--no-playlist".to_string(),
        "--progress-template".to_string(),
        format!(
            "download:{PROGRESS_PREFIX} %(progress.downloaded_bytes)s %(progress.total_bytes)s \
             %(progress.total_bytes_estimate)s %(progress.speed)s %(progress.eta)s"
        ),
        "--print".to_string(),
        format!("after_move:{FILEPATH_PREFIX} %(filepath)s"),
        "-P".to_string(),
        download_dir.to_string_lossy().to_string(),
        "-o".to_string(),
        "%(title).200B [%(id)s].%(ext)s".to_string(),
    ];
    let prefs = &request.preferences;
    if let Some(format_id) = prefs.format_id.as_deref().filter(|v| !v.trim().is_empty()) {
        args.push("-f".to_string());
        args.push(format_id.trim().to_string());
    }
    if prefs.extract_audio {
        args.push("-x".to_string());
    }
    if prefs.download_subtitle {
        args.push("--write-subs".to_string());
    }
    if prefs.create_thumbnail {
        args.push("--write-thumbnail".to_string());
    }
    args.push("--".to_string());
    args.push(request.url.clone());
    args
}

pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let rest = line.trim().strip_prefix(PROGRESS_PREFIX)?;
    let fields = rest.split_whitespace().collect::<Vec<_>>();
    let [downloaded, total, estimate, speed, eta] = fields.as_slice() else {
        return None;
    };
    let downloaded = parse_number(downloaded)?;
    let total = parse_number(total)
        .or_else(|| parse_number(estimate))
        .filter(|t| *t > 0.0)?;
    Some(ProgressUpdate {
        ratio: (downloaded / total).clamp(0.0, 1.0) as f32,
        rate_bytes_per_sec: parse_number(speed).map(|v| v as u64),
        eta_secs: parse_number(eta).map(|v| v as u64),
    })
}

pub fn parse_output_path(line: &str) -> Option<String> {
    line.trim()
        .strip_prefix(FILEPATH_PREFIX)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

pub fn parse_media_info(value: &Value) -> MediaInfo {
    let str_field = |v: &Value, key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .filter(|s| !s.is_empty())
    };
    let u64_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_f64).map(|n| n as u64);

    let mut info = MediaInfo {
        title: str_field(value, "title"),
        uploader: str_field(value, "uploader").or_else(|| str_field(value, "channel")),
        thumbnail_url: str_field(value, "thumbnail"),
        duration_secs: value.get("duration").and_then(Value::as_f64),
        file_size_approx: u64_field(value, "filesize_approx").or_else(|| u64_field(value, "filesize")),
        extractor_key: str_field(value, "extractor_key"),
        webpage_url: str_field(value, "webpage_url").or_else(|| str_field(value, "original_url")),
        ..MediaInfo::default()
    };

    for raw in value.get("formats").and_then(Value::as_array).into_iter().flatten() {
        let Some(format_id) = str_field(raw, "format_id") else {
            continue;
        };
        let format = MediaFormat {
            format_id,
            ext: str_field(raw, "ext"),
            resolution: str_field(raw, "resolution"),
            vcodec: str_field(raw, "vcodec"),
            acodec: str_field(raw, "acodec"),
            tbr: raw.get("tbr").and_then(Value::as_f64),
            abr: raw.get("abr").and_then(Value::as_f64),
            file_size: u64_field(raw, "filesize"),
            file_size_approx: u64_field(raw, "filesize_approx"),
        };
        if format.is_audio_only() {
            info.audio_only_formats.push(format);
        } else if format.has_video() {
            info.video_formats.push(format);
        }
    }

    for raw in value.get("entries").and_then(Value::as_array).into_iter().flatten() {
        let Some(url) = str_field(raw, "webpage_url").or_else(|| str_field(raw, "url")) else {
            continue;
        };
        info.entries.push(PlaylistEntry {
            url,
            title: str_field(raw, "title"),
        });
    }
    info
}

async fn collect_tail<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    tail_lines(tail.iter().map(String::as_str), STDERR_TAIL_LINES)
}

fn tail_lines<'a>(lines: impl Iterator<Item = &'a str>, max: usize) -> String {
    let kept = lines
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>();
    let start = kept.len().saturating_sub(max);
    kept[start..].join("\n")
}

pub fn resolve_yt_dlp_bin(base_dir: &Path) -> PathBuf {
    let exe = if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    };
    let mut candidates = vec![base_dir.join("bin").join(exe), base_dir.join(exe)];
    if cfg!(target_os = "macos") {
        candidates.push(PathBuf::from("/opt/homebrew/bin/yt-dlp"));
        candidates.push(PathBuf::from("/usr/local/bin/yt-dlp"));
    }
    if cfg!(target_os = "linux") {
        candidates.push(PathBuf::from("/usr/bin/yt-dlp"));
        candidates.push(PathBuf::from("/usr/local/bin/yt-dlp"));
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        candidates.extend(std::env::split_paths(&path_var).map(|dir| dir.join(exe)));
    }
    candidates
        .into_iter()
        .find(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from(exe))
}
