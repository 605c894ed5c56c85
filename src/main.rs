use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, bail};
use clap::Parser;
use media_task_downloader::{
    config::Settings,
    dialog::{DialogAction, DialogController, SheetState, validate_url},
    download_service::DownloadService,
    events::{SharedEmitter, StdoutEventEmitter},
    init_backend,
    models::{DownloadState, TaskListSnapshot},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Downloads media pages through yt-dlp, streaming task snapshots to stdout.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Media page url(s) to download.
    #[arg(required = true, num_args = 1..)]
    urls: Vec<String>,

    /// Settings file. Defaults to `<config dir>/media-task-downloader/settings.json`.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory downloaded files are written to.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Path of the yt-dlp executable.
    #[arg(long)]
    yt_dlp: Option<PathBuf>,

    /// Extract the audio track only.
    #[arg(long)]
    audio: bool,

    #[arg(long)]
    subtitles: bool,

    #[arg(long)]
    thumbnail: bool,

    /// Explicit yt-dlp format selector, e.g. `137+140`.
    #[arg(short, long)]
    format: Option<String>,

    /// Treat every url as a playlist and download its entries.
    #[arg(long)]
    playlist: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let base_dir = std::env::current_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| default_config_path(&base_dir));
    let mut settings = Settings::load_or_default(&config_path, &base_dir)?;
    settings.apply_env_overrides();
    apply_args(&mut settings, &args);

    let emitter = Arc::new(StdoutEventEmitter) as SharedEmitter;
    let handles = init_backend(settings, emitter)?;
    let preferences = handles.dialog.preferences();

    if args.playlist {
        let mut url_list = Vec::new();
        for url in &args.urls {
            url_list.extend(resolve_playlist(&handles.dialog, url).await?);
        }
        info!(entries = url_list.len(), "playlists resolved");
        handles.dialog.post_action(DialogAction::DownloadWithPreset {
            url_list,
            preferences,
        })?;
    } else {
        for url in &args.urls {
            validate_url(url)?;
        }
        handles.service.submit(&args.urls, preferences)?;
    }

    let snapshot = tokio::select! {
        settled = wait_until_settled(&handles.service) => settled?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, canceling downloads");
            handles.service.shutdown().await;
            handles.service.snapshot()
        }
    };
    report(&handles.service, &snapshot)
}

fn default_config_path(base_dir: &Path) -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("media-task-downloader"))
        .unwrap_or_else(|| base_dir.to_path_buf())
        .join("settings.json")
}

fn apply_args(settings: &mut Settings, args: &Args) {
    if let Some(dir) = &args.output_dir {
        settings.download_dir = dir.clone();
    }
    if let Some(bin) = &args.yt_dlp {
        settings.yt_dlp_bin = bin.clone();
    }
    let preferences = &mut settings.preferences;
    preferences.extract_audio |= args.audio;
    preferences.download_subtitle |= args.subtitles;
    preferences.create_thumbnail |= args.thumbnail;
    if args.format.is_some() {
        preferences.format_id = args.format.clone();
    }
}

async fn resolve_playlist(dialog: &Arc<DialogController>, url: &str) -> Result<Vec<String>> {
    let mut rx = dialog.subscribe_state();
    dialog.post_action(DialogAction::FetchPlaylist {
        url: url.to_string(),
    })?;
    loop {
        match &*rx.borrow_and_update() {
            SheetState::Configure { url_list, .. } => return Ok(url_list.clone()),
            SheetState::Error { message, .. } => bail!("failed to resolve playlist {url}: {message}"),
            SheetState::InputUrl | SheetState::Loading { .. } => {}
        }
        rx.changed().await?;
    }
}

async fn wait_until_settled(service: &DownloadService) -> Result<Arc<TaskListSnapshot>> {
    let mut rx = service.subscribe();
    loop {
        {
            let snapshot = rx.borrow_and_update();
            let settled = !snapshot.is_empty()
                && snapshot
                    .entries
                    .iter()
                    .all(|e| e.state.download_state.is_terminal());
            if settled {
                return Ok(snapshot.clone());
            }
        }
        rx.changed().await?;
    }
}

fn report(service: &DownloadService, snapshot: &TaskListSnapshot) -> Result<()> {
    let mut failed = 0usize;
    for entry in &snapshot.entries {
        match &entry.state.download_state {
            DownloadState::Completed { file_path } => eprintln!("done      {file_path}"),
            DownloadState::Error { .. } => {
                failed += 1;
                let report = service.error_report(entry.task.id)?;
                eprintln!("failed    {}\n{report}", entry.task.url);
            }
            other => eprintln!("{:<9} {}", other.as_str(), entry.task.url),
        }
    }
    if failed > 0 {
        bail!("{failed} of {} downloads failed", snapshot.len());
    }
    Ok(())
}
