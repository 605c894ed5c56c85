pub mod commands;
pub mod config;
pub mod dialog;
pub mod download_service;
pub mod engine;
pub mod error;
pub mod events;
pub mod models;
pub mod registry;
pub mod runner;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use anyhow::Result;
use config::{PreferencesStore, Settings, SharedPreferences};
use dialog::{DialogController, DialogOptions};
use download_service::{DownloadService, ServiceOptions};
use engine::{SharedEngine, YtDlpEngine};
use events::SharedEmitter;
use registry::TaskRegistry;
use tracing::{info, warn};

pub struct BackendHandles {
    pub service: Arc<DownloadService>,
    pub dialog: Arc<DialogController>,
    pub preferences: Arc<SharedPreferences>,
    pub settings: Settings,
}

/// Wires the yt-dlp engine into a registry, orchestrator and dialog.
pub fn init_backend(settings: Settings, emitter: SharedEmitter) -> Result<BackendHandles> {
    settings.validate()?;
    std::fs::create_dir_all(&settings.download_dir)?;

    let engine = YtDlpEngine::new(&settings.yt_dlp_bin, &settings.download_dir);
    if engine.bin().components().count() > 1 && !engine.bin().exists() {
        warn!(
            bin = %engine.bin().display(),
            "yt-dlp binary not found, tasks will fail until it is installed"
        );
    }
    let engine: SharedEngine = Arc::new(engine);
    Ok(init_with_engine(settings, engine, emitter))
}

/// Same wiring as [`init_backend`] with a caller supplied engine.
pub fn init_with_engine(
    settings: Settings,
    engine: SharedEngine,
    emitter: SharedEmitter,
) -> BackendHandles {
    let registry = Arc::new(TaskRegistry::with_emitter(emitter));
    let service = Arc::new(DownloadService::new(
        registry,
        engine.clone(),
        ServiceOptions::from(&settings),
    ));
    let preferences = Arc::new(SharedPreferences::new(settings.preferences.clone()));
    let dialog = Arc::new(DialogController::new(
        service.clone(),
        engine,
        preferences.clone() as Arc<dyn PreferencesStore>,
        DialogOptions::from(&settings),
    ));
    info!(download_dir = %settings.download_dir.display(), "backend core initialized");

    BackendHandles {
        service,
        dialog,
        preferences,
        settings,
    }
}
