use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    config::{PreferencesStore, Settings},
    download_service::DownloadService,
    engine::{ProbeKind, SharedEngine, probe_guarded},
    error::AppError,
    models::{DownloadPreferences, MediaInfo},
};

/// Visibility of the bottom sheet. Independent from its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SheetValue {
    Hidden,
    Expanded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DialogAction {
    /// Expands the sheet. A single url jumps straight to fetching its
    /// formats; several go to the Configure page as one batch.
    ShowSheet {
        #[serde(default)]
        urls: Vec<String>,
    },
    HideSheet,
    FetchFormats { url: String },
    FetchPlaylist { url: String },
    DownloadWithPreset {
        url_list: Vec<String>,
        preferences: DownloadPreferences,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SheetState {
    InputUrl,
    Loading { action: DialogAction },
    Configure { url_list: Vec<String>, info: MediaInfo },
    Error { action: DialogAction, message: String },
}

#[derive(Debug, Clone)]
pub struct DialogOptions {
    /// Time the sheet needs to animate closed before its content is reset.
    pub reset_delay: Duration,
    pub probe_timeout: Option<Duration>,
}

impl Default for DialogOptions {
    fn default() -> Self {
        Self {
            reset_delay: Duration::from_millis(300),
            probe_timeout: None,
        }
    }
}

impl From<&Settings> for DialogOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            reset_delay: settings.dialog_reset_delay(),
            probe_timeout: settings.probe_timeout(),
        }
    }
}

/// Pre-submission workflow: collects urls, probes them and hands the final
/// selection to [`DownloadService::submit`].
///
/// Content results are tagged with a generation; a result from a superseded
/// request (newer fetch, or the sheet was hidden) is discarded.
pub struct DialogController {
    service: Arc<DownloadService>,
    engine: SharedEngine,
    preferences: Arc<dyn PreferencesStore>,
    options: DialogOptions,
    sheet_value: watch::Sender<SheetValue>,
    sheet_state: watch::Sender<SheetState>,
    pending: Mutex<Pending>,
}

#[derive(Default)]
struct Pending {
    generation: u64,
    resets: u64,
    cancel: Option<CancellationToken>,
}

impl Pending {
    fn supersede(&mut self) -> u64 {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.generation += 1;
        self.generation
    }
}

impl DialogController {
    pub fn new(
        service: Arc<DownloadService>,
        engine: SharedEngine,
        preferences: Arc<dyn PreferencesStore>,
        options: DialogOptions,
    ) -> Self {
        let (sheet_value, _) = watch::channel(SheetValue::Hidden);
        let (sheet_state, _) = watch::channel(SheetState::InputUrl);
        Self {
            service,
            engine,
            preferences,
            options,
            sheet_value,
            sheet_state,
            pending: Mutex::new(Pending::default()),
        }
    }

    pub fn sheet_value(&self) -> SheetValue {
        *self.sheet_value.borrow()
    }

    pub fn sheet_state(&self) -> SheetState {
        self.sheet_state.borrow().clone()
    }

    pub fn subscribe_value(&self) -> watch::Receiver<SheetValue> {
        self.sheet_value.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SheetState> {
        self.sheet_state.subscribe()
    }

    /// Defaults used to pre-fill the Configure page.
    pub fn preferences(&self) -> DownloadPreferences {
        self.preferences.snapshot()
    }

    /// Must be called from within a Tokio runtime.
    pub fn post_action(self: &Arc<Self>, action: DialogAction) -> Result<()> {
        debug!(?action, "dialog action");
        match action {
            DialogAction::ShowSheet { ref urls } => {
                self.pending.lock().expect("dialog mutex poisoned").resets += 1;
                self.sheet_value.send_replace(SheetValue::Expanded);
                match urls.as_slice() {
                    [] => Ok(()),
                    [url] => self.post_action(DialogAction::FetchFormats { url: url.clone() }),
                    _ => {
                        let url_list = urls.clone();
                        match url_list.iter().try_for_each(|u| validate_url(u)) {
                            Ok(()) => self.replace_content(SheetState::Configure {
                                url_list,
                                info: MediaInfo::default(),
                            }),
                            Err(err) => self.replace_content(SheetState::Error {
                                action,
                                message: format!("{err:#}"),
                            }),
                        }
                        Ok(())
                    }
                }
            }
            DialogAction::HideSheet => {
                self.hide();
                Ok(())
            }
            DialogAction::FetchFormats { ref url } => {
                let url = url.clone();
                self.fetch(action, url, ProbeKind::SingleVideo);
                Ok(())
            }
            DialogAction::FetchPlaylist { ref url } => {
                let url = url.clone();
                self.fetch(action, url, ProbeKind::Playlist);
                Ok(())
            }
            DialogAction::DownloadWithPreset {
                ref url_list,
                ref preferences,
            } => {
                let submitted = url_list
                    .iter()
                    .try_for_each(|u| validate_url(u))
                    .and_then(|_| self.service.submit(url_list, preferences.clone()));
                match submitted {
                    Ok(tasks) => {
                        info!(count = tasks.len(), "dialog submitted downloads");
                        self.post_action(DialogAction::HideSheet)
                    }
                    Err(err) => {
                        self.replace_content(SheetState::Error {
                            action,
                            message: format!("{err:#}"),
                        });
                        Err(err)
                    }
                }
            }
        }
    }

    /// Re-issues the action that produced the current `Error` page.
    pub fn retry(self: &Arc<Self>) -> Result<()> {
        let action = match &*self.sheet_state.borrow() {
            SheetState::Error { action, .. } => action.clone(),
            other => {
                return Err(AppError::InvalidInput(format!(
                    "nothing to retry in dialog state {other:?}"
                ))
                .into());
            }
        };
        self.post_action(action)
    }

    fn fetch(self: &Arc<Self>, action: DialogAction, url: String, kind: ProbeKind) {
        if let Err(err) = validate_url(&url) {
            self.replace_content(SheetState::Error {
                action,
                message: format!("{err:#}"),
            });
            return;
        }

        let cancel = CancellationToken::new();
        let generation = {
            let mut pending = self.pending.lock().expect("dialog mutex poisoned");
            let generation = pending.supersede();
            pending.cancel = Some(cancel.clone());
            self.sheet_state.send_replace(SheetState::Loading {
                action: action.clone(),
            });
            generation
        };

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = probe_guarded(
                this.engine.as_ref(),
                &url,
                kind,
                this.options.probe_timeout,
                &cancel,
            )
            .await;
            let next = match result {
                Err(err) if err.is_cancellation() => return,
                Err(err) => SheetState::Error {
                    action,
                    message: err.to_string(),
                },
                Ok(info) => configure_page(action, url, info),
            };
            this.set_if_current(generation, next);
        });
    }

    fn hide(self: &Arc<Self>) {
        let (generation, resets) = {
            let mut pending = self.pending.lock().expect("dialog mutex poisoned");
            pending.resets += 1;
            let generation = pending.supersede();
            // The fetch behind a Loading page was just cancelled and will
            // never replace it.
            if matches!(*self.sheet_state.borrow(), SheetState::Loading { .. }) {
                self.sheet_state.send_replace(SheetState::InputUrl);
            }
            (generation, pending.resets)
        };
        self.sheet_value.send_replace(SheetValue::Hidden);

        let this = Arc::clone(self);
        let delay = self.options.reset_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let pending = this.pending.lock().expect("dialog mutex poisoned");
            let untouched = pending.generation == generation && pending.resets == resets;
            if untouched && *this.sheet_value.borrow() == SheetValue::Hidden {
                this.sheet_state.send_replace(SheetState::InputUrl);
            }
        });
    }

    fn set_if_current(&self, generation: u64, state: SheetState) {
        let pending = self.pending.lock().expect("dialog mutex poisoned");
        if pending.generation == generation {
            self.sheet_state.send_replace(state);
        } else {
            debug!(generation, "dropping superseded dialog result");
        }
    }

    fn replace_content(&self, state: SheetState) {
        let mut pending = self.pending.lock().expect("dialog mutex poisoned");
        pending.supersede();
        self.sheet_state.send_replace(state);
    }
}

fn configure_page(action: DialogAction, url: String, info: MediaInfo) -> SheetState {
    if !matches!(action, DialogAction::FetchPlaylist { .. }) {
        return SheetState::Configure {
            url_list: vec![url],
            info,
        };
    }
    let url_list = info
        .entries
        .iter()
        .map(|e| e.url.clone())
        .filter(|u| !u.is_empty())
        .collect::<Vec<_>>();
    if url_list.is_empty() {
        return SheetState::Error {
            action,
            message: "playlist has no entries".to_string(),
        };
    }
    SheetState::Configure { url_list, info }
}

pub fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url.trim())
        .map_err(|e| AppError::InvalidInput(format!("invalid url {url}: {e}")))?;
    let scheme = parsed.scheme();
    if !matches!(scheme, "http" | "https") {
        return Err(AppError::InvalidInput(format!("unsupported scheme: {scheme}")).into());
    }
    Ok(())
}
