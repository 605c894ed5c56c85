use std::sync::Arc;

use anyhow::Result;

use crate::{
    dialog::{DialogAction, DialogController, SheetState, SheetValue},
    download_service::DownloadService,
    error::AppError,
    models::{DownloadPreferences, OperationLog, Task, TaskEntry, TaskFilter, TaskId},
};

fn parse_task_id(task_id: &str) -> Result<TaskId> {
    task_id
        .parse::<TaskId>()
        .map_err(|e| AppError::InvalidInput(format!("invalid task id {task_id}: {e}")).into())
}

pub fn submit_urls(
    service: Arc<DownloadService>,
    urls: Vec<String>,
    preferences: Option<DownloadPreferences>,
) -> Result<Vec<Task>> {
    service.submit(&urls, preferences.unwrap_or_default())
}

pub fn cancel_task(service: Arc<DownloadService>, task_id: String) -> Result<()> {
    service.cancel(parse_task_id(&task_id)?)
}

pub fn remove_task(service: Arc<DownloadService>, task_id: String) -> Result<()> {
    service.remove(parse_task_id(&task_id)?)
}

pub fn restart_task(service: Arc<DownloadService>, task_id: String) -> Result<()> {
    service.restart(parse_task_id(&task_id)?)
}

pub fn list_tasks(service: Arc<DownloadService>, filter: Option<TaskFilter>) -> Vec<TaskEntry> {
    service.list_tasks(filter.unwrap_or_default())
}

pub fn get_task(service: Arc<DownloadService>, task_id: String) -> Result<TaskEntry> {
    service.task(parse_task_id(&task_id)?)
}

pub fn get_error_report(service: Arc<DownloadService>, task_id: String) -> Result<String> {
    service.error_report(parse_task_id(&task_id)?)
}

pub fn list_operation_logs(service: Arc<DownloadService>, limit: usize) -> Vec<OperationLog> {
    service.list_operation_logs(limit)
}

pub fn clear_operation_logs(service: Arc<DownloadService>) {
    service.clear_operation_logs()
}

pub fn post_dialog_action(dialog: Arc<DialogController>, action: DialogAction) -> Result<()> {
    dialog.post_action(action)
}

pub fn retry_dialog_action(dialog: Arc<DialogController>) -> Result<()> {
    dialog.retry()
}

pub fn get_dialog_state(dialog: Arc<DialogController>) -> (SheetValue, SheetState) {
    (dialog.sheet_value(), dialog.sheet_state())
}

pub fn get_default_preferences(dialog: Arc<DialogController>) -> DownloadPreferences {
    dialog.preferences()
}
