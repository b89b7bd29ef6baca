//! Tauri bridge: commands for the frontend and events it can listen to.
//!
//! Events:
//! - `device-state-changed` with a [`DeviceSnapshot`] whenever the band's
//!   observable state changes.
//! - `sync-completed` with a [`SyncResult`] after every cycle that ran.

use chrono::{DateTime, Utc};
use tauri::{
    plugin::{Builder, TauriPlugin},
    AppHandle, Emitter, Manager, Runtime, State,
};
use tokio::sync::broadcast;

use crate::db::SessionRecord;
use crate::device::{DeviceSnapshot, MeditationDevice};
use crate::link::ScanFilter;
use crate::settings::SyncSettings;
use crate::sync::SyncResult;
use crate::SyncService;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_warn;

const DEVICE_STATE_CHANGED: &str = "device-state-changed";
const SYNC_COMPLETED: &str = "sync-completed";

#[tauri::command]
async fn perform_full_sync(state: State<'_, SyncService>) -> Result<Option<SyncResult>, String> {
    Ok(state.scheduler.sync_now().await)
}

#[tauri::command]
fn get_device_state(state: State<'_, SyncService>) -> Result<DeviceSnapshot, String> {
    Ok(state.device.snapshot())
}

#[tauri::command]
async fn scan_for_bands(state: State<'_, SyncService>) -> Result<Vec<MeditationDevice>, String> {
    let mut found = state
        .link
        .scan(ScanFilter::default())
        .await
        .map_err(|e| e.to_string())?;

    let mut bands = Vec::new();
    while let Some(peripheral) = found.recv().await {
        bands.push(MeditationDevice::from(peripheral));
    }
    Ok(bands)
}

#[tauri::command]
async fn pair_device(
    device: MeditationDevice,
    state: State<'_, SyncService>,
) -> Result<DeviceSnapshot, String> {
    state.pair(device).await.map_err(|e| e.to_string())?;
    Ok(state.device.snapshot())
}

#[tauri::command]
async fn unpair_device(state: State<'_, SyncService>) -> Result<(), String> {
    state.unpair().await.map_err(|e| e.to_string())
}

#[tauri::command]
async fn app_foregrounded(state: State<'_, SyncService>) -> Result<(), String> {
    state.scheduler.on_foreground().await;
    Ok(())
}

#[tauri::command]
async fn app_backgrounded(state: State<'_, SyncService>) -> Result<(), String> {
    state.scheduler.on_background().await;
    Ok(())
}

#[tauri::command]
async fn record_session(
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    pose: Option<String>,
    discipline: Option<String>,
    state: State<'_, SyncService>,
) -> Result<SessionRecord, String> {
    state
        .record_local_session(started_at, ended_at, pose, discipline)
        .await
        .map_err(|e| e.to_string())
}

#[tauri::command]
fn get_sync_settings(state: State<'_, SyncService>) -> Result<SyncSettings, String> {
    Ok(state.settings.sync())
}

/// Takes effect on the next start.
#[tauri::command]
fn set_sync_settings(settings: SyncSettings, state: State<'_, SyncService>) -> Result<(), String> {
    state
        .settings
        .update_sync(settings)
        .map_err(|e| e.to_string())
}

/// Registers the commands under `plugin:bandsync|...` and starts forwarding
/// state changes to the webview.
pub fn init<R: Runtime>(service: SyncService) -> TauriPlugin<R> {
    Builder::new("bandsync")
        .invoke_handler(tauri::generate_handler![
            perform_full_sync,
            get_device_state,
            scan_for_bands,
            pair_device,
            unpair_device,
            app_foregrounded,
            app_backgrounded,
            record_session,
            get_sync_settings,
            set_sync_settings,
        ])
        .setup(move |app, _api| {
            spawn_event_bridge(app.clone(), &service);
            app.manage(service);
            Ok(())
        })
        .build()
}

fn spawn_event_bridge<R: Runtime>(app: AppHandle<R>, service: &SyncService) {
    let mut snapshots = service.device.subscribe();
    let app_for_state = app.clone();
    tauri::async_runtime::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            if let Err(err) = app_for_state.emit(DEVICE_STATE_CHANGED, &snapshot) {
                log_warn!("failed to emit {DEVICE_STATE_CHANGED}: {err}");
            }
        }
    });

    let mut results = service.scheduler.results();
    tauri::async_runtime::spawn(async move {
        loop {
            match results.recv().await {
                Ok(result) => {
                    if let Err(err) = app.emit(SYNC_COMPLETED, &result) {
                        log_warn!("failed to emit {SYNC_COMPLETED}: {err}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
