#![cfg_attr(not(debug_assertions), windows_subsystem = "windows")]

use prifashion_desktop::config::LauncherConfig;
use prifashion_desktop::diagnostics::{diagnostics_path_for_data_dir, now_ms, DiagEvent, Diagnostics};
use prifashion_desktop::shell::{
    self, navigation_decision, new_window_decision, zoom_factor, zoom_level_after, MenuAction,
    NavigationDecision, ShellWindow, ABOUT_DETAIL, ABOUT_MESSAGE, ABOUT_TITLE, WINDOW_MIN_SIZE,
    WINDOW_SIZE, WINDOW_TITLE,
};
use prifashion_desktop::{LaunchOutcome, LauncherStatus, LifecycleCoordinator};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tauri::menu::{AboutMetadata, Menu, MenuBuilder, MenuItemBuilder, PredefinedMenuItem, SubmenuBuilder};
use tauri::webview::NewWindowResponse;
use tauri::{AppHandle, Manager, RunEvent, State, Url, WebviewUrl, WebviewWindow, WebviewWindowBuilder};
use tauri_plugin_log::{Target, TargetKind};
use tauri_plugin_opener::OpenerExt;

const MAIN_WINDOW: &str = "main";

struct LauncherState {
    coordinator: Arc<LifecycleCoordinator>,
}

#[derive(Default)]
struct ZoomState {
    level: Mutex<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct LauncherDiagnostics {
    generated_at_ms: u64,
    status: LauncherStatus,
    events: Vec<DiagEvent>,
    backend_output: Vec<DiagEvent>,
}

struct TauriShell {
    window: WebviewWindow,
}

impl ShellWindow for TauriShell {
    fn show_loading(&self, message: &str, percent: u8) {
        if let Err(err) = self.window.eval(&shell::loading_script(message, percent)) {
            log::warn!("failed to update loading view: {err}");
        }
    }

    fn show_error(&self, message: &str) {
        if let Err(err) = self.window.eval(&shell::error_script(message)) {
            log::error!("failed to render error view ({err}): {message}");
        }
    }

    fn navigate(&self, url: &str) -> Result<(), String> {
        let target = tauri::Url::parse(url).map_err(|err| err.to_string())?;
        self.window.navigate(target).map_err(|err| err.to_string())
    }
}

#[tauri::command]
fn launcher_status(state: State<'_, LauncherState>) -> LauncherStatus {
    state.coordinator.status()
}

#[tauri::command]
fn launcher_diagnostics(state: State<'_, LauncherState>, limit: Option<u32>) -> LauncherDiagnostics {
    let max = limit.unwrap_or(80).clamp(1, 300) as usize;
    LauncherDiagnostics {
        generated_at_ms: now_ms(),
        status: state.coordinator.status(),
        events: state.coordinator.diagnostics().recent(max),
        backend_output: state.coordinator.diagnostics().recent_output(max),
    }
}

#[tauri::command]
fn dismiss_launch_error(window: WebviewWindow) -> Result<(), String> {
    window.close().map_err(|err| err.to_string())
}

fn shutdown_launcher(app: &AppHandle) {
    let Some(state) = app.try_state::<LauncherState>() else {
        return;
    };
    let Some(report) = state.coordinator.shutdown() else {
        return;
    };
    for error in &report.errors {
        log::error!("cleanup: {error}");
    }
    log::info!(
        "launcher cleaned up (backend signalled: {}, frontend closed: {})",
        report.backend_signalled,
        report.frontend_closed
    );
}

fn open_externally(app: &AppHandle, url: &Url) {
    if let Err(err) = app.opener().open_url(url.as_str(), None::<String>) {
        log::warn!("failed to open {url} externally: {err}");
    }
}

fn route_navigation(app: &AppHandle, url: &Url) -> bool {
    match navigation_decision(url.as_str()) {
        NavigationDecision::Allow => true,
        NavigationDecision::OpenExternal => {
            open_externally(app, url);
            false
        }
        NavigationDecision::Deny => {
            log::warn!("blocked navigation to {url}");
            false
        }
    }
}

fn route_new_window(app: &AppHandle, url: &Url) {
    match new_window_decision(url.as_str()) {
        NavigationDecision::OpenExternal => open_externally(app, url),
        _ => log::warn!("blocked new window for {url}"),
    }
}

fn build_main_window(app: &AppHandle, target: WebviewUrl) -> tauri::Result<WebviewWindow> {
    let navigation_handle = app.clone();
    let popup_handle = app.clone();
    WebviewWindowBuilder::new(app, MAIN_WINDOW, target)
        .title(WINDOW_TITLE)
        .inner_size(WINDOW_SIZE.0, WINDOW_SIZE.1)
        .min_inner_size(WINDOW_MIN_SIZE.0, WINDOW_MIN_SIZE.1)
        .on_navigation(move |url| route_navigation(&navigation_handle, url))
        .on_new_window(move |url, _features| {
            route_new_window(&popup_handle, &url);
            NewWindowResponse::Deny
        })
        .build()
}

/// Brings the main window back, recreating it on the frontend if it was
/// closed while the application kept running.
#[cfg(target_os = "macos")]
fn reopen_main_window(app: &AppHandle) {
    if let Some(window) = app.get_webview_window(MAIN_WINDOW) {
        let _ = window.show();
        let _ = window.set_focus();
        return;
    }
    let frontend_url = app
        .try_state::<LauncherState>()
        .and_then(|state| state.coordinator.frontend())
        .and_then(|server| Url::parse(&server.url()).ok());
    let target = match frontend_url {
        Some(url) => WebviewUrl::External(url),
        None => WebviewUrl::App("index.html".into()),
    };
    if let Err(err) = build_main_window(app, target) {
        log::error!("failed to recreate main window: {err}");
    }
}

fn build_menu(app: &AppHandle) -> tauri::Result<Menu<tauri::Wry>> {
    let mut file = SubmenuBuilder::new(app, "File");
    for action in MenuAction::FILE {
        if action == MenuAction::Exit {
            file = file.separator();
        }
        file = file.item(
            &MenuItemBuilder::with_id(action.id(), action.label())
                .accelerator(action.accelerator())
                .build(app)?,
        );
    }
    let mut view = SubmenuBuilder::new(app, "View");
    for action in MenuAction::VIEW {
        view = view.item(
            &MenuItemBuilder::with_id(action.id(), action.label())
                .accelerator(action.accelerator())
                .build(app)?,
        );
    }
    let about = PredefinedMenuItem::about(
        app,
        Some(ABOUT_TITLE),
        Some(AboutMetadata {
            name: Some(ABOUT_MESSAGE.to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            comments: Some(ABOUT_DETAIL.to_string()),
            ..Default::default()
        }),
    )?;
    let help = SubmenuBuilder::new(app, "Help").item(&about).build()?;
    MenuBuilder::new(app)
        .item(&file.build()?)
        .item(&view.build()?)
        .item(&help)
        .build()
}

fn handle_menu(app: &AppHandle, id: &str) {
    let Some(action) = MenuAction::from_id(id) else {
        return;
    };
    if action == MenuAction::Exit {
        app.exit(0);
        return;
    }
    let Some(window) = app.get_webview_window(MAIN_WINDOW) else {
        return;
    };
    match action {
        MenuAction::Refresh => {
            if let Err(err) = window.eval("window.location.reload()") {
                log::warn!("refresh failed: {err}");
            }
        }
        MenuAction::ToggleDevtools => {
            if window.is_devtools_open() {
                window.close_devtools();
            } else {
                window.open_devtools();
            }
        }
        MenuAction::ZoomIn | MenuAction::ZoomOut | MenuAction::ZoomReset => {
            let zoom = app.state::<ZoomState>();
            let mut level = zoom.level.lock().unwrap_or_else(PoisonError::into_inner);
            *level = zoom_level_after(*level, action);
            if let Err(err) = window.set_zoom(zoom_factor(*level)) {
                log::warn!("zoom failed: {err}");
            }
        }
        MenuAction::Exit => {}
    }
}

fn main() {
    let app = tauri::Builder::default()
        .plugin(
            tauri_plugin_log::Builder::default()
                .level(log::LevelFilter::Info)
                .clear_targets()
                .target(Target::new(TargetKind::Stdout))
                .target(Target::new(TargetKind::LogDir {
                    file_name: Some("prifashion".into()),
                }))
                .build(),
        )
        .plugin(tauri_plugin_opener::init())
        .manage(ZoomState::default())
        .menu(build_menu)
        .on_menu_event(|app, event| handle_menu(app, event.id().as_ref()))
        .invoke_handler(tauri::generate_handler![
            launcher_status,
            launcher_diagnostics,
            dismiss_launch_error
        ])
        .setup(|app| {
            let config = LauncherConfig::from_env(app.path().resource_dir().ok());
            let diagnostics = Arc::new(Diagnostics::persistent(diagnostics_path_for_data_dir(
                &config.data_dir,
            )));
            diagnostics.info(
                "launcher",
                format!(
                    "workspace root {}, backend `{}`",
                    config.workspace_root.display(),
                    config.backend.program
                ),
            );
            let coordinator = Arc::new(LifecycleCoordinator::new(&config, diagnostics));
            app.manage(LauncherState {
                coordinator: coordinator.clone(),
            });

            let window = build_main_window(app.handle(), WebviewUrl::App("index.html".into()))?;
            let shell = TauriShell { window };
            tauri::async_runtime::spawn(async move {
                match coordinator.run(&shell).await {
                    LaunchOutcome::Success { frontend_url } => {
                        log::info!("Pri Fashion loaded from {frontend_url}");
                    }
                    LaunchOutcome::Failure { stage, error } => {
                        log::error!("launch failed at {stage} stage: {error}");
                    }
                }
            });
            Ok(())
        })
        .build(tauri::generate_context!())
        .expect("failed to build Pri Fashion desktop shell");

    app.run(|app_handle, event| match event {
        // On macOS closing the last window keeps the app alive until an explicit quit.
        #[cfg(target_os = "macos")]
        RunEvent::ExitRequested { code: None, api, .. } => api.prevent_exit(),
        RunEvent::ExitRequested { .. } | RunEvent::Exit => shutdown_launcher(app_handle),
        #[cfg(not(target_os = "macos"))]
        RunEvent::WindowEvent {
            label,
            event: tauri::WindowEvent::Destroyed,
            ..
        } if label == MAIN_WINDOW => shutdown_launcher(app_handle),
        #[cfg(target_os = "macos")]
        RunEvent::Reopen { .. } => reopen_main_window(app_handle),
        _ => {}
    });
}
