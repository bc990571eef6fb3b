use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::backend::{BackendStatus, BackendSupervisor};
use crate::config::LauncherConfig;
use crate::diagnostics::{now_ms, Diagnostics};
use crate::error::{LaunchError, LaunchStage};
use crate::shell::ShellWindow;
use crate::static_server::{self, ListeningServer};

const PROGRESS_BACKEND_STARTING: u8 = 10;
const PROGRESS_BACKEND_READY: u8 = 45;
const PROGRESS_FRONTEND_STARTING: u8 = 60;
const PROGRESS_FRONTEND_BOUND: u8 = 85;
const PROGRESS_NAVIGATING: u8 = 100;

#[derive(Debug)]
pub enum LaunchOutcome {
    Success { frontend_url: String },
    Failure { stage: LaunchStage, error: LaunchError },
}

impl LaunchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub backend_signalled: bool,
    pub frontend_closed: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherStatus {
    pub backend: BackendStatus,
    pub frontend_port: Option<u16>,
    pub frontend_url: Option<String>,
    pub content_root: Option<String>,
    pub last_error: Option<String>,
    pub last_error_stage: Option<LaunchStage>,
    pub started_at_ms: Option<u64>,
    pub shut_down: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sequences backend, frontend and navigation for one application run and
/// owns their cleanup.
#[derive(Debug)]
pub struct LifecycleCoordinator {
    content_candidates: Vec<PathBuf>,
    preferred_port: u16,
    max_port_attempts: u16,
    settle_delay: Duration,
    diagnostics: Arc<Diagnostics>,
    backend: BackendSupervisor,
    frontend: Mutex<Option<Arc<ListeningServer>>>,
    started: AtomicBool,
    cleaned_up: AtomicBool,
    last_error: Mutex<Option<(LaunchStage, String)>>,
    started_at_ms: Mutex<Option<u64>>,
}

impl LifecycleCoordinator {
    pub fn new(config: &LauncherConfig, diagnostics: Arc<Diagnostics>) -> Self {
        let backend = BackendSupervisor::new(
            config.backend.clone(),
            config.readiness.clone(),
            config.startup_timeout,
            diagnostics.clone(),
        );
        Self {
            content_candidates: config.content_candidates.clone(),
            preferred_port: config.preferred_port,
            max_port_attempts: config.max_port_attempts,
            settle_delay: config.settle_delay,
            diagnostics,
            backend,
            frontend: Mutex::new(None),
            started: AtomicBool::new(false),
            cleaned_up: AtomicBool::new(false),
            last_error: Mutex::new(None),
            started_at_ms: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &BackendSupervisor {
        &self.backend
    }

    pub fn frontend(&self) -> Option<Arc<ListeningServer>> {
        lock(&self.frontend).clone()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn is_shut_down(&self) -> bool {
        self.cleaned_up.load(Ordering::SeqCst)
    }

    /// Runs the launch sequence once. Failures are rendered into `window`
    /// and returned; the application keeps running.
    pub async fn run<W: ShellWindow + ?Sized>(&self, window: &W) -> LaunchOutcome {
        if self.started.swap(true, Ordering::SeqCst) {
            return LaunchOutcome::Failure {
                stage: LaunchStage::Startup,
                error: LaunchError::AlreadyStarted {
                    component: "launcher",
                },
            };
        }
        *lock(&self.started_at_ms) = Some(now_ms());

        let outcome = match self.launch(window).await {
            Ok(frontend_url) => {
                self.diagnostics
                    .info("launcher", format!("application loaded from {frontend_url}"));
                LaunchOutcome::Success { frontend_url }
            }
            Err(error) => {
                let stage = error.stage();
                let message = error.to_string();
                self.diagnostics
                    .error("launcher", format!("{stage} stage failed: {message}"));
                *lock(&self.last_error) = Some((stage, message.clone()));
                window.show_error(&message);
                LaunchOutcome::Failure { stage, error }
            }
        };
        self.diagnostics.clone().flush_in_background().await;
        outcome
    }

    /// Fails the launch once shutdown has run, releasing whatever the launch
    /// acquired after cleanup ran.
    fn ensure_running(&self) -> Result<(), LaunchError> {
        if !self.is_shut_down() {
            return Ok(());
        }
        if let Err(err) = self.backend.stop() {
            self.diagnostics.error("cleanup", err.to_string());
        }
        if let Some(server) = self.frontend() {
            server.close();
        }
        Err(LaunchError::ShuttingDown)
    }

    async fn launch<W: ShellWindow + ?Sized>(&self, window: &W) -> Result<String, LaunchError> {
        self.ensure_running()?;
        window.show_loading("Starting backend server...", PROGRESS_BACKEND_STARTING);
        let signal = self.backend.start().await?;
        self.ensure_running()?;
        self.diagnostics
            .info("launcher", format!("backend ready ({signal:?})"));
        window.show_loading("Backend server ready", PROGRESS_BACKEND_READY);

        window.show_loading("Starting frontend server...", PROGRESS_FRONTEND_STARTING);
        let server = Arc::new(
            static_server::serve(
                &self.content_candidates,
                self.preferred_port,
                self.max_port_attempts,
            )
            .await?,
        );
        let url = server.url();
        *lock(&self.frontend) = Some(server.clone());
        self.diagnostics.info(
            "frontend",
            format!("serving {} at {url}", server.root().display()),
        );
        self.ensure_running()?;
        window.show_loading(
            &format!("Frontend server ready on port {}", server.port()),
            PROGRESS_FRONTEND_BOUND,
        );

        tokio::time::sleep(self.settle_delay).await;
        window.show_loading("Opening Pri Fashion...", PROGRESS_NAVIGATING);
        window
            .navigate(&url)
            .map_err(|message| LaunchError::Navigation {
                url: url.clone(),
                message,
            })?;
        Ok(url)
    }

    /// Stops the backend and closes the frontend server, whatever stage the
    /// launch reached. Only the first call does anything.
    pub fn shutdown(&self) -> Option<CleanupReport> {
        if self.cleaned_up.swap(true, Ordering::SeqCst) {
            return None;
        }
        let mut report = CleanupReport::default();

        match self.backend.stop() {
            Ok(signalled) => report.backend_signalled = signalled,
            Err(err) => report.errors.push(err.to_string()),
        }
        if let Some(server) = self.frontend() {
            report.frontend_closed = server.close();
        }

        self.diagnostics.info(
            "launcher",
            format!(
                "cleanup done (backend signalled: {}, frontend closed: {}, errors: {})",
                report.backend_signalled,
                report.frontend_closed,
                report.errors.len()
            ),
        );
        for error in &report.errors {
            self.diagnostics.error("cleanup", error.clone());
        }
        self.diagnostics.flush();
        Some(report)
    }

    pub fn status(&self) -> LauncherStatus {
        let frontend = self.frontend();
        let last_error = lock(&self.last_error).clone();
        LauncherStatus {
            backend: self.backend.status(),
            frontend_port: frontend.as_ref().map(|server| server.port()),
            frontend_url: frontend.as_ref().map(|server| server.url()),
            content_root: frontend
                .as_ref()
                .map(|server| server.root().to_string_lossy().to_string()),
            last_error_stage: last_error.as_ref().map(|(stage, _)| *stage),
            last_error: last_error.map(|(_, message)| message),
            started_at_ms: *lock(&self.started_at_ms),
            shut_down: self.is_shut_down(),
        }
    }
}
