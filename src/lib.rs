//! Launcher core for the Pri Fashion desktop shell: starts the Django
//! backend, serves the prebuilt UI bundle on loopback and points the native
//! window at it.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod ports;
pub mod readiness;
pub mod shell;
pub mod static_server;

pub use backend::{BackendCommand, BackendStatus, BackendSupervisor, ProcessState};
pub use config::LauncherConfig;
pub use coordinator::{CleanupReport, LaunchOutcome, LauncherStatus, LifecycleCoordinator};
pub use diagnostics::{DiagEvent, Diagnostics};
pub use error::{LaunchError, LaunchStage};
pub use ports::find_free_port;
pub use readiness::{ReadinessDetector, ReadySignal};
pub use shell::{NavigationDecision, ShellWindow};
pub use static_server::ListeningServer;
