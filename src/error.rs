use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStage {
    Startup,
    Backend,
    Frontend,
    Navigation,
    Cleanup,
}

impl LaunchStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Backend => "backend",
            Self::Frontend => "frontend",
            Self::Navigation => "navigation",
            Self::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("no free port found after {attempts} attempts starting at {start}")]
    NoFreePort { start: u16, attempts: u16 },

    #[error("backend exited before becoming ready ({})", describe_code(.code))]
    BackendExited { code: Option<i32> },

    #[error("failed to start backend `{program}`: {source}")]
    BackendSpawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{component} was already started in this run")]
    AlreadyStarted { component: &'static str },

    #[error("launcher is shutting down")]
    ShuttingDown,

    #[error("frontend build not found (looked in: {})", join_paths(.candidates))]
    ContentRootNotFound { candidates: Vec<PathBuf> },

    #[error("failed to bind frontend server on 127.0.0.1:{port}: {source}")]
    FrontendBind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to open {url}: {message}")]
    Navigation { url: String, message: String },

    #[error("{step} cleanup failed: {message}")]
    Cleanup { step: &'static str, message: String },
}

impl LaunchError {
    pub fn stage(&self) -> LaunchStage {
        match self {
            Self::BackendExited { .. } | Self::BackendSpawn { .. } => LaunchStage::Backend,
            Self::NoFreePort { .. }
            | Self::ContentRootNotFound { .. }
            | Self::FrontendBind { .. } => LaunchStage::Frontend,
            Self::Navigation { .. } => LaunchStage::Navigation,
            Self::AlreadyStarted { .. } | Self::ShuttingDown => LaunchStage::Startup,
            Self::Cleanup { .. } => LaunchStage::Cleanup,
        }
    }
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "no candidates".to_string();
    }
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
