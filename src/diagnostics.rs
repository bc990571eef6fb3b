use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

const MAX_EVENTS: usize = 200;
const MAX_OUTPUT_LINES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn as_log_level(self) -> log::Level {
        match self {
            Self::Debug => log::Level::Debug,
            Self::Info => log::Level::Info,
            Self::Warn => log::Level::Warn,
            Self::Error => log::Level::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DiagEvent {
    pub ts_ms: u64,
    pub level: String,
    pub source: String,
    pub message: String,
}

/// Bounded launcher event log, mirrored to the `log` facade. Lifecycle
/// events are persisted as JSON on `flush` so the previous run's events
/// survive a restart. Backend output lines live in a separate in-memory tail
/// and never reach the disk.
#[derive(Debug, Default)]
pub struct Diagnostics {
    events: Mutex<Vec<DiagEvent>>,
    output: Mutex<Vec<DiagEvent>>,
    dirty: AtomicBool,
    path: Option<PathBuf>,
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub fn diagnostics_path_for_data_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("runtime").join("launcher-events.json")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn trim_to(rows: &mut Vec<DiagEvent>, capacity: usize) {
    if rows.len() > capacity {
        let trim = rows.len() - capacity;
        rows.drain(0..trim);
    }
}

fn tail(rows: &[DiagEvent], limit: usize) -> Vec<DiagEvent> {
    let start = rows.len().saturating_sub(limit);
    rows[start..].to_vec()
}

fn load_events_from_path(path: &Path) -> Vec<DiagEvent> {
    let raw = match fs::read_to_string(path) {
        Ok(value) => value,
        Err(_) => return Vec::new(),
    };
    let mut rows = match serde_json::from_str::<Vec<DiagEvent>>(&raw) {
        Ok(list) => list,
        Err(err) => {
            log::warn!("ignoring unreadable diagnostics file {}: {err}", path.display());
            return Vec::new();
        }
    };
    trim_to(&mut rows, MAX_EVENTS);
    rows
}

fn event(level: Level, source: &str, message: String) -> DiagEvent {
    log::log!(target: "prifashion", level.as_log_level(), "[{source}] {message}");
    DiagEvent {
        ts_ms: now_ms(),
        level: level.as_str().to_string(),
        source: source.trim().to_lowercase(),
        message,
    }
}

impl Diagnostics {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn persistent(path: PathBuf) -> Self {
        let events = load_events_from_path(&path);
        Self {
            events: Mutex::new(events),
            path: Some(path),
            ..Self::default()
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records a lifecycle event. Nothing is written to disk until `flush`.
    pub fn push(&self, level: Level, source: &str, message: impl Into<String>) {
        let event = event(level, source, message.into());
        let mut events = lock(&self.events);
        events.push(event);
        trim_to(&mut events, MAX_EVENTS);
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn info(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Info, source, message);
    }

    pub fn warn(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Warn, source, message);
    }

    pub fn error(&self, source: &str, message: impl Into<String>) {
        self.push(Level::Error, source, message);
    }

    /// Records a line of backend output in the in-memory tail.
    pub fn output(&self, level: Level, source: &str, line: impl Into<String>) {
        let event = event(level, source, line.into());
        let mut output = lock(&self.output);
        output.push(event);
        trim_to(&mut output, MAX_OUTPUT_LINES);
    }

    /// Most recent `limit` lifecycle events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<DiagEvent> {
        tail(&lock(&self.events), limit)
    }

    /// Most recent `limit` backend output lines, oldest first.
    pub fn recent_output(&self, limit: usize) -> Vec<DiagEvent> {
        tail(&lock(&self.output), limit)
    }

    /// Writes the lifecycle events if anything changed since the last flush.
    /// Returns whether a file was written.
    pub fn flush(&self) -> bool {
        let Some(path) = self.path.as_ref() else {
            return false;
        };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return false;
        }
        let payload = match serde_json::to_string(&*lock(&self.events)) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("failed to encode diagnostics: {err}");
                return false;
            }
        };
        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match fs::write(path, payload) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("failed to write diagnostics to {}: {err}", path.display());
                false
            }
        }
    }

    /// `flush` on the blocking pool, for callers on the async runtime.
    pub async fn flush_in_background(self: Arc<Self>) -> bool {
        tokio::task::spawn_blocking(move || self.flush())
            .await
            .unwrap_or(false)
    }
}
