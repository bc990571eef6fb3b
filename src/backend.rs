use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::diagnostics::{Diagnostics, Level};
use crate::error::LaunchError;
use crate::readiness::{chunk_matches, ReadinessDetector, ReadySignal};

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
const STDOUT_CHUNK_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// `Some` sets the variable for the child, `None` removes it.
    pub env: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Ready,
    Failed,
    Exited,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    ReadyObserved,
    StartupFailed,
    StopRequested,
    ProcessExited,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
        }
    }

    pub fn on(self, event: ProcessEvent) -> Self {
        match (self, event) {
            (Self::Starting, ProcessEvent::ReadyObserved) => Self::Ready,
            (Self::Starting, ProcessEvent::StartupFailed) => Self::Failed,
            (Self::Starting | Self::Ready, ProcessEvent::StopRequested) => Self::Terminated,
            (_, ProcessEvent::ProcessExited) => Self::Exited,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct ExitRecord {
    pub code: Option<i32>,
    /// State the process was in when the exit was observed.
    pub previous: ProcessState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct BackendStatus {
    pub program: String,
    pub pid: Option<u32>,
    pub state: Option<ProcessState>,
    pub ready_signal: Option<ReadySignal>,
    pub exit: Option<ExitRecord>,
}

#[derive(Debug)]
struct ManagedProcess {
    pid: Option<u32>,
    state: Mutex<ProcessState>,
    ready_signal: Mutex<Option<ReadySignal>>,
    exit_rx: watch::Receiver<Option<ExitRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ManagedProcess {
    fn state(&self) -> ProcessState {
        *lock(&self.state)
    }

    /// Applies `event` and returns `(before, after)`.
    fn apply(&self, event: ProcessEvent) -> (ProcessState, ProcessState) {
        let mut state = lock(&self.state);
        let before = *state;
        *state = before.on(event);
        (before, *state)
    }

    fn exit_record(&self) -> Option<ExitRecord> {
        *self.exit_rx.borrow()
    }
}

/// Owns the single backend process of a launcher run.
#[derive(Debug)]
pub struct BackendSupervisor {
    command: BackendCommand,
    detector: ReadinessDetector,
    startup_timeout: Duration,
    diagnostics: Arc<Diagnostics>,
    process: Mutex<Option<Arc<ManagedProcess>>>,
}

impl BackendSupervisor {
    pub fn new(
        command: BackendCommand,
        detector: ReadinessDetector,
        startup_timeout: Duration,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            command,
            detector,
            startup_timeout,
            diagnostics,
            process: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &BackendCommand {
        &self.command
    }

    /// Spawns the backend and waits until the detector fires, the process
    /// exits non-zero, or the startup timeout elapses. The timeout is not a
    /// failure: the backend is assumed to be up and `TimeoutFallback` is
    /// returned.
    pub async fn start(&self) -> Result<ReadySignal, LaunchError> {
        let (process, pattern_rx) = self.spawn()?;
        self.diagnostics.info(
            "backend",
            format!(
                "spawned `{}` pid={} waiting for {} (timeout {}ms)",
                self.command.program,
                process
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                self.detector.describe(),
                self.startup_timeout.as_millis()
            ),
        );

        let readiness = self.detector.clone().wait(pattern_rx);
        tokio::pin!(readiness);
        let deadline = tokio::time::sleep(self.startup_timeout);
        tokio::pin!(deadline);
        let mut exit_rx = process.exit_rx.clone();
        let mut watching_exit = true;

        loop {
            tokio::select! {
                biased;
                signal = &mut readiness => {
                    return Ok(self.mark_ready(&process, signal));
                }
                changed = exit_rx.changed(), if watching_exit => {
                    if changed.is_err() {
                        watching_exit = false;
                        continue;
                    }
                    let Some(record) = *exit_rx.borrow_and_update() else {
                        continue;
                    };
                    watching_exit = false;
                    if record.code != Some(0) {
                        let error = LaunchError::BackendExited { code: record.code };
                        self.diagnostics.error("backend", error.to_string());
                        return Err(error);
                    }
                    self.diagnostics.warn(
                        "backend",
                        "backend exited with code 0 before signalling readiness; waiting for the startup timeout",
                    );
                }
                () = &mut deadline => {
                    self.diagnostics.warn(
                        "backend",
                        format!(
                            "no readiness signal within {}ms, assuming backend is up",
                            self.startup_timeout.as_millis()
                        ),
                    );
                    return Ok(self.mark_ready(&process, ReadySignal::TimeoutFallback));
                }
            }
        }
    }

    /// Sends a termination signal without waiting for the exit. Returns
    /// whether a signal was sent.
    pub fn stop(&self) -> Result<bool, LaunchError> {
        let Some(process) = self.current() else {
            return Ok(false);
        };
        if process.exit_record().is_some() {
            return Ok(false);
        }
        let Some(pid) = process.pid else {
            return Ok(false);
        };
        send_terminate(pid).map_err(|err| LaunchError::Cleanup {
            step: "backend",
            message: format!("failed to signal pid {pid}: {err}"),
        })?;
        let (before, after) = process.apply(ProcessEvent::StopRequested);
        self.diagnostics.info(
            "backend",
            format!(
                "termination signal sent to pid {pid} ({} -> {})",
                before.as_str(),
                after.as_str()
            ),
        );
        Ok(true)
    }

    pub fn pid(&self) -> Option<u32> {
        self.current().and_then(|process| process.pid)
    }

    pub fn state(&self) -> Option<ProcessState> {
        self.current().map(|process| process.state())
    }

    pub fn status(&self) -> BackendStatus {
        let process = self.current();
        BackendStatus {
            program: self.command.program.clone(),
            pid: process.as_ref().and_then(|p| p.pid),
            state: process.as_ref().map(|p| p.state()),
            ready_signal: process.as_ref().and_then(|p| *lock(&p.ready_signal)),
            exit: process.as_ref().and_then(|p| p.exit_record()),
        }
    }

    /// Resolves with the exit record once the process has exited, or `None`
    /// when nothing was spawned.
    pub async fn wait_for_exit(&self) -> Option<ExitRecord> {
        let process = self.current()?;
        let mut exit_rx = process.exit_rx.clone();
        loop {
            if let Some(record) = *exit_rx.borrow_and_update() {
                return Some(record);
            }
            if exit_rx.changed().await.is_err() {
                return *exit_rx.borrow();
            }
        }
    }

    /// Replaces the tracked process with a ready one carrying `pid`, returning
    /// the pid it displaced.
    #[cfg(test)]
    pub(crate) fn swap_tracked_pid(&self, pid: u32) -> Option<u32> {
        let (_exit_tx, exit_rx) = watch::channel(None);
        let process = Arc::new(ManagedProcess {
            pid: Some(pid),
            state: Mutex::new(ProcessState::Ready),
            ready_signal: Mutex::new(None),
            exit_rx,
        });
        lock(&self.process)
            .replace(process)
            .and_then(|previous| previous.pid)
    }

    fn current(&self) -> Option<Arc<ManagedProcess>> {
        lock(&self.process).clone()
    }

    fn mark_ready(&self, process: &ManagedProcess, signal: ReadySignal) -> ReadySignal {
        let (before, after) = process.apply(ProcessEvent::ReadyObserved);
        if before == ProcessState::Starting {
            *lock(&process.ready_signal) = Some(signal);
            self.diagnostics.info(
                "backend",
                format!("backend ready ({signal:?}, {} -> {})", before.as_str(), after.as_str()),
            );
        }
        signal
    }

    fn spawn(&self) -> Result<(Arc<ManagedProcess>, oneshot::Receiver<()>), LaunchError> {
        let mut slot = lock(&self.process);
        if slot.is_some() {
            return Err(LaunchError::AlreadyStarted {
                component: "backend",
            });
        }

        let mut command = Command::new(&self.command.program);
        command
            .args(&self.command.args)
            .current_dir(&self.command.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.command.env {
            match value {
                Some(value) => {
                    command.env(key, value);
                }
                None => {
                    command.env_remove(key);
                }
            }
        }
        #[cfg(target_os = "windows")]
        command.creation_flags(CREATE_NO_WINDOW);

        let mut child = command.spawn().map_err(|source| {
            let error = LaunchError::BackendSpawn {
                program: self.command.program.clone(),
                source,
            };
            self.diagnostics.error("backend", error.to_string());
            error
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (exit_tx, exit_rx) = watch::channel(None);
        let process = Arc::new(ManagedProcess {
            pid: child.id(),
            state: Mutex::new(ProcessState::Starting),
            ready_signal: Mutex::new(None),
            exit_rx,
        });
        *slot = Some(Arc::clone(&process));
        drop(slot);

        let (pattern_tx, pattern_rx) = oneshot::channel();
        if let Some(stdout) = stdout {
            let pattern = self.detector.stdout_pattern().map(str::to_string);
            tokio::spawn(scan_stdout(
                stdout,
                pattern,
                pattern_tx,
                Arc::clone(&self.diagnostics),
            ));
        }
        if let Some(stderr) = stderr {
            tokio::spawn(capture_stderr(stderr, Arc::clone(&self.diagnostics)));
        }
        tokio::spawn(watch_exit(
            child,
            Arc::clone(&process),
            exit_tx,
            Arc::clone(&self.diagnostics),
        ));

        Ok((process, pattern_rx))
    }
}

async fn scan_stdout(
    mut stdout: ChildStdout,
    pattern: Option<String>,
    ready_tx: oneshot::Sender<()>,
    diagnostics: Arc<Diagnostics>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut buf = vec![0u8; STDOUT_CHUNK_BYTES];
    loop {
        let read = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) => {
                diagnostics.warn("backend.stdout", format!("stdout read failed: {err}"));
                break;
            }
        };
        let chunk = String::from_utf8_lossy(&buf[..read]);
        diagnostics.output(Level::Debug, "backend.stdout", chunk.trim_end());

        let Some(pattern) = pattern.as_deref() else {
            continue;
        };
        if ready_tx.is_some() && chunk_matches(&chunk, pattern) {
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
        }
    }
}

async fn capture_stderr(stderr: ChildStderr, diagnostics: Arc<Diagnostics>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        if !line.is_empty() {
            diagnostics.output(Level::Warn, "backend.stderr", line);
        }
    }
}

async fn watch_exit(
    mut child: Child,
    process: Arc<ManagedProcess>,
    exit_tx: watch::Sender<Option<ExitRecord>>,
    diagnostics: Arc<Diagnostics>,
) {
    let code = match child.wait().await {
        Ok(status) => status.code(),
        Err(err) => {
            diagnostics.error("backend", format!("failed to wait for backend: {err}"));
            None
        }
    };

    if process.state() == ProcessState::Starting && code != Some(0) {
        process.apply(ProcessEvent::StartupFailed);
    }
    let (previous, _) = process.apply(ProcessEvent::ProcessExited);
    let level = if previous == ProcessState::Terminated || code == Some(0) {
        Level::Info
    } else {
        Level::Warn
    };
    diagnostics.push(
        level,
        "backend",
        format!(
            "backend exited ({}) while {}",
            code.map(|code| format!("code {code}"))
                .unwrap_or_else(|| "signal".to_string()),
            previous.as_str()
        ),
    );
    exit_tx.send_replace(Some(ExitRecord { code, previous }));
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: u32) -> std::io::Result<()> {
    let mut command = std::process::Command::new("taskkill");
    command
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command.spawn().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_machine_follows_lifecycle() {
        use ProcessEvent::*;
        use ProcessState::*;

        assert_eq!(Starting.on(ReadyObserved), Ready);
        assert_eq!(Starting.on(StartupFailed), Failed);
        assert_eq!(Ready.on(StopRequested), Terminated);
        assert_eq!(Starting.on(StopRequested), Terminated);
        assert_eq!(Ready.on(ReadyObserved), Ready);
        assert_eq!(Ready.on(StartupFailed), Ready);
        assert_eq!(Failed.on(StopRequested), Failed);
        for state in [Starting, Ready, Failed, Exited, Terminated] {
            assert_eq!(state.on(ProcessExited), Exited);
        }
    }

    #[tokio::test]
    async fn stop_without_a_process_is_a_no_op() {
        let supervisor = BackendSupervisor::new(
            BackendCommand {
                program: "unused".to_string(),
                args: Vec::new(),
                working_dir: std::env::temp_dir(),
                env: Vec::new(),
            },
            ReadinessDetector::FixedDelay(Duration::from_millis(1)),
            Duration::from_secs(1),
            Arc::new(Diagnostics::in_memory()),
        );
        assert!(!supervisor.stop().unwrap());
        assert_eq!(supervisor.state(), None);
        assert_eq!(supervisor.wait_for_exit().await, None);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let supervisor = BackendSupervisor::new(
            BackendCommand {
                program: "/definitely/not/a/backend".to_string(),
                args: Vec::new(),
                working_dir: std::env::temp_dir(),
                env: Vec::new(),
            },
            ReadinessDetector::StdoutPattern("ready".into()),
            Duration::from_secs(5),
            Arc::new(Diagnostics::in_memory()),
        );

        let error = supervisor.start().await.unwrap_err();
        assert!(matches!(error, LaunchError::BackendSpawn { .. }), "{error:?}");
        assert_eq!(supervisor.pid(), None);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use pretty_assertions::assert_eq;
        use std::time::Instant;

        const PATTERN: &str = "Starting development server";

        fn sh(script: &str) -> BackendCommand {
            BackendCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                working_dir: std::env::temp_dir(),
                env: Vec::new(),
            }
        }

        fn supervisor(command: BackendCommand, timeout: Duration) -> BackendSupervisor {
            BackendSupervisor::new(
                command,
                ReadinessDetector::StdoutPattern(PATTERN.to_string()),
                timeout,
                Arc::new(Diagnostics::in_memory()),
            )
        }

        async fn stop_and_reap(supervisor: &BackendSupervisor) -> Option<ExitRecord> {
            let _ = supervisor.stop();
            tokio::time::timeout(Duration::from_secs(5), supervisor.wait_for_exit())
                .await
                .expect("backend should exit after SIGTERM")
        }

        fn ready_events(diagnostics: &Diagnostics) -> usize {
            diagnostics
                .recent(usize::MAX)
                .iter()
                .filter(|event| event.message.starts_with("backend ready"))
                .count()
        }

        #[tokio::test]
        async fn pattern_resolves_once_before_timeout() {
            let diagnostics = Arc::new(Diagnostics::in_memory());
            let supervisor = BackendSupervisor::new(
                sh(&format!(
                    "printf '{PATTERN} at http://127.0.0.1:8000/\\n{PATTERN}\\n'; sleep 0.2; echo '{PATTERN}'; exec sleep 30"
                )),
                ReadinessDetector::StdoutPattern(PATTERN.to_string()),
                Duration::from_secs(10),
                Arc::clone(&diagnostics),
            );

            let started = Instant::now();
            let signal = supervisor.start().await.unwrap();
            assert_eq!(signal, ReadySignal::Pattern);
            assert!(started.elapsed() < Duration::from_secs(5));

            tokio::time::sleep(Duration::from_millis(500)).await;
            assert_eq!(ready_events(&diagnostics), 1);
            assert_eq!(supervisor.state(), Some(ProcessState::Ready));
            assert_eq!(supervisor.status().ready_signal, Some(ReadySignal::Pattern));

            let record = stop_and_reap(&supervisor).await.unwrap();
            assert_eq!(record.previous, ProcessState::Terminated);
            assert_eq!(supervisor.state(), Some(ProcessState::Exited));
        }

        #[tokio::test]
        async fn silent_backend_falls_back_to_ready_after_timeout() {
            let timeout = Duration::from_millis(300);
            let supervisor = supervisor(sh("exec sleep 30"), timeout);

            let started = Instant::now();
            let signal = supervisor.start().await.unwrap();
            let elapsed = started.elapsed();

            assert_eq!(signal, ReadySignal::TimeoutFallback);
            assert!(elapsed >= timeout, "resolved early after {elapsed:?}");
            assert!(elapsed < timeout + Duration::from_secs(2), "resolved late after {elapsed:?}");
            assert_eq!(supervisor.state(), Some(ProcessState::Ready));

            stop_and_reap(&supervisor).await;
        }

        #[tokio::test]
        async fn non_zero_exit_rejects_promptly() {
            let supervisor = supervisor(sh("exit 1"), Duration::from_secs(10));

            let started = Instant::now();
            let error = supervisor.start().await.unwrap_err();

            assert!(
                matches!(error, LaunchError::BackendExited { code: Some(1) }),
                "{error:?}"
            );
            assert!(started.elapsed() < Duration::from_secs(5));
            let record = supervisor.wait_for_exit().await.unwrap();
            assert_eq!(record.code, Some(1));
            assert_eq!(record.previous, ProcessState::Failed);
            assert_eq!(supervisor.state(), Some(ProcessState::Exited));
            assert!(!supervisor.stop().unwrap());
        }

        #[tokio::test]
        async fn clean_exit_before_readiness_waits_for_timeout() {
            let timeout = Duration::from_millis(300);
            let supervisor = supervisor(sh("exit 0"), timeout);

            let started = Instant::now();
            let signal = supervisor.start().await.unwrap();

            assert_eq!(signal, ReadySignal::TimeoutFallback);
            assert!(started.elapsed() >= timeout);
        }

        #[tokio::test]
        async fn stderr_output_is_not_a_failure() {
            let diagnostics = Arc::new(Diagnostics::in_memory());
            let supervisor = BackendSupervisor::new(
                sh(&format!("echo 'System check warning' >&2; sleep 0.1; echo '{PATTERN}'; exec sleep 30")),
                ReadinessDetector::StdoutPattern(PATTERN.to_string()),
                Duration::from_secs(10),
                Arc::clone(&diagnostics),
            );

            assert_eq!(supervisor.start().await.unwrap(), ReadySignal::Pattern);
            let stderr_lines: Vec<_> = diagnostics
                .recent_output(usize::MAX)
                .into_iter()
                .filter(|event| event.source == "backend.stderr")
                .collect();
            assert_eq!(stderr_lines.len(), 1);
            assert_eq!(stderr_lines[0].message, "System check warning");
            assert_eq!(stderr_lines[0].level, "warn");
            assert!(diagnostics
                .recent(usize::MAX)
                .iter()
                .all(|event| !event.source.starts_with("backend.std")));

            stop_and_reap(&supervisor).await;
        }

        #[tokio::test]
        async fn env_overrides_reach_the_child() {
            let mut command = sh("echo \"banner=$PRIFASHION_TEST_BANNER\"; exec sleep 30");
            command.env.push((
                "PRIFASHION_TEST_BANNER".to_string(),
                Some("from-launcher".to_string()),
            ));
            let supervisor = BackendSupervisor::new(
                command,
                ReadinessDetector::StdoutPattern("banner=from-launcher".to_string()),
                Duration::from_secs(10),
                Arc::new(Diagnostics::in_memory()),
            );

            assert_eq!(supervisor.start().await.unwrap(), ReadySignal::Pattern);
            stop_and_reap(&supervisor).await;
        }

        #[tokio::test]
        async fn second_start_is_rejected() {
            let supervisor = supervisor(sh(&format!("echo '{PATTERN}'; exec sleep 30")), Duration::from_secs(10));
            supervisor.start().await.unwrap();

            let error = supervisor.start().await.unwrap_err();
            assert!(matches!(error, LaunchError::AlreadyStarted { component: "backend" }));

            stop_and_reap(&supervisor).await;
        }

        #[tokio::test]
        async fn stop_during_startup_terminates_the_process() {
            let supervisor = Arc::new(supervisor(sh("exec sleep 30"), Duration::from_secs(30)));
            let starter = {
                let supervisor = Arc::clone(&supervisor);
                tokio::spawn(async move { supervisor.start().await })
            };

            let deadline = Instant::now() + Duration::from_secs(5);
            while supervisor.pid().is_none() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(supervisor.stop().unwrap());
            assert_eq!(supervisor.state(), Some(ProcessState::Terminated));

            let outcome = tokio::time::timeout(Duration::from_secs(5), starter)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(outcome, Err(LaunchError::BackendExited { code: None })));
        }
    }
}
