use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::backend::BackendCommand;
use crate::ports::DEFAULT_MAX_PORT_ATTEMPTS;
use crate::readiness::ReadinessDetector;

pub const PROFILE_PATH_ENV: &str = "PRIFASHION_PROFILE_PATH";
const WORKSPACE_ROOT_ENV: &str = "PRIFASHION_WORKSPACE_ROOT";
const BACKEND_BIN_ENV: &str = "PRIFASHION_BACKEND_BIN";
const BACKEND_ARGS_ENV: &str = "PRIFASHION_BACKEND_ARGS";
const BACKEND_HOST_ENV: &str = "PRIFASHION_BACKEND_HOST";
const BACKEND_PORT_ENV: &str = "PRIFASHION_BACKEND_PORT";
const READINESS_ENV: &str = "PRIFASHION_READINESS";
const READY_PATTERN_ENV: &str = "PRIFASHION_READY_PATTERN";
const BACKEND_TIMEOUT_ENV: &str = "PRIFASHION_BACKEND_TIMEOUT_MS";
const FRONTEND_PORT_ENV: &str = "PRIFASHION_FRONTEND_PORT";
const CONTENT_ROOT_ENV: &str = "PRIFASHION_CONTENT_ROOT";
const DATA_DIR_ENV: &str = "PRIFASHION_DATA_DIR";

pub const DEFAULT_READY_PATTERN: &str = "Starting development server";
const DEFAULT_BACKEND_PORT: u16 = 8000;
const DEFAULT_FRONTEND_PORT: u16 = 3000;
const DEFAULT_BACKEND_TIMEOUT_MS: u64 = 15_000;
const BACKEND_TIMEOUT_MIN_MS: u64 = 100;
const BACKEND_TIMEOUT_MAX_MS: u64 = 600_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 300;
const POLL_INTERVAL_MIN_MS: u64 = 50;
const POLL_INTERVAL_MAX_MS: u64 = 10_000;
const DEFAULT_FIXED_DELAY_MS: u64 = 3_000;
const DEFAULT_SETTLE_DELAY_MS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessMode {
    Stdout,
    Http,
    Port,
    Delay,
}

impl ReadinessMode {
    fn from_raw(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "http" | "http_poll" => Self::Http,
            "port" | "tcp" => Self::Port,
            "delay" | "fixed_delay" => Self::Delay,
            _ => Self::Stdout,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct BackendProfile {
    program: Option<String>,
    args: Option<Vec<String>>,
    env: BTreeMap<String, Option<String>>,
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ReadinessProfile {
    mode: Option<String>,
    pattern: Option<String>,
    timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FrontendProfile {
    preferred_port: Option<u16>,
    max_port_attempts: Option<u16>,
    content_root: Option<String>,
    settle_delay_ms: Option<u64>,
}

/// Optional JSON launcher profile. Every key may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LauncherProfile {
    workspace_root: Option<String>,
    data_dir: Option<String>,
    backend: BackendProfile,
    readiness: ReadinessProfile,
    frontend: FrontendProfile,
}

/// Where the launcher binary and its bundled resources live.
#[derive(Debug, Clone, Default)]
pub struct InstallLayout {
    pub resource_dir: Option<PathBuf>,
    pub current_dir: Option<PathBuf>,
}

impl InstallLayout {
    pub fn detect(resource_dir: Option<PathBuf>) -> Self {
        Self {
            resource_dir,
            current_dir: env::current_dir().ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub workspace_root: PathBuf,
    pub backend: BackendCommand,
    pub backend_addr: SocketAddr,
    pub readiness: ReadinessDetector,
    pub startup_timeout: Duration,
    pub content_candidates: Vec<PathBuf>,
    pub preferred_port: u16,
    pub max_port_attempts: u16,
    pub settle_delay: Duration,
    pub data_dir: PathBuf,
}

fn normalize_path(raw: &str) -> Option<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(expand_tilde_path(trimmed))
}

fn user_home_dir() -> Option<PathBuf> {
    for key in ["HOME", "USERPROFILE"] {
        if let Ok(raw) = env::var(key) {
            let clean = raw.trim();
            if !clean.is_empty() {
                return Some(PathBuf::from(clean));
            }
        }
    }
    None
}

pub fn expand_tilde_path(raw: &str) -> PathBuf {
    let text = raw.trim();
    if text == "~" {
        if let Some(home) = user_home_dir() {
            return home;
        }
    }
    if let Some(rest) = text.strip_prefix("~/") {
        if let Some(home) = user_home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(text)
}

/// Reads the profile at `path`. Missing or malformed files fall back to
/// the defaults.
pub fn load_profile(path: Option<&str>) -> LauncherProfile {
    let Some(path) = path.and_then(normalize_path) else {
        return LauncherProfile::default();
    };
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) => {
            log::warn!("launcher profile {} unreadable: {err}", path.display());
            return LauncherProfile::default();
        }
    };
    match serde_json::from_str::<LauncherProfile>(&raw) {
        Ok(profile) => profile,
        Err(err) => {
            log::warn!("launcher profile {} invalid: {err}", path.display());
            LauncherProfile::default()
        }
    }
}

fn env_string(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env_string(lookup, key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring invalid {key}={raw:?}");
            None
        }
    }
}

fn default_python() -> &'static str {
    if cfg!(target_os = "windows") {
        "python"
    } else {
        "python3"
    }
}

fn default_data_dir(layout: &InstallLayout) -> PathBuf {
    if let Some(home) = user_home_dir() {
        return home.join(".prifashion");
    }
    layout
        .current_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".prifashion")
}

fn resolve_workspace_root(explicit: Option<PathBuf>, layout: &InstallLayout) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    let from_manifest = Path::new(env!("CARGO_MANIFEST_DIR")).to_path_buf();
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = layout.resource_dir.as_ref() {
        candidates.push(dir.clone());
    }
    if let Some(dir) = layout.current_dir.as_ref() {
        candidates.push(dir.clone());
    }
    candidates.push(from_manifest.clone());
    if let Some(parent) = from_manifest.parent() {
        candidates.push(parent.to_path_buf());
    }
    candidates
        .into_iter()
        .find(|dir| dir.join("backend").is_dir())
        .unwrap_or(from_manifest)
}

fn backend_env(backend_dir: &Path, overrides: &BTreeMap<String, Option<String>>) -> Vec<(String, Option<String>)> {
    let mut merged: BTreeMap<String, Option<String>> = BTreeMap::new();
    merged.insert(
        "PYTHONPATH".to_string(),
        Some(backend_dir.to_string_lossy().to_string()),
    );
    merged.insert("PYTHONHOME".to_string(), None);
    merged.insert("PYTHONUNBUFFERED".to_string(), Some("1".to_string()));
    merged.insert(
        "DJANGO_SETTINGS_MODULE".to_string(),
        Some("backend.settings".to_string()),
    );
    for (key, value) in overrides {
        merged.insert(key.clone(), value.clone());
    }
    merged.into_iter().collect()
}

impl LauncherConfig {
    pub fn from_env(resource_dir: Option<PathBuf>) -> Self {
        let lookup = |key: &str| env::var(key).ok();
        let profile = load_profile(env_string(&lookup, PROFILE_PATH_ENV).as_deref());
        Self::resolve(&profile, &lookup, &InstallLayout::detect(resource_dir))
    }

    /// Environment beats profile beats defaults.
    pub fn resolve(
        profile: &LauncherProfile,
        lookup: &dyn Fn(&str) -> Option<String>,
        layout: &InstallLayout,
    ) -> Self {
        let explicit_root = env_string(lookup, WORKSPACE_ROOT_ENV)
            .or_else(|| profile.workspace_root.clone())
            .and_then(|raw| normalize_path(&raw));
        let workspace_root = resolve_workspace_root(explicit_root, layout);
        let backend_dir = workspace_root.join("backend");

        let host = env_string(lookup, BACKEND_HOST_ENV)
            .or_else(|| profile.backend.host.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let host = IpAddr::from_str(host.trim()).unwrap_or_else(|_| {
            log::warn!("backend host {host:?} is not an IP address, using 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        let port = env_parse::<u16>(lookup, BACKEND_PORT_ENV)
            .or(profile.backend.port)
            .unwrap_or(DEFAULT_BACKEND_PORT);
        let backend_addr = SocketAddr::new(host, port);

        let program = env_string(lookup, BACKEND_BIN_ENV)
            .or_else(|| profile.backend.program.clone())
            .unwrap_or_else(|| default_python().to_string());
        let args = env_string(lookup, BACKEND_ARGS_ENV)
            .map(|raw| raw.split_whitespace().map(str::to_string).collect())
            .or_else(|| profile.backend.args.clone())
            .unwrap_or_else(|| {
                vec![
                    "manage.py".to_string(),
                    "runserver".to_string(),
                    backend_addr.to_string(),
                    "--noreload".to_string(),
                ]
            });
        let backend = BackendCommand {
            program,
            args,
            env: backend_env(&backend_dir, &profile.backend.env),
            working_dir: backend_dir,
        };

        let readiness_profile = &profile.readiness;
        let mode = env_string(lookup, READINESS_ENV)
            .or_else(|| readiness_profile.mode.clone())
            .map(|raw| ReadinessMode::from_raw(&raw))
            .unwrap_or(ReadinessMode::Stdout);
        let interval = Duration::from_millis(
            readiness_profile
                .poll_interval_ms
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
                .clamp(POLL_INTERVAL_MIN_MS, POLL_INTERVAL_MAX_MS),
        );
        let readiness = match mode {
            ReadinessMode::Stdout => ReadinessDetector::StdoutPattern(
                env_string(lookup, READY_PATTERN_ENV)
                    .or_else(|| readiness_profile.pattern.clone())
                    .unwrap_or_else(|| DEFAULT_READY_PATTERN.to_string()),
            ),
            ReadinessMode::Http => ReadinessDetector::HttpPoll {
                url: format!("http://{backend_addr}/"),
                interval,
            },
            ReadinessMode::Port => ReadinessDetector::PortOpen {
                addr: backend_addr,
                interval,
            },
            ReadinessMode::Delay => ReadinessDetector::FixedDelay(Duration::from_millis(
                readiness_profile.delay_ms.unwrap_or(DEFAULT_FIXED_DELAY_MS),
            )),
        };
        let startup_timeout = Duration::from_millis(
            env_parse::<u64>(lookup, BACKEND_TIMEOUT_ENV)
                .or(readiness_profile.timeout_ms)
                .unwrap_or(DEFAULT_BACKEND_TIMEOUT_MS)
                .clamp(BACKEND_TIMEOUT_MIN_MS, BACKEND_TIMEOUT_MAX_MS),
        );

        let mut content_candidates: Vec<PathBuf> = Vec::new();
        if let Some(explicit) = env_string(lookup, CONTENT_ROOT_ENV)
            .or_else(|| profile.frontend.content_root.clone())
            .and_then(|raw| normalize_path(&raw))
        {
            content_candidates.push(explicit);
        }
        if let Some(resources) = layout.resource_dir.as_ref() {
            content_candidates.push(resources.join("frontend").join("build"));
        }
        let checkout_build = workspace_root.join("frontend").join("build");
        if !content_candidates.contains(&checkout_build) {
            content_candidates.push(checkout_build);
        }

        let data_dir = env_string(lookup, DATA_DIR_ENV)
            .or_else(|| profile.data_dir.clone())
            .and_then(|raw| normalize_path(&raw))
            .unwrap_or_else(|| default_data_dir(layout));

        Self {
            workspace_root,
            backend,
            backend_addr,
            readiness,
            startup_timeout,
            content_candidates,
            preferred_port: env_parse::<u16>(lookup, FRONTEND_PORT_ENV)
                .or(profile.frontend.preferred_port)
                .unwrap_or(DEFAULT_FRONTEND_PORT),
            max_port_attempts: profile
                .frontend
                .max_port_attempts
                .unwrap_or(DEFAULT_MAX_PORT_ATTEMPTS),
            settle_delay: Duration::from_millis(
                profile
                    .frontend
                    .settle_delay_ms
                    .unwrap_or(DEFAULT_SETTLE_DELAY_MS),
            ),
            data_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn profile(json: &str) -> LauncherProfile {
        serde_json::from_str(json).unwrap()
    }

    fn layout_for(root: &Path) -> InstallLayout {
        InstallLayout {
            resource_dir: None,
            current_dir: Some(root.to_path_buf()),
        }
    }

    #[test]
    fn defaults_describe_the_django_backend() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("backend")).unwrap();
        let config = LauncherConfig::resolve(
            &LauncherProfile::default(),
            &lookup_from(&[("PRIFASHION_DATA_DIR", "/tmp/prifashion-data")]),
            &layout_for(root.path()),
        );

        assert_eq!(config.workspace_root, root.path());
        assert_eq!(config.backend.program, default_python());
        assert_eq!(
            config.backend.args,
            vec!["manage.py", "runserver", "127.0.0.1:8000", "--noreload"]
        );
        assert_eq!(config.backend.working_dir, root.path().join("backend"));
        assert!(config
            .backend
            .env
            .contains(&("PYTHONUNBUFFERED".to_string(), Some("1".to_string()))));
        assert!(config.backend.env.contains(&("PYTHONHOME".to_string(), None)));
        assert_eq!(
            config.readiness,
            ReadinessDetector::StdoutPattern(DEFAULT_READY_PATTERN.to_string())
        );
        assert_eq!(config.startup_timeout, Duration::from_secs(15));
        assert_eq!(config.preferred_port, 3000);
        assert_eq!(config.max_port_attempts, DEFAULT_MAX_PORT_ATTEMPTS);
        assert_eq!(config.settle_delay, Duration::from_millis(300));
        assert_eq!(
            config.content_candidates,
            vec![root.path().join("frontend").join("build")]
        );
        assert_eq!(config.data_dir, PathBuf::from("/tmp/prifashion-data"));
    }

    #[test]
    fn environment_beats_profile() {
        let root = tempfile::tempdir().unwrap();
        let profile = profile(
            r#"{
                "backend": { "program": "/opt/py/bin/python", "port": 8100 },
                "readiness": { "pattern": "Listening", "timeout_ms": 5000 },
                "frontend": { "preferred_port": 4000, "settle_delay_ms": 0 }
            }"#,
        );
        let config = LauncherConfig::resolve(
            &profile,
            &lookup_from(&[
                ("PRIFASHION_WORKSPACE_ROOT", root.path().to_str().unwrap()),
                ("PRIFASHION_BACKEND_PORT", "8200"),
                ("PRIFASHION_READY_PATTERN", "Quit the server"),
                ("PRIFASHION_FRONTEND_PORT", "not-a-port"),
            ]),
            &InstallLayout::default(),
        );

        assert_eq!(config.workspace_root, root.path());
        assert_eq!(config.backend.program, "/opt/py/bin/python");
        assert_eq!(config.backend_addr.port(), 8200);
        assert_eq!(config.backend.args[2], "127.0.0.1:8200");
        assert_eq!(
            config.readiness,
            ReadinessDetector::StdoutPattern("Quit the server".to_string())
        );
        assert_eq!(config.startup_timeout, Duration::from_secs(5));
        assert_eq!(config.preferred_port, 4000);
        assert_eq!(config.settle_delay, Duration::ZERO);
    }

    #[test]
    fn readiness_modes_target_the_backend_address() {
        let layout = InstallLayout::default();
        let http = LauncherConfig::resolve(
            &profile(r#"{ "readiness": { "mode": "http", "poll_interval_ms": 1 } }"#),
            &lookup_from(&[]),
            &layout,
        );
        assert_eq!(
            http.readiness,
            ReadinessDetector::HttpPoll {
                url: "http://127.0.0.1:8000/".to_string(),
                interval: Duration::from_millis(POLL_INTERVAL_MIN_MS),
            }
        );

        let port = LauncherConfig::resolve(
            &LauncherProfile::default(),
            &lookup_from(&[("PRIFASHION_READINESS", "port"), ("PRIFASHION_BACKEND_PORT", "9000")]),
            &layout,
        );
        assert_eq!(
            port.readiness,
            ReadinessDetector::PortOpen {
                addr: "127.0.0.1:9000".parse().unwrap(),
                interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            }
        );

        let delay = LauncherConfig::resolve(
            &profile(r#"{ "readiness": { "mode": "delay", "delay_ms": 1200 } }"#),
            &lookup_from(&[]),
            &layout,
        );
        assert_eq!(
            delay.readiness,
            ReadinessDetector::FixedDelay(Duration::from_millis(1200))
        );
    }

    #[test]
    fn timeout_is_clamped() {
        let config = LauncherConfig::resolve(
            &LauncherProfile::default(),
            &lookup_from(&[("PRIFASHION_BACKEND_TIMEOUT_MS", "5")]),
            &InstallLayout::default(),
        );
        assert_eq!(config.startup_timeout, Duration::from_millis(BACKEND_TIMEOUT_MIN_MS));
    }

    #[test]
    fn profile_env_can_unset_variables() {
        let config = LauncherConfig::resolve(
            &profile(r#"{ "backend": { "env": { "PYTHONUNBUFFERED": null, "DEBUG": "1" } } }"#),
            &lookup_from(&[]),
            &InstallLayout::default(),
        );
        assert!(config
            .backend
            .env
            .contains(&("PYTHONUNBUFFERED".to_string(), None)));
        assert!(config
            .backend
            .env
            .contains(&("DEBUG".to_string(), Some("1".to_string()))));
    }

    #[test]
    fn content_candidates_prefer_override_then_resources() {
        let root = tempfile::tempdir().unwrap();
        let resources = root.path().join("resources");
        let config = LauncherConfig::resolve(
            &LauncherProfile::default(),
            &lookup_from(&[
                ("PRIFASHION_WORKSPACE_ROOT", root.path().to_str().unwrap()),
                ("PRIFASHION_CONTENT_ROOT", "/srv/ui"),
            ]),
            &InstallLayout {
                resource_dir: Some(resources.clone()),
                current_dir: None,
            },
        );
        assert_eq!(
            config.content_candidates,
            vec![
                PathBuf::from("/srv/ui"),
                resources.join("frontend").join("build"),
                root.path().join("frontend").join("build"),
            ]
        );
    }

    #[test]
    fn malformed_profile_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.json");
        std::fs::write(&path, "{ \"frontend\": { \"preferred_port\": \"high\" } }").unwrap();

        let profile = load_profile(path.to_str());
        assert_eq!(profile.frontend.preferred_port, None);
        assert!(load_profile(Some("   ")).backend.program.is_none());
        assert!(load_profile(dir.path().join("missing.json").to_str())
            .backend
            .program
            .is_none());
    }

    #[test]
    fn readiness_mode_parsing_defaults_to_stdout() {
        assert_eq!(ReadinessMode::from_raw(" HTTP "), ReadinessMode::Http);
        assert_eq!(ReadinessMode::from_raw("tcp"), ReadinessMode::Port);
        assert_eq!(ReadinessMode::from_raw("fixed_delay"), ReadinessMode::Delay);
        assert_eq!(ReadinessMode::from_raw("banner"), ReadinessMode::Stdout);
    }
}
