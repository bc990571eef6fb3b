use serde_json::json;
use url::{Host, Url};

pub const WINDOW_TITLE: &str = "Pri Fashion";
pub const WINDOW_SIZE: (f64, f64) = (1400.0, 900.0);
pub const WINDOW_MIN_SIZE: (f64, f64) = (1200.0, 800.0);
pub const ERROR_TITLE: &str = "Startup Error";

/// The native window as seen by the coordinator.
pub trait ShellWindow: Send + Sync {
    fn show_loading(&self, message: &str, percent: u8);
    fn show_error(&self, message: &str);
    fn navigate(&self, url: &str) -> Result<(), String>;
}

/// Script that renders the loading presentation of `shell/index.html`.
pub fn loading_script(message: &str, percent: u8) -> String {
    render_script(&json!({
        "kind": "loading",
        "message": message,
        "percent": percent.min(100),
    }))
}

/// Script that swaps the loading presentation for the error view. The
/// page's dismiss button invokes `dismiss_launch_error`.
pub fn error_script(message: &str) -> String {
    render_script(&json!({
        "kind": "error",
        "title": ERROR_TITLE,
        "message": message,
    }))
}

fn render_script(state: &serde_json::Value) -> String {
    // The page picks up the pending state itself if it has not loaded yet.
    format!(
        "window.__prifashionState = {state};\
         if (window.prifashionShell) {{ window.prifashionShell.render(window.__prifashionState); }}"
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    Allow,
    OpenExternal,
    Deny,
}

pub fn is_loopback_host(host: &Host<&str>) -> bool {
    match host {
        Host::Domain(domain) => domain.eq_ignore_ascii_case("localhost"),
        Host::Ipv4(addr) => addr.is_loopback(),
        Host::Ipv6(addr) => addr.is_loopback(),
    }
}

fn is_app_internal(url: &Url) -> bool {
    match url.scheme() {
        "tauri" | "asset" => true,
        "about" => url.path() == "blank",
        "http" | "https" => url.host_str() == Some("tauri.localhost"),
        _ => false,
    }
}

/// Where a navigation request from the webview may go.
pub fn navigation_decision(target: &str) -> NavigationDecision {
    let Ok(url) = Url::parse(target) else {
        return NavigationDecision::Deny;
    };
    if is_app_internal(&url) {
        return NavigationDecision::Allow;
    }
    match url.scheme() {
        "http" | "https" => match url.host() {
            Some(host) if is_loopback_host(&host) => NavigationDecision::Allow,
            Some(_) => NavigationDecision::OpenExternal,
            None => NavigationDecision::Deny,
        },
        "mailto" => NavigationDecision::OpenExternal,
        _ => NavigationDecision::Deny,
    }
}

/// `window.open` and `target="_blank"` requests never get a second window.
/// Web and mail links go to the system browser, anything else is dropped.
pub fn new_window_decision(target: &str) -> NavigationDecision {
    match Url::parse(target) {
        Ok(url) if matches!(url.scheme(), "http" | "https" | "mailto") => {
            NavigationDecision::OpenExternal
        }
        _ => NavigationDecision::Deny,
    }
}

pub const ABOUT_TITLE: &str = "About Pri Fashion";
pub const ABOUT_MESSAGE: &str = "Pri Fashion Management System";
pub const ABOUT_DETAIL: &str = "A comprehensive fashion garment management system.";

const ZOOM_STEP: f64 = 1.0;
const ZOOM_LEVEL_LIMIT: f64 = 8.0;
const ZOOM_BASE: f64 = 1.2;

/// Application menu entries handled by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    Refresh,
    ToggleDevtools,
    Exit,
    ZoomIn,
    ZoomOut,
    ZoomReset,
}

impl MenuAction {
    pub const FILE: [MenuAction; 3] = [Self::Refresh, Self::ToggleDevtools, Self::Exit];
    pub const VIEW: [MenuAction; 3] = [Self::ZoomIn, Self::ZoomOut, Self::ZoomReset];

    pub fn id(self) -> &'static str {
        match self {
            Self::Refresh => "file.refresh",
            Self::ToggleDevtools => "file.devtools",
            Self::Exit => "file.exit",
            Self::ZoomIn => "view.zoom_in",
            Self::ZoomOut => "view.zoom_out",
            Self::ZoomReset => "view.zoom_reset",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Refresh => "Refresh",
            Self::ToggleDevtools => "Toggle Developer Tools",
            Self::Exit => "Exit",
            Self::ZoomIn => "Zoom In",
            Self::ZoomOut => "Zoom Out",
            Self::ZoomReset => "Reset Zoom",
        }
    }

    pub fn accelerator(self) -> &'static str {
        match self {
            Self::Refresh => "CmdOrCtrl+R",
            Self::ToggleDevtools => "F12",
            Self::Exit => "CmdOrCtrl+Q",
            Self::ZoomIn => "CmdOrCtrl+Plus",
            Self::ZoomOut => "CmdOrCtrl+-",
            Self::ZoomReset => "CmdOrCtrl+0",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::FILE
            .into_iter()
            .chain(Self::VIEW)
            .find(|action| action.id() == id)
    }
}

/// Zoom level after `action`; level 0 is 100% and each step is a factor of 1.2.
pub fn zoom_level_after(level: f64, action: MenuAction) -> f64 {
    match action {
        MenuAction::ZoomIn => (level + ZOOM_STEP).min(ZOOM_LEVEL_LIMIT),
        MenuAction::ZoomOut => (level - ZOOM_STEP).max(-ZOOM_LEVEL_LIMIT),
        MenuAction::ZoomReset => 0.0,
        _ => level,
    }
}

pub fn zoom_factor(level: f64) -> f64 {
    ZOOM_BASE.powf(level)
}

/// Untrusted certificates are tolerated for loopback origins only. The
/// webview exposes no certificate-error hook, so this is the policy any
/// such hook must follow rather than something installed today.
#[cfg(test)]
fn accepts_untrusted_certificate(target: &str) -> bool {
    let Ok(url) = Url::parse(target) else {
        return false;
    };
    matches!(url.scheme(), "https" | "wss")
        && url.host().is_some_and(|host| is_loopback_host(&host))
}
