use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::LaunchError;
use crate::ports::find_free_port;

const INDEX_FILE: &str = "index.html";

/// First candidate directory that exists on disk.
pub fn resolve_content_root(candidates: &[PathBuf]) -> Result<PathBuf, LaunchError> {
    candidates
        .iter()
        .find(|candidate| candidate.is_dir())
        .cloned()
        .ok_or_else(|| LaunchError::ContentRootNotFound {
            candidates: candidates.to_vec(),
        })
}

pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html",
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        _ => "text/plain",
    }
}

/// Maps a request path onto a file under `root`. Anything that could leave
/// the root yields `None` and is served like a missing file.
pub fn resolve_request_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(root.join(INDEX_FILE));
    }
    if trimmed.contains('\\') || trimmed.contains(':') {
        return None;
    }
    let mut resolved = root.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

fn text_response(status: StatusCode, body: &'static str) -> Response {
    (status, body).into_response()
}

fn file_response(content_type: &'static str, bytes: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from(bytes),
    )
        .into_response()
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn serve_asset(State(root): State<Arc<PathBuf>>, uri: Uri) -> Response {
    let target = resolve_request_path(&root, uri.path());
    if let Some(path) = target {
        if is_file(&path).await {
            return match tokio::fs::read(&path).await {
                Ok(bytes) => file_response(content_type_for(&path), bytes),
                Err(err) => {
                    log::warn!("failed to read {}: {err}", path.display());
                    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Server error")
                }
            };
        }
    }

    match tokio::fs::read(root.join(INDEX_FILE)).await {
        Ok(bytes) => file_response("text/html", bytes),
        Err(err) => {
            log::warn!("spa fallback for {} unavailable: {err}", uri.path());
            text_response(StatusCode::NOT_FOUND, "Not found")
        }
    }
}

pub fn router(root: PathBuf) -> Router {
    Router::new()
        .fallback(serve_asset)
        .with_state(Arc::new(root))
}

/// A bound loopback HTTP server for the UI bundle.
#[derive(Debug)]
pub struct ListeningServer {
    addr: SocketAddr,
    root: PathBuf,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ListeningServer {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn host(&self) -> Ipv4Addr {
        Ipv4Addr::LOCALHOST
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port())
    }

    pub fn is_open(&self) -> bool {
        self.shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops accepting connections; in-flight requests finish. Returns
    /// whether this call closed an open server.
    pub fn close(&self) -> bool {
        let sender = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                let _ = sender.send(());
                log::info!("frontend server on {} closing", self.addr);
                true
            }
            None => false,
        }
    }

    /// Waits for the server task to finish after `close`.
    pub async fn wait_closed(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Resolves the content root, allocates a port and binds the server.
pub async fn serve(
    candidates: &[PathBuf],
    preferred_port: u16,
    max_port_attempts: u16,
) -> Result<ListeningServer, LaunchError> {
    let root = resolve_content_root(candidates)?;
    let port = find_free_port(preferred_port, max_port_attempts)?;
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
        .await
        .map_err(|source| LaunchError::FrontendBind { port, source })?;
    let addr = listener
        .local_addr()
        .map_err(|source: io::Error| LaunchError::FrontendBind { port, source })?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(root.clone());
    let task = tokio::spawn(async move {
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await;
        match served {
            Ok(()) => log::info!("frontend server on {addr} stopped"),
            Err(err) => log::error!("frontend server on {addr} failed: {err}"),
        }
    });
    log::info!("frontend server serving {} on http://{addr}", root.display());

    Ok(ListeningServer {
        addr,
        root,
        shutdown_tx: Mutex::new(Some(shutdown_tx)),
        task: Mutex::new(Some(task)),
    })
}
