//! Loopback HTTP service that lets agent containers reach the host.
//!
//! One proxy serves every container on the machine. The first `clawker run`
//! that needs it spawns a detached `clawker host-proxy serve` process; later
//! runs find the port answering and reuse it.

use crate::error::{ClawkerError, Result};
use async_trait::async_trait;
use axum::{
    extract::Json,
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Container env var carrying the proxy URL
pub const HOST_PROXY_ENV: &str = "CLAWKER_HOST_PROXY";

/// Host name containers use to reach the host gateway
pub const HOST_GATEWAY_ALIAS: &str = "host.docker.internal";

/// Extra-hosts entry mapping the alias onto the gateway
pub const HOST_GATEWAY_EXTRA_HOST: &str = "host.docker.internal:host-gateway";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(3);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_millis(300);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait HostProxy: Send + Sync {
    /// Start the proxy if needed; returns the URL containers should use
    async fn ensure_running(&self) -> Result<String>;
}

/// URL handed to containers for a proxy on `port`
pub fn container_url(port: u16) -> String {
    format!("http://{HOST_GATEWAY_ALIAS}:{port}")
}

/// Whether something accepts connections on the loopback port
pub async fn is_listening(port: u16) -> bool {
    matches!(
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Spawns and tracks the per-host proxy process
pub struct HostProxyManager {
    exe: PathBuf,
    port: u16,
    url: Mutex<Option<String>>,
}

impl HostProxyManager {
    pub fn new(port: u16) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            port,
            url: Mutex::new(None),
        })
    }

    fn spawn_server(&self) -> Result<()> {
        let mut cmd = std::process::Command::new(&self.exe);
        cmd.args(["host-proxy", "serve", "--port", &self.port.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn().map_err(|e| {
            ClawkerError::Unavailable(format!("failed to start host proxy: {e}"))
        })?;
        info!("Started host proxy on port {} (pid {})", self.port, child.id());
        Ok(())
    }
}

#[async_trait]
impl HostProxy for HostProxyManager {
    async fn ensure_running(&self) -> Result<String> {
        let mut url = self.url.lock().await;
        if let Some(url) = url.as_ref() {
            if is_listening(self.port).await {
                return Ok(url.clone());
            }
        }

        if !is_listening(self.port).await {
            self.spawn_server()?;
            let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
            while !is_listening(self.port).await {
                if tokio::time::Instant::now() >= deadline {
                    return Err(ClawkerError::Unavailable(format!(
                        "host proxy did not answer on port {} within {}s",
                        self.port,
                        STARTUP_TIMEOUT.as_secs()
                    )));
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        } else {
            debug!("Host proxy already listening on port {}", self.port);
        }

        let container = container_url(self.port);
        *url = Some(container.clone());
        Ok(container)
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenUrlRequest {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct GitCredentialRequest {
    /// `fill`, `approve` or `reject`
    pub action: String,
    /// Credential description in git's key=value protocol
    pub input: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GitCredentialResponse {
    pub output: String,
}

type HandlerError = (StatusCode, String);

/// Routes served by `clawker host-proxy serve`
pub fn build_router() -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/open/url", post(open_url_handler))
        .route("/git/credential", post(git_credential_handler))
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn open_url_handler(
    Json(request): Json<OpenUrlRequest>,
) -> std::result::Result<StatusCode, HandlerError> {
    let url = request.url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("refusing to open non-http URL '{url}'"),
        ));
    }
    info!("Opening {} in the host browser", url);
    open::that_detached(url).map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to open browser: {e}"),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn git_credential_handler(
    Json(request): Json<GitCredentialRequest>,
) -> std::result::Result<Json<GitCredentialResponse>, HandlerError> {
    if !matches!(request.action.as_str(), "fill" | "approve" | "reject") {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("unsupported credential action '{}'", request.action),
        ));
    }

    let output = run_git_credential(&request.action, &request.input)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(GitCredentialResponse { output }))
}

async fn run_git_credential(action: &str, input: &str) -> Result<String> {
    let mut child = Command::new("git")
        .args(["credential", action])
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input.as_bytes()).await?;
        if !input.ends_with('\n') {
            stdin.write_all(b"\n").await?;
        }
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(ClawkerError::Runtime(format!(
            "git credential {action} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Loopback, plus the bridge gateway containers reach the host through on Linux
pub fn listen_addresses(bridge_gateway: Option<IpAddr>) -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    if let Some(gateway) = bridge_gateway {
        if !addrs.contains(&gateway) {
            addrs.push(gateway);
        }
    }
    addrs
}

/// Serve the proxy on `port` of every address until `cancel` fires.
///
/// The first address is required; the others are served when they can be bound.
pub async fn serve(addrs: &[IpAddr], port: u16, cancel: CancellationToken) -> Result<()> {
    let mut listeners = Vec::new();
    for (i, ip) in addrs.iter().enumerate() {
        let addr = SocketAddr::new(*ip, port);
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!("Host proxy listening on {}", addr);
                listeners.push(listener);
            }
            Err(e) if i == 0 => {
                return Err(ClawkerError::Unavailable(format!(
                    "failed to bind host proxy to {addr}: {e}"
                )));
            }
            Err(e) => warn!("Host proxy not reachable on {}: {}", addr, e),
        }
    }

    let servers = listeners.into_iter().map(|listener| {
        let cancel = cancel.clone();
        async move {
            axum::serve(listener, build_router())
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
        }
    });
    if let Err(e) = futures_util::future::try_join_all(servers).await {
        warn!("Host proxy server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
pub use fake::FakeHostProxy;
