//! SSH and GPG agent forwarding into running containers.
//!
//! A detached `clawker bridge serve` process per container relays each host
//! agent socket through the runtime's exec channel: the guest side is a
//! `socat` listener on the well-known socket path, the host side a plain
//! UNIX socket connection opened when the guest sends its first request.

use crate::error::{ClawkerError, Result};
use crate::gitcreds::{GUEST_GPG_SOCK, GUEST_SSH_SOCK};
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Consecutive empty relay sessions before the bridge gives up on a socket
const MAX_IDLE_SESSIONS: u32 = 3;

/// Host sockets to forward into a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSockets {
    pub ssh: Option<PathBuf>,
    pub gpg: Option<PathBuf>,
}

impl BridgeSockets {
    pub fn is_empty(&self) -> bool {
        self.ssh.is_none() && self.gpg.is_none()
    }

    /// (host socket, guest socket) pairs
    pub fn pairs(&self) -> Vec<(PathBuf, &'static str)> {
        let mut pairs = Vec::new();
        if let Some(ssh) = &self.ssh {
            pairs.push((ssh.clone(), GUEST_SSH_SOCK));
        }
        if let Some(gpg) = &self.gpg {
            pairs.push((gpg.clone(), GUEST_GPG_SOCK));
        }
        pairs
    }
}

#[async_trait]
pub trait SocketBridge: Send + Sync {
    /// Make sure a bridge for `container_id` is running; idempotent
    async fn ensure_bridge(&self, container_id: &str, sockets: &BridgeSockets) -> Result<()>;
}

/// Runs each bridge as a detached `clawker bridge serve` process
pub struct ProcessSocketBridge {
    exe: PathBuf,
    pid_dir: PathBuf,
}

impl ProcessSocketBridge {
    pub fn new(pid_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe()?,
            pid_dir,
        })
    }

    fn pid_file(&self, container_id: &str) -> PathBuf {
        let short = &container_id[..container_id.len().min(12)];
        self.pid_dir.join(format!("bridge-{short}.pid"))
    }
}

/// Whether a process with this pid exists
pub fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check
    unsafe { libc::kill(pid, 0) == 0 }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[async_trait]
impl SocketBridge for ProcessSocketBridge {
    async fn ensure_bridge(&self, container_id: &str, sockets: &BridgeSockets) -> Result<()> {
        if sockets.is_empty() {
            return Ok(());
        }

        let pid_file = self.pid_file(container_id);
        if let Some(pid) = read_pid(&pid_file) {
            if process_alive(pid) {
                debug!("Socket bridge for {} already running (pid {})", container_id, pid);
                return Ok(());
            }
        }

        tokio::fs::create_dir_all(&self.pid_dir).await?;
        let mut cmd = std::process::Command::new(&self.exe);
        cmd.args(["bridge", "serve", "--container", container_id]);
        if let Some(ssh) = &sockets.ssh {
            cmd.arg("--ssh").arg(ssh);
        }
        if let Some(gpg) = &sockets.gpg {
            cmd.arg("--gpg").arg(gpg);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|e| {
            ClawkerError::Unavailable(format!("failed to start socket bridge: {e}"))
        })?;
        tokio::fs::write(&pid_file, child.id().to_string()).await?;
        info!("Started socket bridge for {} (pid {})", container_id, child.id());
        Ok(())
    }
}

/// Guest-side listener command for one forwarded socket
pub fn guest_listener_command(guest_socket: &str) -> Vec<String> {
    let dir = Path::new(guest_socket)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|| "/tmp".to_string());
    vec![
        "sh".to_string(),
        "-c".to_string(),
        format!(
            "mkdir -p {dir} && chmod 700 {dir} && exec socat UNIX-LISTEN:{guest_socket},unlink-early,mode=600 STDIO"
        ),
    ]
}

/// Relay every socket in `sockets` until the container goes away or `cancel` fires
#[cfg(unix)]
pub async fn serve_bridge(
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    sockets: BridgeSockets,
    cancel: CancellationToken,
) -> Result<()> {
    let mut tasks = Vec::new();
    for (host, guest) in sockets.pairs() {
        let runtime = runtime.clone();
        let container_id = container_id.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                result = relay_socket(runtime.as_ref(), &container_id, &host, guest) => {
                    if let Err(e) = result {
                        warn!("Bridge for {} stopped: {}", guest, e);
                    }
                }
                _ = cancel.cancelled() => debug!("Bridge for {} cancelled", guest),
            }
        }));
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Bridge task failed: {}", e);
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn relay_socket(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    host_socket: &Path,
    guest_socket: &str,
) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let command = guest_listener_command(guest_socket);
    let mut idle_sessions = 0;

    loop {
        // A failed exec means the container is gone
        let streams = runtime.exec_attach(container_id, &command).await?;
        let mut output = streams.output;
        let mut input = streams.input;

        // The guest client speaks first; connect to the host agent on demand
        let Some(first) = output.next().await else {
            idle_sessions += 1;
            if idle_sessions >= MAX_IDLE_SESSIONS {
                return Err(ClawkerError::Runtime(format!(
                    "listener for {guest_socket} keeps exiting; is socat installed in the image?"
                )));
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        };
        idle_sessions = 0;

        let host = tokio::net::UnixStream::connect(host_socket).await?;
        let (mut host_read, mut host_write) = host.into_split();
        host_write.write_all(first?.bytes()).await?;

        let to_host = async {
            while let Some(chunk) = output.next().await {
                host_write.write_all(chunk?.bytes()).await?;
            }
            Ok::<_, ClawkerError>(())
        };
        let to_guest = async {
            let mut buf = vec![0u8; 8192];
            loop {
                let n = host_read.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                input.write_all(&buf[..n]).await?;
            }
            input.shutdown().await?;
            Ok::<_, ClawkerError>(())
        };

        tokio::select! {
            result = to_host => result?,
            result = to_guest => result?,
        }
        debug!("Relay session for {} finished", guest_socket);
    }
}
