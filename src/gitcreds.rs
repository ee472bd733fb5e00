use crate::config::{home_dir, GitCredentialsConfig};
use crate::request::MountSpec;
use crate::socketbridge::BridgeSockets;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

/// SSH agent socket path inside the container
pub const GUEST_SSH_SOCK: &str = "/home/claude/.ssh/agent.sock";

/// GPG agent socket path inside the container
pub const GUEST_GPG_SOCK: &str = "/home/claude/.gnupg/S.gpg-agent";

/// Read-only location of the host gitconfig; the guest entrypoint merges it
pub const HOST_GITCONFIG_MOUNT: &str = "/tmp/host-gitconfig";

/// Git-related resources found on the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostGitEnv {
    pub ssh_auth_sock: Option<PathBuf>,
    pub gpg_agent_socket: Option<PathBuf>,
    pub gitconfig: Option<PathBuf>,
}

impl HostGitEnv {
    pub async fn detect() -> Self {
        let ssh_auth_sock = std::env::var_os("SSH_AUTH_SOCK")
            .map(PathBuf::from)
            .filter(|p| p.exists());
        let gitconfig = home_dir()
            .ok()
            .map(|h| h.join(".gitconfig"))
            .filter(|p| p.is_file());

        Self {
            ssh_auth_sock,
            gpg_agent_socket: gpg_extra_socket().await,
            gitconfig,
        }
    }
}

/// Host gpg-agent extra socket, as reported by gpgconf or at the runtime dir default
async fn gpg_extra_socket() -> Option<PathBuf> {
    if let Ok(gpgconf) = which::which("gpgconf") {
        if let Ok(output) = Command::new(gpgconf)
            .args(["--list-dirs", "agent-extra-socket"])
            .output()
            .await
        {
            let path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
            if output.status.success() && path.exists() {
                return Some(path);
            }
        }
    }

    let uid = user_uid()?;
    let fallback = PathBuf::from(format!("/run/user/{uid}/gnupg/S.gpg-agent.extra"));
    if fallback.exists() {
        debug!("Using GPG agent socket {}", fallback.display());
        Some(fallback)
    } else {
        None
    }
}

#[cfg(unix)]
fn user_uid() -> Option<u32> {
    use std::os::unix::fs::MetadataExt;
    let home = home_dir().ok()?;
    std::fs::metadata(home).ok().map(|m| m.uid())
}

#[cfg(not(unix))]
fn user_uid() -> Option<u32> {
    None
}

/// Mounts, env and sockets to bridge for git credential forwarding
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitCredentialWiring {
    pub mounts: Vec<MountSpec>,
    pub env: Vec<String>,
    pub bridge: BridgeSockets,
}

pub fn wire_git_credentials(
    policy: &GitCredentialsConfig,
    host: &HostGitEnv,
    host_proxy_running: bool,
) -> GitCredentialWiring {
    let mut wiring = GitCredentialWiring::default();

    // Credential helper requests are relayed through the host proxy
    if policy.forward_https && host_proxy_running {
        wiring.env.push("CLAWKER_GIT_HTTPS=true".to_string());
    }

    if policy.forward_ssh {
        if let Some(sock) = &host.ssh_auth_sock {
            wiring.env.push(format!("SSH_AUTH_SOCK={GUEST_SSH_SOCK}"));
            wiring.env.push("CLAWKER_SSH_FORWARDING=true".to_string());
            wiring.bridge.ssh = Some(sock.clone());
        }
    }

    if policy.forward_gpg {
        if let Some(sock) = &host.gpg_agent_socket {
            wiring.env.push("CLAWKER_GPG_FORWARDING=true".to_string());
            wiring.bridge.gpg = Some(sock.clone());
        }
    }

    if policy.copy_git_config {
        if let Some(gitconfig) = &host.gitconfig {
            wiring.mounts.push(MountSpec::bind(
                gitconfig.to_string_lossy().to_string(),
                HOST_GITCONFIG_MOUNT,
                true,
            ));
        }
    }

    wiring
}
