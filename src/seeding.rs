//! First-boot seeding of the claude config volume.
//!
//! Seeding only happens when the config volume was created by this run. The
//! host config tree is staged into a temporary directory (an allow-listed
//! subset, with host paths rewritten for the container) and copied into the
//! volume; host credentials, when valid, are staged and copied separately.

use crate::config::{home_dir, ClaudeCodeConfig, ConfigStrategy};
use crate::error::{ClawkerError, Result};
use crate::keychain::{load_credentials, Credentials, Keychain};
use crate::runtime::ContainerRuntime;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Home directory of the `claude` user inside agent images
pub const CONTAINER_HOME: &str = "/home/claude";

/// Where the config volume is mounted inside the container
pub const CONTAINER_CONFIG_DIR: &str = "/home/claude/.claude";

pub const CREDENTIALS_FILE: &str = ".credentials.json";

/// Host config entries carried into a fresh volume
const COPY_ALLOW_LIST: &[&str] = &[
    "settings.json",
    "CLAUDE.md",
    "agents",
    "commands",
    "skills",
    "plugins",
];

/// Host claude config directory: `CLAUDE_CONFIG_DIR`, else `~/.claude`
pub fn host_config_dir() -> Result<PathBuf> {
    match std::env::var("CLAUDE_CONFIG_DIR") {
        Ok(dir) if !dir.is_empty() => Ok(PathBuf::from(dir)),
        _ => Ok(home_dir()?.join(".claude")),
    }
}

/// Directory name the claude CLI uses for a project path under `projects/`
pub fn encode_project_path(path: &str) -> String {
    path.chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect()
}

/// What seeding did, plus non-fatal incidents
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedOutcome {
    pub copied_config: bool,
    pub copied_credentials: bool,
    pub warnings: Vec<String>,
}

pub struct ConfigSeeder<'a> {
    runtime: &'a dyn ContainerRuntime,
    keychain: &'a dyn Keychain,
    host_config_dir: PathBuf,
    user: String,
}

impl<'a> ConfigSeeder<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        keychain: &'a dyn Keychain,
        host_config_dir: PathBuf,
        user: String,
    ) -> Self {
        Self {
            runtime,
            keychain,
            host_config_dir,
            user,
        }
    }

    /// Seed `volume`; callers only invoke this for a freshly created volume
    pub async fn seed(
        &self,
        volume: &str,
        claude: &ClaudeCodeConfig,
        host_project_dir: &Path,
        remote_path: &str,
    ) -> Result<SeedOutcome> {
        let mut outcome = SeedOutcome::default();

        if claude.strategy == ConfigStrategy::Copy {
            if self.host_config_dir.exists() {
                let staging = tempfile::tempdir()?;
                stage_config_tree(
                    &self.host_config_dir,
                    staging.path(),
                    host_project_dir,
                    remote_path,
                )?;
                self.runtime
                    .copy_to_volume(volume, CONTAINER_CONFIG_DIR, staging.path(), CONTAINER_CONFIG_DIR)
                    .await?;
                outcome.copied_config = true;
                info!("Seeded {} from {}", volume, self.host_config_dir.display());
            } else {
                outcome.warnings.push(format!(
                    "claude config directory {} not found; starting with an empty config",
                    self.host_config_dir.display()
                ));
            }
        }

        if claude.use_host_auth {
            match load_credentials(self.keychain, &self.user).await {
                Ok(Credentials::Valid(secret)) => {
                    let staging = tempfile::tempdir()?;
                    write_private(&staging.path().join(CREDENTIALS_FILE), secret.as_bytes())?;
                    self.runtime
                        .copy_to_volume(volume, CONTAINER_CONFIG_DIR, staging.path(), CONTAINER_CONFIG_DIR)
                        .await?;
                    outcome.copied_credentials = true;
                }
                Ok(Credentials::Missing) => outcome.warnings.push(
                    "no claude credentials found in the host keychain; log in inside the container"
                        .to_string(),
                ),
                Ok(Credentials::Expired) => outcome.warnings.push(
                    "host claude credentials have expired; log in inside the container".to_string(),
                ),
                Err(e) => outcome
                    .warnings
                    .push(format!("could not read host credentials: {e}")),
            }
        }

        Ok(outcome)
    }
}

fn write_private(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Stage the allow-listed host config into `staging`, rewriting host paths
pub fn stage_config_tree(
    host_dir: &Path,
    staging: &Path,
    host_project_dir: &Path,
    remote_path: &str,
) -> Result<()> {
    if !host_dir.is_dir() {
        return Err(ClawkerError::Config(format!(
            "{} is not a directory",
            host_dir.display()
        )));
    }

    for name in COPY_ALLOW_LIST {
        let src = host_dir.join(name);
        if !src.exists() {
            continue;
        }
        let dst = staging.join(name);
        if src.is_dir() {
            std::fs::create_dir_all(&dst)?;
            copy_dir_recursive(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst)?;
        }
        debug!("Staged {}", name);
    }

    let plugins = staging.join("plugins");
    if plugins.is_dir() {
        let host_prefix = host_dir.to_string_lossy().to_string();
        rewrite_tree(&plugins, &["json"], &host_prefix, CONTAINER_CONFIG_DIR)?;
    }

    let host_project = host_project_dir.to_string_lossy().to_string();
    let history = host_dir
        .join("projects")
        .join(encode_project_path(&host_project));
    if history.is_dir() {
        let dst = staging
            .join("projects")
            .join(encode_project_path(remote_path));
        std::fs::create_dir_all(&dst)?;
        copy_dir_recursive(&history, &dst)?;
        rewrite_tree(&dst, &["json", "jsonl"], &host_project, remote_path)?;
        debug!("Staged project history for {}", host_project);
    }

    Ok(())
}

/// Recursively copy a directory, following symlinks
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let dst_path = dst.join(entry.file_name());

        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping broken entry {}: {}", path.display(), e);
                continue;
            }
        };

        if metadata.is_dir() {
            std::fs::create_dir_all(&dst_path)?;
            copy_dir_recursive(&path, &dst_path)?;
        } else if metadata.is_file() {
            std::fs::copy(&path, &dst_path)?;
        }
    }
    Ok(())
}

/// Replace `from` with `to` in every file under `dir` with one of `extensions`
fn rewrite_tree(dir: &Path, extensions: &[&str], from: &str, to: &str) -> Result<()> {
    if from.is_empty() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            rewrite_tree(&path, extensions, from, to)?;
            continue;
        }
        let matches_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| extensions.contains(&e));
        if !matches_ext {
            continue;
        }
        // Bytes, not text: history lines may carry invalid UTF-8
        let content = std::fs::read(&path)?;
        if let Some(rewritten) = replace_bytes(&content, from.as_bytes(), to.as_bytes()) {
            std::fs::write(&path, rewritten)?;
            debug!("Rewrote host paths in {}", path.display());
        }
    }
    Ok(())
}

/// `None` when `from` does not occur
fn replace_bytes(content: &[u8], from: &[u8], to: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(content.len());
    let mut rest = content;
    let mut replaced = false;
    while let Some(pos) = rest.windows(from.len()).position(|window| window == from) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(to);
        rest = &rest[pos + from.len()..];
        replaced = true;
    }
    if !replaced {
        return None;
    }
    out.extend_from_slice(rest);
    Some(out)
}
