//! Workspace setup: source directory, mount set and per-agent volumes.

use crate::config::WorkspaceMode;
use crate::error::{ClawkerError, Result};
use crate::naming::{AgentNames, VolumeKind};
use crate::request::MountSpec;
use crate::runtime::{managed_labels, ContainerRuntime};
use crate::seeding::CONTAINER_CONFIG_DIR;
use crate::worktree::{worktree_dir, GitWorktrees, WorktreeSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the shell history volume is mounted
pub const HISTORY_MOUNT: &str = "/commandhistory";

pub struct WorkspaceRequest<'a> {
    /// Project root on the host (configured root or the working directory)
    pub project_dir: &'a Path,
    pub remote_path: &'a str,
    pub mode: WorkspaceMode,
    pub worktree: Option<&'a WorktreeSpec>,
    /// Parent of the managed worktrees directory
    pub data_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceSetup {
    pub mounts: Vec<MountSpec>,
    /// Host directory the workspace comes from
    pub source_dir: PathBuf,
    pub mode: WorkspaceMode,
    pub config_volume: String,
    /// Config volume was created by this run, so it needs seeding
    pub config_freshly_created: bool,
}

/// Ensure a managed volume named `name` exists; returns whether it was created.
///
/// Existing managed volumes are reused. A volume of that name without the
/// managed label is never touched. A create that loses a race against
/// another run creating the same managed volume counts as reuse.
pub async fn ensure_volume(
    runtime: &dyn ContainerRuntime,
    name: &str,
    names: &AgentNames,
) -> Result<bool> {
    if let Some(existing) = runtime.volume_inspect(name).await? {
        if !existing.is_managed() {
            return Err(ClawkerError::ForeignVolume(name.to_string()));
        }
        debug!("Reusing volume {}", name);
        return Ok(false);
    }

    match runtime
        .volume_create(name, managed_labels(&names.project, &names.agent))
        .await
    {
        Ok(created) if created.is_managed() => {
            info!("Created volume {}", name);
            Ok(true)
        }
        Ok(_) => Err(ClawkerError::ForeignVolume(name.to_string())),
        Err(create_err) => match runtime.volume_inspect(name).await {
            Ok(Some(existing)) if existing.is_managed() => {
                debug!("Volume {} appeared concurrently; reusing", name);
                Ok(false)
            }
            Ok(Some(_)) => Err(ClawkerError::ForeignVolume(name.to_string())),
            _ => Err(create_err),
        },
    }
}

/// Resolve the source directory, compute mounts and ensure volumes.
///
/// Every volume created here is pushed to `created` as soon as it exists so a
/// failure later in this stage still rolls it back.
pub async fn setup_workspace(
    runtime: &dyn ContainerRuntime,
    git: &dyn GitWorktrees,
    names: &AgentNames,
    request: &WorkspaceRequest<'_>,
    created: &mut Vec<String>,
) -> Result<WorkspaceSetup> {
    let mut mounts = Vec::new();

    let source_dir = match request.worktree {
        Some(spec) => {
            let dest = worktree_dir(request.data_dir, &names.project, spec);
            let info = git.ensure_worktree(request.project_dir, spec, &dest).await?;
            let git_dir = info.main_git_dir.to_string_lossy().to_string();
            mounts.push(MountSpec::bind(git_dir.clone(), git_dir, false));
            info.worktree_path
        }
        None => request.project_dir.to_path_buf(),
    };

    let config_volume = names.config_volume();
    let config_freshly_created = ensure_volume(runtime, &config_volume, names).await?;
    if config_freshly_created {
        created.push(config_volume.clone());
    }
    mounts.push(MountSpec::volume(config_volume.clone(), CONTAINER_CONFIG_DIR));

    let history_volume = names.volume(VolumeKind::History);
    if ensure_volume(runtime, &history_volume, names).await? {
        created.push(history_volume.clone());
    }
    mounts.push(MountSpec::volume(history_volume, HISTORY_MOUNT));

    match request.mode {
        WorkspaceMode::Bind => {
            mounts.push(MountSpec::bind(
                source_dir.to_string_lossy().to_string(),
                request.remote_path,
                false,
            ));
        }
        WorkspaceMode::Snapshot => {
            let workspace_volume = names.volume(VolumeKind::Workspace);
            if ensure_volume(runtime, &workspace_volume, names).await? {
                created.push(workspace_volume.clone());
                runtime
                    .copy_to_volume(
                        &workspace_volume,
                        request.remote_path,
                        &source_dir,
                        request.remote_path,
                    )
                    .await?;
                info!("Snapshot of {} copied into {}", source_dir.display(), workspace_volume);
            }
            mounts.push(MountSpec::volume(workspace_volume, request.remote_path));
        }
    }

    Ok(WorkspaceSetup {
        mounts,
        source_dir,
        mode: request.mode,
        config_volume,
        config_freshly_created,
    })
}
