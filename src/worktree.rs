use crate::config::sanitize_name;
use crate::error::{ClawkerError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// A `branch[:base]` worktree request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeSpec {
    pub branch: String,
    /// Start point for a new branch; defaults to the current HEAD
    pub base: Option<String>,
}

impl WorktreeSpec {
    pub fn parse(spec: &str) -> Result<Self> {
        let (branch, base) = match spec.split_once(':') {
            Some((branch, base)) => (branch.trim(), Some(base.trim())),
            None => (spec.trim(), None),
        };
        if branch.is_empty() {
            return Err(ClawkerError::Validation(format!(
                "invalid worktree '{spec}': expected branch[:base]"
            )));
        }
        if branch.starts_with('-') || branch.contains("..") || branch.contains(char::is_whitespace)
        {
            return Err(ClawkerError::Validation(format!(
                "invalid worktree branch '{branch}'"
            )));
        }
        if base == Some("") {
            return Err(ClawkerError::Validation(format!(
                "invalid worktree '{spec}': empty base after ':'"
            )));
        }
        Ok(Self {
            branch: branch.to_string(),
            base: base.map(str::to_string),
        })
    }

    /// Directory-safe form of the branch name (`feature/x` -> `feature-x`)
    pub fn slug(&self) -> String {
        sanitize_name(&self.branch.replace('/', "-"))
    }
}

/// `<data_dir>/worktrees/<project>/<branch-slug>`
pub fn worktree_dir(data_dir: &Path, project: &str, spec: &WorktreeSpec) -> PathBuf {
    let project = if project.is_empty() { "default" } else { project };
    data_dir.join("worktrees").join(project).join(spec.slug())
}

/// Information about a git worktree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeInfo {
    /// Path to the worktree directory
    pub worktree_path: PathBuf,

    /// Path to the main repository's .git directory
    pub main_git_dir: PathBuf,
}

/// Detect if `dir` is a git worktree (its `.git` is a `gitdir:` file)
pub fn detect_worktree(dir: &Path) -> Result<Option<WorktreeInfo>> {
    let git_path = dir.join(".git");

    if !git_path.is_file() {
        debug!("{} is not a worktree checkout", dir.display());
        return Ok(None);
    }

    let git_content = std::fs::read_to_string(&git_path)
        .map_err(|e| ClawkerError::Config(format!("Failed to read .git file: {}", e)))?;

    let Some(gitdir) = git_content.trim().strip_prefix("gitdir: ") else {
        return Err(ClawkerError::Config(format!(
            "Invalid .git file format, expected 'gitdir: <path>', got: {}",
            git_content.trim()
        )));
    };

    let worktree_git_dir = dir.join(gitdir.trim()).canonicalize().map_err(|e| {
        ClawkerError::Config(format!(
            "Failed to resolve worktree git directory path {}: {}",
            gitdir.trim(),
            e
        ))
    })?;

    // <main>/.git/worktrees/<name> -> <main>/.git
    let main_git_dir = worktree_git_dir
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| {
            ClawkerError::Config(format!(
                "Unexpected worktree git directory structure: {}",
                worktree_git_dir.display()
            ))
        })?
        .to_path_buf();

    if !main_git_dir.join("config").exists() {
        return Err(ClawkerError::Config(format!(
            "Expected main git directory at {} but it doesn't appear to be a git directory",
            main_git_dir.display()
        )));
    }

    Ok(Some(WorktreeInfo {
        worktree_path: dir.to_path_buf(),
        main_git_dir,
    }))
}

/// Git operations the workspace stage delegates to
#[async_trait]
pub trait GitWorktrees: Send + Sync {
    /// Make sure a worktree for `spec` exists at `dest`, creating it from `repo`
    async fn ensure_worktree(&self, repo: &Path, spec: &WorktreeSpec, dest: &Path) -> Result<WorktreeInfo>;
}

/// [`GitWorktrees`] backed by the `git` command line
pub struct GitCli;

impl GitCli {
    async fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
        debug!("git -C {} {}", repo.display(), args.join(" "));
        Ok(Command::new("git").arg("-C").arg(repo).args(args).output().await?)
    }

    async fn branch_exists(repo: &Path, branch: &str) -> Result<bool> {
        let reference = format!("refs/heads/{branch}");
        let output = Self::git(repo, &["show-ref", "--verify", "--quiet", &reference]).await?;
        Ok(output.status.success())
    }
}

#[async_trait]
impl GitWorktrees for GitCli {
    async fn ensure_worktree(&self, repo: &Path, spec: &WorktreeSpec, dest: &Path) -> Result<WorktreeInfo> {
        if let Some(existing) = detect_worktree(dest)? {
            debug!("Reusing worktree at {}", dest.display());
            return Ok(existing);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let dest_str = dest.to_string_lossy().to_string();

        let output = if Self::branch_exists(repo, &spec.branch).await? {
            Self::git(repo, &["worktree", "add", &dest_str, &spec.branch]).await?
        } else {
            let mut args = vec!["worktree", "add", "-b", spec.branch.as_str(), dest_str.as_str()];
            if let Some(base) = &spec.base {
                args.push(base.as_str());
            }
            Self::git(repo, &args).await?
        };

        if !output.status.success() {
            return Err(ClawkerError::Config(format!(
                "git worktree add failed for '{}': {}",
                spec.branch,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        info!("Created worktree for {} at {}", spec.branch, dest.display());

        detect_worktree(dest)?.ok_or_else(|| {
            ClawkerError::Config(format!("{} is not a git worktree", dest.display()))
        })
    }
}
