use crate::error::{ClawkerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the per-project configuration
pub const CONFIG_FILE_NAME: &str = "clawker.yaml";

/// Default container path the workspace is mounted at
pub const DEFAULT_REMOTE_PATH: &str = "/workspace";

/// Default loopback port for the host proxy
pub const DEFAULT_HOST_PROXY_PORT: u16 = 18374;

/// Per-project configuration loaded from `clawker.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project key; derived from the project directory name when empty
    pub project: String,

    pub build: BuildConfig,

    pub agent: AgentConfig,

    pub workspace: WorkspaceConfig,

    pub security: SecurityConfig,

    pub host_proxy: HostProxyConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BuildConfig {
    /// Image used when neither the command line nor the project image resolves
    pub image: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Extra environment handed to every agent container
    pub env: BTreeMap<String, String>,

    pub editor: Option<String>,

    pub visual: Option<String>,

    pub claude_code: ClaudeCodeConfig,
}

/// How the claude-code config volume is seeded on first boot
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStrategy {
    /// Copy the host's claude config tree into the volume
    #[default]
    Copy,
    /// Start from an empty config
    Fresh,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClaudeCodeConfig {
    pub strategy: ConfigStrategy,

    /// Forward the host's keychain credentials and skip onboarding
    pub use_host_auth: bool,

    /// Script run once by the guest entrypoint on first start
    pub post_init: String,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            strategy: ConfigStrategy::Copy,
            use_host_auth: true,
            post_init: String::new(),
        }
    }
}

/// Workspace mount mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    /// Live bind mount of the host directory
    #[default]
    Bind,
    /// Named volume populated from the host directory when first created
    Snapshot,
}

impl WorkspaceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceMode::Bind => "bind",
            WorkspaceMode::Snapshot => "snapshot",
        }
    }
}

impl std::str::FromStr for WorkspaceMode {
    type Err = ClawkerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bind" => Ok(WorkspaceMode::Bind),
            "snapshot" => Ok(WorkspaceMode::Snapshot),
            other => Err(ClawkerError::Validation(format!(
                "invalid workspace mode '{other}': expected 'bind' or 'snapshot'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Path inside the container the workspace appears at
    pub remote_path: String,

    pub default_mode: WorkspaceMode,

    /// Project root; relative paths are resolved against the config directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_path: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            remote_path: DEFAULT_REMOTE_PATH.to_string(),
            default_mode: WorkspaceMode::Bind,
            root_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    pub enable_host_proxy: bool,

    pub firewall: FirewallConfig,

    pub git_credentials: GitCredentialsConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_host_proxy: true,
            firewall: FirewallConfig::default(),
            git_credentials: GitCredentialsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirewallConfig {
    pub enable: bool,

    /// Extra domains the guest firewall allows
    pub add_domains: Vec<String>,

    /// Named IP range sources (e.g. "github") the guest firewall allows
    pub ip_range_sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GitCredentialsConfig {
    pub forward_https: bool,
    pub forward_ssh: bool,
    pub forward_gpg: bool,
    pub copy_git_config: bool,
}

impl Default for GitCredentialsConfig {
    fn default() -> Self {
        Self {
            forward_https: true,
            forward_ssh: true,
            forward_gpg: true,
            copy_git_config: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostProxyConfig {
    pub port: u16,
}

impl Default for HostProxyConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_HOST_PROXY_PORT,
        }
    }
}

impl ProjectConfig {
    /// Load `clawker.yaml` from `project_dir`; a missing file yields defaults
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            debug!("No {} in {}, using defaults", CONFIG_FILE_NAME, project_dir.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            ClawkerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content).map_err(|e| {
            ClawkerError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        info!("Loaded project config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Directory mounted as the workspace; `config_dir` unless `root_path` is set
    pub fn project_root(&self, config_dir: &Path) -> PathBuf {
        match &self.workspace.root_path {
            Some(root) if root.is_absolute() => root.clone(),
            Some(root) => config_dir.join(root),
            None => config_dir.to_path_buf(),
        }
    }

    /// Project key, falling back to the sanitized name of `project_dir`
    pub fn project_key(&self, project_dir: &Path) -> String {
        if !self.project.is_empty() {
            return self.project.clone();
        }
        project_dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(sanitize_name)
            .unwrap_or_default()
    }
}

/// Lowercase a name and replace anything outside `[a-z0-9_.-]` with `-`
pub fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized
        .trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Home directory of the invoking user
pub fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| ClawkerError::Config("HOME environment variable not set".to_string()))
}

/// Data directory for worktrees and pid files (XDG_DATA_HOME or ~/.local/share/clawker)
pub fn data_dir() -> Result<PathBuf> {
    let base_dir = if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(data_home)
    } else {
        home_dir()?.join(".local").join("share")
    };

    Ok(base_dir.join("clawker"))
}
