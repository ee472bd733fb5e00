use crate::error::Result;
use crate::request::CreateRequest;
use async_trait::async_trait;
use futures_util::Stream;
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;

pub mod docker;
#[cfg(test)]
pub mod fake;

/// Label marking volumes and containers owned by clawker
pub const MANAGED_LABEL: &str = "dev.clawker.managed";
pub const PROJECT_LABEL: &str = "dev.clawker.project";
pub const AGENT_LABEL: &str = "dev.clawker.agent";

/// Labels every managed object carries
pub fn managed_labels(project: &str, agent: &str) -> HashMap<String, String> {
    HashMap::from([
        (MANAGED_LABEL.to_string(), "true".to_string()),
        (PROJECT_LABEL.to_string(), project.to_string()),
        (AGENT_LABEL.to_string(), agent.to_string()),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
}

impl VolumeInfo {
    pub fn is_managed(&self) -> bool {
        self.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachOptions {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub detach_keys: Option<String>,
}

/// One frame read from an attached container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Raw TTY output (no stdout/stderr framing)
    Console(Vec<u8>),
}

impl OutputChunk {
    pub fn bytes(&self) -> &[u8] {
        match self {
            OutputChunk::Stdout(b) | OutputChunk::Stderr(b) | OutputChunk::Console(b) => b,
        }
    }
}

pub type OutputStream = Pin<Box<dyn Stream<Item = Result<OutputChunk>> + Send>>;
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// Both halves of a hijacked attach or exec connection
pub struct AttachedStreams {
    pub output: OutputStream,
    pub input: InputSink,
}

/// Resolves with the container's exit status once the wait condition is met
pub type ExitWatcher = oneshot::Receiver<Result<i64>>;

/// When a container wait resolves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitCondition {
    /// Immediately for a container that is created but not started
    NotRunning,
    /// On the next exit after the wait is registered
    NextExit,
    /// Once the container has exited and been removed
    Removed,
}

impl WaitCondition {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitCondition::NotRunning => "not-running",
            WaitCondition::NextExit => "next-exit",
            WaitCondition::Removed => "removed",
        }
    }
}

/// Capability interface over the container daemon
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// `None` when no volume of this name exists
    async fn volume_inspect(&self, name: &str) -> Result<Option<VolumeInfo>>;

    async fn volume_create(&self, name: &str, labels: HashMap<String, String>)
        -> Result<VolumeInfo>;

    async fn volume_remove(&self, name: &str) -> Result<()>;

    /// Copy the contents of `src_dir` into `dest_path`, where the volume is
    /// seen mounted at `mount_point`
    async fn copy_to_volume(
        &self,
        volume: &str,
        mount_point: &str,
        src_dir: &Path,
        dest_path: &str,
    ) -> Result<()>;

    async fn container_create(&self, name: &str, request: &CreateRequest)
        -> Result<CreatedContainer>;

    /// Open the hijacked stream connection; valid before the container starts
    async fn container_attach(&self, id: &str, options: &AttachOptions)
        -> Result<AttachedStreams>;

    async fn container_start(&self, id: &str) -> Result<()>;

    /// The wait request has been sent to the daemon when this returns
    async fn container_wait(&self, id: &str, condition: WaitCondition) -> Result<ExitWatcher>;

    async fn container_resize(&self, id: &str, rows: u16, cols: u16) -> Result<()>;

    /// Extract a tar archive rooted at `dest_path`
    async fn copy_to_container(&self, id: &str, dest_path: &str, archive: Vec<u8>) -> Result<()>;

    async fn container_remove(&self, id: &str) -> Result<()>;

    /// Run `cmd` in a running container with stdin and stdout attached
    async fn exec_attach(&self, id: &str, cmd: &[String]) -> Result<AttachedStreams>;
}
