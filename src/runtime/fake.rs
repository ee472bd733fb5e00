//! Recording in-memory runtime used by unit tests.

use super::{
    AttachOptions, AttachedStreams, ContainerRuntime, CreatedContainer, ExitWatcher, OutputChunk,
    VolumeInfo, WaitCondition,
};
use crate::archive::{read_entries, tar_directory};
use crate::error::{ClawkerError, Result};
use crate::request::CreateRequest;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};

/// Ordered log of collaborator calls shared between fakes
#[derive(Clone, Default)]
pub struct CallTrace(Arc<Mutex<Vec<String>>>);

impl CallTrace {
    pub fn record(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Index of the first call starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }
}

/// How the fake container behaves once started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitBehavior {
    /// Emit the configured output, close the stream, exit with this code
    Code(i64),
    /// Close the stream without exiting (user pressed the detach keys)
    Detach,
    /// Keep running until the test ends
    Hang,
}

/// One recorded archive upload
#[derive(Debug, Clone)]
pub struct CopyCall {
    /// Volume name or container id
    pub target: String,
    pub dest_path: String,
    pub entries: Vec<(String, Vec<u8>)>,
}

impl CopyCall {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, c)| c.as_slice())
    }
}

/// Writer that appends everything to a shared buffer
#[derive(Clone, Default)]
pub struct RecordingSink(pub Arc<Mutex<Vec<u8>>>);

impl RecordingSink {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for RecordingSink {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub struct FakeRuntime {
    pub trace: CallTrace,
    volumes: Mutex<BTreeMap<String, VolumeInfo>>,
    images: Mutex<HashSet<String>>,
    failures: Mutex<HashSet<String>>,
    /// Volumes that appear (managed) between inspect and create
    racing_volumes: Mutex<HashSet<String>>,
    containers: Mutex<BTreeMap<String, String>>,
    pub created: Mutex<Vec<(String, CreateRequest)>>,
    pub volume_copies: Mutex<Vec<CopyCall>>,
    pub container_copies: Mutex<Vec<CopyCall>>,
    pub stdin_received: Arc<Mutex<Vec<u8>>>,
    output: Mutex<Vec<OutputChunk>>,
    exit: Mutex<ExitBehavior>,
    output_tx: Mutex<Option<mpsc::UnboundedSender<OutputChunk>>>,
    exit_tx: Mutex<Option<oneshot::Sender<Result<i64>>>>,
    started: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn new(trace: CallTrace) -> Self {
        Self {
            trace,
            volumes: Mutex::default(),
            images: Mutex::default(),
            failures: Mutex::default(),
            racing_volumes: Mutex::default(),
            containers: Mutex::default(),
            created: Mutex::default(),
            volume_copies: Mutex::default(),
            container_copies: Mutex::default(),
            stdin_received: Arc::default(),
            output: Mutex::default(),
            exit: Mutex::new(ExitBehavior::Code(0)),
            output_tx: Mutex::default(),
            exit_tx: Mutex::default(),
            started: Mutex::default(),
        }
    }

    /// Fail calls to `op`, or only `op:<arg>` when qualified
    pub fn fail(&self, op: &str) {
        self.failures.lock().unwrap().insert(op.to_string());
    }

    pub fn add_image(&self, image: &str) {
        self.images.lock().unwrap().insert(image.to_string());
    }

    pub fn add_volume(&self, name: &str, labels: HashMap<String, String>) {
        self.volumes.lock().unwrap().insert(
            name.to_string(),
            VolumeInfo {
                name: name.to_string(),
                labels,
            },
        );
    }

    pub fn race_volume(&self, name: &str) {
        self.racing_volumes.lock().unwrap().insert(name.to_string());
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.volumes.lock().unwrap().keys().cloned().collect()
    }

    pub fn set_output(&self, chunks: Vec<OutputChunk>) {
        *self.output.lock().unwrap() = chunks;
    }

    pub fn set_exit(&self, behavior: ExitBehavior) {
        *self.exit.lock().unwrap() = behavior;
    }

    fn check(&self, op: &str, arg: &str) -> Result<()> {
        let failures = self.failures.lock().unwrap();
        if failures.contains(op) || failures.contains(&format!("{op}:{arg}")) {
            return Err(ClawkerError::Runtime(format!("injected {op} failure")));
        }
        Ok(())
    }

    fn container_id(n: usize) -> String {
        format!("c0ffee{n:058x}")
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        self.trace.record(format!("image_exists({image})"));
        self.check("image_exists", image)?;
        Ok(self.images.lock().unwrap().contains(image))
    }

    async fn volume_inspect(&self, name: &str) -> Result<Option<VolumeInfo>> {
        self.trace.record(format!("volume_inspect({name})"));
        self.check("volume_inspect", name)?;
        Ok(self.volumes.lock().unwrap().get(name).cloned())
    }

    async fn volume_create(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<VolumeInfo> {
        self.trace.record(format!("volume_create({name})"));
        if self.racing_volumes.lock().unwrap().remove(name) {
            self.add_volume(name, crate::runtime::managed_labels("other", "run"));
            return Err(ClawkerError::Runtime(format!("volume {name} already exists")));
        }
        self.check("volume_create", name)?;
        let mut volumes = self.volumes.lock().unwrap();
        let info = volumes
            .entry(name.to_string())
            .or_insert_with(|| VolumeInfo {
                name: name.to_string(),
                labels,
            })
            .clone();
        Ok(info)
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        self.trace.record(format!("volume_remove({name})"));
        self.check("volume_remove", name)?;
        match self.volumes.lock().unwrap().remove(name) {
            Some(_) => Ok(()),
            None => Err(ClawkerError::NotFound(format!("volume {name}"))),
        }
    }

    async fn copy_to_volume(
        &self,
        volume: &str,
        _mount_point: &str,
        src_dir: &Path,
        dest_path: &str,
    ) -> Result<()> {
        self.trace.record(format!("copy_to_volume({volume},{dest_path})"));
        self.check("copy_to_volume", volume)?;
        if !self.volumes.lock().unwrap().contains_key(volume) {
            return Err(ClawkerError::NotFound(format!("volume {volume}")));
        }
        let entries = read_entries(&tar_directory(src_dir)?);
        self.volume_copies.lock().unwrap().push(CopyCall {
            target: volume.to_string(),
            dest_path: dest_path.to_string(),
            entries,
        });
        Ok(())
    }

    async fn container_create(
        &self,
        name: &str,
        request: &CreateRequest,
    ) -> Result<CreatedContainer> {
        self.trace.record(format!("create({name})"));
        self.check("container_create", name)?;
        let mut containers = self.containers.lock().unwrap();
        if containers.values().any(|n| n == name) {
            return Err(ClawkerError::Runtime(format!(
                "Conflict. The container name \"/{name}\" is already in use"
            )));
        }
        let id = Self::container_id(containers.len() + 1);
        containers.insert(id.clone(), name.to_string());
        self.created
            .lock()
            .unwrap()
            .push((name.to_string(), request.clone()));
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn container_attach(&self, id: &str, _options: &AttachOptions) -> Result<AttachedStreams> {
        self.trace.record(format!("attach({id})"));
        self.check("container_attach", id)?;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.output_tx.lock().unwrap() = Some(tx);
        let output = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (Ok(chunk), rx))
        });
        Ok(AttachedStreams {
            output: Box::pin(output),
            input: Box::pin(RecordingSink(self.stdin_received.clone())),
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.trace.record(format!("start({id})"));
        self.check("container_start", id)?;
        self.started.lock().unwrap().insert(id.to_string());

        let behavior = *self.exit.lock().unwrap();
        let output_tx = self.output_tx.lock().unwrap().take();
        if let Some(tx) = &output_tx {
            for chunk in self.output.lock().unwrap().drain(..) {
                let _ = tx.send(chunk);
            }
        }
        match behavior {
            ExitBehavior::Code(code) => {
                drop(output_tx);
                if let Some(tx) = self.exit_tx.lock().unwrap().take() {
                    let _ = tx.send(Ok(code));
                }
            }
            ExitBehavior::Detach => drop(output_tx),
            ExitBehavior::Hang => *self.output_tx.lock().unwrap() = output_tx,
        }
        Ok(())
    }

    async fn container_wait(&self, id: &str, condition: WaitCondition) -> Result<ExitWatcher> {
        self.trace.record(format!("wait({id},{})", condition.as_str()));
        self.check("container_wait", id)?;
        let (tx, rx) = oneshot::channel();
        // Like the daemon, a created container already satisfies "not-running"
        if condition == WaitCondition::NotRunning && !self.started.lock().unwrap().contains(id) {
            let _ = tx.send(Ok(0));
        } else {
            *self.exit_tx.lock().unwrap() = Some(tx);
        }
        Ok(rx)
    }

    async fn container_resize(&self, id: &str, rows: u16, cols: u16) -> Result<()> {
        self.trace.record(format!("resize({id},{rows},{cols})"));
        self.check("container_resize", id)
    }

    async fn copy_to_container(&self, id: &str, dest_path: &str, archive: Vec<u8>) -> Result<()> {
        self.trace.record(format!("copy_to_container({id},{dest_path})"));
        self.check("copy_to_container", dest_path)?;
        let entries = read_entries(&archive);
        for (path, _) in &entries {
            self.check("copy_to_container", path)?;
        }
        self.container_copies.lock().unwrap().push(CopyCall {
            target: id.to_string(),
            dest_path: dest_path.to_string(),
            entries,
        });
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> Result<()> {
        self.trace.record(format!("remove({id})"));
        self.check("container_remove", id)?;
        self.containers.lock().unwrap().remove(id);
        Ok(())
    }

    async fn exec_attach(&self, id: &str, cmd: &[String]) -> Result<AttachedStreams> {
        self.trace.record(format!("exec({id},{})", cmd.join(" ")));
        self.check("exec_attach", id)?;
        let output = futures_util::stream::empty::<Result<OutputChunk>>();
        Ok(AttachedStreams {
            output: Box::pin(output),
            input: Box::pin(RecordingSink(self.stdin_received.clone())),
        })
    }
}
