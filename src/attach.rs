//! Start-or-handoff: detached start, or attach-then-start for foreground runs.
//!
//! The foreground path opens the attach connection and arms the exit watcher
//! before the container starts, so a short-lived container cannot finish (or
//! be auto-removed) before anything is listening. Output pumps are running
//! before `start` is issued for the same reason.

use crate::error::{ClawkerError, Result};
use crate::runtime::{AttachOptions, ContainerRuntime, OutputChunk, OutputStream, WaitCondition};
use crate::socketbridge::{BridgeSockets, SocketBridge};
use crate::terminal::{RawModeGuard, Terminal};
use futures_util::StreamExt;
use std::io::Read;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long to wait for an exit status after the output stream closes
pub const DETACH_GRACE: Duration = Duration::from_secs(2);

/// How long to let output drain after the exit status arrives
pub const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Bytes buffered between the stdin reader thread and the input pump
const STDIN_BUFFER: usize = 64 * 1024;

/// Length of the short container id
pub const SHORT_ID_LEN: usize = 12;

pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(SHORT_ID_LEN)]
}

/// Caller-side standard streams
pub struct IoStreams {
    pub stdin: Pin<Box<dyn AsyncRead + Send>>,
    pub stdout: Pin<Box<dyn AsyncWrite + Send>>,
    pub stderr: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Feed a blocking reader through a dedicated thread.
///
/// The thread is never joined, so a read parked on an idle terminal does not
/// hold up runtime shutdown once the session is over.
pub fn thread_reader<R: Read + Send + 'static>(mut reader: R) -> Pin<Box<dyn AsyncRead + Send>> {
    let handle = match tokio::runtime::Handle::try_current() {
        Ok(handle) => handle,
        Err(e) => {
            warn!("Input forwarding unavailable: {}", e);
            return Box::pin(tokio::io::empty());
        }
    };
    let (read_half, mut write_half) = tokio::io::duplex(STDIN_BUFFER);
    let spawned = std::thread::Builder::new()
        .name("clawker-stdin".to_string())
        .spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("Input read failed: {}", e);
                        break;
                    }
                };
                // Fails once the session dropped its end
                if handle.block_on(write_half.write_all(&buf[..n])).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Input forwarding unavailable: {}", e);
    }
    Box::pin(read_half)
}

impl IoStreams {
    pub fn std() -> Self {
        Self {
            stdin: thread_reader(std::io::stdin()),
            stdout: Box::pin(tokio::io::stdout()),
            stderr: Box::pin(tokio::io::stderr()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub container_id: String,
    pub detach: bool,
    pub tty: bool,
    /// Forward caller stdin to the container
    pub stdin: bool,
    pub detach_keys: Option<String>,
    /// The daemon removes the container when it exits
    pub auto_remove: bool,
    /// Host agent sockets to bridge once the container runs
    pub bridge: BridgeSockets,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// Started in the background
    Started,
    /// Foreground container exited with status 0
    Exited,
    /// Output closed without an exit; the user detached
    Detached,
}

pub struct Launcher<'a> {
    runtime: &'a dyn ContainerRuntime,
    terminal: &'a dyn Terminal,
    bridge: Option<&'a dyn SocketBridge>,
    cancel: CancellationToken,
    detach_grace: Duration,
    drain_grace: Duration,
}

impl<'a> Launcher<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        terminal: &'a dyn Terminal,
        bridge: Option<&'a dyn SocketBridge>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            terminal,
            bridge,
            cancel,
            detach_grace: DETACH_GRACE,
            drain_grace: DRAIN_GRACE,
        }
    }

    pub fn with_detach_grace(mut self, grace: Duration) -> Self {
        self.detach_grace = grace;
        self
    }

    /// Start the container; a non-zero foreground exit is `ClawkerError::Exit`
    pub async fn launch(&self, request: &LaunchRequest, io: IoStreams) -> Result<LaunchOutcome> {
        if request.detach {
            self.start_detached(request, io).await
        } else {
            self.attach_then_start(request, io).await
        }
    }

    async fn ensure_bridge(&self, request: &LaunchRequest) {
        let Some(bridge) = self.bridge else {
            return;
        };
        if request.bridge.is_empty() {
            return;
        }
        if let Err(e) = bridge.ensure_bridge(&request.container_id, &request.bridge).await {
            warn!("Socket forwarding unavailable: {}", e);
        }
    }

    async fn start_detached(&self, request: &LaunchRequest, mut io: IoStreams) -> Result<LaunchOutcome> {
        let id = &request.container_id;
        self.runtime.container_start(id).await?;
        self.ensure_bridge(request).await;

        io.stdout
            .write_all(format!("{}\n", short_id(id)).as_bytes())
            .await?;
        io.stdout.flush().await?;
        info!("Started {} in the background", short_id(id));
        Ok(LaunchOutcome::Started)
    }

    async fn attach_then_start(&self, request: &LaunchRequest, io: IoStreams) -> Result<LaunchOutcome> {
        let id = request.container_id.as_str();

        let raw_mode = if request.tty {
            self.terminal.enable_raw_mode()?
        } else {
            RawModeGuard::noop()
        };

        let outcome = self.run_session(request, io).await;

        drop(raw_mode);
        debug!("Session with {} ended: {:?}", short_id(id), outcome);

        match outcome? {
            SessionEnd::Exit(0) => Ok(LaunchOutcome::Exited),
            SessionEnd::Exit(code) => Err(ClawkerError::Exit { code }),
            SessionEnd::Detached => {
                info!("Detached from {}; it keeps running", short_id(id));
                Ok(LaunchOutcome::Detached)
            }
        }
    }

    async fn run_session(&self, request: &LaunchRequest, io: IoStreams) -> Result<SessionEnd> {
        let id = request.container_id.as_str();
        let IoStreams {
            stdin,
            stdout,
            stderr,
        } = io;

        let attached = self
            .runtime
            .container_attach(
                id,
                &AttachOptions {
                    stdin: request.stdin,
                    stdout: true,
                    stderr: true,
                    detach_keys: request.detach_keys.clone(),
                },
            )
            .await?;
        // "not-running" would resolve at once for a container that is only created
        let condition = if request.auto_remove {
            WaitCondition::Removed
        } else {
            WaitCondition::NextExit
        };
        let mut exit = self.runtime.container_wait(id, condition).await?;

        let mut output_task = TaskGuard(tokio::spawn(pump_output(attached.output, stdout, stderr)));
        let _input_task = request
            .stdin
            .then(|| TaskGuard(tokio::spawn(pump_input(stdin, attached.input))));

        self.runtime.container_start(id).await?;

        let mut resizes = None;
        if request.tty {
            // Guests only redraw on a size change, so nudge then restore
            let (rows, cols) = self.terminal.size()?;
            self.runtime.container_resize(id, rows.saturating_add(1), cols.saturating_add(1)).await?;
            self.runtime.container_resize(id, rows, cols).await?;
            resizes = Some(self.terminal.resize_events()?);
        }

        self.ensure_bridge(request).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Err(ClawkerError::Cancelled),

                pumped = &mut output_task.0 => {
                    match pumped {
                        Err(e) => break Err(ClawkerError::Runtime(format!("output pump failed: {e}"))),
                        Ok(Err(e)) => break Err(e),
                        Ok(Ok(())) => {}
                    }
                    break match tokio::time::timeout(self.detach_grace, &mut exit).await {
                        Ok(Ok(Ok(code))) => Ok(SessionEnd::Exit(code)),
                        Ok(Ok(Err(e))) => Err(e),
                        Ok(Err(_)) => Err(ClawkerError::Runtime(
                            "exit watcher closed without a status".to_string(),
                        )),
                        Err(_) => Ok(SessionEnd::Detached),
                    };
                }

                status = &mut exit => {
                    let status = match status {
                        Ok(status) => status,
                        Err(_) => break Err(ClawkerError::Runtime(
                            "exit watcher closed without a status".to_string(),
                        )),
                    };
                    match status {
                        Ok(code) => {
                            if tokio::time::timeout(self.drain_grace, &mut output_task.0).await.is_err() {
                                debug!("Output still open {:?} after exit", self.drain_grace);
                            }
                            break Ok(SessionEnd::Exit(code));
                        }
                        Err(e) => break Err(e),
                    }
                }

                size = next_resize(&mut resizes) => match size {
                    Some((rows, cols)) => {
                        if let Err(e) = self.runtime.container_resize(id, rows, cols).await {
                            debug!("Failed to forward resize: {}", e);
                        }
                    }
                    None => resizes = None,
                },
            }
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    Exit(i64),
    Detached,
}

/// Aborts the pump when the session ends, whichever way it ends
struct TaskGuard<T>(JoinHandle<T>);

impl<T> Drop for TaskGuard<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn next_resize(resizes: &mut Option<mpsc::Receiver<(u16, u16)>>) -> Option<(u16, u16)> {
    match resizes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Copy container output to the caller; TTY output goes to stdout
async fn pump_output(
    mut output: OutputStream,
    mut stdout: Pin<Box<dyn AsyncWrite + Send>>,
    mut stderr: Pin<Box<dyn AsyncWrite + Send>>,
) -> Result<()> {
    while let Some(chunk) = output.next().await {
        match chunk? {
            OutputChunk::Stderr(bytes) => {
                stderr.write_all(&bytes).await?;
                stderr.flush().await?;
            }
            OutputChunk::Stdout(bytes) | OutputChunk::Console(bytes) => {
                stdout.write_all(&bytes).await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}

/// Copy caller stdin to the container and half-close on EOF
async fn pump_input(
    mut stdin: Pin<Box<dyn AsyncRead + Send>>,
    mut input: Pin<Box<dyn AsyncWrite + Send>>,
) -> Result<()> {
    tokio::io::copy(&mut stdin, &mut input).await?;
    input.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::{CallTrace, ExitBehavior, FakeRuntime, RecordingSink};
    use crate::terminal::FakeTerminal;

    struct Captured {
        stdout: RecordingSink,
        stderr: RecordingSink,
    }

    fn io_with_stdin(input: &'static [u8]) -> (IoStreams, Captured) {
        let stdout = RecordingSink::default();
        let stderr = RecordingSink::default();
        let io = IoStreams {
            stdin: Box::pin(std::io::Cursor::new(input)),
            stdout: Box::pin(stdout.clone()),
            stderr: Box::pin(stderr.clone()),
        };
        (io, Captured { stdout, stderr })
    }

    fn foreground(id: &str) -> LaunchRequest {
        LaunchRequest {
            container_id: id.to_string(),
            tty: true,
            stdin: true,
            ..Default::default()
        }
    }

    const ID: &str = "c0ffee0123456789abcdef";

    #[tokio::test]
    async fn test_attach_strictly_before_start_before_resize() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        runtime.set_output(vec![OutputChunk::Console(b"hi\n".to_vec())]);
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let launcher = Launcher::new(&runtime, &terminal, None, CancellationToken::new());

        let (io, captured) = io_with_stdin(b"");
        let outcome = launcher.launch(&foreground(ID), io).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::Exited);
        assert_eq!(
            trace.calls(),
            vec![
                "raw_mode".to_string(),
                format!("attach({ID})"),
                format!("wait({ID},next-exit)"),
                format!("start({ID})"),
                format!("resize({ID},25,81)"),
                format!("resize({ID},24,80)"),
                "restore_terminal".to_string(),
            ]
        );
        assert_eq!(captured.stdout.contents(), b"hi\n");
    }

    #[tokio::test]
    async fn test_detached_start_prints_short_id() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let launcher = Launcher::new(&runtime, &terminal, None, CancellationToken::new());

        let request = LaunchRequest {
            container_id: ID.to_string(),
            detach: true,
            ..Default::default()
        };
        let (io, captured) = io_with_stdin(b"");
        let outcome = launcher.launch(&request, io).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::Started);
        assert_eq!(captured.stdout.contents(), b"c0ffee012345\n");
        assert_eq!(trace.calls(), vec![format!("start({ID})")]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_surfaces_code_and_restores_terminal() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        runtime.set_exit(ExitBehavior::Code(3));
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let launcher = Launcher::new(&runtime, &terminal, None, CancellationToken::new());

        let (io, _) = io_with_stdin(b"");
        let err = launcher.launch(&foreground(ID), io).await.unwrap_err();

        assert!(matches!(err, ClawkerError::Exit { code: 3 }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(trace.calls().last().map(String::as_str), Some("restore_terminal"));
    }

    #[tokio::test]
    async fn test_stream_close_without_exit_is_detach() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        runtime.set_exit(ExitBehavior::Detach);
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let launcher = Launcher::new(&runtime, &terminal, None, CancellationToken::new())
            .with_detach_grace(Duration::from_millis(50));

        let (io, _) = io_with_stdin(b"");
        let outcome = launcher.launch(&foreground(ID), io).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::Detached);
        assert_eq!(trace.count("remove"), 0);
    }

    #[tokio::test]
    async fn test_non_tty_demultiplexes_and_forwards_stdin() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        runtime.set_exit(ExitBehavior::Hang);
        runtime.set_output(vec![
            OutputChunk::Stdout(b"out\n".to_vec()),
            OutputChunk::Stderr(b"err\n".to_vec()),
        ]);
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let cancel = CancellationToken::new();
        let launcher = Launcher::new(&runtime, &terminal, None, cancel.clone());

        let request = LaunchRequest {
            container_id: ID.to_string(),
            stdin: true,
            ..Default::default()
        };
        let (io, captured) = io_with_stdin(b"ping\n");
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let err = launcher.launch(&request, io).await.unwrap_err();
        canceller.await.unwrap();

        assert!(err.is_cancelled());
        assert_eq!(captured.stdout.contents(), b"out\n");
        assert_eq!(captured.stderr.contents(), b"err\n");
        assert_eq!(runtime.stdin_received.lock().unwrap().as_slice(), b"ping\n");
        assert_eq!(trace.count("raw_mode"), 0);
        assert_eq!(trace.count("resize"), 0);
    }

    #[tokio::test]
    async fn test_host_resize_is_forwarded() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        runtime.set_exit(ExitBehavior::Hang);
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let cancel = CancellationToken::new();
        let launcher = Launcher::new(&runtime, &terminal, None, cancel.clone());

        let (io, _) = io_with_stdin(b"");
        let request = foreground(ID);
        let session = launcher.launch(&request, io);
        let driver = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            terminal.resize(40, 120).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(session, driver);

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(trace.count(&format!("resize({ID},40,120)")), 1);
        assert_eq!(trace.calls().last().map(String::as_str), Some("restore_terminal"));
    }

    #[tokio::test]
    async fn test_foreground_waits_for_the_exit_after_start() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        runtime.set_exit(ExitBehavior::Code(7));
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let launcher = Launcher::new(&runtime, &terminal, None, CancellationToken::new());

        let (io, _) = io_with_stdin(b"");
        let err = launcher.launch(&foreground(ID), io).await.unwrap_err();

        // A wait that fired on the created state would have reported 0
        assert!(matches!(err, ClawkerError::Exit { code: 7 }));
        assert_eq!(trace.count(&format!("wait({ID},next-exit)")), 1);
    }

    #[tokio::test]
    async fn test_auto_remove_waits_for_removal() {
        let trace = CallTrace::default();
        let runtime = FakeRuntime::new(trace.clone());
        let terminal = FakeTerminal::new(trace.clone(), 24, 80);
        let launcher = Launcher::new(&runtime, &terminal, None, CancellationToken::new());

        let request = LaunchRequest {
            auto_remove: true,
            ..foreground(ID)
        };
        let (io, _) = io_with_stdin(b"");
        let outcome = launcher.launch(&request, io).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::Exited);
        assert_eq!(trace.count(&format!("wait({ID},removed)")), 1);
    }

    #[tokio::test]
    async fn test_not_running_wait_resolves_before_start() {
        let runtime = FakeRuntime::new(CallTrace::default());
        let exit = runtime
            .container_wait(ID, WaitCondition::NotRunning)
            .await
            .unwrap();
        assert_eq!(exit.await.unwrap().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_thread_reader_forwards_bytes_until_eof() {
        use tokio::io::AsyncReadExt;

        let mut reader = thread_reader(std::io::Cursor::new(b"ping\n".to_vec()));
        let mut received = Vec::new();
        reader.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"ping\n");
    }

    #[test]
    fn test_parked_stdin_read_does_not_block_shutdown() {
        use tokio::io::AsyncReadExt;

        /// Blocks in `read` until the test ends
        struct Parked(std::sync::mpsc::Receiver<()>);

        impl Read for Parked {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                let _ = self.0.recv();
                Ok(0)
            }
        }

        let (_release, parked) = std::sync::mpsc::channel::<()>();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut stdin = thread_reader(Parked(parked));
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                let _ = stdin.read(&mut buf).await;
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
        });

        let started = std::time::Instant::now();
        drop(runtime);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
