use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Capacity of the step channel between the pipeline and the display
pub const PROGRESS_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Pending,
    Running,
    Complete,
    Cached,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressStep {
    pub id: &'static str,
    pub name: String,
    pub status: StepStatus,
    pub error: Option<String>,
}

/// Sending half of the progress channel; cheap to clone
#[derive(Clone)]
pub struct Progress {
    tx: Option<mpsc::Sender<ProgressStep>>,
}

impl Progress {
    /// A sink that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn channel() -> (Self, mpsc::Receiver<ProgressStep>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        (Self { tx: Some(tx) }, rx)
    }

    async fn send(&self, id: &'static str, name: &str, status: StepStatus, error: Option<String>) {
        let Some(tx) = &self.tx else {
            return;
        };
        let step = ProgressStep {
            id,
            name: name.to_string(),
            status,
            error,
        };
        if tx.send(step).await.is_err() {
            debug!("Progress display closed; dropping step {}", id);
        }
    }

    pub async fn start(&self, id: &'static str, name: &str) {
        self.send(id, name, StepStatus::Running, None).await;
    }

    pub async fn complete(&self, id: &'static str, name: &str) {
        self.send(id, name, StepStatus::Complete, None).await;
    }

    pub async fn cached(&self, id: &'static str, name: &str) {
        self.send(id, name, StepStatus::Cached, None).await;
    }

    pub async fn fail(&self, id: &'static str, name: &str, error: &str) {
        self.send(id, name, StepStatus::Error, Some(error.to_string()))
            .await;
    }
}

/// Spinner display consuming progress steps on a blocking thread
pub struct ProgressDisplay {
    handle: JoinHandle<()>,
}

impl ProgressDisplay {
    pub fn spawn() -> (Progress, Self) {
        let (progress, rx) = Progress::channel();
        let handle = tokio::task::spawn_blocking(move || render(rx));
        (progress, Self { handle })
    }

    /// Wait for the display to drain; every `Progress` clone must be dropped first
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            debug!("Progress display task failed: {}", e);
        }
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn render(mut rx: mpsc::Receiver<ProgressStep>) {
    let multi = MultiProgress::new();
    let mut bars: HashMap<&'static str, ProgressBar> = HashMap::new();

    while let Some(step) = rx.blocking_recv() {
        let bar = bars.entry(step.id).or_insert_with(|| {
            let pb = multi.add(ProgressBar::new_spinner());
            pb.set_style(spinner_style());
            pb
        });
        match step.status {
            StepStatus::Pending => bar.set_message(step.name),
            StepStatus::Running => {
                bar.set_message(format!("{}...", step.name));
                bar.enable_steady_tick(Duration::from_millis(80));
            }
            StepStatus::Complete => bar.finish_with_message(format!("✓ {}", step.name)),
            StepStatus::Cached => bar.finish_with_message(format!("✓ {} (cached)", step.name)),
            StepStatus::Error => bar.finish_with_message(format!(
                "✗ {}: {}",
                step.name,
                step.error.unwrap_or_default()
            )),
        }
    }

    for bar in bars.values().filter(|b| !b.is_finished()) {
        bar.finish_and_clear();
    }
}
