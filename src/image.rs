use crate::config::ProjectConfig;
use crate::error::{ClawkerError, Result};
use crate::runtime::ContainerRuntime;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Image reference that selects the project image
pub const PROJECT_IMAGE_SENTINEL: &str = "@";

/// Dockerfile looked up at the project root when building
pub const DOCKERFILE_NAME: &str = "Dockerfile";

/// `clawker-<project>:latest`
pub fn project_image_tag(project: &str) -> String {
    let project = if project.is_empty() { "default" } else { project };
    format!("clawker-{project}:latest")
}

/// Builds the project image; the pipeline treats this as opaque
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, project_dir: &Path, tag: &str) -> Result<()>;
}

/// Yes/no question on the controlling terminal
pub trait Prompter: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&self, message: &str) -> bool {
        eprint!("{} [y/N]: ", message);
        if io::stderr().flush().is_err() {
            return false;
        }

        let mut input = String::new();
        if io::stdin().lock().read_line(&mut input).is_err() {
            return false;
        }
        matches!(input.trim().to_lowercase().as_str(), "y" | "yes")
    }
}

/// Runs `docker build` on the project's Dockerfile
pub struct DockerCliBuilder {
    pub verbose: bool,
}

#[async_trait]
impl ImageBuilder for DockerCliBuilder {
    async fn build(&self, project_dir: &Path, tag: &str) -> Result<()> {
        let dockerfile = project_dir.join(DOCKERFILE_NAME);
        if !dockerfile.exists() {
            return Err(ClawkerError::Config(format!(
                "no {} found in {}",
                DOCKERFILE_NAME,
                project_dir.display()
            )));
        }

        let spinner = if !self.verbose {
            let pb = ProgressBar::new_spinner();
            pb.set_style(
                ProgressStyle::default_spinner()
                    .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
                    .template("{spinner:.cyan} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            pb.set_message(format!("Building {}...", tag));
            pb.enable_steady_tick(std::time::Duration::from_millis(80));
            Some(pb)
        } else {
            info!("Building image: {}", tag);
            None
        };

        let mut cmd = Command::new("docker");
        cmd.arg("build")
            .arg("-t")
            .arg(tag)
            .arg("-f")
            .arg(&dockerfile)
            .arg(project_dir)
            .stdin(Stdio::null());
        if self.verbose {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        debug!("Running build command: {:?}", cmd);
        let status = cmd.status().await.map_err(|e| {
            ClawkerError::Runtime(format!("Failed to execute docker build: {}", e))
        })?;

        if let Some(pb) = spinner {
            if status.success() {
                pb.finish_with_message(format!("✓ Built {}", tag));
            } else {
                pb.finish_with_message(format!("✗ Failed to build {}", tag));
            }
        }

        if !status.success() {
            return Err(ClawkerError::Runtime(format!(
                "docker build exited with status: {}",
                status
            )));
        }
        info!("Successfully built image: {}", tag);
        Ok(())
    }
}

/// Resolves the image reference a run should use
pub struct ImageResolver<'a> {
    runtime: &'a dyn ContainerRuntime,
    builder: &'a dyn ImageBuilder,
    /// `None` when stdin is not a terminal
    prompter: Option<&'a dyn Prompter>,
}

impl<'a> ImageResolver<'a> {
    pub fn new(
        runtime: &'a dyn ContainerRuntime,
        builder: &'a dyn ImageBuilder,
        prompter: Option<&'a dyn Prompter>,
    ) -> Self {
        Self {
            runtime,
            builder,
            prompter,
        }
    }

    /// An explicit reference wins; `@` or empty falls back to the project
    /// image, then `build.image`, then an interactive build.
    pub async fn resolve(
        &self,
        requested: &str,
        project: &str,
        config: &ProjectConfig,
        project_dir: &Path,
    ) -> Result<String> {
        let requested = requested.trim();
        if !requested.is_empty() && requested != PROJECT_IMAGE_SENTINEL {
            return Ok(requested.to_string());
        }

        let tag = project_image_tag(project);
        if self.runtime.image_exists(&tag).await? {
            debug!("Using project image {}", tag);
            return Ok(tag);
        }

        if let Some(image) = config.build.image.as_deref().filter(|i| !i.is_empty()) {
            debug!("Using configured image {}", image);
            return Ok(image.to_string());
        }

        if let Some(prompter) = self.prompter {
            if prompter.confirm(&format!("No image found for {tag}. Build image now?")) {
                self.builder.build(project_dir, &tag).await?;
                return Ok(tag);
            }
        }

        Err(ClawkerError::Validation(format!(
            "no image to run: pass an image, set build.image in clawker.yaml, or build {tag} from a {DOCKERFILE_NAME}"
        )))
    }
}
