//! Container initialization: everything between "the user asked for an
//! agent" and "a created container is ready to start".
//!
//! Stages run strictly in order:
//!
//! 1. flag validation (no daemon calls; names arrive resolved)
//! 2. workspace setup: source directory, mounts and per-agent volumes
//! 3. config seeding, only when the config volume was created by this run
//! 4. environment wiring: host proxy (non-fatal), git credentials, runtime env
//! 5. container create
//! 6. artifact injection between create and start
//!
//! Any failure after stage 2 removes the volumes this run created. The
//! original error is returned wrapped as `container init: <stage>: ...`.

use crate::config::{home_dir, ProjectConfig, WorkspaceMode};
use crate::env::{compose_env, TerminalHints};
use crate::error::{ClawkerError, Result};
use crate::gitcreds::{wire_git_credentials, HostGitEnv};
use crate::hostproxy::{HostProxy, HOST_GATEWAY_EXTRA_HOST, HOST_PROXY_ENV};
use crate::inject::{inject_onboarding, inject_post_init, ONBOARDING_FILE};
use crate::keychain::Keychain;
use crate::naming::AgentNames;
use crate::options::ContainerOptions;
use crate::progress::Progress;
use crate::request::{build_create_request, Wiring};
use crate::runtime::ContainerRuntime;
use crate::seeding::ConfigSeeder;
use crate::socketbridge::BridgeSockets;
use crate::workspace::{setup_workspace, WorkspaceRequest};
use crate::worktree::{GitWorktrees, WorktreeSpec};
use std::future::Future;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STEP_WORKSPACE: &str = "workspace";
const STEP_CONFIG: &str = "config";
const STEP_ENVIRONMENT: &str = "environment";
const STEP_CREATE: &str = "create";
const STEP_INJECT: &str = "inject";

/// What the caller wants initialized
pub struct InitRequest<'a> {
    /// Validated flags; `options.image` is already resolved
    pub options: &'a ContainerOptions,
    pub config: &'a ProjectConfig,
    /// Resolved and validated before the daemon is contacted
    pub names: AgentNames,
    /// Configured project root, or the working directory
    pub project_dir: PathBuf,
    pub mode: Option<WorkspaceMode>,
    pub worktree: Option<WorktreeSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitResult {
    pub container_id: String,
    pub agent: String,
    pub container_name: String,
    pub host_proxy_running: bool,
    /// Non-fatal incidents to show before the terminal is handed over
    pub warnings: Vec<String>,
    /// Host agent sockets to bridge once the container runs
    pub bridge: BridgeSockets,
}

/// Host-side inputs that are read from the environment in production
#[derive(Debug, Clone, Default)]
pub struct HostContext {
    pub config_dir: PathBuf,
    /// Host `~/.claude.json`, source of the onboarding account fields
    pub claude_json: Option<PathBuf>,
    pub user: String,
    pub git: HostGitEnv,
    pub terminal: TerminalHints,
    pub data_dir: PathBuf,
}

impl HostContext {
    pub async fn detect() -> Result<Self> {
        Ok(Self {
            config_dir: crate::seeding::host_config_dir()?,
            claude_json: home_dir().ok().map(|h| h.join(ONBOARDING_FILE)),
            user: crate::keychain::current_user()?,
            git: HostGitEnv::detect().await,
            terminal: TerminalHints::detect(),
            data_dir: crate::config::data_dir()?,
        })
    }
}

pub struct ContainerInitializer<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub keychain: &'a dyn Keychain,
    pub git: &'a dyn GitWorktrees,
    pub host_proxy: Option<&'a dyn HostProxy>,
    pub progress: Progress,
    pub host: HostContext,
    pub cancel: CancellationToken,
}

impl ContainerInitializer<'_> {
    pub async fn initialize(&self, request: &InitRequest<'_>) -> Result<InitResult> {
        let mut created = Vec::new();
        let mut warnings = Vec::new();

        match self.run_stages(request, &mut created, &mut warnings).await {
            Ok(result) => Ok(result),
            Err(err) => {
                if !created.is_empty() {
                    for warning in rollback_volumes(self.runtime, &created).await {
                        warn!("{}", warning);
                    }
                }
                Err(err.in_stage("container init"))
            }
        }
    }

    /// Race `fut` against cancellation
    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ClawkerError::Cancelled),
            result = fut => result,
        }
    }

    async fn step<T>(
        &self,
        id: &'static str,
        name: &str,
        stage: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.progress.start(id, name).await;
        match self.guard(fut).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.progress.fail(id, name, &e.to_string()).await;
                Err(e.in_stage(stage))
            }
        }
    }

    async fn run_stages(
        &self,
        request: &InitRequest<'_>,
        created: &mut Vec<String>,
        warnings: &mut Vec<String>,
    ) -> Result<InitResult> {
        let options = request.options;
        let config = request.config;

        // 1. flags, before any daemon call
        options.validate()?;
        let names = request.names.clone();
        debug!("Resolved agent {} as {}", names.agent, names.container);

        // 2. workspace
        let remote_path = config.workspace.remote_path.clone();
        let mode = request.mode.unwrap_or(config.workspace.default_mode);
        let workspace_request = WorkspaceRequest {
            project_dir: &request.project_dir,
            remote_path: &remote_path,
            mode,
            worktree: request.worktree.as_ref(),
            data_dir: &self.host.data_dir,
        };
        let setup = self
            .step(
                STEP_WORKSPACE,
                "Preparing workspace",
                "workspace setup",
                setup_workspace(self.runtime, self.git, &names, &workspace_request, created),
            )
            .await?;
        self.progress.complete(STEP_WORKSPACE, "Preparing workspace").await;

        // 3. seeding
        if setup.config_freshly_created {
            let seeder = ConfigSeeder::new(
                self.runtime,
                self.keychain,
                self.host.config_dir.clone(),
                self.host.user.clone(),
            );
            let outcome = self
                .step(
                    STEP_CONFIG,
                    "Seeding agent config",
                    "config seeding",
                    seeder.seed(
                        &setup.config_volume,
                        &config.agent.claude_code,
                        &setup.source_dir,
                        &remote_path,
                    ),
                )
                .await?;
            warnings.extend(outcome.warnings);
            self.progress.complete(STEP_CONFIG, "Seeding agent config").await;
        } else {
            self.progress.cached(STEP_CONFIG, "Seeding agent config").await;
        }

        // 4. environment
        self.progress.start(STEP_ENVIRONMENT, "Wiring environment").await;
        let mut proxy_env = Vec::new();
        let mut extra_hosts = Vec::new();
        let mut host_proxy_running = false;
        if config.security.enable_host_proxy {
            if let Some(proxy) = self.host_proxy {
                match self.guard(proxy.ensure_running()).await {
                    Ok(url) => {
                        proxy_env.push(format!("{HOST_PROXY_ENV}={url}"));
                        extra_hosts.push(HOST_GATEWAY_EXTRA_HOST.to_string());
                        host_proxy_running = true;
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => warnings.push(format!(
                        "host proxy unavailable, continuing without it: {e}"
                    )),
                }
            }
        }

        let git = wire_git_credentials(
            &config.security.git_credentials,
            &self.host.git,
            host_proxy_running,
        );
        let runtime_env = compose_env(config, &names, mode, &setup.source_dir, self.host.terminal);

        let mut env = runtime_env.env;
        env.extend(proxy_env);
        env.extend(git.env);
        let mut mounts = setup.mounts;
        mounts.extend(git.mounts);
        let wiring = Wiring {
            image: options.image.clone(),
            env,
            mounts,
            working_dir: Some(remote_path.clone()),
            extra_hosts,
            cap_add: runtime_env.cap_add,
        };
        self.progress.complete(STEP_ENVIRONMENT, "Wiring environment").await;

        // 5. create
        let create_request = build_create_request(options, &names, wiring)
            .and_then(|r| r.validate().map(|()| r))
            .map_err(|e| e.in_stage("container create"))?;
        let container = self
            .step(
                STEP_CREATE,
                "Creating container",
                "container create",
                self.runtime.container_create(&names.container, &create_request),
            )
            .await?;
        warnings.extend(container.warnings);
        self.progress.complete(STEP_CREATE, "Creating container").await;
        info!("Created container {} ({})", names.container, container.id);

        // 6. injection
        let claude = &config.agent.claude_code;
        let post_init = claude.post_init.trim();
        if claude.use_host_auth || !post_init.is_empty() {
            let injected = self
                .step(STEP_INJECT, "Injecting startup files", "artifact injection", async {
                    if claude.use_host_auth {
                        inject_onboarding(self.runtime, &container.id, self.host.claude_json.as_deref())
                            .await?;
                    }
                    if !post_init.is_empty() {
                        inject_post_init(self.runtime, &container.id, post_init).await?;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = injected {
                if let Err(remove_err) = self.runtime.container_remove(&container.id).await {
                    warn!("Failed to remove container {}: {}", names.container, remove_err);
                }
                return Err(e);
            }
            self.progress.complete(STEP_INJECT, "Injecting startup files").await;
        }

        Ok(InitResult {
            container_id: container.id,
            agent: names.agent,
            container_name: names.container,
            host_proxy_running,
            warnings: std::mem::take(warnings),
            bridge: git.bridge,
        })
    }
}

/// Remove volumes this run created; returns one warning per volume left behind
pub async fn rollback_volumes(runtime: &dyn ContainerRuntime, created: &[String]) -> Vec<String> {
    let mut warnings = Vec::new();
    for name in created.iter().rev() {
        match runtime.volume_inspect(name).await {
            Ok(None) => debug!("Volume {} already gone", name),
            Ok(Some(volume)) if volume.is_managed() => match runtime.volume_remove(name).await {
                Ok(()) => info!("Removed volume {}", name),
                Err(e) => warnings.push(format!("failed to remove volume {name}: {e}")),
            },
            Ok(Some(_)) => warnings.push(format!(
                "volume {name} is not managed by clawker; leaving it in place"
            )),
            Err(e) => warnings.push(format!("failed to inspect volume {name}: {e}")),
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::{IoStreams, LaunchOutcome, LaunchRequest, Launcher};
    use crate::hostproxy::FakeHostProxy;
    use crate::keychain::FakeKeychain;
    use crate::runtime::fake::{CallTrace, FakeRuntime, RecordingSink};
    use crate::runtime::{managed_labels, OutputChunk};
    use crate::terminal::FakeTerminal;
    use crate::worktree::WorktreeInfo;
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::path::Path;
    use tempfile::TempDir;

    struct NoGit;

    #[async_trait]
    impl GitWorktrees for NoGit {
        async fn ensure_worktree(
            &self,
            _repo: &Path,
            _spec: &WorktreeSpec,
            _dest: &Path,
        ) -> Result<WorktreeInfo> {
            Err(ClawkerError::Config("no worktrees in tests".to_string()))
        }
    }

    struct Harness {
        trace: CallTrace,
        runtime: FakeRuntime,
        keychain: FakeKeychain,
        proxy: FakeHostProxy,
        host_config: TempDir,
        _data: TempDir,
        data_dir: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let trace = CallTrace::default();
            let host_config = tempfile::tempdir().unwrap();
            std::fs::write(host_config.path().join("settings.json"), "{}").unwrap();
            let data = tempfile::tempdir().unwrap();
            let data_dir = data.path().to_path_buf();
            Self {
                runtime: FakeRuntime::new(trace.clone()),
                keychain: FakeKeychain::new(trace.clone(), Some(FakeKeychain::valid_secret())),
                proxy: FakeHostProxy::new(trace.clone()),
                trace,
                host_config,
                _data: data,
                data_dir,
            }
        }

        fn initializer(&self) -> ContainerInitializer<'_> {
            ContainerInitializer {
                runtime: &self.runtime,
                keychain: &self.keychain,
                git: &NoGit,
                host_proxy: Some(&self.proxy),
                progress: Progress::disabled(),
                host: HostContext {
                    config_dir: self.host_config.path().to_path_buf(),
                    claude_json: None,
                    user: "me".to_string(),
                    git: HostGitEnv::default(),
                    terminal: TerminalHints::default(),
                    data_dir: self.data_dir.clone(),
                },
                cancel: CancellationToken::new(),
            }
        }
    }

    fn options(image: &str) -> ContainerOptions {
        ContainerOptions {
            image: image.to_string(),
            ..Default::default()
        }
    }

    fn request<'a>(
        options: &'a ContainerOptions,
        config: &'a ProjectConfig,
        agent: &str,
    ) -> InitRequest<'a> {
        InitRequest {
            options,
            config,
            names: AgentNames::resolve("myapp", Some(agent), &mut rand::thread_rng()).unwrap(),
            project_dir: PathBuf::from("/src/myapp"),
            mode: None,
            worktree: None,
        }
    }

    fn io() -> (IoStreams, RecordingSink) {
        let stdout = RecordingSink::default();
        let io = IoStreams {
            stdin: Box::pin(tokio::io::empty()),
            stdout: Box::pin(stdout.clone()),
            stderr: Box::pin(RecordingSink::default()),
        };
        (io, stdout)
    }

    #[tokio::test]
    async fn test_detached_run_prints_short_id() {
        let h = Harness::new();
        let mut opts = options("alpine");
        opts.detach = true;
        let config = ProjectConfig::default();

        let result = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();
        assert_eq!(result.container_name, "clawker.myapp.dev");

        let terminal = FakeTerminal::new(h.trace.clone(), 24, 80);
        let launcher = Launcher::new(&h.runtime, &terminal, None, CancellationToken::new());
        let (io, stdout) = io();
        let launch = LaunchRequest {
            container_id: result.container_id.clone(),
            detach: true,
            ..Default::default()
        };
        let outcome = launcher.launch(&launch, io).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::Started);
        assert_eq!(h.trace.count("create("), 1);
        assert_eq!(h.trace.count("start("), 1);
        assert_eq!(h.trace.count("attach("), 0);
        assert_eq!(h.trace.count("wait("), 0);
        assert_eq!(h.trace.count("resize("), 0);
        assert_eq!(
            String::from_utf8(stdout.contents()).unwrap(),
            format!("{}\n", &result.container_id[..12])
        );

        let created = h.runtime.created.lock().unwrap();
        let container = &created[0].1.container;
        assert!(!container.attach_stdin && !container.attach_stdout);
    }

    #[tokio::test]
    async fn test_interactive_run_attaches_before_start() {
        let h = Harness::new();
        let mut opts = options("alpine");
        opts.tty = true;
        opts.stdin_open = true;
        opts.auto_remove = true;
        opts.command = vec!["echo".to_string(), "hi".to_string()];
        let config = ProjectConfig::default();

        let result = h
            .initializer()
            .initialize(&request(&opts, &config, "run1"))
            .await
            .unwrap();
        h.runtime
            .set_output(vec![OutputChunk::Console(b"hi\n".to_vec())]);

        let terminal = FakeTerminal::new(h.trace.clone(), 30, 100);
        let launcher = Launcher::new(&h.runtime, &terminal, None, CancellationToken::new());
        let (io, stdout) = io();
        let launch = LaunchRequest {
            container_id: result.container_id.clone(),
            tty: true,
            stdin: true,
            ..Default::default()
        };
        let outcome = launcher.launch(&launch, io).await.unwrap();

        assert_eq!(outcome, LaunchOutcome::Exited);
        let id = &result.container_id;
        let attach = h.trace.position(&format!("attach({id})")).unwrap();
        let start = h.trace.position(&format!("start({id})")).unwrap();
        let nudge = h.trace.position(&format!("resize({id},31,101)")).unwrap();
        let settle = h.trace.position(&format!("resize({id},30,100)")).unwrap();
        let restore = h.trace.position("restore_terminal").unwrap();
        assert!(attach < start && start < nudge && nudge < settle && settle < restore);
        assert_eq!(stdout.contents(), b"hi\n");
    }

    #[tokio::test]
    async fn test_foreign_volume_aborts_without_side_effects() {
        let h = Harness::new();
        h.runtime
            .add_volume("clawker.myapp.dev-config", HashMap::new());
        let opts = options("alpine");
        let config = ProjectConfig::default();

        let err = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap_err();

        assert!(matches!(err.root(), ClawkerError::ForeignVolume(_)));
        assert!(err.to_string().starts_with("container init: "));
        assert_eq!(h.trace.count("volume_create"), 0);
        assert_eq!(h.trace.count("volume_remove"), 0);
        assert_eq!(h.trace.count("create("), 0);
        assert_eq!(h.runtime.volume_names(), vec!["clawker.myapp.dev-config"]);
    }

    #[tokio::test]
    async fn test_seeding_on_first_run_only() {
        let h = Harness::new();
        let opts = options("alpine");
        let config = ProjectConfig::default();
        let (progress, mut steps) = Progress::channel();

        let mut first = h.initializer();
        first.progress = progress.clone();
        first
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();
        assert_eq!(h.trace.count("copy_to_volume("), 2);
        assert!(h.runtime.volume_names().contains(&"clawker.myapp.dev-config".to_string()));

        // The first container is gone; volumes stay
        h.runtime.container_remove(&format!("c0ffee{:058x}", 1)).await.unwrap();

        let mut second = h.initializer();
        second.progress = progress;
        second
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();
        drop(second);
        drop(first);

        assert_eq!(h.trace.count("copy_to_volume("), 2);
        let mut config_statuses = Vec::new();
        while let Ok(step) = steps.try_recv() {
            if step.id == "config" {
                config_statuses.push(step.status);
            }
        }
        assert_eq!(
            config_statuses.last(),
            Some(&crate::progress::StepStatus::Cached)
        );
    }

    #[tokio::test]
    async fn test_host_proxy_failure_is_non_fatal() {
        let mut h = Harness::new();
        h.proxy = FakeHostProxy::failing(h.trace.clone());
        let opts = options("alpine");
        let config = ProjectConfig::default();

        let result = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();

        assert!(!result.host_proxy_running);
        let proxy_warnings: Vec<_> = result
            .warnings
            .iter()
            .filter(|w| w.contains("host proxy"))
            .collect();
        assert_eq!(proxy_warnings.len(), 1);
        assert_eq!(h.trace.count("create("), 1);
        let created = h.runtime.created.lock().unwrap();
        let env = &created[0].1.container.env;
        assert!(!env.iter().any(|e| e.starts_with(HOST_PROXY_ENV)));
        assert!(!env.iter().any(|e| e.starts_with("CLAWKER_GIT_HTTPS")));
    }

    #[tokio::test]
    async fn test_host_proxy_url_and_gateway_when_running() {
        let h = Harness::new();
        let opts = options("alpine");
        let config = ProjectConfig::default();

        let result = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();

        assert!(result.host_proxy_running);
        let created = h.runtime.created.lock().unwrap();
        let (_, req) = &created[0];
        assert!(req
            .container
            .env
            .contains(&"CLAWKER_HOST_PROXY=http://host.docker.internal:18374".to_string()));
        assert_eq!(req.host.extra_hosts, vec![HOST_GATEWAY_EXTRA_HOST]);
    }

    #[tokio::test]
    async fn test_seeding_failure_rolls_back_volumes() {
        let h = Harness::new();
        let not_a_dir = tempfile::NamedTempFile::new().unwrap();
        let opts = options("alpine");
        let config = ProjectConfig::default();

        let mut init = h.initializer();
        init.host.config_dir = not_a_dir.path().to_path_buf();
        let err = init
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("container init: config seeding: "));
        assert!(h.runtime.volume_names().is_empty());
        assert_eq!(h.trace.count("volume_remove(clawker.myapp.dev-config)"), 1);
        assert_eq!(h.trace.count("create("), 0);
    }

    #[tokio::test]
    async fn test_no_seeding_when_config_volume_exists() {
        let h = Harness::new();
        for kind in ["config", "history"] {
            h.runtime
                .add_volume(&format!("clawker.myapp.dev-{kind}"), managed_labels("myapp", "dev"));
        }
        let opts = options("alpine");
        let config = ProjectConfig::default();

        h.initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();

        assert_eq!(h.trace.count("copy_to_volume("), 0);
        assert_eq!(h.trace.count("keychain_read"), 0);
    }

    #[tokio::test]
    async fn test_rollback_keeps_preexisting_volumes() {
        let h = Harness::new();
        h.runtime
            .add_volume("clawker.myapp.dev-config", managed_labels("myapp", "dev"));
        h.runtime.fail("container_create");
        let before: BTreeSet<String> = h.runtime.volume_names().into_iter().collect();
        let opts = options("alpine");
        let config = ProjectConfig::default();

        let err = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("container init: container create: "));
        let after: BTreeSet<String> = h.runtime.volume_names().into_iter().collect();
        assert_eq!(before, after);
        assert_eq!(h.trace.count("volume_remove(clawker.myapp.dev-config)"), 0);
        assert_eq!(h.trace.count("volume_remove(clawker.myapp.dev-history)"), 1);
    }

    #[tokio::test]
    async fn test_env_file_loses_to_cli_env() {
        let h = Harness::new();
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("agent.env");
        std::fs::write(&env_file, "# comment\n\nMODE=file\nONLY_FILE=1\n").unwrap();
        let mut opts = options("alpine");
        opts.env_files = vec![env_file];
        opts.env = vec!["MODE=cli".to_string()];
        let config = ProjectConfig::default();

        h.initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();

        let created = h.runtime.created.lock().unwrap();
        let env = &created[0].1.container.env;
        assert!(env.contains(&"MODE=cli".to_string()));
        assert!(!env.contains(&"MODE=file".to_string()));
        assert!(env.contains(&"ONLY_FILE=1".to_string()));
    }

    #[tokio::test]
    async fn test_validation_errors_precede_daemon_calls() {
        let h = Harness::new();
        let config = ProjectConfig::default();

        let mut health = options("alpine");
        health.health_interval = Some("5s".to_string());
        let err = h
            .initializer()
            .initialize(&request(&health, &config, "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), ClawkerError::Validation(_)));

        let mut restart = options("alpine");
        restart.restart = Some("always".to_string());
        restart.auto_remove = true;
        let err = h
            .initializer()
            .initialize(&request(&restart, &config, "dev"))
            .await
            .unwrap_err();
        assert!(matches!(err.root(), ClawkerError::Validation(_)));

        assert!(h.trace.calls().is_empty());
    }

    #[tokio::test]
    async fn test_injection_between_create_and_start() {
        let h = Harness::new();
        let opts = options("alpine");
        let mut config = ProjectConfig::default();
        config.agent.claude_code.post_init = "npm ci".to_string();

        let result = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();

        let copies = h.runtime.container_copies.lock().unwrap();
        assert_eq!(copies.len(), 2);
        assert!(copies[0].file(".claude.json").is_some());
        assert!(copies[1].file(".clawker/post-init.sh").is_some());
        assert!(copies.iter().all(|c| c.target == result.container_id));
        assert_eq!(h.trace.count("start("), 0);
    }

    #[tokio::test]
    async fn test_no_onboarding_without_host_auth() {
        let h = Harness::new();
        let opts = options("alpine");
        let mut config = ProjectConfig::default();
        config.agent.claude_code.use_host_auth = false;

        h.initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();

        assert_eq!(h.trace.count("copy_to_container"), 0);
        assert_eq!(h.trace.count("keychain_read"), 0);
    }

    #[tokio::test]
    async fn test_post_init_failure_removes_container_and_volumes() {
        let h = Harness::new();
        h.runtime.fail("copy_to_container:.clawker/post-init.sh");
        let opts = options("alpine");
        let mut config = ProjectConfig::default();
        config.agent.claude_code.post_init = "npm ci".to_string();

        let err = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("container init: artifact injection: "));
        assert_eq!(h.trace.count("remove("), 1);
        assert!(h.runtime.volume_names().is_empty());
    }

    #[tokio::test]
    async fn test_second_create_for_same_agent_conflicts() {
        let h = Harness::new();
        let opts = options("alpine");
        let config = ProjectConfig::default();

        h.initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap();
        let err = h
            .initializer()
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Conflict"));
        assert_eq!(h.runtime.volume_names().len(), 2);
    }

    /// Host proxy whose startup is interrupted by Ctrl-C
    struct InterruptedProxy {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl HostProxy for InterruptedProxy {
        async fn ensure_running(&self) -> Result<String> {
            self.cancel.cancel();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancellation_mid_pipeline_rolls_back_created_volumes() {
        let h = Harness::new();
        let opts = options("alpine");
        let config = ProjectConfig::default();
        let cancel = CancellationToken::new();
        let proxy = InterruptedProxy {
            cancel: cancel.clone(),
        };
        let init = ContainerInitializer {
            host_proxy: Some(&proxy),
            cancel: cancel.clone(),
            ..h.initializer()
        };

        let err = init
            .initialize(&request(&opts, &config, "dev"))
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(h.trace.count("volume_create(") > 0);
        assert_eq!(h.trace.count("volume_remove("), h.trace.count("volume_create("));
        assert!(h.runtime.volume_names().is_empty());
        assert_eq!(h.trace.count("create("), 0);
    }
}
