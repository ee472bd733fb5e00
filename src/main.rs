mod archive;
mod attach;
mod cli;
mod config;
mod env;
mod error;
mod gitcreds;
mod hostproxy;
mod image;
mod init;
mod inject;
mod keychain;
mod naming;
mod options;
mod progress;
mod request;
mod runtime;
mod seeding;
mod socketbridge;
mod terminal;
mod workspace;
mod worktree;

use attach::{IoStreams, LaunchOutcome, LaunchRequest, Launcher};
use clap::Parser;
use cli::{BridgeCommand, Cli, Commands, HostProxyCommand, RunArgs};
use config::{ProjectConfig, WorkspaceMode};
use options::ContainerOptions;
use error::{ClawkerError, Result};
use hostproxy::{HostProxy, HostProxyManager};
use image::{DockerCliBuilder, ImageResolver, Prompter, StdinPrompter};
use init::{ContainerInitializer, HostContext, InitRequest};
use keychain::SystemKeychain;
use naming::AgentNames;
use progress::{Progress, ProgressDisplay};
use runtime::docker::DockerRuntime;
use runtime::ContainerRuntime;
use socketbridge::{BridgeSockets, ProcessSocketBridge, SocketBridge};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use terminal::{require_terminal, CrosstermTerminal, Terminal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use worktree::{GitCli, WorktreeSpec};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "clawker=debug,info"
    } else {
        "clawker=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli.command, cli.verbose).await {
        if !matches!(e.root(), ClawkerError::Exit { .. }) {
            error!("Error: {}", e);
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(command: Commands, verbose: bool) -> Result<()> {
    match command {
        Commands::Run(args) => run_container(args, true, verbose).await,
        Commands::Create(args) => run_container(args, false, verbose).await,
        Commands::HostProxy {
            command: HostProxyCommand::Serve { port },
        } => {
            let gateway = bridge_gateway().await;
            hostproxy::serve(&hostproxy::listen_addresses(gateway), port, cancel_on_ctrl_c()).await
        }
        Commands::Bridge {
            command: BridgeCommand::Serve { container, ssh, gpg },
        } => {
            let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect().await?);
            socketbridge::serve_bridge(
                runtime,
                container,
                BridgeSockets { ssh, gpg },
                cancel_on_ctrl_c(),
            )
            .await
        }
    }
}

/// Token cancelled on the first Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("Interrupted; cancelling");
            token.cancel();
        }
    });
    cancel
}

/// Gateway of the default bridge network, where containers reach the host on Linux
async fn bridge_gateway() -> Option<IpAddr> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    let runtime = match DockerRuntime::connect().await {
        Ok(runtime) => runtime,
        Err(e) => {
            warn!("Host proxy serves loopback only: {}", e);
            return None;
        }
    };
    match runtime.bridge_gateway().await {
        Ok(gateway) => gateway,
        Err(e) => {
            warn!("Host proxy serves loopback only: {}", e);
            None
        }
    }
}

/// Everything `run` and `create` check before the first daemon call
#[derive(Debug)]
struct RunPlan {
    options: ContainerOptions,
    config: ProjectConfig,
    names: AgentNames,
    project_dir: PathBuf,
    mode: Option<WorkspaceMode>,
    worktree: Option<WorktreeSpec>,
}

fn plan_run(args: &RunArgs, config_dir: &Path) -> Result<RunPlan> {
    let config = ProjectConfig::load(config_dir)?;
    let root = config.project_root(config_dir);
    let project_dir = std::fs::canonicalize(&root).map_err(|e| {
        ClawkerError::Config(format!("project root {} is not usable: {}", root.display(), e))
    })?;
    let project = config.project_key(&project_dir);

    let options = args.container_options();
    options.validate()?;
    let mode = args
        .mode
        .as_deref()
        .map(str::parse::<WorkspaceMode>)
        .transpose()?;
    let worktree = args.worktree.as_deref().map(WorktreeSpec::parse).transpose()?;
    let names = AgentNames::resolve(&project, args.agent.as_deref(), &mut rand::thread_rng())?;
    debug!("Planned {} in {}", names.container, project_dir.display());

    Ok(RunPlan {
        options,
        config,
        names,
        project_dir,
        mode,
        worktree,
    })
}

/// `run` and `create`: resolve the image, initialize, then launch when asked
async fn run_container(args: RunArgs, launch: bool, verbose: bool) -> Result<()> {
    let RunPlan {
        mut options,
        config,
        names,
        project_dir,
        mode,
        worktree,
    } = plan_run(&args, &std::env::current_dir()?)?;

    let terminal = CrosstermTerminal;
    if launch && !options.detach && options.tty && options.stdin_open {
        require_terminal(&terminal)?;
    }

    let runtime = DockerRuntime::connect().await?;

    // Image resolution may prompt, so it runs before the progress display
    let builder = DockerCliBuilder { verbose };
    let stdin_prompter = StdinPrompter;
    let prompter: Option<&dyn Prompter> = if terminal.stdin_is_terminal() {
        Some(&stdin_prompter)
    } else {
        None
    };
    options.image = ImageResolver::new(&runtime, &builder, prompter)
        .resolve(&options.image, &names.project, &config, &project_dir)
        .await?;
    info!("Using image {}", options.image);

    let keychain = SystemKeychain;
    let host_proxy = HostProxyManager::new(config.host_proxy.port)?;
    let host = HostContext::detect().await?;
    let bridge_dir = host.data_dir.join("bridges");
    let cancel = cancel_on_ctrl_c();

    let (progress, display) = if verbose {
        (Progress::disabled(), None)
    } else {
        let (progress, display) = ProgressDisplay::spawn();
        (progress, Some(display))
    };

    let initializer = ContainerInitializer {
        runtime: &runtime,
        keychain: &keychain,
        git: &GitCli,
        host_proxy: Some(&host_proxy as &dyn HostProxy),
        progress,
        host,
        cancel: cancel.clone(),
    };
    let request = InitRequest {
        options: &options,
        config: &config,
        names,
        project_dir,
        mode,
        worktree,
    };
    let result = initializer.initialize(&request).await;
    // Closes the progress channel so the display can finish
    drop(initializer);
    if let Some(display) = display {
        display.finish().await;
    }
    let result = result?;

    for warning in &result.warnings {
        eprintln!("warning: {}", warning);
    }

    if !launch {
        println!("{}", result.container_id);
        return Ok(());
    }

    let bridge = ProcessSocketBridge::new(bridge_dir)?;
    let launcher = Launcher::new(&runtime, &terminal, Some(&bridge as &dyn SocketBridge), cancel);
    let launch_request = LaunchRequest {
        container_id: result.container_id.clone(),
        detach: options.detach,
        tty: options.tty,
        stdin: options.stdin_open,
        detach_keys: options.detach_keys.clone(),
        auto_remove: options.auto_remove,
        bridge: result.bridge,
    };
    match launcher.launch(&launch_request, IoStreams::std()).await? {
        LaunchOutcome::Detached => {
            eprintln!("Detached from {}", result.container_name);
        }
        LaunchOutcome::Started | LaunchOutcome::Exited => {}
    }
    Ok(())
}
