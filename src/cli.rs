use crate::options::ContainerOptions;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "clawker")]
#[command(about = "Run Claude agents in managed Docker containers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create and start an agent container
    Run(RunArgs),

    /// Create an agent container without starting it
    Create(RunArgs),

    /// Host proxy used by containers to reach the host
    #[command(hide = true)]
    HostProxy {
        #[command(subcommand)]
        command: HostProxyCommand,
    },

    /// Per-container socket relay for SSH and GPG agents
    #[command(hide = true)]
    Bridge {
        #[command(subcommand)]
        command: BridgeCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostProxyCommand {
    /// Serve the proxy in the foreground
    Serve {
        #[arg(long, default_value_t = crate::config::DEFAULT_HOST_PROXY_PORT)]
        port: u16,
    },
}

#[derive(Subcommand, Debug)]
pub enum BridgeCommand {
    /// Relay host agent sockets into a container until it stops
    Serve {
        #[arg(long)]
        container: String,

        /// Host SSH agent socket
        #[arg(long)]
        ssh: Option<PathBuf>,

        /// Host GPG agent extra socket
        #[arg(long)]
        gpg: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Agent name (random adjective-noun when omitted)
    #[arg(long)]
    pub agent: Option<String>,

    /// Workspace mode: bind or snapshot
    #[arg(long)]
    pub mode: Option<String>,

    /// Run in a git worktree (format: branch[:base])
    #[arg(long)]
    pub worktree: Option<String>,

    #[command(flatten)]
    pub container: ContainerFlags,

    /// Image to run; `@` selects the project image
    #[arg(default_value = crate::image::PROJECT_IMAGE_SENTINEL)]
    pub image: String,

    /// Command and arguments for the container
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Docker-compatible container flags
#[derive(Args, Debug, Default)]
pub struct ContainerFlags {
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    pub tty: bool,

    /// Keep STDIN open even if not attached
    #[arg(short, long)]
    pub interactive: bool,

    /// Run in the background and print the container ID
    #[arg(short, long)]
    pub detach: bool,

    /// Attach to STDIN, STDOUT or STDERR
    #[arg(short, long)]
    pub attach: Vec<String>,

    /// Remove the container when it exits
    #[arg(long)]
    pub rm: bool,

    /// Key sequence for detaching a container
    #[arg(long, default_value = "ctrl-p,ctrl-q")]
    pub detach_keys: String,

    /// Override the image entrypoint
    #[arg(long)]
    pub entrypoint: Option<String>,

    /// Environment variable (format: KEY=VALUE, or KEY to copy from the host)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Read environment variables from a file
    #[arg(long)]
    pub env_file: Vec<PathBuf>,

    /// Container label (format: KEY=VALUE)
    #[arg(short, long)]
    pub label: Vec<String>,

    /// Read labels from a file
    #[arg(long)]
    pub label_file: Vec<PathBuf>,

    /// Publish a port (format: [ip:][hostPort:]containerPort[/proto])
    #[arg(short, long)]
    pub publish: Vec<String>,

    /// Expose a port without publishing it
    #[arg(long)]
    pub expose: Vec<String>,

    /// Publish all exposed ports to random host ports
    #[arg(short = 'P', long)]
    pub publish_all: bool,

    /// Bind mount or named volume (format: source:target[:ro])
    #[arg(short, long)]
    pub volume: Vec<String>,

    /// Mount a tmpfs (format: path[:options])
    #[arg(long)]
    pub tmpfs: Vec<String>,

    /// Working directory inside the container
    #[arg(short, long)]
    pub workdir: Option<String>,

    /// User name or UID
    #[arg(short, long)]
    pub user: Option<String>,

    /// Container host name
    #[arg(long)]
    pub hostname: Option<String>,

    /// Memory limit (e.g. 512m, 2g)
    #[arg(short, long)]
    pub memory: Option<String>,

    /// Memory plus swap limit; -1 for unlimited swap
    #[arg(long)]
    pub memory_swap: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    pub memory_swappiness: Option<i64>,

    /// Number of CPUs
    #[arg(long)]
    pub cpus: Option<f64>,

    #[arg(long)]
    pub blkio_weight: Option<u16>,

    #[arg(long, allow_hyphen_values = true)]
    pub oom_score_adj: Option<i64>,

    /// Network to connect to
    #[arg(long)]
    pub network: Option<String>,

    #[arg(long)]
    pub ip: Option<String>,

    #[arg(long)]
    pub ip6: Option<String>,

    #[arg(long)]
    pub mac_address: Option<String>,

    #[arg(long)]
    pub cap_add: Vec<String>,

    #[arg(long)]
    pub cap_drop: Vec<String>,

    #[arg(long)]
    pub security_opt: Vec<String>,

    /// Give extended privileges to the container
    #[arg(long)]
    pub privileged: bool,

    /// Command to run to check health
    #[arg(long)]
    pub health_cmd: Option<String>,

    #[arg(long)]
    pub health_interval: Option<String>,

    #[arg(long)]
    pub health_timeout: Option<String>,

    #[arg(long)]
    pub health_start_period: Option<String>,

    #[arg(long)]
    pub health_retries: Option<i64>,

    /// Disable any image-defined healthcheck
    #[arg(long)]
    pub no_healthcheck: bool,

    /// Restart policy (no, always, unless-stopped, on-failure[:max-retries])
    #[arg(long)]
    pub restart: Option<String>,

    #[arg(long)]
    pub pid: Option<String>,

    #[arg(long)]
    pub ipc: Option<String>,

    #[arg(long)]
    pub uts: Option<String>,

    #[arg(long)]
    pub userns: Option<String>,

    #[arg(long)]
    pub cgroupns: Option<String>,

    #[arg(long)]
    pub log_driver: Option<String>,

    #[arg(long)]
    pub log_opt: Vec<String>,

    #[arg(long)]
    pub annotation: Vec<String>,

    #[arg(long)]
    pub sysctl: Vec<String>,
}

impl RunArgs {
    pub fn container_options(&self) -> ContainerOptions {
        let flags = &self.container;
        ContainerOptions {
            image: self.image.clone(),
            command: self.command.clone(),
            entrypoint: flags.entrypoint.clone(),
            tty: flags.tty,
            stdin_open: flags.interactive,
            detach: flags.detach,
            attach: flags.attach.clone(),
            auto_remove: flags.rm,
            detach_keys: Some(flags.detach_keys.clone()),
            env: flags.env.clone(),
            env_files: flags.env_file.clone(),
            labels: flags.label.clone(),
            label_files: flags.label_file.clone(),
            publish: flags.publish.clone(),
            expose: flags.expose.clone(),
            publish_all: flags.publish_all,
            volumes: flags.volume.clone(),
            tmpfs: flags.tmpfs.clone(),
            workdir: flags.workdir.clone(),
            user: flags.user.clone(),
            hostname: flags.hostname.clone(),
            memory: flags.memory.clone(),
            memory_swap: flags.memory_swap.clone(),
            memory_swappiness: flags.memory_swappiness,
            cpus: flags.cpus,
            blkio_weight: flags.blkio_weight,
            oom_score_adj: flags.oom_score_adj,
            network: flags.network.clone(),
            ip: flags.ip.clone(),
            ip6: flags.ip6.clone(),
            mac_address: flags.mac_address.clone(),
            cap_add: flags.cap_add.clone(),
            cap_drop: flags.cap_drop.clone(),
            security_opt: flags.security_opt.clone(),
            privileged: flags.privileged,
            health_cmd: flags.health_cmd.clone(),
            health_interval: flags.health_interval.clone(),
            health_timeout: flags.health_timeout.clone(),
            health_start_period: flags.health_start_period.clone(),
            health_retries: flags.health_retries,
            no_healthcheck: flags.no_healthcheck,
            restart: flags.restart.clone(),
            pid: flags.pid.clone(),
            ipc: flags.ipc.clone(),
            uts: flags.uts.clone(),
            userns: flags.userns.clone(),
            cgroupns: flags.cgroupns.clone(),
            log_driver: flags.log_driver.clone(),
            log_opts: flags.log_opt.clone(),
            annotations: flags.annotation.clone(),
            sysctls: flags.sysctl.clone(),
        }
    }
}
