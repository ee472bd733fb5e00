//! Container create request assembled from [`ContainerOptions`].
//!
//! The request is split the way the daemon API splits it: container config,
//! host config and network config. Building it is pure; the same checks
//! [`ContainerOptions::validate`] applies are re-checked on the finished
//! request by [`CreateRequest::validate`].

use crate::error::{ClawkerError, Result};
use crate::naming::AgentNames;
use crate::options::{parse_bytes, parse_swap, split_key_value, ContainerOptions, HealthSpec, RestartSpec};
use crate::runtime::managed_labels;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub kind: MountKind,
    /// Host path or volume name; empty for tmpfs
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl MountSpec {
    pub fn bind(source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            read_only,
        }
    }

    pub fn volume(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.into(),
            target: target.into(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub exposed_ports: BTreeSet<String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,
    pub healthcheck: Option<HealthSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBindingSpec {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSpec {
    pub mounts: Vec<MountSpec>,
    pub tmpfs: BTreeMap<String, String>,
    pub port_bindings: BTreeMap<String, Vec<PortBindingSpec>>,
    pub publish_all: bool,
    pub auto_remove: bool,
    pub restart: Option<RestartSpec>,
    pub network_mode: Option<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub pid_mode: Option<String>,
    pub ipc_mode: Option<String>,
    pub uts_mode: Option<String>,
    pub userns_mode: Option<String>,
    pub cgroupns_mode: Option<String>,
    pub log_driver: Option<String>,
    pub log_opts: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub sysctls: BTreeMap<String, String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub memory_swappiness: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub blkio_weight: Option<u16>,
    pub oom_score_adj: Option<i64>,
    pub extra_hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSpec {
    pub network: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub mac_address: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRequest {
    pub container: ContainerSpec,
    pub host: HostSpec,
    pub network: NetworkSpec,
}

/// Pieces of the request contributed by earlier pipeline stages
#[derive(Debug, Clone, Default)]
pub struct Wiring {
    pub image: String,
    /// Runtime environment composed from config; CLI env is layered on top
    pub env: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub working_dir: Option<String>,
    pub extra_hosts: Vec<String>,
    pub cap_add: Vec<String>,
}

fn to_map(entries: &[String]) -> Result<BTreeMap<String, String>> {
    entries.iter().map(|e| split_key_value(e)).collect()
}

/// Build the create request; `options` must already have passed validation
pub fn build_create_request(
    options: &ContainerOptions,
    names: &AgentNames,
    wiring: Wiring,
) -> Result<CreateRequest> {
    let streams = options.attach_streams()?;

    // Config-derived env first, then env files, then -e (later wins)
    let mut env = wiring.env;
    env.extend(options.environment()?);
    let env = crate::options::merge_entries(env);

    let mut labels: BTreeMap<String, String> = options.label_entries()?.into_iter().collect();
    labels.extend(managed_labels(&names.project, &names.agent));

    let entrypoint = options
        .entrypoint
        .as_ref()
        .map(|e| if e.is_empty() { vec![String::new()] } else { vec![e.clone()] });

    let container = ContainerSpec {
        image: wiring.image,
        cmd: options.command.clone(),
        entrypoint,
        env,
        labels,
        tty: options.tty,
        open_stdin: options.stdin_open,
        stdin_once: options.stdin_open && !options.detach,
        attach_stdin: !options.detach && streams.stdin,
        attach_stdout: !options.detach && streams.stdout,
        attach_stderr: !options.detach && streams.stderr,
        exposed_ports: options.exposed_ports()?,
        working_dir: options.workdir.clone().or(wiring.working_dir),
        user: options.user.clone(),
        hostname: options.hostname.clone(),
        healthcheck: options.health_spec()?,
    };

    let mut port_bindings: BTreeMap<String, Vec<PortBindingSpec>> = BTreeMap::new();
    for mapping in options.port_mappings()? {
        port_bindings
            .entry(mapping.port_key())
            .or_default()
            .push(PortBindingSpec {
                host_ip: mapping.host_ip,
                host_port: mapping.host_port,
            });
    }

    let mut mounts = wiring.mounts;
    for spec in &options.volumes {
        let volume = crate::options::parse_volume_spec(spec)?;
        mounts.push(MountSpec {
            kind: if volume.named { MountKind::Volume } else { MountKind::Bind },
            source: volume.source,
            target: volume.target,
            read_only: volume.read_only,
        });
    }

    let tmpfs = options
        .tmpfs
        .iter()
        .map(|spec| match spec.split_once(':') {
            Some((target, opts)) => (target.to_string(), opts.to_string()),
            None => (spec.clone(), String::new()),
        })
        .collect();

    let mut cap_add = wiring.cap_add;
    for cap in &options.cap_add {
        if !cap_add.contains(cap) {
            cap_add.push(cap.clone());
        }
    }

    let host = HostSpec {
        mounts,
        tmpfs,
        port_bindings,
        publish_all: options.publish_all,
        auto_remove: options.auto_remove,
        restart: options.restart_spec()?,
        network_mode: options.network.clone(),
        cap_add,
        cap_drop: options.cap_drop.clone(),
        security_opt: options.security_opt.clone(),
        privileged: options.privileged,
        pid_mode: options.pid.clone(),
        ipc_mode: options.ipc.clone(),
        uts_mode: options.uts.clone(),
        userns_mode: options.userns.clone(),
        cgroupns_mode: options.cgroupns.clone(),
        log_driver: options.log_driver.clone(),
        log_opts: to_map(&options.log_opts)?,
        annotations: to_map(&options.annotations)?,
        sysctls: to_map(&options.sysctls)?,
        memory: options.memory.as_deref().map(parse_bytes).transpose()?,
        memory_swap: options.memory_swap.as_deref().map(parse_swap).transpose()?,
        memory_swappiness: options.memory_swappiness,
        nano_cpus: options.cpus.map(|c| (c * 1e9) as i64),
        blkio_weight: options.blkio_weight,
        oom_score_adj: options.oom_score_adj,
        extra_hosts: wiring.extra_hosts,
    };

    let network = NetworkSpec {
        network: options.network.clone(),
        ipv4_address: options.ip.clone(),
        ipv6_address: options.ip6.clone(),
        mac_address: options.mac_address.clone(),
    };

    Ok(CreateRequest {
        container,
        host,
        network,
    })
}

impl CreateRequest {
    /// Re-check the invariants a request built from validated options holds
    pub fn validate(&self) -> Result<()> {
        if let Some(restart) = &self.host.restart {
            if restart.is_restarting() && self.host.auto_remove {
                return Err(ClawkerError::Validation(
                    "conflicting options: restart policy and auto-remove".to_string(),
                ));
            }
        }
        if let Some(health) = &self.container.healthcheck {
            if health.test.is_empty() {
                return Err(ClawkerError::Validation(
                    "health check settings require a test command".to_string(),
                ));
            }
            if health.test == ["NONE"]
                && (health.interval.is_some() || health.timeout.is_some() || health.retries.is_some())
            {
                return Err(ClawkerError::Validation(
                    "disabled health check cannot carry settings".to_string(),
                ));
            }
        }
        if let Some(swap) = self.host.memory_swap {
            match self.host.memory {
                None => {
                    return Err(ClawkerError::Validation(
                        "memory swap requires a memory limit".to_string(),
                    ))
                }
                Some(memory) if swap != -1 && swap < memory => {
                    return Err(ClawkerError::Validation(
                        "memory swap must be at least the memory limit".to_string(),
                    ))
                }
                _ => {}
            }
        }
        if let Some(swappiness) = self.host.memory_swappiness {
            if !(-1..=100).contains(&swappiness) {
                return Err(ClawkerError::Validation("invalid memory swappiness".to_string()));
            }
        }
        if let Some(weight) = self.host.blkio_weight {
            if weight != 0 && !(10..=1000).contains(&weight) {
                return Err(ClawkerError::Validation("invalid blkio weight".to_string()));
            }
        }
        if let Some(adj) = self.host.oom_score_adj {
            if !(-1000..=1000).contains(&adj) {
                return Err(ClawkerError::Validation("invalid oom score adjustment".to_string()));
            }
        }
        for key in self.host.port_bindings.keys() {
            if !self.container.exposed_ports.contains(key) {
                return Err(ClawkerError::Validation(format!(
                    "port binding {key} is not exposed"
                )));
            }
        }
        Ok(())
    }
}
