use super::{
    AttachOptions, AttachedStreams, ContainerRuntime, CreatedContainer, ExitWatcher, OutputChunk,
    VolumeInfo, WaitCondition,
};
use crate::archive::tar_directory;
use crate::error::{ClawkerError, Result};
use crate::request::{CreateRequest, MountKind};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    ContainerCreateBody, EndpointIpamConfig, EndpointSettings, HealthConfig, HostConfig,
    HostConfigCgroupnsModeEnum, HostConfigLogConfig, Mount, MountTypeEnum, NetworkingConfig,
    PortBinding, RestartPolicy, RestartPolicyNameEnum, VolumeCreateOptions,
};
use bollard::query_parameters::{
    AttachContainerOptionsBuilder, CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectNetworkOptions, RemoveContainerOptionsBuilder, RemoveVolumeOptions, ResizeContainerTTYOptionsBuilder,
    StartContainerOptions, UploadToContainerOptionsBuilder, WaitContainerOptionsBuilder,
};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Image used for short-lived helper containers that fill volumes
const HELPER_IMAGE: &str = "busybox:latest";

/// [`ContainerRuntime`] backed by the Docker Engine API
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the local defaults (`DOCKER_HOST` or the default socket)
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            ClawkerError::Unavailable(format!("cannot connect to Docker: {e}"))
        })?;
        docker.ping().await.map_err(|e| {
            ClawkerError::Unavailable(format!("Docker daemon is not reachable: {e}"))
        })?;
        Ok(Self { docker })
    }

    /// IPv4 gateway of the default `bridge` network, if it has one
    pub async fn bridge_gateway(&self) -> Result<Option<std::net::IpAddr>> {
        let network = self
            .docker
            .inspect_network("bridge", None::<InspectNetworkOptions>)
            .await?;
        let gateway = network
            .ipam
            .and_then(|ipam| ipam.config)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|config| config.gateway)
            .filter_map(|gateway| gateway.parse::<std::net::IpAddr>().ok())
            .find(|ip| ip.is_ipv4());
        debug!("Bridge gateway: {:?}", gateway);
        Ok(gateway)
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.image_exists(image).await? {
            return Ok(());
        }
        let (from_image, tag) = match image.rsplit_once(':') {
            Some((name, tag)) => (name, tag),
            None => (image, "latest"),
        };
        debug!("Pulling helper image {}", image);
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::default()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }
}

fn opt_vec<T>(v: Vec<T>) -> Option<Vec<T>> {
    if v.is_empty() {
        None
    } else {
        Some(v)
    }
}

fn opt_map<I: IntoIterator<Item = (String, String)>>(entries: I) -> Option<HashMap<String, String>> {
    let map: HashMap<String, String> = entries.into_iter().collect();
    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

fn restart_policy_name(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::EMPTY,
    }
}

/// Translate a create request into the Engine API body
fn to_create_body(request: &CreateRequest) -> ContainerCreateBody {
    let c = &request.container;
    let h = &request.host;
    let n = &request.network;

    let exposed_ports: HashMap<String, HashMap<(), ()>> = c
        .exposed_ports
        .iter()
        .map(|port| (port.clone(), HashMap::new()))
        .collect();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = h
        .port_bindings
        .iter()
        .map(|(key, bindings)| {
            let bindings = bindings
                .iter()
                .map(|b| PortBinding {
                    host_ip: b.host_ip.clone(),
                    host_port: b.host_port.clone(),
                })
                .collect();
            (key.clone(), Some(bindings))
        })
        .collect();

    let mounts = h
        .mounts
        .iter()
        .map(|m| Mount {
            typ: Some(match m.kind {
                MountKind::Bind => MountTypeEnum::BIND,
                MountKind::Volume => MountTypeEnum::VOLUME,
                MountKind::Tmpfs => MountTypeEnum::TMPFS,
            }),
            source: (!m.source.is_empty()).then(|| m.source.clone()),
            target: Some(m.target.clone()),
            read_only: Some(m.read_only),
            ..Default::default()
        })
        .collect();

    let healthcheck = c.healthcheck.as_ref().map(|hc| HealthConfig {
        test: Some(hc.test.clone()),
        interval: hc.interval,
        timeout: hc.timeout,
        start_period: hc.start_period,
        retries: hc.retries,
        ..Default::default()
    });

    let restart_policy = h.restart.as_ref().map(|r| RestartPolicy {
        name: Some(restart_policy_name(&r.name)),
        maximum_retry_count: r.max_retries,
    });

    let cgroupns_mode = h.cgroupns_mode.as_deref().map(|mode| match mode {
        "host" => HostConfigCgroupnsModeEnum::HOST,
        "private" => HostConfigCgroupnsModeEnum::PRIVATE,
        _ => HostConfigCgroupnsModeEnum::EMPTY,
    });

    let log_config = h.log_driver.as_ref().map(|driver| HostConfigLogConfig {
        typ: Some(driver.clone()),
        config: opt_map(h.log_opts.clone()),
    });

    let host_config = HostConfig {
        mounts: Some(mounts),
        tmpfs: opt_map(h.tmpfs.clone()),
        port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
        publish_all_ports: Some(h.publish_all),
        auto_remove: Some(h.auto_remove),
        restart_policy,
        network_mode: h.network_mode.clone(),
        cap_add: opt_vec(h.cap_add.clone()),
        cap_drop: opt_vec(h.cap_drop.clone()),
        security_opt: opt_vec(h.security_opt.clone()),
        privileged: Some(h.privileged),
        pid_mode: h.pid_mode.clone(),
        ipc_mode: h.ipc_mode.clone(),
        uts_mode: h.uts_mode.clone(),
        userns_mode: h.userns_mode.clone(),
        cgroupns_mode,
        log_config,
        annotations: opt_map(h.annotations.clone()),
        sysctls: opt_map(h.sysctls.clone()),
        memory: h.memory,
        memory_swap: h.memory_swap,
        memory_swappiness: h.memory_swappiness,
        nano_cpus: h.nano_cpus,
        blkio_weight: h.blkio_weight,
        oom_score_adj: h.oom_score_adj,
        extra_hosts: opt_vec(h.extra_hosts.clone()),
        ..Default::default()
    };

    let networking_config = n.network.as_ref().and_then(|network| {
        if n.ipv4_address.is_none() && n.ipv6_address.is_none() && n.mac_address.is_none() {
            return None;
        }
        let endpoint = EndpointSettings {
            ipam_config: Some(EndpointIpamConfig {
                ipv4_address: n.ipv4_address.clone(),
                ipv6_address: n.ipv6_address.clone(),
                ..Default::default()
            }),
            mac_address: n.mac_address.clone(),
            ..Default::default()
        };
        Some(NetworkingConfig {
            endpoints_config: Some(HashMap::from([(network.clone(), endpoint)])),
        })
    });

    ContainerCreateBody {
        image: Some(c.image.clone()),
        cmd: opt_vec(c.cmd.clone()),
        entrypoint: c.entrypoint.clone(),
        env: opt_vec(c.env.clone()),
        labels: opt_map(c.labels.clone()),
        tty: Some(c.tty),
        open_stdin: Some(c.open_stdin),
        stdin_once: Some(c.stdin_once),
        attach_stdin: Some(c.attach_stdin),
        attach_stdout: Some(c.attach_stdout),
        attach_stderr: Some(c.attach_stderr),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        working_dir: c.working_dir.clone(),
        user: c.user.clone(),
        hostname: c.hostname.clone(),
        healthcheck,
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    }
}

fn to_chunk(output: LogOutput) -> OutputChunk {
    match output {
        LogOutput::StdOut { message } => OutputChunk::Stdout(message.to_vec()),
        LogOutput::StdErr { message } => OutputChunk::Stderr(message.to_vec()),
        LogOutput::StdIn { message } | LogOutput::Console { message } => {
            OutputChunk::Console(message.to_vec())
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = ClawkerError::from(e);
                if err.is_not_found() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn volume_inspect(&self, name: &str) -> Result<Option<VolumeInfo>> {
        match self.docker.inspect_volume(name).await {
            Ok(volume) => Ok(Some(VolumeInfo {
                name: volume.name,
                labels: volume.labels,
            })),
            Err(e) => {
                let err = ClawkerError::from(e);
                if err.is_not_found() {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn volume_create(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<VolumeInfo> {
        let volume = self
            .docker
            .create_volume(VolumeCreateOptions {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            })
            .await?;
        debug!("Created volume {}", volume.name);
        Ok(VolumeInfo {
            name: volume.name,
            labels: volume.labels,
        })
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None::<RemoveVolumeOptions>)
            .await?;
        Ok(())
    }

    async fn copy_to_volume(
        &self,
        volume: &str,
        mount_point: &str,
        src_dir: &Path,
        dest_path: &str,
    ) -> Result<()> {
        let archive = tar_directory(src_dir)?;
        self.ensure_image(HELPER_IMAGE).await?;

        let body = ContainerCreateBody {
            image: Some(HELPER_IMAGE.to_string()),
            cmd: Some(vec!["true".to_string()]),
            labels: Some(HashMap::from([(
                super::MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(HostConfig {
                mounts: Some(vec![Mount {
                    typ: Some(MountTypeEnum::VOLUME),
                    source: Some(volume.to_string()),
                    target: Some(mount_point.to_string()),
                    read_only: Some(false),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let helper = self
            .docker
            .create_container(None::<bollard::query_parameters::CreateContainerOptions>, body)
            .await?;
        debug!("Copying {} into volume {} via helper {}", src_dir.display(), volume, helper.id);

        let upload = self.copy_to_container(&helper.id, dest_path, archive).await;
        if let Err(e) = self.container_remove(&helper.id).await {
            warn!("Failed to remove helper container {}: {}", helper.id, e);
        }
        upload
    }

    async fn container_create(
        &self,
        name: &str,
        request: &CreateRequest,
    ) -> Result<CreatedContainer> {
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptionsBuilder::default().name(name).build()),
                to_create_body(request),
            )
            .await?;
        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn container_attach(&self, id: &str, options: &AttachOptions) -> Result<AttachedStreams> {
        let mut builder = AttachContainerOptionsBuilder::default()
            .stream(true)
            .stdin(options.stdin)
            .stdout(options.stdout)
            .stderr(options.stderr);
        if let Some(keys) = &options.detach_keys {
            builder = builder.detach_keys(keys);
        }
        let attached = self.docker.attach_container(id, Some(builder.build())).await?;
        Ok(AttachedStreams {
            output: Box::pin(
                attached
                    .output
                    .map(|item| item.map(to_chunk).map_err(ClawkerError::from)),
            ),
            input: attached.input,
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        Ok(())
    }

    async fn container_wait(&self, id: &str, condition: WaitCondition) -> Result<ExitWatcher> {
        let (tx, rx) = oneshot::channel();
        let (armed_tx, armed_rx) = oneshot::channel::<()>();
        let docker = self.docker.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut stream = Box::pin(
                docker.wait_container(
                    &id,
                    Some(
                        WaitContainerOptionsBuilder::default()
                            .condition(condition.as_str())
                            .build(),
                    ),
                ),
            );
            // The first poll sends the request; the caller is released after it
            let mut armed_tx = Some(armed_tx);
            let first = futures_util::future::poll_fn(|cx| {
                let polled = stream.poll_next_unpin(cx);
                if let Some(armed) = armed_tx.take() {
                    let _ = armed.send(());
                }
                polled
            })
            .await;
            let status = match first {
                Some(Ok(response)) => Ok(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                    Ok(code)
                }
                Some(Err(e)) => Err(ClawkerError::from(e)),
                None => Err(ClawkerError::Runtime(format!(
                    "wait on container {id} ended without a status"
                ))),
            };
            let _ = tx.send(status);
        });
        armed_rx.await.map_err(|_| {
            ClawkerError::Runtime("container wait task ended before sending its request".to_string())
        })?;
        debug!("Registered {} wait", condition.as_str());
        Ok(rx)
    }

    async fn container_resize(&self, id: &str, rows: u16, cols: u16) -> Result<()> {
        self.docker
            .resize_container_tty(
                id,
                ResizeContainerTTYOptionsBuilder::default()
                    .h(rows as i32)
                    .w(cols as i32)
                    .build(),
            )
            .await?;
        Ok(())
    }

    async fn copy_to_container(&self, id: &str, dest_path: &str, archive: Vec<u8>) -> Result<()> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptionsBuilder::default().path(dest_path).build()),
                bollard::body_full(archive.into()),
            )
            .await?;
        Ok(())
    }

    async fn container_remove(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::default().force(true).build()),
            )
            .await?;
        Ok(())
    }

    async fn exec_attach(&self, id: &str, cmd: &[String]) -> Result<AttachedStreams> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd.to_vec()),
                    ..Default::default()
                },
            )
            .await?;
        match self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            StartExecResults::Attached { output, input } => Ok(AttachedStreams {
                output: Box::pin(output.map(|item| item.map(to_chunk).map_err(ClawkerError::from))),
                input,
            }),
            StartExecResults::Detached => Err(ClawkerError::Runtime(format!(
                "exec in {id} started detached"
            ))),
        }
    }
}
