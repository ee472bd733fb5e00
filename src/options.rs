use crate::error::{ClawkerError, Result};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Container options collected from the command line.
///
/// Treated as immutable by the initialization pipeline; [`ContainerOptions::validate`]
/// runs every cross-field check before the first daemon call.
#[derive(Debug, Clone, Default)]
pub struct ContainerOptions {
    /// Image reference; `@` or empty selects the project image
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Option<String>,

    pub tty: bool,
    pub stdin_open: bool,
    pub detach: bool,
    /// Explicit attach selector, a subset of stdin/stdout/stderr
    pub attach: Vec<String>,
    pub auto_remove: bool,
    pub detach_keys: Option<String>,

    pub env: Vec<String>,
    pub env_files: Vec<PathBuf>,
    pub labels: Vec<String>,
    pub label_files: Vec<PathBuf>,

    pub publish: Vec<String>,
    pub expose: Vec<String>,
    pub publish_all: bool,

    /// Bind or named-volume specs, `source:target[:ro]`
    pub volumes: Vec<String>,
    /// tmpfs specs, `target[:options]`
    pub tmpfs: Vec<String>,

    pub workdir: Option<String>,
    pub user: Option<String>,
    pub hostname: Option<String>,

    pub memory: Option<String>,
    pub memory_swap: Option<String>,
    pub memory_swappiness: Option<i64>,
    pub cpus: Option<f64>,
    pub blkio_weight: Option<u16>,
    pub oom_score_adj: Option<i64>,

    pub network: Option<String>,
    pub ip: Option<String>,
    pub ip6: Option<String>,
    pub mac_address: Option<String>,

    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,

    pub health_cmd: Option<String>,
    pub health_interval: Option<String>,
    pub health_timeout: Option<String>,
    pub health_start_period: Option<String>,
    pub health_retries: Option<i64>,
    pub no_healthcheck: bool,

    /// `name[:maxRetries]`
    pub restart: Option<String>,

    pub pid: Option<String>,
    pub ipc: Option<String>,
    pub uts: Option<String>,
    pub userns: Option<String>,
    pub cgroupns: Option<String>,

    pub log_driver: Option<String>,
    pub log_opts: Vec<String>,
    pub annotations: Vec<String>,
    pub sysctls: Vec<String>,
}

/// Which standard streams to attach
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachStreams {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartSpec {
    pub name: String,
    pub max_retries: Option<i64>,
}

impl RestartSpec {
    pub fn is_restarting(&self) -> bool {
        !self.name.is_empty() && self.name != "no"
    }
}

/// One parsed `-p` mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
    pub container_port: u16,
    pub protocol: String,
}

impl PortMapping {
    /// Key used for exposed ports and bindings, e.g. `80/tcp`
    pub fn port_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

impl ContainerOptions {
    /// Cross-field validation; must pass before any daemon call
    pub fn validate(&self) -> Result<()> {
        self.attach_streams()?;
        self.restart_spec()?;
        self.health_spec()?;

        let memory = self.memory.as_deref().map(parse_bytes).transpose()?;
        if let Some(swap) = self.memory_swap.as_deref() {
            let swap = parse_swap(swap)?;
            match memory {
                None => {
                    return Err(ClawkerError::Validation(
                        "--memory-swap requires --memory to be set".to_string(),
                    ))
                }
                Some(memory) if swap != -1 && swap < memory => {
                    return Err(ClawkerError::Validation(
                        "--memory-swap must be greater than or equal to --memory".to_string(),
                    ))
                }
                _ => {}
            }
        }
        if let Some(swappiness) = self.memory_swappiness {
            if !(-1..=100).contains(&swappiness) {
                return Err(ClawkerError::Validation(format!(
                    "invalid --memory-swappiness {swappiness}: valid values are -1 to 100"
                )));
            }
        }
        if let Some(weight) = self.blkio_weight {
            if weight != 0 && !(10..=1000).contains(&weight) {
                return Err(ClawkerError::Validation(format!(
                    "invalid --blkio-weight {weight}: must be 0 or between 10 and 1000"
                )));
            }
        }
        if let Some(adj) = self.oom_score_adj {
            if !(-1000..=1000).contains(&adj) {
                return Err(ClawkerError::Validation(format!(
                    "invalid --oom-score-adj {adj}: valid values are -1000 to 1000"
                )));
            }
        }
        if let Some(cpus) = self.cpus {
            if cpus < 0.0 {
                return Err(ClawkerError::Validation(format!("invalid --cpus {cpus}")));
            }
        }
        if let Some(mac) = self.mac_address.as_deref() {
            validate_mac_address(mac)?;
        }
        if let Some(ip) = self.ip.as_deref() {
            ip.parse::<Ipv4Addr>().map_err(|_| {
                ClawkerError::Validation(format!("invalid IPv4 address for --ip: {ip}"))
            })?;
        }
        if let Some(ip6) = self.ip6.as_deref() {
            ip6.parse::<Ipv6Addr>().map_err(|_| {
                ClawkerError::Validation(format!("invalid IPv6 address for --ip6: {ip6}"))
            })?;
        }

        validate_namespace("pid", self.pid.as_deref(), &["host"], true)?;
        validate_namespace(
            "ipc",
            self.ipc.as_deref(),
            &["none", "private", "shareable", "host"],
            true,
        )?;
        validate_namespace("uts", self.uts.as_deref(), &["host"], false)?;
        validate_namespace("userns", self.userns.as_deref(), &["host"], false)?;
        validate_namespace("cgroupns", self.cgroupns.as_deref(), &["host", "private"], false)?;

        self.port_mappings()?;
        self.exposed_ports()?;
        for spec in &self.volumes {
            parse_volume_spec(spec)?;
        }
        for entry in self.sysctls.iter().chain(&self.annotations).chain(&self.log_opts) {
            split_key_value(entry)?;
        }

        Ok(())
    }

    /// Streams to attach: explicit selector, else stdin flag plus stdout/stderr
    pub fn attach_streams(&self) -> Result<AttachStreams> {
        if self.attach.is_empty() {
            return Ok(AttachStreams {
                stdin: self.stdin_open,
                stdout: true,
                stderr: true,
            });
        }

        let mut streams = AttachStreams {
            stdin: false,
            stdout: false,
            stderr: false,
        };
        for name in &self.attach {
            match name.to_lowercase().as_str() {
                "stdin" => streams.stdin = true,
                "stdout" => streams.stdout = true,
                "stderr" => streams.stderr = true,
                other => {
                    return Err(ClawkerError::Validation(format!(
                        "invalid --attach value '{other}': expected stdin, stdout or stderr"
                    )))
                }
            }
        }
        Ok(streams)
    }

    pub fn restart_spec(&self) -> Result<Option<RestartSpec>> {
        let Some(raw) = self.restart.as_deref() else {
            return Ok(None);
        };
        let spec = parse_restart(raw)?;
        if spec.is_restarting() && self.auto_remove {
            return Err(ClawkerError::Validation(
                "conflicting options: --restart and --rm cannot be combined".to_string(),
            ));
        }
        Ok(Some(spec))
    }

    /// Health probe: `["NONE"]` when disabled, a shell probe when configured
    pub fn health_spec(&self) -> Result<Option<HealthSpec>> {
        let has_health_fields = self.health_cmd.is_some()
            || self.health_interval.is_some()
            || self.health_timeout.is_some()
            || self.health_start_period.is_some()
            || self.health_retries.is_some();

        if self.no_healthcheck {
            if has_health_fields {
                return Err(ClawkerError::Validation(
                    "--no-healthcheck conflicts with --health-* options".to_string(),
                ));
            }
            return Ok(Some(HealthSpec {
                test: vec!["NONE".to_string()],
                ..Default::default()
            }));
        }

        if !has_health_fields {
            return Ok(None);
        }
        let Some(cmd) = self.health_cmd.as_deref() else {
            return Err(ClawkerError::Validation(
                "--health-* options require --health-cmd".to_string(),
            ));
        };

        let to_nanos = |flag: &str, value: Option<&str>| -> Result<Option<i64>> {
            value
                .map(|v| {
                    parse_duration(v)
                        .and_then(|d| {
                            i64::try_from(d.as_nanos())
                                .map_err(|_| format!("duration '{v}' is out of range"))
                        })
                        .map_err(|e| ClawkerError::Validation(format!("invalid {flag}: {e}")))
                })
                .transpose()
        };

        if let Some(retries) = self.health_retries {
            if retries < 0 {
                return Err(ClawkerError::Validation(
                    "--health-retries cannot be negative".to_string(),
                ));
            }
        }

        Ok(Some(HealthSpec {
            test: vec!["CMD-SHELL".to_string(), cmd.to_string()],
            interval: to_nanos("--health-interval", self.health_interval.as_deref())?,
            timeout: to_nanos("--health-timeout", self.health_timeout.as_deref())?,
            start_period: to_nanos("--health-start-period", self.health_start_period.as_deref())?,
            retries: self.health_retries,
        }))
    }

    pub fn port_mappings(&self) -> Result<Vec<PortMapping>> {
        let mut mappings = Vec::new();
        for spec in &self.publish {
            mappings.extend(parse_port_spec(spec)?);
        }
        Ok(mappings)
    }

    /// Union of `--expose` ports and ports derived from `-p`
    pub fn exposed_ports(&self) -> Result<BTreeSet<String>> {
        let mut ports = BTreeSet::new();
        for spec in &self.expose {
            let (range, protocol) = split_protocol(spec)?;
            let (start, end) = parse_port_range(range)?;
            for port in start..=end {
                ports.insert(format!("{port}/{protocol}"));
            }
        }
        for mapping in self.port_mappings()? {
            ports.insert(mapping.port_key());
        }
        Ok(ports)
    }

    /// Environment entries: env files first, then `-e` entries (later wins)
    pub fn environment(&self) -> Result<Vec<String>> {
        let mut entries = Vec::new();
        for path in &self.env_files {
            entries.extend(read_kv_file(path)?);
        }
        entries.extend(self.env.iter().map(|e| expand_from_host(e)));
        Ok(merge_entries(entries))
    }

    /// Labels from label files, then `-l` entries (later wins)
    pub fn label_entries(&self) -> Result<Vec<(String, String)>> {
        let mut entries = Vec::new();
        for path in &self.label_files {
            entries.extend(read_kv_file(path)?);
        }
        entries.extend(self.labels.iter().cloned());
        merge_entries(entries)
            .iter()
            .map(|entry| {
                let (k, v) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
                Ok((k.to_string(), v.to_string()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSpec {
    pub test: Vec<String>,
    pub interval: Option<i64>,
    pub timeout: Option<i64>,
    pub start_period: Option<i64>,
    pub retries: Option<i64>,
}

/// Parse `name[:maxRetries]`
pub fn parse_restart(raw: &str) -> Result<RestartSpec> {
    let (name, retries) = match raw.split_once(':') {
        Some((name, retries)) => (name, Some(retries)),
        None => (raw, None),
    };
    if name.is_empty() && retries.is_some() {
        return Err(ClawkerError::Validation(format!(
            "invalid restart policy '{raw}': missing policy name"
        )));
    }
    let max_retries = retries
        .map(|r| {
            r.parse::<i64>().map_err(|_| {
                ClawkerError::Validation(format!(
                    "invalid restart policy '{raw}': maximum retry count must be an integer"
                ))
            })
        })
        .transpose()?;

    match name {
        "" | "no" | "always" | "unless-stopped" | "on-failure" => {}
        other => {
            return Err(ClawkerError::Validation(format!(
                "invalid restart policy '{other}'"
            )))
        }
    }
    if max_retries.is_some() && name != "on-failure" {
        return Err(ClawkerError::Validation(format!(
            "invalid restart policy '{raw}': maximum retry count is only valid with on-failure"
        )));
    }

    Ok(RestartSpec {
        name: name.to_string(),
        max_retries,
    })
}

fn validate_namespace(
    flag: &str,
    value: Option<&str>,
    keywords: &[&str],
    allow_container: bool,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if value.is_empty() || keywords.contains(&value) {
        return Ok(());
    }
    if allow_container {
        if let Some(target) = value.strip_prefix("container:") {
            if !target.is_empty() {
                return Ok(());
            }
        }
    }
    Err(ClawkerError::Validation(format!(
        "invalid --{flag} mode '{value}'"
    )))
}

fn validate_mac_address(mac: &str) -> Result<()> {
    let parts: Vec<&str> = mac.split([':', '-']).collect();
    let valid = parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()));
    if valid {
        Ok(())
    } else {
        Err(ClawkerError::Validation(format!(
            "invalid MAC address: {mac}"
        )))
    }
}

fn split_protocol(spec: &str) -> Result<(&str, String)> {
    match spec.rsplit_once('/') {
        Some((rest, proto)) => {
            let proto = proto.to_lowercase();
            if !matches!(proto.as_str(), "tcp" | "udp" | "sctp") {
                return Err(ClawkerError::Validation(format!(
                    "invalid protocol '{proto}' in port spec '{spec}'"
                )));
            }
            Ok((rest, proto))
        }
        None => Ok((spec, "tcp".to_string())),
    }
}

fn parse_port_range(range: &str) -> Result<(u16, u16)> {
    let parse = |p: &str| {
        p.parse::<u16>()
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| ClawkerError::Validation(format!("invalid port '{p}'")))
    };
    match range.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if end < start {
                return Err(ClawkerError::Validation(format!(
                    "invalid port range '{range}'"
                )));
            }
            Ok((start, end))
        }
        None => {
            let port = parse(range)?;
            Ok((port, port))
        }
    }
}

/// Parse `[[hostIP:]hostPort:]containerPort[/protocol]`, expanding ranges
pub fn parse_port_spec(spec: &str) -> Result<Vec<PortMapping>> {
    let (rest, protocol) = split_protocol(spec)?;

    // Bracketed IPv6 host address
    let (host_ip, rest) = if let Some(stripped) = rest.strip_prefix('[') {
        let (ip, tail) = stripped.split_once(']').ok_or_else(|| {
            ClawkerError::Validation(format!("invalid port spec '{spec}': unterminated '['"))
        })?;
        let tail = tail.strip_prefix(':').ok_or_else(|| {
            ClawkerError::Validation(format!("invalid port spec '{spec}'"))
        })?;
        (Some(ip.to_string()), tail)
    } else {
        (None, rest)
    };

    let parts: Vec<&str> = rest.split(':').collect();
    let (host_ip, host_port, container) = match (host_ip, parts.as_slice()) {
        (None, [container]) => (None, None, *container),
        (None, [host_port, container]) => (None, Some(*host_port), *container),
        (None, [ip, host_port, container]) => (Some(ip.to_string()), Some(*host_port), *container),
        (Some(ip), [host_port, container]) => (Some(ip), Some(*host_port), *container),
        _ => {
            return Err(ClawkerError::Validation(format!(
                "invalid port spec '{spec}'"
            )))
        }
    };

    if let Some(ip) = host_ip.as_deref() {
        if !ip.is_empty() && ip.parse::<std::net::IpAddr>().is_err() {
            return Err(ClawkerError::Validation(format!(
                "invalid host IP '{ip}' in port spec '{spec}'"
            )));
        }
    }

    let (c_start, c_end) = parse_port_range(container)?;
    let host_range = match host_port.filter(|p| !p.is_empty()) {
        Some(p) => Some(parse_port_range(p)?),
        None => None,
    };

    let count = c_end - c_start;
    if let Some((h_start, h_end)) = host_range {
        // A single container port may bind a host range; docker picks one
        if h_end - h_start != count && count != 0 {
            return Err(ClawkerError::Validation(format!(
                "invalid port spec '{spec}': host and container ranges differ in size"
            )));
        }
    }

    let host_ip = host_ip.filter(|ip| !ip.is_empty());
    let mappings = (0..=count)
        .map(|offset| {
            let host_port = host_range.map(|(h_start, h_end)| {
                if count == 0 && h_end != h_start {
                    format!("{h_start}-{h_end}")
                } else {
                    (h_start + offset).to_string()
                }
            });
            PortMapping {
                host_ip: host_ip.clone(),
                host_port,
                container_port: c_start + offset,
                protocol: protocol.clone(),
            }
        })
        .collect();
    Ok(mappings)
}

/// One `-v` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
    /// Source is a named volume rather than a host path
    pub named: bool,
}

pub fn parse_volume_spec(spec: &str) -> Result<VolumeSpec> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (source, target, mode) = match parts.as_slice() {
        [source, target] => (*source, *target, None),
        [source, target, mode] => (*source, *target, Some(*mode)),
        _ => {
            return Err(ClawkerError::Validation(format!(
                "invalid volume spec '{spec}': expected source:target[:ro|rw]"
            )))
        }
    };
    if source.is_empty() || !target.starts_with('/') {
        return Err(ClawkerError::Validation(format!(
            "invalid volume spec '{spec}': target must be an absolute path"
        )));
    }
    let read_only = match mode {
        None | Some("rw") => false,
        Some("ro") => true,
        Some(other) => {
            return Err(ClawkerError::Validation(format!(
                "invalid volume mode '{other}' in '{spec}'"
            )))
        }
    };
    let named = !(source.starts_with('/') || source.starts_with('.') || source.starts_with('~'));
    Ok(VolumeSpec {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
        named,
    })
}

pub fn split_key_value(entry: &str) -> Result<(String, String)> {
    match entry.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(ClawkerError::Validation(format!(
            "invalid entry '{entry}': expected KEY=VALUE"
        ))),
    }
}

/// Parse sizes like `512m`, `2g`, `1024` into bytes
pub fn parse_bytes(raw: &str) -> Result<i64> {
    let lower = raw.trim().to_lowercase();
    let lower = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1i64 << 10),
        Some('m') => (&lower[..lower.len() - 1], 1i64 << 20),
        Some('g') => (&lower[..lower.len() - 1], 1i64 << 30),
        Some('t') => (&lower[..lower.len() - 1], 1i64 << 40),
        _ => (lower, 1),
    };
    let value: f64 = digits
        .parse()
        .map_err(|_| ClawkerError::Validation(format!("invalid size '{raw}'")))?;
    if value < 0.0 {
        return Err(ClawkerError::Validation(format!("invalid size '{raw}'")));
    }
    Ok((value * multiplier as f64) as i64)
}

/// Like [`parse_bytes`] but accepts `-1` for unlimited swap
pub fn parse_swap(raw: &str) -> Result<i64> {
    if raw.trim() == "-1" {
        return Ok(-1);
    }
    parse_bytes(raw)
}

/// Parse Go-style durations such as `30s`, `1m30s`, `500ms`
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    if raw == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{raw}'"))?;
        let (number, tail) = rest.split_at(digits_end);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid duration '{raw}'"))?;
        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_end);
        let seconds = match unit {
            "ns" => value / 1e9,
            "us" | "µs" => value / 1e6,
            "ms" => value / 1e3,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            other => return Err(format!("unknown unit '{other}' in duration '{raw}'")),
        };
        total = Duration::try_from_secs_f64(seconds)
            .ok()
            .and_then(|d| total.checked_add(d))
            .ok_or_else(|| format!("duration '{raw}' is out of range"))?;
        rest = tail;
    }
    Ok(total)
}

/// `KEY` alone takes its value from the host environment
fn expand_from_host(entry: &str) -> String {
    if entry.contains('=') {
        return entry.to_string();
    }
    match std::env::var(entry) {
        Ok(value) => format!("{entry}={value}"),
        Err(_) => entry.to_string(),
    }
}

/// Read a KEY=VALUE file, skipping blank lines and `#` comments
pub fn read_kv_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ClawkerError::Validation(format!("failed to read {}: {}", path.display(), e))
    })?;
    debug!("Read entries from {}", path.display());
    Ok(parse_kv_lines(&content))
}

pub fn parse_kv_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(expand_from_host)
        .collect()
}

/// Deduplicate `KEY=VALUE` entries by key; later entries win, first position kept
pub fn merge_entries(entries: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(&entry);
        if let Some(existing) = merged.iter_mut().find(|e| {
            e.split_once('=').map(|(k, _)| k).unwrap_or(e.as_str()) == key
        }) {
            *existing = entry;
        } else {
            merged.push(entry);
        }
    }
    merged
}
