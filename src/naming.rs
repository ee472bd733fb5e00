//! Deterministic container and volume naming.
//!
//! Every container this tool creates is named `clawker.<project>.<agent>`
//! (or `clawker.<agent>` without a project) and every per-agent volume is the
//! container name plus a kind suffix, so names are a total function of
//! (project, agent, kind).

use crate::error::{ClawkerError, Result};
use rand::seq::SliceRandom;
use rand::Rng;

/// Prefix shared by every container and volume name
pub const NAME_PREFIX: &str = "clawker";

/// Longest container name accepted (a hostname segment)
pub const MAX_NAME_LEN: usize = 63;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "cosmic", "crisp", "daring", "eager", "fancy", "gentle", "happy",
    "jolly", "keen", "lively", "lucky", "mellow", "nimble", "plucky", "quiet", "rapid", "shiny",
    "snappy", "sunny", "swift", "tidy", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "comet", "falcon", "ferret", "gecko", "heron", "koala", "lemur", "lynx", "marmot",
    "narwhal", "otter", "panda", "pelican", "quokka", "raven", "salmon", "sparrow", "tapir",
    "walrus", "wombat", "yak",
];

/// Kinds of per-agent volumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VolumeKind {
    /// Claude config tree and credentials
    Config,
    /// Shell history
    History,
    /// Workspace contents in snapshot mode
    Workspace,
}

impl VolumeKind {
    pub fn suffix(&self) -> &'static str {
        match self {
            VolumeKind::Config => "config",
            VolumeKind::History => "history",
            VolumeKind::Workspace => "workspace",
        }
    }
}

/// Resolved identity of one agent container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentNames {
    pub project: String,
    pub agent: String,
    pub container: String,
}

impl AgentNames {
    /// Resolve the agent name (generating one when absent) and derive the container name.
    ///
    /// Validation happens here, before any daemon call.
    pub fn resolve<R: Rng + ?Sized>(
        project: &str,
        agent: Option<&str>,
        rng: &mut R,
    ) -> Result<Self> {
        if !project.is_empty() {
            validate_segment("project", project)?;
        }

        let agent = match agent.map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => generate_agent_name(rng),
        };
        validate_segment("agent", &agent)?;

        let container = container_name(project, &agent);
        if container.len() > MAX_NAME_LEN {
            return Err(ClawkerError::Validation(format!(
                "container name '{container}' is {} characters long; shorten the agent or project name to fit {MAX_NAME_LEN}",
                container.len()
            )));
        }

        Ok(Self {
            project: project.to_string(),
            agent,
            container,
        })
    }

    pub fn volume(&self, kind: VolumeKind) -> String {
        volume_name(&self.container, kind)
    }

    pub fn config_volume(&self) -> String {
        self.volume(VolumeKind::Config)
    }
}

/// `clawker.<project>.<agent>`, or `clawker.<agent>` when the project is empty
pub fn container_name(project: &str, agent: &str) -> String {
    if project.is_empty() {
        format!("{NAME_PREFIX}.{agent}")
    } else {
        format!("{NAME_PREFIX}.{project}.{agent}")
    }
}

pub fn volume_name(container: &str, kind: VolumeKind) -> String {
    format!("{container}-{}", kind.suffix())
}

/// Pick a random `adjective-noun` agent name
pub fn generate_agent_name<R: Rng + ?Sized>(rng: &mut R) -> String {
    let adjective = ADJECTIVES.choose(rng).copied().unwrap_or("eager");
    let noun = NOUNS.choose(rng).copied().unwrap_or("otter");
    format!("{adjective}-{noun}")
}

fn validate_segment(what: &str, value: &str) -> Result<()> {
    if value.starts_with('-') {
        return Err(ClawkerError::Validation(format!(
            "invalid {what} name '{value}': must not begin with '-'"
        )));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| *c == '/' || *c == '\\' || c.is_whitespace())
    {
        return Err(ClawkerError::Validation(format!(
            "invalid {what} name '{value}': must not contain {bad:?}"
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(ClawkerError::Validation(format!(
            "invalid {what} name '{value}': only letters, digits, '-', '_' and '.' are allowed"
        )));
    }
    Ok(())
}
