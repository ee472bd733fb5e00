//! Files placed into a created container before it first starts.

use crate::archive::{tar_files, ArchiveFile};
use crate::error::Result;
use crate::runtime::ContainerRuntime;
use crate::seeding::CONTAINER_HOME;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

/// Onboarding marker, relative to the container home
pub const ONBOARDING_FILE: &str = ".claude.json";

/// Post-init script, relative to the container home
pub const POST_INIT_FILE: &str = ".clawker/post-init.sh";

/// Host account fields carried into the marker
const CARRIED_ACCOUNT_KEYS: &[&str] = &["oauthAccount", "userID"];

/// Marker content; account fields are copied from the host `~/.claude.json` when present
pub fn onboarding_marker(host_claude_json: Option<&Path>) -> Vec<u8> {
    let mut marker = Map::new();
    marker.insert("hasCompletedOnboarding".to_string(), Value::Bool(true));

    let host: Option<Value> = host_claude_json
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| serde_json::from_str(&content).ok());
    if let Some(Value::Object(host)) = host {
        for key in CARRIED_ACCOUNT_KEYS {
            if let Some(value) = host.get(*key) {
                marker.insert(key.to_string(), value.clone());
            }
        }
    }

    Value::Object(marker).to_string().into_bytes()
}

/// Script text as written into the container; adds a shebang when missing
pub fn post_init_script(script: &str) -> Vec<u8> {
    let mut content = String::new();
    if !script.starts_with("#!") {
        content.push_str("#!/bin/bash\nset -e\n");
    }
    content.push_str(script);
    if !content.ends_with('\n') {
        content.push('\n');
    }
    content.into_bytes()
}

pub async fn inject_onboarding(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    host_claude_json: Option<&Path>,
) -> Result<()> {
    let archive = tar_files(&[ArchiveFile {
        path: ONBOARDING_FILE.to_string(),
        content: onboarding_marker(host_claude_json),
        mode: 0o600,
    }])?;
    runtime
        .copy_to_container(container_id, CONTAINER_HOME, archive)
        .await?;
    debug!("Injected onboarding marker into {}", container_id);
    Ok(())
}

pub async fn inject_post_init(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    script: &str,
) -> Result<()> {
    let archive = tar_files(&[ArchiveFile {
        path: POST_INIT_FILE.to_string(),
        content: post_init_script(script),
        mode: 0o755,
    }])?;
    runtime
        .copy_to_container(container_id, CONTAINER_HOME, archive)
        .await?;
    info!("Injected post-init script into {}", container_id);
    Ok(())
}
