//! Host credential lookup.
//!
//! The claude CLI stores its OAuth credentials in the platform keychain under a
//! fixed service name. Only reads are performed here.

use crate::error::{ClawkerError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Keychain service the claude CLI stores its credentials under
pub const CREDENTIALS_SERVICE: &str = "Claude Code-credentials";

/// Upper bound on a single keychain read
pub const KEYCHAIN_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait Keychain: Send + Sync {
    /// Secret stored for (service, user); `None` when there is no entry
    async fn read(&self, service: &str, user: &str) -> Result<Option<String>>;
}

/// Outcome of looking up the host credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Missing,
    Expired,
    Valid(String),
}

/// Name of the invoking OS user
pub fn current_user() -> Result<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map_err(|_| ClawkerError::Keychain("cannot determine the current user".to_string()))
}

/// Read and classify the claude credentials for `user`
pub async fn load_credentials(keychain: &dyn Keychain, user: &str) -> Result<Credentials> {
    let Some(secret) = keychain.read(CREDENTIALS_SERVICE, user).await? else {
        return Ok(Credentials::Missing);
    };
    let now_ms = chrono::Utc::now().timestamp_millis();
    if is_expired(&secret, now_ms)? {
        return Ok(Credentials::Expired);
    }
    Ok(Credentials::Valid(secret))
}

/// `claudeAiOauth.expiresAt` (epoch milliseconds) is in the past
fn is_expired(secret: &str, now_ms: i64) -> Result<bool> {
    let value: Value = serde_json::from_str(secret)
        .map_err(|e| ClawkerError::Keychain(format!("credentials are not valid JSON: {e}")))?;
    match value
        .get("claudeAiOauth")
        .and_then(|oauth| oauth.get("expiresAt"))
        .and_then(Value::as_i64)
    {
        Some(expires_at) => Ok(expires_at <= now_ms),
        None => Ok(false),
    }
}

/// Keychain backed by the platform's command-line tool
pub struct SystemKeychain;

impl SystemKeychain {
    fn command(service: &str, user: &str) -> Result<Command> {
        if cfg!(target_os = "macos") {
            let mut cmd = Command::new("security");
            cmd.args(["find-generic-password", "-s", service, "-a", user, "-w"]);
            Ok(cmd)
        } else {
            let tool = which::which("secret-tool").map_err(|_| {
                ClawkerError::Keychain(
                    "secret-tool not found; install libsecret-tools to forward host credentials"
                        .to_string(),
                )
            })?;
            let mut cmd = Command::new(tool);
            cmd.args(["lookup", "service", service, "username", user]);
            Ok(cmd)
        }
    }
}

#[async_trait]
impl Keychain for SystemKeychain {
    async fn read(&self, service: &str, user: &str) -> Result<Option<String>> {
        let mut cmd = Self::command(service, user)?;
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(KEYCHAIN_TIMEOUT, cmd.output())
            .await
            .map_err(|_| {
                ClawkerError::Unavailable(format!(
                    "keychain did not answer within {}s",
                    KEYCHAIN_TIMEOUT.as_secs()
                ))
            })??;

        let secret = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() || secret.is_empty() {
            debug!(
                "No keychain entry for service '{}' (status {})",
                service, output.status
            );
            return Ok(None);
        }
        Ok(Some(secret))
    }
}

#[cfg(test)]
pub use fake::FakeKeychain;
