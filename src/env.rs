//! Base container environment composed from project config and host terminal.

use crate::config::{FirewallConfig, ProjectConfig, WorkspaceMode};
use crate::naming::AgentNames;
use std::path::Path;

/// Capabilities the guest firewall script needs
pub const FIREWALL_CAPABILITIES: &[&str] = &["NET_ADMIN", "NET_RAW"];

/// Color support of the caller's terminal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminalHints {
    pub color_256: bool,
    pub truecolor: bool,
}

impl TerminalHints {
    pub fn detect() -> Self {
        let term = std::env::var("TERM").unwrap_or_default();
        let colorterm = std::env::var("COLORTERM").unwrap_or_default();
        Self::from_vars(&term, &colorterm)
    }

    pub fn from_vars(term: &str, colorterm: &str) -> Self {
        let truecolor = matches!(colorterm, "truecolor" | "24bit");
        Self {
            color_256: truecolor || term.contains("256color"),
            truecolor,
        }
    }
}

/// Base env plus the capabilities it implies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeEnv {
    pub env: Vec<String>,
    pub cap_add: Vec<String>,
}

/// Compose the container env; later entries override earlier ones on merge.
///
/// The agent env map comes first so identity and workspace variables cannot
/// be shadowed by it.
pub fn compose_env(
    config: &ProjectConfig,
    names: &AgentNames,
    mode: WorkspaceMode,
    source_dir: &Path,
    hints: TerminalHints,
) -> RuntimeEnv {
    let mut env: Vec<String> = config
        .agent
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();

    env.push(format!("CLAWKER_PROJECT={}", names.project));
    env.push(format!("CLAWKER_AGENT={}", names.agent));
    env.push(format!("CLAWKER_WORKSPACE_MODE={}", mode.as_str()));
    env.push(format!("CLAWKER_WORKSPACE_SOURCE={}", source_dir.display()));

    if let Some(editor) = &config.agent.editor {
        env.push(format!("EDITOR={editor}"));
    }
    if let Some(visual) = config.agent.visual.as_ref().or(config.agent.editor.as_ref()) {
        env.push(format!("VISUAL={visual}"));
    }

    if hints.color_256 {
        env.push("TERM=xterm-256color".to_string());
    }
    if hints.truecolor {
        env.push("COLORTERM=truecolor".to_string());
    }

    let mut cap_add = Vec::new();
    if config.security.firewall.enable {
        env.extend(firewall_env(&config.security.firewall));
        cap_add.extend(FIREWALL_CAPABILITIES.iter().map(|c| c.to_string()));
    }

    RuntimeEnv { env, cap_add }
}

fn firewall_env(firewall: &FirewallConfig) -> Vec<String> {
    let mut env = vec!["CLAWKER_FIREWALL_ENABLED=true".to_string()];
    if !firewall.add_domains.is_empty() {
        env.push(format!(
            "CLAWKER_FIREWALL_DOMAINS={}",
            firewall.add_domains.join(",")
        ));
    }
    if !firewall.ip_range_sources.is_empty() {
        env.push(format!(
            "CLAWKER_FIREWALL_IP_RANGE_SOURCES={}",
            firewall.ip_range_sources.join(",")
        ));
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn names() -> AgentNames {
        AgentNames::resolve("myapp", Some("dev"), &mut StdRng::seed_from_u64(1)).unwrap()
    }

    #[test]
    fn test_terminal_hints() {
        assert_eq!(
            TerminalHints::from_vars("xterm-256color", ""),
            TerminalHints {
                color_256: true,
                truecolor: false
            }
        );
        assert!(TerminalHints::from_vars("xterm", "truecolor").color_256);
        assert_eq!(TerminalHints::from_vars("dumb", ""), TerminalHints::default());
    }

    #[test]
    fn test_identity_and_workspace_vars() {
        let mut config = ProjectConfig::default();
        config.agent.env.insert("FOO".to_string(), "bar".to_string());
        config.agent.editor = Some("nvim".to_string());

        let runtime = compose_env(
            &config,
            &names(),
            WorkspaceMode::Snapshot,
            Path::new("/src/myapp"),
            TerminalHints::default(),
        );

        assert_eq!(runtime.env[0], "FOO=bar");
        for expected in [
            "CLAWKER_PROJECT=myapp",
            "CLAWKER_AGENT=dev",
            "CLAWKER_WORKSPACE_MODE=snapshot",
            "CLAWKER_WORKSPACE_SOURCE=/src/myapp",
            "EDITOR=nvim",
            "VISUAL=nvim",
        ] {
            assert!(runtime.env.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(runtime.cap_add.is_empty());
    }

    #[test]
    fn test_firewall_adds_hints_and_capabilities() {
        let mut config = ProjectConfig::default();
        config.security.firewall.enable = true;
        config.security.firewall.add_domains = vec!["example.com".into(), "crates.io".into()];
        config.security.firewall.ip_range_sources = vec!["github".into()];

        let runtime = compose_env(
            &config,
            &names(),
            WorkspaceMode::Bind,
            Path::new("/src"),
            TerminalHints {
                color_256: true,
                truecolor: true,
            },
        );

        assert!(runtime.env.contains(&"CLAWKER_FIREWALL_ENABLED=true".to_string()));
        assert!(runtime
            .env
            .contains(&"CLAWKER_FIREWALL_DOMAINS=example.com,crates.io".to_string()));
        assert!(runtime
            .env
            .contains(&"CLAWKER_FIREWALL_IP_RANGE_SOURCES=github".to_string()));
        assert!(runtime.env.contains(&"COLORTERM=truecolor".to_string()));
        assert_eq!(runtime.cap_add, vec!["NET_ADMIN", "NET_RAW"]);
    }
}
