//! The host-provided handler environment descriptor.
//!
//! The host agent drops a `HandlerEnvironment.json` next to the extension
//! describing where logs, requests, and status documents live. We consume
//! it read-only.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::error::AgentError;

/// File name of the descriptor, looked up in the working directory and
/// next to the executable, in that order.
pub(crate) const DESCRIPTOR: &str = "HandlerEnvironment.json";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    handler_environment: Folders,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Folders {
    log_folder: Utf8PathBuf,
    config_folder: Utf8PathBuf,
    status_folder: Utf8PathBuf,
    #[serde(default)]
    state_folder: Option<Utf8PathBuf>,
}

/// Runtime directories for one handler instance.
#[derive(Debug, Clone)]
pub(crate) struct Paths {
    /// Where rolling log files go.
    pub(crate) log_dir: Utf8PathBuf,
    /// `<n>.settings` requests from the host agent.
    pub(crate) config_dir: Utf8PathBuf,
    /// `<n>.status` documents we write.
    pub(crate) status_dir: Utf8PathBuf,
    /// Handler-private state: the instance lock, reboot marker, automation
    /// config. Not part of the host contract.
    pub(crate) state_dir: Utf8PathBuf,
}

/// Parse the descriptor content. The file is a JSON array holding a single
/// envelope object, mirroring the shape of the status document.
fn parse(content: &str) -> Result<Paths> {
    let mut envelopes: Vec<Envelope> =
        serde_json::from_str(content).context("Parsing handler environment")?;
    let envelope = match envelopes.len() {
        1 => envelopes.remove(0),
        n => anyhow::bail!("expected exactly one handler environment entry, found {n}"),
    };
    let folders = envelope.handler_environment;
    let state_dir = folders.state_folder.unwrap_or_else(|| {
        folders
            .config_folder
            .parent()
            .map(|p| p.join("state"))
            .unwrap_or_else(|| Utf8PathBuf::from("state"))
    });
    Ok(Paths {
        log_dir: folders.log_folder,
        config_dir: folders.config_folder,
        status_dir: folders.status_folder,
        state_dir,
    })
}

fn read_descriptor_from(dir: &Utf8Path) -> Option<String> {
    let candidate = dir.join(DESCRIPTOR);
    std::fs::read_to_string(&candidate).ok()
}

/// Locate and parse the handler environment.
pub(crate) fn locate() -> Result<Paths, AgentError> {
    let mut candidates: Vec<Utf8PathBuf> = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(cwd) = Utf8PathBuf::try_from(cwd) {
            candidates.push(cwd);
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            if let Ok(dir) = Utf8PathBuf::try_from(dir.to_path_buf()) {
                candidates.push(dir);
            }
        }
    }
    for dir in &candidates {
        if let Some(content) = read_descriptor_from(dir) {
            return parse(&content)
                .map_err(|e| AgentError::Environment(format!("{}: {e:#}", dir.join(DESCRIPTOR))));
        }
    }
    Err(AgentError::Environment(format!(
        "{DESCRIPTOR} not found in {:?}",
        candidates
    )))
}

impl Paths {
    /// Create the handler-owned directories (state and logs). The config
    /// and status directories belong to the host agent.
    pub(crate) fn ensure_handler_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("Creating {}", self.state_dir))?;
        std::fs::create_dir_all(&self.log_dir).with_context(|| format!("Creating {}", self.log_dir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const DESCRIPTOR_JSON: &str = indoc! {r#"
        [{
          "version": 1.0,
          "handlerEnvironment": {
            "logFolder": "/var/log/azure/patchagent",
            "configFolder": "/var/lib/waagent/patchagent/config",
            "statusFolder": "/var/lib/waagent/patchagent/status"
          }
        }]
    "#};

    #[test]
    fn test_parse_defaults_state_dir() {
        let paths = parse(DESCRIPTOR_JSON).unwrap();
        assert_eq!(paths.log_dir, "/var/log/azure/patchagent");
        assert_eq!(paths.config_dir, "/var/lib/waagent/patchagent/config");
        assert_eq!(paths.status_dir, "/var/lib/waagent/patchagent/status");
        assert_eq!(paths.state_dir, "/var/lib/waagent/patchagent/state");
    }

    #[test]
    fn test_parse_explicit_state_dir() {
        let content = DESCRIPTOR_JSON.replace(
            "\"statusFolder\"",
            "\"stateFolder\": \"/tmp/state\",\n    \"statusFolder\"",
        );
        let paths = parse(&content).unwrap();
        assert_eq!(paths.state_dir, "/tmp/state");
    }

    #[test]
    fn test_parse_rejects_multiple_entries() {
        let content = format!(
            "[{},{}]",
            DESCRIPTOR_JSON.trim().trim_start_matches('[').trim_end_matches(']'),
            DESCRIPTOR_JSON.trim().trim_start_matches('[').trim_end_matches(']')
        );
        assert!(parse(&content).is_err());
    }

    #[test]
    fn test_parse_rejects_missing_folder() {
        let content = DESCRIPTOR_JSON.replace("logFolder", "logDir");
        assert!(parse(&content).is_err());
    }
}
