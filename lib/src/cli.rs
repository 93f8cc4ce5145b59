//! # Guest patch agent CLI
//!
//! The host agent launches the binary with a single mode flag such as
//! `-enable` (single dash, per the extension contract); argv is normalized
//! to a clap subcommand before parsing, so `enable` and `--enable` work
//! too.

use std::ffi::OsString;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use crate::deadline::DISABLE_SENTINEL;
use crate::error::{exitcode, AgentError};
use crate::handlerenv;
use crate::orchestrator::{self, InstanceLock};

/// How long `disable` waits for a running operation to wind down.
const DISABLE_WAIT: Duration = Duration::from_secs(10 * 60);

/// The lifecycle modes of the host agent's extension contract.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "guestpatch")]
#[clap(rename_all = "kebab-case")]
#[clap(version)]
pub(crate) enum Opt {
    /// Prepare handler-owned directories after the extension is unpacked.
    Install,
    /// Run the patch operation from the newest goal state.
    Enable,
    /// Stop any running operation and block further runs until re-enabled.
    Disable,
    /// Remove handler-private state. Status and config directories belong
    /// to the host agent and are left alone.
    Uninstall,
    /// Refresh handler state after an extension version update.
    Update,
    /// Clear handler-private state without uninstalling.
    Reset,
}

const MODES: &[&str] = &["install", "enable", "disable", "uninstall", "update", "reset"];

/// Rewrite the contract's `-mode` flag into the subcommand clap expects.
fn normalize_args(args: Vec<OsString>) -> Vec<OsString> {
    let mut args = args;
    if let Some(first) = args.get(1) {
        if let Some(s) = first.to_str() {
            let bare = s.trim_start_matches('-');
            if s.starts_with('-') && MODES.contains(&bare) {
                args[1] = OsString::from(bare);
            }
        }
    }
    args
}

/// Map an error to the contract's exit code table.
pub fn exit_code_for(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<AgentError>() {
        Some(agent) => agent.exit_code(),
        None => exitcode::GENERAL,
    }
}

/// Parse arguments and run the selected mode to completion.
pub async fn run_from_iter<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    let opt = Opt::parse_from(normalize_args(args));

    let paths = handlerenv::locate()?;
    paths.ensure_handler_dirs()?;
    // Held for the process lifetime; dropping it would lose buffered logs.
    let _guard = guestpatch_utils::initialize_tracing(Some(paths.log_dir.as_path()));
    tracing::info!("mode {opt:?}");

    match opt {
        Opt::Install | Opt::Update => {
            // Directory creation above is the whole job.
            Ok(())
        }
        Opt::Enable => orchestrator::enable(&paths).await,
        Opt::Disable => disable(&paths).await,
        Opt::Uninstall => remove_state_dir(&paths),
        Opt::Reset => {
            remove_state_dir(&paths)?;
            std::fs::create_dir_all(&paths.state_dir)
                .with_context(|| format!("Recreating {}", paths.state_dir))?;
            Ok(())
        }
    }
}

fn remove_state_dir(paths: &handlerenv::Paths) -> Result<()> {
    match std::fs::remove_dir_all(&paths.state_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Removing {}", paths.state_dir)),
    }
}

/// Drop the disable sentinel (the config watcher of a running instance
/// honors it within a second) and wait for the instance lock to clear.
async fn disable(paths: &handlerenv::Paths) -> Result<()> {
    let sentinel = paths.state_dir.join(DISABLE_SENTINEL);
    std::fs::write(&sentinel, b"disabled\n").with_context(|| format!("Writing {sentinel}"))?;
    let cancel = CancellationToken::new();
    let lock = InstanceLock::acquire(&paths.state_dir, &cancel, DISABLE_WAIT).await?;
    drop(lock);
    tracing::info!("no operation in flight; disable complete");
    Ok(())
}
