//! Handling of system restarts and the cross-boot marker.
//!
//! A reboot is only performed after the install loop has exited and the
//! status document has been flushed. Before invoking it we persist a marker
//! recording the run's intended terminal outcome; the next invocation
//! finalizes that run before reading a fresh goal state.

use std::io::Write;

use anyhow::{Context, Result};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::model::{RebootSetting, RunRecord};
use crate::task::Task;
use tokio_util::sync::CancellationToken;

/// Marker file name in the handler-state directory.
pub(crate) const REBOOT_MARKER: &str = ".reboot.marker";

/// If the OS has not terminated us this long after the reboot command, the
/// reboot is considered failed.
const REBOOT_GRACE: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Persisted across the reboot so the next invocation can finalize the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RebootMarker {
    pub(crate) activity_id: String,
    pub(crate) sequence: u64,
    pub(crate) run_snapshot: RunRecord,
}

/// What to do after the install loop, per policy and system signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RebootDecision {
    /// Nothing to do.
    None,
    /// A reboot is wanted but policy forbids it; record that.
    MarkRequired,
    /// Reboot now.
    Reboot,
}

/// The policy table.
pub(crate) fn plan(setting: RebootSetting, reboot_required: bool) -> RebootDecision {
    match (setting, reboot_required) {
        (RebootSetting::Never, true) => RebootDecision::MarkRequired,
        (RebootSetting::Never, false) => RebootDecision::None,
        (RebootSetting::Always, _) => RebootDecision::Reboot,
        (RebootSetting::IfRequired, true) => RebootDecision::Reboot,
        (RebootSetting::IfRequired, false) => RebootDecision::None,
    }
}

pub(crate) fn load_marker(state_dir: &Dir) -> Result<Option<RebootMarker>> {
    match state_dir.read_to_string(REBOOT_MARKER) {
        Ok(content) => Ok(Some(
            serde_json::from_str(&content).context("Parsing reboot marker")?,
        )),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).context("Reading reboot marker"),
    }
}

#[context("Writing reboot marker")]
pub(crate) fn write_marker(state_dir: &Dir, marker: &RebootMarker) -> Result<()> {
    let tmp = format!("{REBOOT_MARKER}.tmp");
    state_dir.write(&tmp, serde_json::to_vec(marker)?)?;
    state_dir.rename(&tmp, state_dir, REBOOT_MARKER)?;
    Ok(())
}

pub(crate) fn clear_marker(state_dir: &Dir) -> Result<()> {
    match state_dir.remove_file(REBOOT_MARKER) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("Removing reboot marker"),
    }
}

/// Initiate a system reboot. On success the process is terminated out from
/// under us, so this only returns on failure.
#[context("Initiating reboot")]
pub(crate) async fn initiate(cancel: &CancellationToken) -> Result<()> {
    // Flush output streams
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    let out = Task::new("Rebooting system", "systemctl")
        .args(["reboot"])
        .run(cancel)
        .await;
    let ok = matches!(&out, Ok(o) if o.success());
    if !ok {
        tracing::warn!("systemctl reboot unavailable; falling back to shutdown");
        let out = Task::new("Rebooting system", "shutdown")
            .args(["-r", "now"])
            .run(cancel)
            .await?;
        if !out.success() {
            anyhow::bail!("shutdown -r now exited {}", out.exit_code);
        }
    }
    tracing::debug!("initiated reboot, awaiting termination");
    tokio::time::sleep(REBOOT_GRACE).await;
    anyhow::bail!("still running {REBOOT_GRACE:?} after requesting reboot")
}

/// Open the handler-state directory.
pub(crate) fn open_state_dir(path: &camino::Utf8Path) -> Result<Dir> {
    Dir::open_ambient_dir(path, cap_std::ambient_authority())
        .with_context(|| format!("Opening {path}"))
}
