//! The core data model for patch runs.
//!
//! These types cross the wire to the host agent (inside the status
//! document), so every rename here is part of the external contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of work a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Enumerate available patches without mutating the system.
    Assessment,
    /// Install a filtered selection of patches.
    Installation,
    /// Persist automatic patching/assessment modes.
    ConfigurePatching,
    /// Cancel an in-flight operation carrying the same activity id.
    NoOperation,
}

/// Reboot policy attached to an installation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootSetting {
    /// Reboot after the install loop if the system signals it is needed.
    IfRequired,
    /// Never reboot; record that one is pending instead.
    Never,
    /// Always reboot after the install loop.
    Always,
}

/// Patch classification assigned by the package manager's advisory system
/// or repository pocket.
///
/// Declaration order is the sort rank used for deterministic ordering of
/// selections; do not reorder variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Classification {
    /// A critical security advisory.
    Critical,
    /// A security advisory.
    Security,
    /// Bugfix, enhancement, or otherwise unclassified-but-known.
    Other,
    /// The underlying tool does not expose a classification.
    Unknown,
}

/// Whether the filter engine chose a patch for installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectedState {
    /// Chosen by the filters (or pulled in as a dependency).
    Selected,
    /// Did not match the filters.
    NotSelected,
    /// Matched an exclude pattern, directly or through a dependency.
    Excluded,
    /// Selection not yet decided.
    Pending,
}

/// Install progress for a single patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstallState {
    /// Queued for installation.
    Pending,
    /// The package manager is working on it right now.
    Installing,
    /// Terminal: installed successfully.
    Installed,
    /// Terminal: the install attempt failed.
    Failed,
    /// Terminal: never attempted (deadline, cancellation, not selected).
    NotStarted,
    /// Terminal: excluded by pattern or excluded dependency.
    Excluded,
}

/// Terminal and non-terminal states of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// The run is still executing.
    InProgress,
    /// Every selected patch reached `Installed`.
    Succeeded,
    /// At least one patch installed and at least one failed or was
    /// excluded through a dependency.
    CompletedWithErrors,
    /// Nothing installed and errors occurred.
    Failed,
    /// Cancellation ended the run.
    Aborted,
}

/// Progress of the post-install reboot, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebootStatus {
    /// No reboot attempted or needed so far.
    NotStarted,
    /// The system wants a reboot but policy forbade it.
    Required,
    /// The reboot was invoked; expect the process to terminate.
    Started,
    /// A prior run's reboot completed (observed after restart).
    Completed,
    /// The reboot command failed or did not take effect.
    Failed,
}

/// Automatic patching mode persisted by `ConfigurePatching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchMode {
    /// Leave the image's own automatic-update configuration alone.
    ImageDefault,
    /// The platform drives patching; disable image-level automation.
    AutomaticByPlatform,
}

/// Automatic assessment mode persisted by `ConfigurePatching`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssessmentMode {
    /// Leave the image's own assessment configuration alone.
    ImageDefault,
    /// The platform schedules periodic assessments.
    AutomaticByPlatform,
}

/// One row of the patch table in the status document.
///
/// Identity is `(name, version)`; `id` is a stable per-run join key
/// derived from them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchRecord {
    /// Stable identifier within a run.
    pub id: String,
    /// Package name as reported by the native tool.
    pub name: String,
    /// Candidate version.
    pub version: String,
    /// Advisory classification.
    pub classification: Classification,
    /// Filter verdict.
    pub selected_state: SelectedState,
    /// Install progress.
    pub install_state: InstallState,
    /// Populated when `install_state` is `Failed` or `Excluded`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl PatchRecord {
    /// Create a record in the initial (pending) states.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        classification: Classification,
    ) -> Self {
        let name = name.into();
        let version = version.into();
        Self {
            id: format!("{name}_{version}"),
            name,
            version,
            classification,
            selected_state: SelectedState::Pending,
            install_state: InstallState::Pending,
            error_message: None,
        }
    }

    /// Whether the install state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.install_state,
            InstallState::Installed | InstallState::Failed | InstallState::NotStarted | InstallState::Excluded
        )
    }

    /// Transition the install state. `Installed` never regresses; a
    /// transition out of any terminal state is ignored.
    pub fn set_install_state(&mut self, next: InstallState) {
        if self.is_terminal() {
            tracing::debug!(
                "ignoring install state transition {:?} -> {next:?} for {}",
                self.install_state,
                self.id
            );
            return;
        }
        self.install_state = next;
    }

    /// Terminal failure with a message.
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.set_install_state(InstallState::Failed);
        if self.install_state == InstallState::Failed {
            self.error_message = Some(message.into());
        }
    }

    /// Mark as excluded (pattern match or excluded dependency).
    pub fn mark_excluded(&mut self, reason: impl Into<String>) {
        self.selected_state = SelectedState::Excluded;
        self.set_install_state(InstallState::Excluded);
        self.error_message = Some(reason.into());
    }
}

/// One execution of an operation against one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    /// Correlation identifier from the request.
    pub activity_id: String,
    /// The operation being executed.
    pub operation: Operation,
    /// When this run began.
    pub started_at: DateTime<Utc>,
    /// When this run reached a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Overall status; monotone once terminal.
    pub status: RunStatus,
    /// Ordered patch table.
    pub patches: Vec<PatchRecord>,
    /// Reboot progress.
    pub reboot_status: RebootStatus,
    /// Human-readable progress notes surfaced as substatus entries.
    pub substatus: Vec<String>,
}

impl RunRecord {
    /// Create an in-progress run.
    pub fn new(activity_id: impl Into<String>, operation: Operation) -> Self {
        Self {
            activity_id: activity_id.into(),
            operation,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::InProgress,
            patches: Vec::new(),
            reboot_status: RebootStatus::NotStarted,
            substatus: Vec::new(),
        }
    }

    /// Whether the run has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, RunStatus::InProgress)
    }

    /// Transition to a terminal status. Once terminal, later seals are
    /// ignored so the status is monotone.
    pub fn seal(&mut self, status: RunStatus) {
        if self.is_terminal() {
            tracing::debug!("ignoring seal {status:?}; run already {:?}", self.status);
            return;
        }
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Append a progress note.
    pub fn add_substatus(&mut self, message: impl Into<String>) {
        self.substatus.push(message.into());
    }

    /// Find a patch row by identity.
    pub fn patch_mut(&mut self, name: &str, version: &str) -> Option<&mut PatchRecord> {
        self.patches
            .iter_mut()
            .find(|p| p.name == name && p.version == version)
    }
}
