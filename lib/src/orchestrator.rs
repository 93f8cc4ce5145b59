//! The run state machine: Ingest -> Plan -> Execute -> Finalize.
//!
//! One orchestrator drives one request to a terminal status. Package
//! operations happen strictly one at a time; the advisory lock in the
//! handler-state directory enforces that across processes, and the install
//! loop enforces it within one.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::deadline::{self, Cancellation, Checkpoint, DeadlineController};
use crate::distro;
use crate::error::AgentError;
use crate::filter::{self, ClosureVerdict, PatchPatterns, SelectionFilters};
use crate::handlerenv::Paths;
use crate::model::{
    Classification, InstallState, Operation, PatchRecord, RebootStatus, RunRecord, RunStatus,
    SelectedState,
};
use crate::pkgmgr::{self, PackageManager, PkgError};
use crate::reboot::{self, RebootDecision, RebootMarker};
use crate::settings::{self, AutomationConfig, Request};
use crate::status::{self, StatusWriter};

/// How long a new invocation waits for a previous one to release the lock.
const LOCK_WAIT: Duration = Duration::from_secs(60 * 60);

/// Advisory lock guaranteeing a single Execute-phase orchestrator.
#[derive(Debug)]
pub(crate) struct InstanceLock {
    _file: std::fs::File,
}

impl InstanceLock {
    pub(crate) const LOCK_FILE: &'static str = ".orchestrator.lock";

    /// Try to take the lock without blocking.
    pub(crate) fn try_acquire(state_dir: &Utf8Path) -> Result<Option<Self>> {
        let path = state_dir.join(Self::LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Opening {path}"))?;
        match rustix::fs::flock(&file, rustix::fs::FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {
                let mut f = &file;
                let _ = writeln!(f, "{}", std::process::id());
                Ok(Some(Self { _file: file }))
            }
            Err(rustix::io::Errno::WOULDBLOCK) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("locking {path}: {e}")),
        }
    }

    /// Wait (politely, 1 Hz) for the lock.
    pub(crate) async fn acquire(
        state_dir: &Utf8Path,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> Result<Self> {
        let started = tokio::time::Instant::now();
        loop {
            if let Some(lock) = Self::try_acquire(state_dir)? {
                return Ok(lock);
            }
            if started.elapsed() >= max_wait {
                anyhow::bail!("another instance held the lock for over {max_wait:?}");
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = cancel.cancelled() => anyhow::bail!("cancelled while waiting for the instance lock"),
            }
        }
    }
}

/// Entry point for `enable`: finalize any pending reboot, ingest the newest
/// goal state, and dispatch it.
pub(crate) async fn enable(paths: &Paths) -> Result<()> {
    paths.ensure_handler_dirs()?;
    let state = reboot::open_state_dir(&paths.state_dir)?;
    finalize_reboot_marker(paths, &state)?;

    // Being enabled again clears a previous disable.
    match state.remove_file(deadline::DISABLE_SENTINEL) {
        Ok(()) => tracing::info!("cleared disable sentinel"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).context("Removing disable sentinel"),
    }

    let config_dir = Dir::open_ambient_dir(&paths.config_dir, cap_std::ambient_authority())
        .map_err(|e| AgentError::Environment(format!("config directory: {e}")))?;
    let Some((sequence, content)) = settings::newest_sequence(&config_dir)? else {
        return Err(AgentError::Configuration("no settings files present".into()).into());
    };
    tracing::info!("processing sequence {sequence}");

    let request = match settings::parse_settings(&content)
        .and_then(|raw| settings::validate(raw, sequence, Utc::now()))
    {
        Ok(r) => r,
        Err(e) => {
            // Best effort: the host should see why this sequence failed even
            // though we also exit with the configuration error code.
            let mut run = RunRecord::new("unknown", Operation::NoOperation);
            run.add_substatus(format!("{e}"));
            run.seal(RunStatus::Failed);
            if let Err(we) =
                status::write_status_once(&paths.status_dir, sequence, &run, &BTreeMap::new())
            {
                tracing::error!("cannot write failure status: {we:#}");
            }
            return Err(e.into());
        }
    };

    let cancel = Cancellation::new();
    deadline::spawn_signal_listener(&cancel)?;

    match request.operation {
        Operation::NoOperation => no_operation(paths, &request, &cancel).await,
        Operation::ConfigurePatching => configure_patching(paths, &state, &request),
        Operation::Assessment | Operation::Installation => {
            run_patch_operation(paths, request, cancel).await
        }
    }
}

/// A completed prior run left a reboot marker: post its terminal status
/// with the reboot recorded as completed, then forget it.
pub(crate) fn finalize_reboot_marker(paths: &Paths, state: &Dir) -> Result<()> {
    let Some(marker) = reboot::load_marker(state)? else {
        return Ok(());
    };
    let mut run = marker.run_snapshot;
    run.reboot_status = RebootStatus::Completed;
    status::write_status_once(&paths.status_dir, marker.sequence, &run, &BTreeMap::new())
        .context("Finalizing pre-reboot run")?;
    reboot::clear_marker(state)?;
    tracing::info!(
        "finalized run {} (sequence {}) after reboot",
        run.activity_id,
        marker.sequence
    );
    Ok(())
}

/// `NoOperation`: wait for any in-flight orchestrator to settle (our
/// sequence's presence already asked it to stop through its config
/// watcher), then report success.
async fn no_operation(paths: &Paths, request: &Request, cancel: &Cancellation) -> Result<()> {
    let _lock = InstanceLock::acquire(&paths.state_dir, cancel.token(), LOCK_WAIT).await?;
    let mut run = RunRecord::new(&request.activity_id, Operation::NoOperation);
    run.seal(RunStatus::Succeeded);
    status::write_status_once(&paths.status_dir, request.sequence, &run, &request.extra)?;
    Ok(())
}

/// `ConfigurePatching`: persist the automation modes for the external
/// assessment timer and report success.
fn configure_patching(paths: &Paths, state: &Dir, request: &Request) -> Result<()> {
    let cfg = AutomationConfig {
        patch_mode: request.patch_mode,
        assessment_mode: request.assessment_mode,
        maximum_assessment_interval: request.maximum_assessment_interval.clone(),
    };
    settings::persist_automation(state, &cfg)?;
    let mut run = RunRecord::new(&request.activity_id, Operation::ConfigurePatching);
    run.seal(RunStatus::Succeeded);
    status::write_status_once(&paths.status_dir, request.sequence, &run, &request.extra)?;
    Ok(())
}

async fn run_patch_operation(paths: &Paths, request: Request, cancel: Cancellation) -> Result<()> {
    let distro = match distro::detect() {
        Ok(d) => d,
        Err(e) => {
            let mut run = RunRecord::new(&request.activity_id, request.operation);
            run.add_substatus(format!("{e}"));
            run.seal(RunStatus::Failed);
            let _ =
                status::write_status_once(&paths.status_dir, request.sequence, &run, &request.extra);
            return Err(e.into());
        }
    };
    let adapter = pkgmgr::adapter_for(&distro);
    run_with_adapter(paths, request, cancel, &adapter).await
}

/// Everything after ingest, for a resolved adapter: watcher, lock, execute,
/// and the actual reboot when one was decided.
pub(crate) async fn run_with_adapter<A: PackageManager>(
    paths: &Paths,
    request: Request,
    cancel: Cancellation,
    adapter: &A,
) -> Result<()> {
    deadline::spawn_config_watcher(
        &cancel,
        paths.config_dir.clone(),
        paths.state_dir.clone(),
        request.sequence,
        request.activity_id.clone(),
    );
    let lock = InstanceLock::acquire(&paths.state_dir, cancel.token(), LOCK_WAIT).await?;
    let state = reboot::open_state_dir(&paths.state_dir)?;
    let budget = request
        .maximum_duration
        .unwrap_or(settings::ASSESSMENT_DURATION);
    let deadline_ctl = DeadlineController::new(budget);

    let reboot_now = execute(paths, &request, &cancel, adapter, &state, deadline_ctl).await;
    drop(lock);

    if reboot_now {
        // A fresh token: the armed deadline must not kill the reboot command.
        let fresh = CancellationToken::new();
        if let Err(e) = reboot::initiate(&fresh).await {
            tracing::error!("reboot failed: {e:#}");
            if let Some(marker) = reboot::load_marker(&state)? {
                let mut run = marker.run_snapshot;
                run.reboot_status = RebootStatus::Failed;
                run.add_substatus(format!("reboot failed: {e:#}"));
                let _ = status::write_status_once(
                    &paths.status_dir,
                    marker.sequence,
                    &run,
                    &request.extra,
                );
            }
            reboot::clear_marker(&state)?;
        }
    }
    Ok(())
}

/// Run the operation to a terminal status document. Returns true when a
/// reboot was decided, its marker persisted, and the status flushed.
pub(crate) async fn execute<A: PackageManager>(
    paths: &Paths,
    request: &Request,
    cancel: &Cancellation,
    adapter: &A,
    state: &Dir,
    deadline_ctl: DeadlineController,
) -> bool {
    tracing::info!(
        "activity {} ({:?}, scheduled {}) via the {} adapter",
        request.activity_id,
        request.operation,
        request.start_time,
        adapter.name()
    );
    let cmd_token = cancel.token().child_token();
    deadline_ctl.arm(cmd_token.clone());
    let (writer, writer_handle) =
        status::spawn(paths.status_dir.clone(), request.sequence, request.extra.clone());
    let reboot_now = {
        let mut orch = Orchestrator {
            adapter,
            writer: &writer,
            cancel,
            cmd_token,
            deadline: deadline_ctl,
            run: RunRecord::new(&request.activity_id, request.operation),
            request,
            reboot_hint: false,
        };
        match request.operation {
            Operation::Assessment => {
                orch.run_assessment().await;
                false
            }
            _ => orch.run_installation(state).await,
        }
    };
    drop(writer);
    let _ = writer_handle.await;
    reboot_now
}

/// Why the Execute phase ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interruption {
    None,
    Deadline,
    Cancelled,
    Fatal,
}

/// Terminal status per the partial-failure policy.
fn terminal_status(patches: &[PatchRecord], interruption: Interruption) -> RunStatus {
    let installed = patches
        .iter()
        .filter(|p| p.install_state == InstallState::Installed)
        .count();
    let failed = patches
        .iter()
        .filter(|p| p.install_state == InstallState::Failed)
        .count();
    let excluded_dep = patches
        .iter()
        .filter(|p| {
            p.install_state == InstallState::Excluded
                && p.error_message
                    .as_deref()
                    .is_some_and(|m| m.starts_with("excluded-dep"))
        })
        .count();
    match interruption {
        Interruption::Cancelled => RunStatus::Aborted,
        Interruption::Fatal => RunStatus::Failed,
        Interruption::Deadline => {
            if installed > 0 {
                RunStatus::CompletedWithErrors
            } else {
                RunStatus::Failed
            }
        }
        Interruption::None => {
            if failed > 0 {
                if installed > 0 {
                    RunStatus::CompletedWithErrors
                } else {
                    RunStatus::Failed
                }
            } else if excluded_dep > 0 && installed > 0 {
                RunStatus::CompletedWithErrors
            } else {
                RunStatus::Succeeded
            }
        }
    }
}

struct Orchestrator<'a, A> {
    adapter: &'a A,
    writer: &'a StatusWriter,
    cancel: &'a Cancellation,
    cmd_token: CancellationToken,
    deadline: DeadlineController,
    run: RunRecord,
    request: &'a Request,
    reboot_hint: bool,
}

impl<A: PackageManager> Orchestrator<'_, A> {
    /// List available updates and resolve Unknown classifications through
    /// the adapter's advisory data.
    async fn fetch_candidates(&mut self) -> Result<Vec<pkgmgr::AvailableUpdate>, PkgError> {
        let mut candidates = self.adapter.list_available_updates(&self.cmd_token).await?;
        let unknown: Vec<String> = candidates
            .iter()
            .filter(|c| c.classification == Classification::Unknown)
            .map(|c| c.name.clone())
            .collect();
        if !unknown.is_empty() {
            match self.adapter.classify(&self.cmd_token, &unknown).await {
                Ok(map) => {
                    for c in &mut candidates {
                        if let Some(cl) = map.get(&c.name) {
                            c.classification = *cl;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!("classification unavailable: {e}");
                    self.run
                        .add_substatus(format!("classification unavailable: {e}"));
                }
            }
        }
        Ok(candidates)
    }

    async fn fail(&mut self, why: String) {
        self.run.add_substatus(why);
        self.run.seal(RunStatus::Failed);
        self.writer.send_terminal(&self.run).await;
    }

    async fn run_assessment(&mut self) {
        self.writer.send_progress(&self.run);
        let candidates = match self.fetch_candidates().await {
            Ok(c) => c,
            Err(e) => return self.fail(format!("{e}")).await,
        };
        let mut records: Vec<PatchRecord> = candidates
            .iter()
            .map(|c| {
                let mut r =
                    PatchRecord::new(c.name.clone(), c.version.clone(), c.classification);
                r.selected_state = SelectedState::NotSelected;
                r.set_install_state(InstallState::NotStarted);
                r
            })
            .collect();
        filter::sort_records(&mut records);
        self.run.patches = records;
        let status = if self.cancel.is_cancelled() {
            RunStatus::Aborted
        } else {
            RunStatus::Succeeded
        };
        self.run.seal(status);
        self.writer.send_terminal(&self.run).await;
    }

    /// Plan and execute an installation; returns true when a reboot is due.
    async fn run_installation(&mut self, state: &Dir) -> bool {
        self.writer.send_progress(&self.run);
        let candidates = match self.fetch_candidates().await {
            Ok(c) => c,
            Err(e) => {
                self.fail(format!("{e}")).await;
                return false;
            }
        };
        // Patterns were validated at ingest; a failure here is a bug, but
        // degrade to a failed run rather than panic.
        let (includes, excludes) = match (
            PatchPatterns::compile(&self.request.patches_to_include),
            PatchPatterns::compile(&self.request.patches_to_exclude),
        ) {
            (Ok(i), Ok(e)) => (i, e),
            (Err(e), _) | (_, Err(e)) => {
                self.fail(format!("pattern compilation: {e:#}")).await;
                return false;
            }
        };
        let filters = SelectionFilters {
            classifications: &self.request.classifications_to_include,
            includes: &includes,
            excludes: &excludes,
        };
        let mut records = filter::select(&candidates, &filters);
        // The installation table carries what we act on: selections and
        // exclusions. Non-matching candidates stay out of the document.
        records.retain(|r| r.selected_state != SelectedState::NotSelected);
        self.run.patches = records;
        self.writer.send_progress(&self.run);

        let candidate_info: BTreeMap<String, (String, Classification)> = candidates
            .iter()
            .map(|c| (c.name.clone(), (c.version.clone(), c.classification)))
            .collect();

        let mut interruption = Interruption::None;

        // Plan: expand the dependency closure one transaction at a time so
        // an excluded dependency is attributable to its requester.
        let selected: Vec<(String, String)> = self
            .run
            .patches
            .iter()
            .filter(|p| p.selected_state == SelectedState::Selected)
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();
        for (name, version) in selected {
            if self.cancel.is_cancelled() {
                interruption = Interruption::Cancelled;
                break;
            }
            if self.deadline.checkpoint() != Checkpoint::Continue {
                interruption = Interruption::Deadline;
                break;
            }
            let sim = match self
                .adapter
                .simulate_install(&self.cmd_token, std::slice::from_ref(&name))
                .await
            {
                Ok(sim) => sim,
                Err(PkgError::Fatal(m)) => {
                    self.run.add_substatus(format!("simulation: {m}"));
                    interruption = Interruption::Fatal;
                    break;
                }
                Err(e) => {
                    // Keep the patch; the real install will tell the truth.
                    self.run
                        .add_substatus(format!("simulation for {name} failed: {e}"));
                    continue;
                }
            };
            tracing::debug!(
                "simulated {name}: {} acknowledged, {} dependencies",
                sim.requested.len(),
                sim.additional_dependencies.len()
            );
            if !sim.conflicts.is_empty() {
                self.run.add_substatus(format!(
                    "{name}: transaction would remove {}",
                    sim.conflicts.join(", ")
                ));
            }
            match filter::closure_verdict(&sim, &excludes) {
                ClosureVerdict::Proceed { dependencies } => {
                    for dep in dependencies {
                        if self.run.patches.iter().any(|p| p.name == dep) {
                            continue;
                        }
                        let (dep_version, dep_classification) = candidate_info
                            .get(&dep)
                            .cloned()
                            .unwrap_or((String::new(), Classification::Unknown));
                        let mut r = PatchRecord::new(dep, dep_version, dep_classification);
                        r.selected_state = SelectedState::Selected;
                        self.run.patches.push(r);
                    }
                }
                ClosureVerdict::ExcludedDep { dependency } => {
                    if let Some(p) = self.run.patch_mut(&name, &version) {
                        p.mark_excluded(format!(
                            "excluded-dep: transaction requires excluded package {dependency}"
                        ));
                    }
                    if !self.run.patches.iter().any(|p| p.name == dependency) {
                        let (dep_version, dep_classification) = candidate_info
                            .get(&dependency)
                            .cloned()
                            .unwrap_or((String::new(), Classification::Unknown));
                        let mut r =
                            PatchRecord::new(dependency, dep_version, dep_classification);
                        r.mark_excluded("excluded-dep: matches an exclude pattern");
                        self.run.patches.push(r);
                    }
                }
            }
            self.writer.send_progress(&self.run);
        }
        filter::sort_records(&mut self.run.patches);
        self.writer.send_progress(&self.run);

        // Execute: one patch at a time, so every row is attributable.
        if interruption == Interruption::None {
            let queue: Vec<(String, String)> = self
                .run
                .patches
                .iter()
                .filter(|p| {
                    p.selected_state == SelectedState::Selected
                        && p.install_state == InstallState::Pending
                })
                .map(|p| (p.name.clone(), p.version.clone()))
                .collect();
            for (name, version) in queue {
                if self.cancel.is_cancelled() {
                    interruption = Interruption::Cancelled;
                    break;
                }
                match self.deadline.checkpoint() {
                    Checkpoint::Continue => {}
                    Checkpoint::StopWithPartial | Checkpoint::StopNow => {
                        interruption = Interruption::Deadline;
                        break;
                    }
                }
                if let Some(p) = self.run.patch_mut(&name, &version) {
                    p.set_install_state(InstallState::Installing);
                }
                self.writer.send_progress(&self.run);

                let started = tokio::time::Instant::now();
                let result = self
                    .adapter
                    .install_one(
                        &self.cmd_token,
                        &name,
                        (!version.is_empty()).then_some(version.as_str()),
                    )
                    .await;
                self.deadline.record_install(started.elapsed());

                let mut fatal = false;
                if let Ok(o) = &result {
                    if o.reboot_required == Some(true) {
                        self.reboot_hint = true;
                    }
                }
                if let Some(p) = self.run.patch_mut(&name, &version) {
                    match &result {
                        Ok(o) if o.succeeded => p.set_install_state(InstallState::Installed),
                        Ok(o) => p.mark_failed(o.error_summary()),
                        Err(PkgError::Fatal(m)) => {
                            p.mark_failed(m.clone());
                            fatal = true;
                        }
                        Err(e) => p.mark_failed(e.to_string()),
                    }
                }
                self.writer.send_progress(&self.run);
                if fatal {
                    interruption = Interruption::Fatal;
                    break;
                }
            }
        }

        // Exactly one terminal row per patch in the table (never attempted
        // means NotStarted).
        for p in &mut self.run.patches {
            if p.selected_state == SelectedState::Selected
                && matches!(p.install_state, InstallState::Pending | InstallState::Installing)
            {
                p.set_install_state(InstallState::NotStarted);
            }
        }

        if interruption == Interruption::None {
            self.verify_installed().await;
        }
        if interruption == Interruption::Cancelled {
            if let Some(reason) = self.cancel.reason() {
                self.run.add_substatus(format!("cancelled: {reason:?}"));
            }
        }

        let status = terminal_status(&self.run.patches, interruption);

        if interruption == Interruption::None {
            let required = self.reboot_hint
                || self
                    .adapter
                    .reboot_required(&self.cmd_token)
                    .await
                    .unwrap_or(false);
            match reboot::plan(self.request.reboot_setting, required) {
                RebootDecision::None => {}
                RebootDecision::MarkRequired => {
                    self.run.reboot_status = RebootStatus::Required;
                }
                RebootDecision::Reboot => {
                    self.run.seal(status);
                    self.run.reboot_status = RebootStatus::Started;
                    let marker = RebootMarker {
                        activity_id: self.run.activity_id.clone(),
                        sequence: self.request.sequence,
                        run_snapshot: self.run.clone(),
                    };
                    match reboot::write_marker(state, &marker) {
                        Ok(()) => {
                            self.writer.send_terminal(&self.run).await;
                            return true;
                        }
                        Err(e) => {
                            // No marker means no way to finalize after the
                            // reboot; do not reboot.
                            self.run.reboot_status = RebootStatus::Failed;
                            self.run
                                .add_substatus(format!("cannot persist reboot marker: {e:#}"));
                        }
                    }
                }
            }
        }

        self.run.seal(status);
        self.writer.send_terminal(&self.run).await;
        false
    }

    /// Double-check Installed rows against the package database; mismatches
    /// are surfaced as substatus notes, not failures.
    async fn verify_installed(&mut self) {
        let expected: Vec<String> = self
            .run
            .patches
            .iter()
            .filter(|p| p.install_state == InstallState::Installed)
            .map(|p| p.name.clone())
            .collect();
        if expected.is_empty() {
            return;
        }
        match self.adapter.list_installed(&self.cmd_token).await {
            Ok(installed) => {
                let present: BTreeMap<&str, &str> = installed
                    .iter()
                    .map(|p| (p.name.as_str(), p.version.as_str()))
                    .collect();
                for name in expected {
                    match present.get(name.as_str()) {
                        Some(version) => tracing::debug!("{name} present at {version}"),
                        None => {
                            tracing::warn!("{name} reported installed but absent from the database");
                            self.run.add_substatus(format!(
                                "{name} reported installed but absent from the package database"
                            ));
                        }
                    }
                }
            }
            Err(e) => tracing::debug!("post-install verification skipped: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::CancelReason;
    use crate::model::{AssessmentMode, PatchMode, RebootSetting};
    use crate::pkgmgr::{AvailableUpdate, InstallOutcome, InstalledPackage, SimulatedInstall};
    use crate::status::{PatchPayload, StatusEnvelope};
    use camino::Utf8PathBuf;
    use std::cell::RefCell;
    use std::collections::BTreeSet;

    #[derive(Default)]
    struct Scripted {
        updates: Vec<AvailableUpdate>,
        simulations: BTreeMap<String, SimulatedInstall>,
        fail_installs: BTreeSet<String>,
        install_delay: Duration,
        reboot_needed: bool,
        installs: RefCell<Vec<String>>,
    }

    impl Scripted {
        fn update(name: &str, version: &str, c: Classification) -> AvailableUpdate {
            AvailableUpdate {
                name: name.into(),
                version: version.into(),
                classification: c,
            }
        }
    }

    impl PackageManager for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn list_available_updates(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Vec<AvailableUpdate>, PkgError> {
            Ok(self.updates.clone())
        }

        async fn list_installed(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<Vec<InstalledPackage>, PkgError> {
            Ok(self
                .installs
                .borrow()
                .iter()
                .map(|n| InstalledPackage {
                    name: n.clone(),
                    version: "0".into(),
                })
                .collect())
        }

        async fn classify(
            &self,
            _cancel: &CancellationToken,
            _names: &[String],
        ) -> Result<BTreeMap<String, Classification>, PkgError> {
            Ok(BTreeMap::new())
        }

        async fn simulate_install(
            &self,
            _cancel: &CancellationToken,
            names: &[String],
        ) -> Result<SimulatedInstall, PkgError> {
            let name = &names[0];
            Ok(self.simulations.get(name).cloned().unwrap_or(SimulatedInstall {
                requested: names.to_vec(),
                additional_dependencies: Vec::new(),
                conflicts: Vec::new(),
            }))
        }

        async fn install_one(
            &self,
            _cancel: &CancellationToken,
            name: &str,
            _version: Option<&str>,
        ) -> Result<InstallOutcome, PkgError> {
            if !self.install_delay.is_zero() {
                tokio::time::sleep(self.install_delay).await;
            }
            if self.fail_installs.contains(name) {
                return Ok(InstallOutcome {
                    succeeded: false,
                    exit_code: 1,
                    reboot_required: None,
                    stdout: String::new(),
                    stderr: format!("nothing provides {name}"),
                });
            }
            self.installs.borrow_mut().push(name.to_string());
            Ok(InstallOutcome {
                succeeded: true,
                exit_code: 0,
                reboot_required: None,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn reboot_required(
            &self,
            _cancel: &CancellationToken,
        ) -> Result<bool, PkgError> {
            Ok(self.reboot_needed)
        }
    }

    struct TestEnv {
        _td: tempfile::TempDir,
        paths: Paths,
    }

    fn test_env() -> TestEnv {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let paths = Paths {
            log_dir: root.join("log"),
            config_dir: root.join("config"),
            status_dir: root.join("status"),
            state_dir: root.join("state"),
        };
        for d in [&paths.log_dir, &paths.config_dir, &paths.status_dir, &paths.state_dir] {
            std::fs::create_dir_all(d).unwrap();
        }
        TestEnv { _td: td, paths }
    }

    fn request(operation: Operation) -> Request {
        Request {
            sequence: 3,
            operation,
            activity_id: "a1".into(),
            start_time: Utc::now(),
            maximum_duration: Some(Duration::from_secs(1800)),
            reboot_setting: RebootSetting::IfRequired,
            classifications_to_include: Vec::new(),
            patches_to_include: Vec::new(),
            patches_to_exclude: Vec::new(),
            patch_mode: None,
            assessment_mode: None,
            maximum_assessment_interval: None,
            extra: BTreeMap::new(),
        }
    }

    fn read_payload(paths: &Paths, sequence: u64) -> PatchPayload {
        let content =
            std::fs::read(paths.status_dir.join(format!("{sequence}.status"))).unwrap();
        let envelopes: Vec<StatusEnvelope> = serde_json::from_slice(&content).unwrap();
        serde_json::from_str(&envelopes[0].status.formatted_message.message).unwrap()
    }

    async fn run(
        env: &TestEnv,
        request: &Request,
        adapter: &Scripted,
        cancel: &Cancellation,
        ctl: DeadlineController,
    ) -> bool {
        let state = reboot::open_state_dir(&env.paths.state_dir).unwrap();
        execute(&env.paths, request, cancel, adapter, &state, ctl).await
    }

    fn quick_ctl() -> DeadlineController {
        DeadlineController::with_tuning(
            Duration::from_secs(600),
            Duration::from_millis(1),
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_assessment_reports_classified_rows() {
        let env = test_env();
        let adapter = Scripted {
            updates: vec![
                Scripted::update("openssl", "1.1.1k", Classification::Security),
                Scripted::update("vim", "8.2", Classification::Other),
            ],
            ..Default::default()
        };
        let req = request(Operation::Assessment);
        let cancel = Cancellation::new();
        let rebooting = run(&env, &req, &adapter, &cancel, quick_ctl()).await;
        assert!(!rebooting);

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Succeeded);
        assert_eq!(payload.patches.len(), 2);
        // Security sorts before Other
        assert_eq!(payload.patches[0].name, "openssl");
        assert_eq!(payload.patches[0].classification, Classification::Security);
        assert_eq!(payload.patches[1].classification, Classification::Other);
        // Assessment never installs
        assert!(adapter.installs.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_installation_includes_dependency_closure() {
        let env = test_env();
        let mut simulations = BTreeMap::new();
        simulations.insert(
            "selinux-policy".to_string(),
            SimulatedInstall {
                requested: vec!["selinux-policy".into()],
                additional_dependencies: vec!["selinux-policy-targeted".into()],
                conflicts: vec![],
            },
        );
        let adapter = Scripted {
            updates: vec![
                Scripted::update("selinux-policy", "3.14.3-108", Classification::Security),
                Scripted::update("unrelated", "1.0", Classification::Other),
            ],
            simulations,
            ..Default::default()
        };
        let mut req = request(Operation::Installation);
        req.classifications_to_include =
            vec![Classification::Critical, Classification::Security];
        req.patches_to_include = vec!["selinux-*".into()];
        let cancel = Cancellation::new();
        run(&env, &req, &adapter, &cancel, quick_ctl()).await;

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Succeeded);
        let installed: Vec<&str> = payload
            .patches
            .iter()
            .filter(|p| p.install_state == InstallState::Installed)
            .map(|p| p.name.as_str())
            .collect();
        assert!(installed.contains(&"selinux-policy"));
        assert!(installed.contains(&"selinux-policy-targeted"));
        // The unrelated candidate was filtered out of the table entirely
        assert!(!payload.patches.iter().any(|p| p.name == "unrelated"));
    }

    #[tokio::test]
    async fn test_excluded_dependency_blocks_transaction() {
        let env = test_env();
        let mut simulations = BTreeMap::new();
        simulations.insert(
            "kernel-modules".to_string(),
            SimulatedInstall {
                requested: vec!["kernel-modules".into()],
                additional_dependencies: vec!["kernel-core".into()],
                conflicts: vec![],
            },
        );
        let adapter = Scripted {
            updates: vec![
                Scripted::update("kernel-modules", "4.18.0-425", Classification::Security),
                Scripted::update("kernel-core", "4.18.0-425", Classification::Security),
            ],
            simulations,
            ..Default::default()
        };
        let mut req = request(Operation::Installation);
        req.patches_to_include = vec!["kernel*".into()];
        req.patches_to_exclude = vec!["kernel-core".into()];
        let cancel = Cancellation::new();
        run(&env, &req, &adapter, &cancel, quick_ctl()).await;

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Succeeded);
        assert!(adapter.installs.borrow().is_empty());
        for name in ["kernel-modules", "kernel-core"] {
            let p = payload.patches.iter().find(|p| p.name == name).unwrap();
            assert_eq!(p.install_state, InstallState::Excluded, "{name}");
            assert_eq!(p.selected_state, SelectedState::Excluded, "{name}");
        }
        let modules = payload
            .patches
            .iter()
            .find(|p| p.name == "kernel-modules")
            .unwrap();
        assert!(modules
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("excluded-dep"));
    }

    #[tokio::test]
    async fn test_deadline_leaves_remainder_not_started() {
        let env = test_env();
        let updates = (0..10)
            .map(|i| Scripted::update(&format!("pkg-{i:02}"), "1.0", Classification::Other))
            .collect();
        let adapter = Scripted {
            updates,
            install_delay: Duration::from_millis(400),
            ..Default::default()
        };
        let req = request(Operation::Installation);
        let cancel = Cancellation::new();
        let ctl = DeadlineController::with_tuning(
            Duration::from_secs(2),
            Duration::from_millis(10),
            Duration::from_millis(200),
        );
        run(&env, &req, &adapter, &cancel, ctl).await;

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::CompletedWithErrors);
        let installed = payload
            .patches
            .iter()
            .filter(|p| p.install_state == InstallState::Installed)
            .count();
        let not_started = payload
            .patches
            .iter()
            .filter(|p| p.install_state == InstallState::NotStarted)
            .count();
        assert!(installed >= 1, "expected some installs, got {installed}");
        assert!(not_started >= 1, "expected a remainder, got {not_started}");
        assert_eq!(installed + not_started, 10);
        assert_eq!(payload.reboot_status, RebootStatus::NotStarted);
    }

    #[tokio::test]
    async fn test_reboot_always_writes_marker_and_finalizes() {
        let env = test_env();
        let adapter = Scripted {
            updates: vec![Scripted::update("openssl", "1.1.1k", Classification::Security)],
            reboot_needed: false,
            ..Default::default()
        };
        let mut req = request(Operation::Installation);
        req.reboot_setting = RebootSetting::Always;
        let cancel = Cancellation::new();
        let rebooting = run(&env, &req, &adapter, &cancel, quick_ctl()).await;
        assert!(rebooting, "Always must reboot even without a system signal");

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Succeeded);
        assert_eq!(payload.reboot_status, RebootStatus::Started);

        let state = reboot::open_state_dir(&env.paths.state_dir).unwrap();
        assert!(reboot::load_marker(&state).unwrap().is_some());

        // Simulate the next invocation after the reboot
        finalize_reboot_marker(&env.paths, &state).unwrap();
        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Succeeded);
        assert_eq!(payload.reboot_status, RebootStatus::Completed);
        assert!(reboot::load_marker(&state).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_at_patch_boundary() {
        let env = test_env();
        let updates = (0..5)
            .map(|i| Scripted::update(&format!("pkg-{i}"), "1.0", Classification::Other))
            .collect();
        let adapter = Scripted {
            updates,
            install_delay: Duration::from_millis(200),
            ..Default::default()
        };
        let mut req = request(Operation::Installation);
        req.reboot_setting = RebootSetting::Always;
        let cancel = Cancellation::new();

        let canceller = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel(CancelReason::NoOperation);
        };
        let (rebooting, ()) = tokio::join!(
            run(&env, &req, &adapter, &cancel, quick_ctl()),
            canceller
        );
        // Cancelled runs never reboot, even with Always
        assert!(!rebooting);

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Aborted);
        let installed = payload
            .patches
            .iter()
            .filter(|p| p.install_state == InstallState::Installed)
            .count();
        let not_started = payload
            .patches
            .iter()
            .filter(|p| p.install_state == InstallState::NotStarted)
            .count();
        assert!(installed >= 1);
        assert!(not_started >= 1);
        // No patch left in a non-terminal state
        assert!(payload.patches.iter().all(|p| p.is_terminal()));
    }

    #[tokio::test]
    async fn test_per_patch_failure_continues_loop() {
        let env = test_env();
        let adapter = Scripted {
            updates: vec![
                Scripted::update("alpha", "1.0", Classification::Other),
                Scripted::update("broken", "1.0", Classification::Other),
                Scripted::update("gamma", "1.0", Classification::Other),
            ],
            fail_installs: BTreeSet::from(["broken".to_string()]),
            ..Default::default()
        };
        let req = request(Operation::Installation);
        let cancel = Cancellation::new();
        run(&env, &req, &adapter, &cancel, quick_ctl()).await;

        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::CompletedWithErrors);
        let by_name = |n: &str| payload.patches.iter().find(|p| p.name == n).unwrap();
        assert_eq!(by_name("alpha").install_state, InstallState::Installed);
        assert_eq!(by_name("broken").install_state, InstallState::Failed);
        assert_eq!(by_name("gamma").install_state, InstallState::Installed);
        assert_eq!(payload.errors.len(), 1);
        assert!(payload.errors[0].message.contains("broken"));
    }

    #[tokio::test]
    async fn test_no_operation_emits_succeeded() {
        let env = test_env();
        let mut req = request(Operation::NoOperation);
        req.sequence = 9;
        let cancel = Cancellation::new();
        no_operation(&env.paths, &req, &cancel).await.unwrap();
        let payload = read_payload(&env.paths, 9);
        assert_eq!(payload.status, RunStatus::Succeeded);
        assert_eq!(payload.operation, Operation::NoOperation);
        assert!(payload.patches.is_empty());
    }

    #[tokio::test]
    async fn test_configure_patching_persists_modes() {
        let env = test_env();
        let state = reboot::open_state_dir(&env.paths.state_dir).unwrap();
        let mut req = request(Operation::ConfigurePatching);
        req.patch_mode = Some(PatchMode::AutomaticByPlatform);
        req.assessment_mode = Some(AssessmentMode::AutomaticByPlatform);
        req.maximum_assessment_interval = Some("PT6H".into());
        configure_patching(&env.paths, &state, &req).unwrap();

        let cfg: AutomationConfig = serde_json::from_str(
            &state.read_to_string(settings::AUTOMATION_FILE).unwrap(),
        )
        .unwrap();
        assert_eq!(cfg.patch_mode, Some(PatchMode::AutomaticByPlatform));
        assert_eq!(cfg.maximum_assessment_interval.as_deref(), Some("PT6H"));
        let payload = read_payload(&env.paths, 3);
        assert_eq!(payload.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_instance_lock_is_exclusive() {
        let env = test_env();
        let first = InstanceLock::try_acquire(&env.paths.state_dir).unwrap();
        assert!(first.is_some());
        // flock is per-open-file; a second open in the same process still
        // conflicts because each acquire opens its own descriptor.
        let second = InstanceLock::try_acquire(&env.paths.state_dir).unwrap();
        assert!(second.is_none());
        drop(first);
        let third = InstanceLock::try_acquire(&env.paths.state_dir).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn test_terminal_status_table() {
        fn patch(state: InstallState, msg: Option<&str>) -> PatchRecord {
            let mut p = PatchRecord::new("p", "1", Classification::Other);
            p.install_state = state;
            p.error_message = msg.map(Into::into);
            p
        }
        use InstallState::*;
        use Interruption as I;
        // All installed
        assert_eq!(
            terminal_status(&[patch(Installed, None)], I::None),
            RunStatus::Succeeded
        );
        // Empty selection
        assert_eq!(terminal_status(&[], I::None), RunStatus::Succeeded);
        // Mixed success and failure
        assert_eq!(
            terminal_status(&[patch(Installed, None), patch(Failed, Some("x"))], I::None),
            RunStatus::CompletedWithErrors
        );
        // Only failures
        assert_eq!(
            terminal_status(&[patch(Failed, Some("x"))], I::None),
            RunStatus::Failed
        );
        // Exclusions alone still succeed
        assert_eq!(
            terminal_status(&[patch(Excluded, Some("excluded-dep: x"))], I::None),
            RunStatus::Succeeded
        );
        // Exclusions next to successes degrade to warnings
        assert_eq!(
            terminal_status(
                &[patch(Installed, None), patch(Excluded, Some("excluded-dep: x"))],
                I::None
            ),
            RunStatus::CompletedWithErrors
        );
        // Cancellation wins over everything
        assert_eq!(
            terminal_status(&[patch(Installed, None)], I::Cancelled),
            RunStatus::Aborted
        );
        // Fatal aborts as failed even with prior successes
        assert_eq!(
            terminal_status(&[patch(Installed, None)], I::Fatal),
            RunStatus::Failed
        );
        // Deadline: partial progress is a warning, none is a failure
        assert_eq!(
            terminal_status(&[patch(Installed, None), patch(NotStarted, None)], I::Deadline),
            RunStatus::CompletedWithErrors
        );
        assert_eq!(
            terminal_status(&[patch(NotStarted, None)], I::Deadline),
            RunStatus::Failed
        );
    }
}
