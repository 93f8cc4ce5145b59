//! Adapter for SUSE-family systems (zypper).
//!
//! zypper classifies *patches*, not packages; a patch carries a category
//! and severity and "conflicts" with the pre-fix versions of its member
//! packages. Classification therefore walks patch metadata and maps the
//! member packages back to a classification.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::model::Classification;
use crate::task::{CommandOutput, Task};

use super::{
    run_with_retry, strip_arch, AvailableUpdate, InstallOutcome, InstalledPackage,
    PackageManager, PkgError, SimulatedInstall,
};

/// The zypper adapter.
#[derive(Debug)]
pub(crate) struct Zypper;

/// ZYPPER_EXIT_INF_REBOOT_NEEDED
const EXIT_REBOOT_NEEDED: i32 = 102;
/// ZYPPER_EXIT_INF_RESTART_NEEDED (zypper itself, not the system)
const EXIT_RESTART_NEEDED: i32 = 103;
/// ZYPPER_EXIT_ZYPP_LOCKED
const EXIT_ZYPP_LOCKED: i32 = 7;

fn zypper_task(description: &str, args: &[&str]) -> Task {
    Task::new(description, "zypper")
        .args(std::iter::once("--non-interactive").chain(args.iter().copied()))
}

fn transient(out: &CommandOutput) -> Option<String> {
    (out.exit_code == EXIT_ZYPP_LOCKED).then(|| "system management is locked".to_string())
}

/// Parse the `list-updates` pipe table: `S | Repository | Name | Current
/// Version | Available Version | Arch`.
pub(crate) fn parse_list_updates(stdout: &str) -> Vec<AvailableUpdate> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        if line.starts_with("--") || !line.contains('|') {
            continue;
        }
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        if cols.len() < 6 || cols[2] == "Name" {
            continue;
        }
        let (name, available) = (cols[2], cols[4]);
        if name.is_empty() || available.is_empty() {
            continue;
        }
        out.push(AvailableUpdate {
            name: name.to_string(),
            version: available.to_string(),
            // Patch metadata resolves this later
            classification: Classification::Unknown,
        });
    }
    out
}

/// One row of `list-patches`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PatchListing {
    pub(crate) name: String,
    pub(crate) category: String,
    pub(crate) severity: String,
}

/// Parse the `list-patches` pipe table, keeping only patches still needed.
pub(crate) fn parse_list_patches(stdout: &str) -> Vec<PatchListing> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        if line.starts_with("--") || !line.contains('|') {
            continue;
        }
        let cols: Vec<&str> = line.split('|').map(str::trim).collect();
        if cols.len() < 6 || cols[1] == "Name" {
            continue;
        }
        let status = cols[5];
        if !status.starts_with("needed") {
            continue;
        }
        out.push(PatchListing {
            name: cols[1].to_string(),
            category: cols[2].to_string(),
            severity: cols[3].to_string(),
        });
    }
    out
}

/// Classification for a patch's category and severity.
pub(crate) fn classify_patch(category: &str, severity: &str) -> Classification {
    if category.eq_ignore_ascii_case("security") {
        if severity.eq_ignore_ascii_case("critical") {
            Classification::Critical
        } else {
            Classification::Security
        }
    } else {
        Classification::Other
    }
}

/// Parse `info -t patch` output into per-patch (classification, members).
///
/// Member packages come from the `Conflicts` block, which lists the
/// pre-fix versions as `name.arch < version`.
pub(crate) fn parse_patch_info(stdout: &str) -> Vec<(Classification, Vec<String>)> {
    let mut patches: Vec<(String, String, Vec<String>)> = Vec::new();
    let mut in_conflicts = false;
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Information for patch ") {
            patches.push((String::new(), String::new(), Vec::new()));
            in_conflicts = false;
            continue;
        }
        let Some(current) = patches.last_mut() else {
            continue;
        };
        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            match key {
                "Category" => {
                    current.0 = value.to_string();
                    in_conflicts = false;
                    continue;
                }
                "Severity" => {
                    current.1 = value.to_string();
                    in_conflicts = false;
                    continue;
                }
                _ => {}
            }
            if key.starts_with("Conflicts") {
                in_conflicts = true;
                continue;
            }
            // Any other `Key : value` header ends a conflicts block, but
            // member lines like `openssl.x86_64 < 1.1.1l` also contain a
            // colon-free shape, so only reset on known header style lines.
            if line.starts_with(|c: char| c.is_ascii_alphabetic()) && !in_conflicts {
                continue;
            }
        }
        if in_conflicts && line.starts_with(' ') && !trimmed.is_empty() {
            let Some(first) = trimmed.split_whitespace().next() else {
                continue;
            };
            current.2.push(strip_arch(first).to_string());
        } else if trimmed.is_empty() {
            in_conflicts = false;
        }
    }
    patches
        .into_iter()
        .map(|(category, severity, members)| (classify_patch(&category, &severity), members))
        .collect()
}

/// Parse `install --dry-run` prose: "The following N packages are going to
/// be installed/upgraded/REMOVED:" followed by indented name lines.
pub(crate) fn parse_dry_run(stdout: &str, requested: &[String]) -> SimulatedInstall {
    let mut sim = SimulatedInstall::default();
    #[derive(PartialEq, Clone, Copy)]
    enum Target {
        None,
        Install,
        Remove,
    }
    let mut target = Target::None;
    for line in stdout.lines() {
        if !line.starts_with(' ') {
            let lower = line.to_ascii_lowercase();
            target = if lower.contains("going to be installed")
                || lower.contains("going to be upgraded")
            {
                Target::Install
            } else if lower.contains("going to be removed") {
                Target::Remove
            } else {
                Target::None
            };
            continue;
        }
        if target == Target::None {
            continue;
        }
        for name in line.split_whitespace() {
            match target {
                Target::Install => {
                    if requested.iter().any(|r| r == name) {
                        sim.requested.push(name.to_string());
                    } else {
                        sim.additional_dependencies.push(name.to_string());
                    }
                }
                Target::Remove => sim.conflicts.push(name.to_string()),
                Target::None => {}
            }
        }
    }
    sim
}

impl PackageManager for Zypper {
    fn name(&self) -> &'static str {
        "zypper"
    }

    async fn list_available_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError> {
        let out = run_with_retry(
            || zypper_task("zypper list-updates", &["list-updates"]),
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            return Err(PkgError::Failed(format!(
                "zypper list-updates exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_list_updates(&out.stdout))
    }

    async fn list_installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstalledPackage>, PkgError> {
        let out = run_with_retry(
            || {
                Task::new("rpm query installed", "rpm")
                    .args(["-qa", "--queryformat", "%{NAME} %{VERSION}-%{RELEASE}\\n"])
            },
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            return Err(PkgError::Failed(format!("rpm -qa exited {}", out.exit_code)));
        }
        Ok(out
            .stdout
            .lines()
            .filter_map(|l| {
                let (name, version) = l.split_once(' ')?;
                Some(InstalledPackage {
                    name: name.to_string(),
                    version: version.to_string(),
                })
            })
            .collect())
    }

    async fn classify(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<BTreeMap<String, Classification>, PkgError> {
        let out = run_with_retry(
            || zypper_task("zypper list-patches", &["list-patches"]),
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            tracing::debug!("list-patches unavailable (exit {})", out.exit_code);
            return Ok(BTreeMap::new());
        }
        let patches = parse_list_patches(&out.stdout);
        if patches.is_empty() {
            return Ok(BTreeMap::new());
        }
        for p in &patches {
            tracing::debug!("needed patch {} ({}/{})", p.name, p.category, p.severity);
        }
        let mut args = vec!["info", "-t", "patch"];
        args.extend(patches.iter().map(|p| p.name.as_str()));
        let out = run_with_retry(
            || zypper_task("zypper patch info", &args),
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            tracing::debug!("patch info unavailable (exit {})", out.exit_code);
            return Ok(BTreeMap::new());
        }
        let mut map: BTreeMap<String, Classification> = BTreeMap::new();
        for (classification, members) in parse_patch_info(&out.stdout) {
            for member in members {
                if !names.contains(&member) {
                    continue;
                }
                let keep = map
                    .get(&member)
                    .is_some_and(|existing| *existing <= classification);
                if !keep {
                    map.insert(member, classification);
                }
            }
        }
        Ok(map)
    }

    async fn simulate_install(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<SimulatedInstall, PkgError> {
        let mut args = vec!["install", "--dry-run", "--auto-agree-with-licenses"];
        args.extend(names.iter().map(String::as_str));
        let out = run_with_retry(
            || zypper_task("zypper simulate install", &args),
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            return Err(PkgError::Failed(format!(
                "zypper dry-run exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_dry_run(&out.stdout, names))
    }

    async fn install_one(
        &self,
        cancel: &CancellationToken,
        name: &str,
        version: Option<&str>,
    ) -> Result<InstallOutcome, PkgError> {
        let spec = match version {
            Some(v) => format!("{name}={v}"),
            None => name.to_string(),
        };
        let args = ["install", "--auto-agree-with-licenses", spec.as_str()];
        let out = run_with_retry(
            || zypper_task(&format!("zypper install {spec}"), &args),
            cancel,
            transient,
        )
        .await?;
        let succeeded = matches!(out.exit_code, 0 | EXIT_REBOOT_NEEDED | EXIT_RESTART_NEEDED)
            && !out.killed;
        Ok(InstallOutcome {
            succeeded,
            exit_code: out.exit_code,
            reboot_required: (out.exit_code == EXIT_REBOOT_NEEDED).then_some(true),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn reboot_required(&self, cancel: &CancellationToken) -> Result<bool, PkgError> {
        let r = zypper_task("zypper needs-rebooting", &["needs-rebooting"])
            .run(cancel)
            .await;
        match r {
            Ok(out) => Ok(out.exit_code == EXIT_REBOOT_NEEDED),
            Err(e) => {
                tracing::debug!("needs-rebooting unavailable: {e:#}");
                Ok(false)
            }
        }
    }
}
