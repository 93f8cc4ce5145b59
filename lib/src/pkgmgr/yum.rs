//! Adapter for RHEL-family systems still on classic yum.
//!
//! `check-update` exits 100 when updates exist; classification comes from
//! the separate `updateinfo` advisory listing and may be missing entirely
//! on repositories without updateinfo metadata.

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::model::Classification;
use crate::task::{CommandOutput, Task};

use super::{
    parse_check_update, parse_transaction_table, parse_updateinfo_list, run_with_retry,
    strip_epoch, AvailableUpdate, InstallOutcome, InstalledPackage, PackageManager, PkgError,
    SimulatedInstall,
};

/// The yum adapter.
#[derive(Debug)]
pub(crate) struct Yum;

/// `check-update` uses exit 100 to mean "updates are available".
const CHECK_UPDATE_AVAILABLE: i32 = 100;

fn transient(out: &CommandOutput) -> Option<String> {
    if out.exit_code == 0 {
        return None;
    }
    for text in [&out.stderr, &out.stdout] {
        for needle in [
            "Another app is currently holding the yum lock",
            "Existing lock /var/run/yum.pid",
        ] {
            if text.contains(needle) {
                return Some(needle.to_string());
            }
        }
    }
    None
}

fn fatal_reason(out: &CommandOutput) -> Option<String> {
    for text in [&out.stderr, &out.stdout] {
        for needle in ["rpmdb open failed", "cannot open Packages database"] {
            if text.contains(needle) {
                return Some(format!("rpm database unusable: {needle}"));
            }
        }
    }
    None
}

impl PackageManager for Yum {
    fn name(&self) -> &'static str {
        "yum"
    }

    async fn list_available_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError> {
        let out = run_with_retry(
            || Task::new("yum check-update", "yum").args(["-q", "check-update"]),
            cancel,
            transient,
        )
        .await?;
        if let Some(reason) = fatal_reason(&out) {
            return Err(PkgError::Fatal(reason));
        }
        match out.exit_code {
            0 => Ok(Vec::new()),
            CHECK_UPDATE_AVAILABLE => Ok(parse_check_update(&out.stdout)
                .into_iter()
                .map(|(name, version)| AvailableUpdate {
                    name,
                    version,
                    // Resolved later through updateinfo
                    classification: Classification::Unknown,
                })
                .collect()),
            code => Err(PkgError::Failed(format!(
                "yum check-update exited {code}: {}",
                out.stderr.trim()
            ))),
        }
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
            || Task::new("yum updateinfo", "yum").args(["-q", "updateinfo", "list", "updates"]),
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            // Repositories without updateinfo metadata; everything stays Unknown.
            tracing::debug!("updateinfo unavailable (exit {})", out.exit_code);
            return Ok(BTreeMap::new());
        }
        let mut map = parse_updateinfo_list(&out.stdout);
        map.retain(|name, _| names.contains(name));
        Ok(map)
    }

    async fn simulate_install(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<SimulatedInstall, PkgError> {
        let mut args = vec!["install", "--assumeno"];
        args.extend(names.iter().map(String::as_str));
        let out = run_with_retry(
            || Task::new("yum simulate install", "yum").args(args.iter().copied()),
            cancel,
            transient,
        )
        .await?;
        if let Some(reason) = fatal_reason(&out) {
            return Err(PkgError::Fatal(reason));
        }
        // --assumeno answers "no" at the confirmation prompt, so a resolved
        // transaction still exits nonzero with an "Operation aborted." footer.
        Ok(parse_transaction_table(&out.stdout))
    }

    async fn install_one(
        &self,
        cancel: &CancellationToken,
        name: &str,
        version: Option<&str>,
    ) -> Result<InstallOutcome, PkgError> {
        let spec = match version {
            Some(v) => format!("{name}-{}", strip_epoch(v)),
            None => name.to_string(),
        };
        let out = run_with_retry(
            || Task::new(format!("yum install {spec}"), "yum").args(["-y", "install", &spec]),
            cancel,
            transient,
        )
        .await?;
        if let Some(reason) = fatal_reason(&out) {
            return Err(PkgError::Fatal(reason));
        }
        Ok(InstallOutcome {
            succeeded: out.success(),
            exit_code: out.exit_code,
            reboot_required: None,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    async fn reboot_required(&self, cancel: &CancellationToken) -> Result<bool, PkgError> {
        // needs-restarting ships with yum-utils and may be absent; absence
        // just means "no signal".
        let r = Task::new("needs-restarting", "needs-restarting")
            .args(["-r"])
            .run(cancel)
            .await;
        match r {
            Ok(out) => Ok(out.exit_code == 1),
            Err(e) => {
                tracing::debug!("needs-restarting unavailable: {e:#}");
                Ok(false)
            }
        }
    }
}
