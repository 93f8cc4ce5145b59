//! Adapter for RHEL-family systems on dnf.
//!
//! Mostly the yum contract with different chatter: the lock message
//! changed, `needs-restarting` became a dnf subcommand, and long package
//! names wrap the check-update columns (handled by the shared parser).

use std::collections::BTreeMap;

use tokio_util::sync::CancellationToken;

use crate::model::Classification;
use crate::task::{CommandOutput, Task};

use super::{
    parse_check_update, parse_transaction_table, parse_updateinfo_list, run_with_retry,
    strip_epoch, AvailableUpdate, InstallOutcome, InstalledPackage, PackageManager, PkgError,
    SimulatedInstall,
};

/// The dnf adapter.
#[derive(Debug)]
pub(crate) struct Dnf;

const CHECK_UPDATE_AVAILABLE: i32 = 100;

fn transient(out: &CommandOutput) -> Option<String> {
    if out.exit_code == 0 {
        return None;
    }
    for text in [&out.stderr, &out.stdout] {
        for needle in [
            "Waiting for process with pid",
            "Another app is currently holding",
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
        for needle in ["rpmdb open failed", "database disk image is malformed"] {
            if text.contains(needle) {
                return Some(format!("rpm database unusable: {needle}"));
            }
        }
    }
    None
}

impl PackageManager for Dnf {
    fn name(&self) -> &'static str {
        "dnf"
    }

    async fn list_available_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError> {
        let out = run_with_retry(
            || Task::new("dnf check-update", "dnf").args(["-q", "check-update"]),
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
                    classification: Classification::Unknown,
                })
                .collect()),
            code => Err(PkgError::Failed(format!(
                "dnf check-update exited {code}: {}",
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
            || {
                Task::new("dnf updateinfo", "dnf")
                    .args(["-q", "updateinfo", "list", "--updates"])
            },
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
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
            || Task::new("dnf simulate install", "dnf").args(args.iter().copied()),
            cancel,
            transient,
        )
        .await?;
        if let Some(reason) = fatal_reason(&out) {
            return Err(PkgError::Fatal(reason));
        }
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
            || Task::new(format!("dnf install {spec}"), "dnf").args(["-y", "install", &spec]),
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
        let r = Task::new("dnf needs-restarting", "dnf")
            .args(["needs-restarting", "-r"])
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
