//! Adapter for Debian-family systems (apt/apt-get/dpkg).
//!
//! Classification on apt derives from the source pocket: packages coming
//! from a `*-security` pocket are Security, everything else Other. There is
//! no advisory database to distinguish Critical.

use std::collections::BTreeMap;

use camino::Utf8Path;
use tokio_util::sync::CancellationToken;

use crate::model::Classification;
use crate::task::{CommandOutput, Task};

use super::{
    run_with_retry, AvailableUpdate, InstallOutcome, InstalledPackage, PackageManager, PkgError,
    SimulatedInstall,
};

/// Signal file dpkg maintainer scripts touch when a reboot is wanted.
const REBOOT_REQUIRED_FILE: &str = "/var/run/reboot-required";

/// The Debian-family adapter.
#[derive(Debug)]
pub(crate) struct Apt;

fn apt_task(description: &str, args: &[&str]) -> Task {
    Task::new(description, "apt-get")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .args(args.iter().copied())
}

/// Lock contention is routine while unattended-upgrades or another apt
/// runs; classify it for retry.
fn transient(out: &CommandOutput) -> Option<String> {
    if out.exit_code == 0 {
        return None;
    }
    let haystack = [&out.stderr, &out.stdout];
    for text in haystack {
        for needle in [
            "Could not get lock",
            "Unable to acquire the dpkg frontend lock",
            "Unable to lock the administration directory",
        ] {
            if text.contains(needle) {
                return Some(needle.to_string());
            }
        }
    }
    None
}

/// An interrupted dpkg database needs `dpkg --configure -a` by an operator;
/// nothing we install can succeed until then.
fn fatal_reason(out: &CommandOutput) -> Option<String> {
    for text in [&out.stderr, &out.stdout] {
        if text.contains("dpkg was interrupted") {
            return Some("dpkg was interrupted; manual `dpkg --configure -a` required".into());
        }
    }
    None
}

/// Parse `apt list --upgradable` lines of the form
/// `openssl/focal-security 1.1.1k-1ubuntu1 amd64 [upgradable from: ...]`.
pub(crate) fn parse_list_upgradable(stdout: &str) -> Vec<AvailableUpdate> {
    let mut out = Vec::new();
    for line in stdout.lines() {
        let Some((name, rest)) = line.split_once('/') else {
            continue;
        };
        if name.is_empty() || name.contains(' ') {
            continue;
        }
        let mut fields = rest.split_whitespace();
        let Some(pocket) = fields.next() else { continue };
        let Some(version) = fields.next() else { continue };
        let classification = if pocket.contains("security") {
            Classification::Security
        } else {
            Classification::Other
        };
        out.push(AvailableUpdate {
            name: name.to_string(),
            version: version.to_string(),
            classification,
        });
    }
    out
}

/// Parse `apt-get -s` simulation output: `Inst`/`Remv` action lines like
/// `Inst openssl [1.1.1f] (1.1.1k-1ubuntu1 Ubuntu:20.04/focal-security [amd64])`.
pub(crate) fn parse_simulation(stdout: &str, requested: &[String]) -> SimulatedInstall {
    let mut sim = SimulatedInstall::default();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("Inst") => {
                let Some(name) = fields.next() else { continue };
                if requested.iter().any(|r| r == name) {
                    sim.requested.push(name.to_string());
                } else {
                    sim.additional_dependencies.push(name.to_string());
                }
            }
            Some("Remv") => {
                if let Some(name) = fields.next() {
                    sim.conflicts.push(name.to_string());
                }
            }
            _ => {}
        }
    }
    sim
}

/// Parse `dpkg-query --show` output: `name<TAB>version` per line.
pub(crate) fn parse_dpkg_query(stdout: &str) -> Vec<InstalledPackage> {
    stdout
        .lines()
        .filter_map(|line| {
            let (name, version) = line.split_once('\t')?;
            let name = name.split_once(':').map(|(n, _arch)| n).unwrap_or(name);
            (!name.is_empty() && !version.is_empty()).then(|| InstalledPackage {
                name: name.to_string(),
                version: version.to_string(),
            })
        })
        .collect()
}

impl Apt {
    async fn upgradable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError> {
        let out = run_with_retry(
            || {
                Task::new("apt list --upgradable", "apt")
                    .env("DEBIAN_FRONTEND", "noninteractive")
                    .args(["list", "--upgradable"])
            },
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            return Err(PkgError::Failed(format!(
                "apt list --upgradable exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_list_upgradable(&out.stdout))
    }
}

impl PackageManager for Apt {
    fn name(&self) -> &'static str {
        "apt"
    }

    async fn list_available_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError> {
        self.upgradable(cancel).await
    }

    async fn list_installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstalledPackage>, PkgError> {
        let out = run_with_retry(
            || Task::new("dpkg-query --show", "dpkg-query").args(["--show"]),
            cancel,
            transient,
        )
        .await?;
        if !out.success() {
            return Err(PkgError::Failed(format!(
                "dpkg-query exited {}",
                out.exit_code
            )));
        }
        Ok(parse_dpkg_query(&out.stdout))
    }

    async fn classify(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<BTreeMap<String, Classification>, PkgError> {
        // The pocket is already in the upgradable listing; re-derive from it.
        let updates = self.upgradable(cancel).await?;
        Ok(updates
            .into_iter()
            .filter(|u| names.contains(&u.name))
            .map(|u| (u.name, u.classification))
            .collect())
    }

    async fn simulate_install(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<SimulatedInstall, PkgError> {
        let mut args = vec!["-s", "install", "--only-upgrade"];
        args.extend(names.iter().map(String::as_str));
        let out = run_with_retry(
            || apt_task("apt-get simulate install", &args),
            cancel,
            transient,
        )
        .await?;
        if let Some(reason) = fatal_reason(&out) {
            return Err(PkgError::Fatal(reason));
        }
        if !out.success() {
            return Err(PkgError::Failed(format!(
                "simulation exited {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(parse_simulation(&out.stdout, names))
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
        let args = [
            "-y",
            "--only-upgrade",
            "-o",
            "Dpkg::Options::=--force-confdef",
            "-o",
            "Dpkg::Options::=--force-confold",
            "install",
            spec.as_str(),
        ];
        let out = run_with_retry(
            || apt_task(&format!("apt-get install {spec}"), &args),
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

    async fn reboot_required(&self, _cancel: &CancellationToken) -> Result<bool, PkgError> {
        Ok(Utf8Path::new(REBOOT_REQUIRED_FILE).exists())
    }
}
