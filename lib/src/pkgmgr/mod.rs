//! Package-manager adapters.
//!
//! One adapter per family (apt, yum, dnf, zypper); each implements the same
//! capability set and owns its output parser. Adapters return structured
//! outcomes instead of raising: a nonzero exit scoped to the requested
//! packages is data, not an error. Only an unusable tool surfaces as
//! [`PkgError::Fatal`].

pub(crate) mod apt;
pub(crate) mod dnf;
pub(crate) mod yum;
pub(crate) mod zypper;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::distro::{Distro, PkgFamily};
use crate::model::Classification;
use crate::task::{CommandOutput, Task};

/// An update available for installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AvailableUpdate {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) classification: Classification,
}

/// An installed package from the tool's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstalledPackage {
    pub(crate) name: String,
    pub(crate) version: String,
}

/// What a dry-run install reports for a requested set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct SimulatedInstall {
    /// Names the tool acknowledged from the request.
    pub(crate) requested: Vec<String>,
    /// Extra packages the transaction would pull in.
    pub(crate) additional_dependencies: Vec<String>,
    /// Packages the transaction would remove.
    pub(crate) conflicts: Vec<String>,
}

/// Structured outcome of a single-package install attempt.
#[derive(Debug, Clone)]
pub(crate) struct InstallOutcome {
    /// Adapter's verdict; some tools use nonzero codes for success-with-info.
    pub(crate) succeeded: bool,
    pub(crate) exit_code: i32,
    /// Immediate reboot signal when the tool reports one (e.g. zypper 102).
    pub(crate) reboot_required: Option<bool>,
    pub(crate) stdout: String,
    pub(crate) stderr: String,
}

impl InstallOutcome {
    /// A short failure summary suitable for a patch row.
    pub(crate) fn error_summary(&self) -> String {
        let last = self
            .stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .or_else(|| {
                self.stdout
                    .lines()
                    .rev()
                    .map(str::trim)
                    .find(|l| !l.is_empty())
            });
        match last {
            Some(line) => format!("exit {}: {line}", self.exit_code),
            None => format!("exit {}", self.exit_code),
        }
    }
}

/// Failure classes for adapter operations.
#[derive(Debug, thiserror::Error)]
pub(crate) enum PkgError {
    /// Retries were exhausted on a temporary condition (usually a lock).
    #[error("package manager busy: {0}")]
    Transient(String),
    /// The invocation failed in a way scoped to the requested packages.
    #[error("package manager failed: {0}")]
    Failed(String),
    /// The package manager itself is unusable; the run must abort.
    #[error("package manager unusable: {0}")]
    Fatal(String),
}

/// The capability contract every family implements.
pub(crate) trait PackageManager {
    /// Family name for diagnostics.
    fn name(&self) -> &'static str;

    /// Enumerate updates available for installation. Classification may be
    /// `Unknown` here when the listing itself does not carry it; the
    /// orchestrator resolves those through [`Self::classify`].
    async fn list_available_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError>;

    /// Enumerate installed packages.
    async fn list_installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstalledPackage>, PkgError>;

    /// Resolve classifications for the given package names. Names the
    /// advisory data does not cover are absent from the result.
    async fn classify(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<BTreeMap<String, Classification>, PkgError>;

    /// Dry-run an install to discover the dependency closure.
    async fn simulate_install(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<SimulatedInstall, PkgError>;

    /// Install a single package, best effort.
    async fn install_one(
        &self,
        cancel: &CancellationToken,
        name: &str,
        version: Option<&str>,
    ) -> Result<InstallOutcome, PkgError>;

    /// Whether the system signals that a reboot is needed.
    async fn reboot_required(&self, cancel: &CancellationToken) -> Result<bool, PkgError>;
}

/// The adapter for the detected distribution.
#[derive(Debug)]
pub(crate) enum SystemAdapter {
    Apt(apt::Apt),
    Yum(yum::Yum),
    Dnf(dnf::Dnf),
    Zypper(zypper::Zypper),
}

/// Select the adapter matching a detected distribution.
pub(crate) fn adapter_for(distro: &Distro) -> SystemAdapter {
    match distro.family {
        PkgFamily::Apt => SystemAdapter::Apt(apt::Apt),
        PkgFamily::Yum => SystemAdapter::Yum(yum::Yum),
        PkgFamily::Dnf => SystemAdapter::Dnf(dnf::Dnf),
        PkgFamily::Zypper => SystemAdapter::Zypper(zypper::Zypper),
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            SystemAdapter::Apt($inner) => $body,
            SystemAdapter::Yum($inner) => $body,
            SystemAdapter::Dnf($inner) => $body,
            SystemAdapter::Zypper($inner) => $body,
        }
    };
}

impl PackageManager for SystemAdapter {
    fn name(&self) -> &'static str {
        delegate!(self, a => a.name())
    }

    async fn list_available_updates(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<AvailableUpdate>, PkgError> {
        delegate!(self, a => a.list_available_updates(cancel).await)
    }

    async fn list_installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstalledPackage>, PkgError> {
        delegate!(self, a => a.list_installed(cancel).await)
    }

    async fn classify(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<BTreeMap<String, Classification>, PkgError> {
        delegate!(self, a => a.classify(cancel, names).await)
    }

    async fn simulate_install(
        &self,
        cancel: &CancellationToken,
        names: &[String],
    ) -> Result<SimulatedInstall, PkgError> {
        delegate!(self, a => a.simulate_install(cancel, names).await)
    }

    async fn install_one(
        &self,
        cancel: &CancellationToken,
        name: &str,
        version: Option<&str>,
    ) -> Result<InstallOutcome, PkgError> {
        delegate!(self, a => a.install_one(cancel, name, version).await)
    }

    async fn reboot_required(&self, cancel: &CancellationToken) -> Result<bool, PkgError> {
        delegate!(self, a => a.reboot_required(cancel).await)
    }
}

/// Maximum attempts for a transiently-failing invocation.
const MAX_ATTEMPTS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_secs(2);

/// Run a command, retrying with exponential backoff while `transient`
/// classifies the outcome as temporary (lock contention and friends).
/// A spawn failure (missing binary) is fatal.
pub(crate) async fn run_with_retry(
    mk: impl Fn() -> Task,
    cancel: &CancellationToken,
    transient: impl Fn(&CommandOutput) -> Option<String>,
) -> Result<CommandOutput, PkgError> {
    let mut last = String::new();
    for attempt in 0..MAX_ATTEMPTS {
        let out = mk()
            .run(cancel)
            .await
            .map_err(|e| PkgError::Fatal(format!("{e:#}")))?;
        if out.killed {
            // The watchdog ended it; cancellation or deadline, not ours to retry.
            return Ok(out);
        }
        match transient(&out) {
            None => return Ok(out),
            Some(reason) => {
                let delay = BASE_DELAY * 2u32.saturating_pow(attempt);
                tracing::debug!("transient (attempt {attempt}): {reason}; retrying in {delay:?}");
                last = reason;
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(PkgError::Transient(last)),
                }
            }
        }
    }
    Err(PkgError::Transient(last))
}

/// Architectures we strip from `name.arch` and NEVRA strings.
const RPM_ARCHES: &[&str] = &[
    "x86_64", "i686", "i586", "aarch64", "armv7hl", "ppc64le", "s390x", "riscv64", "noarch",
];

/// Split `name.arch` into the bare name, tolerating names containing dots.
pub(crate) fn strip_arch(s: &str) -> &str {
    if let Some((name, arch)) = s.rsplit_once('.') {
        if RPM_ARCHES.contains(&arch) {
            return name;
        }
    }
    s
}

/// Split a full NEVRA (`name-[epoch:]version-release[.arch]`) into
/// `(name, version-release)`. The version starts at the first
/// hyphen-separated segment that begins with a digit or an epoch.
pub(crate) fn split_nevra(s: &str) -> Option<(String, String)> {
    let s = strip_arch(s);
    let segments: Vec<&str> = s.split('-').collect();
    if segments.len() < 2 {
        return None;
    }
    let version_start = segments.iter().skip(1).position(|seg| {
        let seg = seg.split_once(':').map(|(_, v)| v).unwrap_or(seg);
        seg.chars().next().is_some_and(|c| c.is_ascii_digit())
    })? + 1;
    let name = segments[..version_start].join("-");
    let version = segments[version_start..].join("-");
    Some((name, version))
}

/// Parse `check-update` output shared by yum and dnf: three columns
/// `name.arch version repo`, tolerating the wrapped form where a long
/// package name pushes the remaining columns onto the following line.
pub(crate) fn parse_check_update(stdout: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut pending_name: Option<String> = None;
    for line in stdout.lines() {
        let line_trimmed = line.trim_end();
        if line_trimmed.is_empty() {
            pending_name = None;
            continue;
        }
        // The obsoleting section trails the update list and is not ours.
        if line_trimmed.starts_with("Obsoleting Packages") {
            break;
        }
        // Informational chatter is not column data.
        if line_trimmed.starts_with("Last metadata expiration")
            || line_trimmed.starts_with("Loaded plugins")
            || line_trimmed.starts_with("Security:")
        {
            continue;
        }
        let fields: Vec<&str> = line_trimmed.split_whitespace().collect();
        match (pending_name.take(), fields.as_slice()) {
            // Continuation line carrying version and repo for a stashed name
            (Some(name), [version, _repo]) => {
                out.push((name, (*version).to_string()));
            }
            (None, [name_arch, version, _repo]) => {
                out.push((strip_arch(name_arch).to_string(), (*version).to_string()));
            }
            // A lone overlong name.arch; columns follow on the next line
            (None, [name_arch]) if name_arch.contains('.') => {
                pending_name = Some(strip_arch(name_arch).to_string());
            }
            // Anything else is not column data; the take() above already
            // discarded a stashed name.
            _ => {}
        }
    }
    out
}

/// Map an `updateinfo list` advisory type to a classification.
pub(crate) fn classify_advisory(advisory_type: &str) -> Classification {
    let t = advisory_type.to_ascii_lowercase();
    if t.starts_with("critical/sec") {
        Classification::Critical
    } else if t.contains("/sec") || t == "security" {
        Classification::Security
    } else if t == "bugfix" || t == "enhancement" || t == "newpackage" {
        Classification::Other
    } else {
        Classification::Unknown
    }
}

/// Parse `updateinfo list` output into a name -> classification map.
/// Lines look like `RHSA-2021:1234 Critical/Sec. openssl-1.1.1k-1.el8.x86_64`.
pub(crate) fn parse_updateinfo_list(stdout: &str) -> BTreeMap<String, Classification> {
    let mut map: BTreeMap<String, Classification> = BTreeMap::new();
    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [_advisory, advisory_type, nevra] = fields.as_slice() else {
            continue;
        };
        let Some((name, _version)) = split_nevra(nevra) else {
            continue;
        };
        let c = classify_advisory(advisory_type);
        // A package can appear under several advisories; keep the most severe.
        let keep_existing = map.get(&name).is_some_and(|existing| *existing <= c);
        if !keep_existing {
            map.insert(name, c);
        }
    }
    map
}

/// Parse the transaction summary table printed by yum/dnf in dry runs:
/// sections like `Installing:` / `Installing dependencies:` followed by
/// indented `name arch version repo size` rows.
pub(crate) fn parse_transaction_table(stdout: &str) -> SimulatedInstall {
    #[derive(PartialEq, Clone, Copy)]
    enum Section {
        None,
        Install,
        Dependencies,
        Remove,
    }
    let mut section = Section::None;
    let mut installing = Vec::new();
    let mut dependencies = Vec::new();
    let mut removing = Vec::new();
    let mut pending_name: Option<String> = None;
    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.chars().all(|c| c == '=') {
            pending_name = None;
            continue;
        }
        if !line.starts_with(' ') {
            section = match trimmed.trim_end_matches(':') {
                "Installing" | "Upgrading" | "Updating" | "Reinstalling" | "Downgrading" => {
                    Section::Install
                }
                "Installing dependencies" | "Installing for dependencies"
                | "Upgrading for dependencies" => Section::Dependencies,
                "Removing" | "Removing dependent packages" => Section::Remove,
                _ => Section::None,
            };
            pending_name = None;
            continue;
        }
        if section == Section::None {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let name = match (pending_name.take(), fields.as_slice()) {
            // A wrapped row: the name alone on its own line
            (None, [only]) => {
                pending_name = Some((*only).to_string());
                continue;
            }
            (Some(name), _) => name,
            (None, [name, ..]) => (*name).to_string(),
            (None, []) => continue,
        };
        match section {
            Section::Install => installing.push(name),
            Section::Dependencies => dependencies.push(name),
            Section::Remove => removing.push(name),
            Section::None => {}
        }
    }
    SimulatedInstall {
        requested: installing,
        additional_dependencies: dependencies,
        conflicts: removing,
    }
}

/// An epoch prefix (`1:`) is not accepted by install commands; strip it.
pub(crate) fn strip_epoch(version: &str) -> &str {
    match version.split_once(':') {
        Some((epoch, rest)) if epoch.chars().all(|c| c.is_ascii_digit()) => rest,
        _ => version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn test_split_nevra() {
        let cases = [
            ("openssl-1.1.1k-1.el8.x86_64", ("openssl", "1.1.1k-1.el8")),
            (
                "selinux-policy-targeted-3.14.3-108.el8.noarch",
                ("selinux-policy-targeted", "3.14.3-108.el8"),
            ),
            ("kernel-core-4.18.0-425.el8.x86_64", ("kernel-core", "4.18.0-425.el8")),
            ("python3-pip-1:21.2.3-6.el9.noarch", ("python3-pip", "1:21.2.3-6.el9")),
        ];
        for (input, (name, version)) in cases {
            let (n, v) = split_nevra(input).unwrap();
            assert_eq!((n.as_str(), v.as_str()), (name, version), "{input}");
        }
        assert_eq!(split_nevra("justaname"), None);
    }

    #[test]
    fn test_strip_arch_tolerates_dotted_names() {
        assert_eq!(strip_arch("openssl.x86_64"), "openssl");
        assert_eq!(strip_arch("java-1.8.0-openjdk.x86_64"), "java-1.8.0-openjdk");
        assert_eq!(strip_arch("libstdc++.noarch"), "libstdc++");
        // A dot that is part of the name, not an arch
        assert_eq!(strip_arch("python3.11"), "python3.11");
    }

    #[test]
    fn test_parse_check_update_plain_and_wrapped() {
        let stdout = indoc! {"
            Last metadata expiration check: 0:14:27 ago on Mon Jan  1 00:00:00 2024.

            openssl.x86_64                  1:1.1.1k-5.el8_5              baseos
            selinux-policy.noarch           3.14.3-108.el8                baseos
            some-package-with-a-very-long-unwieldy-name.noarch
                                            2.0.1-4.el8                   appstream
            обнови-me.noarch                1.0-1.el8                     appstream

            Obsoleting Packages
            grub2-tools.x86_64              1:2.02-123.el8                baseos
        "};
        let r = parse_check_update(stdout);
        similar_asserts::assert_eq!(
            r,
            vec![
                ("openssl".to_string(), "1:1.1.1k-5.el8_5".to_string()),
                ("selinux-policy".to_string(), "3.14.3-108.el8".to_string()),
                (
                    "some-package-with-a-very-long-unwieldy-name".to_string(),
                    "2.0.1-4.el8".to_string()
                ),
                ("обнови-me".to_string(), "1.0-1.el8".to_string()),
            ]
        );
    }

    #[test]
    fn test_classify_advisory() {
        assert_eq!(classify_advisory("Critical/Sec."), Classification::Critical);
        assert_eq!(classify_advisory("Important/Sec."), Classification::Security);
        assert_eq!(classify_advisory("Moderate/Sec."), Classification::Security);
        assert_eq!(classify_advisory("security"), Classification::Security);
        assert_eq!(classify_advisory("bugfix"), Classification::Other);
        assert_eq!(classify_advisory("enhancement"), Classification::Other);
        assert_eq!(classify_advisory("mystery"), Classification::Unknown);
    }

    #[test]
    fn test_parse_updateinfo_keeps_most_severe() {
        let stdout = indoc! {"
            RHSA-2021:1234 Critical/Sec.  openssl-1.1.1k-1.el8.x86_64
            RHSA-2021:9999 Moderate/Sec.  openssl-1.1.1k-1.el8.x86_64
            RHBA-2021:0001 bugfix         vim-enhanced-8.0.1763-16.el8.x86_64
        "};
        let map = parse_updateinfo_list(stdout);
        assert_eq!(map["openssl"], Classification::Critical);
        assert_eq!(map["vim-enhanced"], Classification::Other);
    }

    #[test]
    fn test_parse_transaction_table() {
        let stdout = indoc! {"
            Dependencies resolved.
            ================================================================================
             Package                    Arch     Version           Repository          Size
            ================================================================================
            Installing:
             selinux-policy             noarch   3.14.3-108.el8    baseos             630 k
            Installing dependencies:
             selinux-policy-targeted    noarch   3.14.3-108.el8    baseos              15 M
             a-package-with-an-extremely-long-name-that-wraps
                                        noarch   1.0-1.el8         appstream          1.0 M
            Removing:
             old-conflicting-pkg        x86_64   1.0-1.el8         @baseos            2.0 M

            Transaction Summary
            ================================================================================
            Operation aborted.
        "};
        let sim = parse_transaction_table(stdout);
        assert_eq!(sim.requested, ["selinux-policy"]);
        assert_eq!(
            sim.additional_dependencies,
            ["selinux-policy-targeted", "a-package-with-an-extremely-long-name-that-wraps"]
        );
        assert_eq!(sim.conflicts, ["old-conflicting-pkg"]);
    }

    #[test]
    fn test_strip_epoch() {
        assert_eq!(strip_epoch("1:1.1.1k-5.el8"), "1.1.1k-5.el8");
        assert_eq!(strip_epoch("2.0.1-4"), "2.0.1-4");
        // A colon later in the string is not an epoch
        assert_eq!(strip_epoch("v:oddball"), "v:oddball");
    }
}
