//! Distribution detection and package-manager family selection.

use std::collections::BTreeMap;

use camino::Utf8Path;

use crate::error::AgentError;

/// Package-manager families with a native adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PkgFamily {
    Apt,
    Yum,
    Dnf,
    Zypper,
}

impl PkgFamily {
    /// The native tool's binary name.
    pub(crate) fn tool(&self) -> &'static str {
        match self {
            PkgFamily::Apt => "apt-get",
            PkgFamily::Yum => "yum",
            PkgFamily::Dnf => "dnf",
            PkgFamily::Zypper => "zypper",
        }
    }
}

/// Identity of the detected distribution.
#[derive(Debug, Clone)]
pub(crate) struct Distro {
    /// `ID` from os-release (e.g. `ubuntu`).
    #[allow(dead_code)]
    pub(crate) id: String,
    /// `VERSION_ID` from os-release, empty when absent.
    #[allow(dead_code)]
    pub(crate) version_id: String,
    /// The adapter family serving this distribution.
    pub(crate) family: PkgFamily,
}

/// Parse os-release content into key/value pairs, stripping quotes.
fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    let mut r = BTreeMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let v = v.trim().trim_matches('"').trim_matches('\'');
        r.insert(k.trim().to_string(), v.to_string());
    }
    r
}

/// Pick the family for an os-release identity. `have_dnf` selects between
/// the yum and dnf adapters on Red Hat style systems.
fn family_for(id: &str, id_like: &str, have_dnf: bool) -> Option<PkgFamily> {
    let ids = std::iter::once(id).chain(id_like.split_whitespace());
    for candidate in ids {
        match candidate {
            "debian" | "ubuntu" => return Some(PkgFamily::Apt),
            "rhel" | "centos" | "fedora" | "ol" | "almalinux" | "rocky" | "amzn" | "mariner"
            | "azurelinux" => {
                return Some(if have_dnf { PkgFamily::Dnf } else { PkgFamily::Yum })
            }
            "sles" | "sled" | "opensuse" | "suse" | "opensuse-leap" => {
                return Some(PkgFamily::Zypper)
            }
            _ => {}
        }
    }
    None
}

fn have_binary(name: &str) -> bool {
    which::which(name).is_ok()
}

fn read_first(paths: &[&str]) -> Option<String> {
    paths
        .iter()
        .find_map(|p| std::fs::read_to_string(Utf8Path::new(p).as_std_path()).ok())
}

/// Detect the running distribution and select the adapter family.
pub(crate) fn detect() -> Result<Distro, AgentError> {
    if let Some(content) = read_first(&["/etc/os-release", "/usr/lib/os-release"]) {
        let kv = parse_os_release(&content);
        let id = kv.get("ID").cloned().unwrap_or_default();
        let id_like = kv.get("ID_LIKE").cloned().unwrap_or_default();
        let version_id = kv.get("VERSION_ID").cloned().unwrap_or_default();
        if let Some(family) = family_for(&id, &id_like, have_binary("dnf")) {
            tracing::info!("detected {id} {version_id}, using {}", family.tool());
            return Ok(Distro {
                id,
                version_id,
                family,
            });
        }
        return Err(AgentError::UnsupportedDistro(format!(
            "no package-manager adapter for ID={id} ID_LIKE={id_like}"
        )));
    }
    // Ancient images without os-release; go by release files.
    if Utf8Path::new("/etc/redhat-release").exists() {
        let family = if have_binary("dnf") {
            PkgFamily::Dnf
        } else {
            PkgFamily::Yum
        };
        return Ok(Distro {
            id: "redhat".into(),
            version_id: String::new(),
            family,
        });
    }
    if Utf8Path::new("/etc/SuSE-release").exists() {
        return Ok(Distro {
            id: "suse".into(),
            version_id: String::new(),
            family: PkgFamily::Zypper,
        });
    }
    Err(AgentError::UnsupportedDistro(
        "no os-release or recognized release file present".into(),
    ))
}
