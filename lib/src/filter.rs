//! Patch selection: classification filter, wildcard include/exclude
//! patterns, and dependency-closure verdicts.
//!
//! Patterns use `*` and `?` and match either a bare package name
//! (case-insensitive) or `name=version` (the version part case-sensitive).
//! Exclude always wins over include.

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobMatcher};

use crate::model::{Classification, InstallState, PatchRecord, SelectedState};
use crate::pkgmgr::{AvailableUpdate, SimulatedInstall};

#[derive(Debug, Clone)]
struct PatternMatcher {
    /// The original pattern text, for messages.
    source: String,
    name: GlobMatcher,
    version: Option<GlobMatcher>,
}

/// A compiled set of include or exclude patterns.
#[derive(Debug, Clone, Default)]
pub(crate) struct PatchPatterns {
    matchers: Vec<PatternMatcher>,
}

impl PatchPatterns {
    /// Compile patterns; a malformed glob is an error naming the pattern.
    pub(crate) fn compile(patterns: &[String]) -> Result<Self> {
        let mut matchers = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let (name_part, version_part) = match pattern.split_once('=') {
                Some((n, v)) => (n, Some(v)),
                None => (pattern.as_str(), None),
            };
            let name = GlobBuilder::new(name_part)
                .case_insensitive(true)
                .build()
                .with_context(|| format!("invalid patch pattern {pattern:?}"))?
                .compile_matcher();
            let version = version_part
                .map(|v| {
                    GlobBuilder::new(v)
                        .build()
                        .with_context(|| format!("invalid patch pattern {pattern:?}"))
                        .map(|g| g.compile_matcher())
                })
                .transpose()?;
            matchers.push(PatternMatcher {
                source: pattern.clone(),
                name,
                version,
            });
        }
        Ok(Self { matchers })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// The first pattern matching `name` (or `name=version`), if any.
    pub(crate) fn matching_pattern(&self, name: &str, version: &str) -> Option<&str> {
        self.matchers
            .iter()
            .find(|m| {
                m.name.is_match(name)
                    && m.version.as_ref().is_none_or(|v| v.is_match(version))
            })
            .map(|m| m.source.as_str())
    }

    pub(crate) fn matches(&self, name: &str, version: &str) -> bool {
        self.matching_pattern(name, version).is_some()
    }
}

/// Filter inputs derived from a request.
#[derive(Debug)]
pub(crate) struct SelectionFilters<'a> {
    /// Empty means all classifications.
    pub(crate) classifications: &'a [Classification],
    pub(crate) includes: &'a PatchPatterns,
    pub(crate) excludes: &'a PatchPatterns,
}

impl SelectionFilters<'_> {
    /// Whether a classification passes the classification filter. `Unknown`
    /// passes when the filter is empty or admits `Other`.
    fn admits_classification(&self, c: Classification) -> bool {
        if self.classifications.is_empty() {
            return true;
        }
        match c {
            Classification::Unknown => self.classifications.contains(&Classification::Other),
            other => self.classifications.contains(&other),
        }
    }
}

/// Deterministic ordering: classification rank, then name (case-folded),
/// then version.
pub(crate) fn sort_records(records: &mut [PatchRecord]) {
    records.sort_by(|a, b| {
        (a.classification, a.name.to_lowercase(), &a.version).cmp(&(
            b.classification,
            b.name.to_lowercase(),
            &b.version,
        ))
    });
}

/// Apply the filters to the candidate set, producing one record per
/// candidate with selection and install states assigned. The returned
/// table is deterministically ordered.
pub(crate) fn select(
    candidates: &[AvailableUpdate],
    filters: &SelectionFilters<'_>,
) -> Vec<PatchRecord> {
    let mut records = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut record = PatchRecord::new(
            candidate.name.clone(),
            candidate.version.clone(),
            candidate.classification,
        );
        if let Some(pattern) =
            filters.excludes.matching_pattern(&candidate.name, &candidate.version)
        {
            record.mark_excluded(format!("excluded by pattern {pattern:?}"));
        } else if !filters.admits_classification(candidate.classification) {
            record.selected_state = SelectedState::NotSelected;
            record.set_install_state(InstallState::NotStarted);
        } else if !filters.includes.is_empty()
            && !filters.includes.matches(&candidate.name, &candidate.version)
        {
            record.selected_state = SelectedState::NotSelected;
            record.set_install_state(InstallState::NotStarted);
        } else {
            record.selected_state = SelectedState::Selected;
        }
        records.push(record);
    }
    sort_records(&mut records);
    records
}

/// Verdict for one selected patch after dependency simulation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClosureVerdict {
    /// Install, pulling in these additional dependencies.
    Proceed {
        /// Dependency names not part of the original selection.
        dependencies: Vec<String>,
    },
    /// A dependency matched an exclude pattern; the whole transaction
    /// involving it must not run.
    ExcludedDep {
        /// The offending dependency.
        dependency: String,
    },
}

/// Decide whether a simulated transaction may proceed given the exclude
/// patterns. Dependencies carry no version of their own in some tools'
/// dry-run output, so version-qualified excludes only match when the
/// simulation reported one.
pub(crate) fn closure_verdict(
    sim: &SimulatedInstall,
    excludes: &PatchPatterns,
) -> ClosureVerdict {
    for dep in &sim.additional_dependencies {
        if excludes.matches(dep, "") {
            return ClosureVerdict::ExcludedDep {
                dependency: dep.clone(),
            };
        }
    }
    ClosureVerdict::Proceed {
        dependencies: sim.additional_dependencies.clone(),
    }
}
