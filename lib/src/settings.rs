//! Ingest of `<sequence>.settings` goal states from the host agent.
//!
//! The host drops numbered settings files into the config directory; the
//! highest sequence number is the current goal state. Everything here is
//! validated once into an immutable [`Request`]; the rest of the agent
//! never re-reads the raw JSON.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::filter::PatchPatterns;
use crate::model::{AssessmentMode, Classification, Operation, PatchMode, RebootSetting};

/// Hard ceiling on an installation window.
pub(crate) const MAX_INSTALL_DURATION: Duration = Duration::from_secs(4 * 60 * 60);
/// Internal budget for assessment runs, which carry no duration of their own.
pub(crate) const ASSESSMENT_DURATION: Duration = Duration::from_secs(60 * 60);
/// Requests whose start time is older than this are considered stale.
const MAX_START_AGE_DAYS: i64 = 21;

/// Name of the automation-mode file consumed by the assessment timer.
pub(crate) const AUTOMATION_FILE: &str = "automation.json";

/// Raw mirror of one settings file. Unknown fields are preserved in
/// `extra` and echoed back in status for diagnosability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawSettings {
    pub(crate) operation: Operation,
    #[serde(default)]
    pub(crate) activity_id: Option<String>,
    #[serde(default)]
    pub(crate) start_time: Option<String>,
    #[serde(default)]
    pub(crate) maximum_duration: Option<String>,
    #[serde(default)]
    pub(crate) reboot_setting: Option<RebootSetting>,
    #[serde(default)]
    pub(crate) classifications_to_include: Vec<String>,
    #[serde(default)]
    pub(crate) patches_to_include: Vec<String>,
    #[serde(default)]
    pub(crate) patches_to_exclude: Vec<String>,
    #[serde(default)]
    pub(crate) patch_mode: Option<PatchMode>,
    #[serde(default)]
    pub(crate) assessment_mode: Option<AssessmentMode>,
    #[serde(default)]
    pub(crate) maximum_assessment_interval: Option<String>,
    #[serde(flatten)]
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

/// A validated, immutable request.
#[derive(Debug, Clone)]
pub(crate) struct Request {
    /// Sequence number of the settings file this came from.
    pub(crate) sequence: u64,
    pub(crate) operation: Operation,
    pub(crate) activity_id: String,
    pub(crate) start_time: DateTime<Utc>,
    /// Present for Installation; already clamped to the hard bounds.
    pub(crate) maximum_duration: Option<Duration>,
    /// Defaults to `IfRequired` outside Installation.
    pub(crate) reboot_setting: RebootSetting,
    /// Empty means all classifications.
    pub(crate) classifications_to_include: Vec<Classification>,
    pub(crate) patches_to_include: Vec<String>,
    pub(crate) patches_to_exclude: Vec<String>,
    pub(crate) patch_mode: Option<PatchMode>,
    pub(crate) assessment_mode: Option<AssessmentMode>,
    /// Validated for parseability but kept verbatim; the assessment timer
    /// consumes the original string.
    pub(crate) maximum_assessment_interval: Option<String>,
    /// Fields this version does not understand, round-tripped verbatim.
    pub(crate) extra: BTreeMap<String, serde_json::Value>,
}

/// Parse the ISO-8601 duration subset the host sends: `PnDTnHnMnS`, with
/// an optional fractional seconds part.
pub(crate) fn parse_iso8601_duration(s: &str) -> Result<Duration> {
    let rest = s
        .strip_prefix('P')
        .with_context(|| format!("duration {s:?} must start with 'P'"))?;
    let mut secs: f64 = 0.0;
    let mut in_time = false;
    let mut num = String::new();
    let mut matched_any = false;
    for c in rest.chars() {
        match c {
            'T' | 't' => {
                if in_time || !num.is_empty() {
                    anyhow::bail!("malformed duration {s:?}");
                }
                in_time = true;
            }
            '0'..='9' | '.' => num.push(c),
            unit => {
                let value: f64 = num
                    .parse()
                    .with_context(|| format!("bad number in duration {s:?}"))?;
                num.clear();
                matched_any = true;
                let factor = match (unit.to_ascii_uppercase(), in_time) {
                    ('D', false) => 86400.0,
                    ('H', true) => 3600.0,
                    ('M', true) => 60.0,
                    ('S', true) => 1.0,
                    _ => anyhow::bail!("unsupported unit {unit:?} in duration {s:?}"),
                };
                secs += value * factor;
            }
        }
    }
    if !num.is_empty() || !matched_any {
        anyhow::bail!("malformed duration {s:?}");
    }
    Ok(Duration::from_secs_f64(secs))
}

fn parse_classifications(values: &[String]) -> Result<Vec<Classification>> {
    let mut r = Vec::new();
    for v in values {
        let c = match v.as_str() {
            "Critical" => Classification::Critical,
            "Security" => Classification::Security,
            "Other" => Classification::Other,
            other => anyhow::bail!("unknown classification {other:?}"),
        };
        if !r.contains(&c) {
            r.push(c);
        }
    }
    let has_critical = r.contains(&Classification::Critical);
    let has_security = r.contains(&Classification::Security);
    if has_critical != has_security {
        anyhow::bail!("Critical and Security must be included together or not at all");
    }
    Ok(r)
}

/// Validate a raw settings payload into a [`Request`].
pub(crate) fn validate(
    raw: RawSettings,
    sequence: u64,
    now: DateTime<Utc>,
) -> Result<Request, AgentError> {
    let cfg = |e: anyhow::Error| AgentError::Configuration(format!("{e:#}"));

    let activity_id = raw
        .activity_id
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AgentError::Configuration("activityId is required".into()))?
        .to_string();
    let start_time = raw
        .start_time
        .as_deref()
        .ok_or_else(|| AgentError::Configuration("startTime is required".into()))
        .and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| AgentError::Configuration(format!("invalid startTime {s:?}: {e}")))
        })?;
    let age = now.signed_duration_since(start_time);
    if age.num_days() > MAX_START_AGE_DAYS {
        return Err(AgentError::Configuration(format!(
            "startTime {start_time} is {} days old; refusing stale request",
            age.num_days()
        )));
    }

    let classifications_to_include =
        parse_classifications(&raw.classifications_to_include).map_err(cfg)?;
    // Compile once here so a bad pattern fails ingest instead of surfacing
    // mid-run; the filter engine compiles again at use.
    let _ = PatchPatterns::compile(&raw.patches_to_include).map_err(cfg)?;
    let _ = PatchPatterns::compile(&raw.patches_to_exclude).map_err(cfg)?;

    let mut maximum_duration = None;
    let mut reboot_setting = RebootSetting::IfRequired;
    if raw.operation == Operation::Installation {
        let requested = raw
            .maximum_duration
            .as_deref()
            .ok_or_else(|| {
                AgentError::Configuration("maximumDuration is required for Installation".into())
            })
            .and_then(|s| parse_iso8601_duration(s).map_err(cfg))?;
        maximum_duration = Some(requested.min(MAX_INSTALL_DURATION));
        reboot_setting = raw.reboot_setting.ok_or_else(|| {
            AgentError::Configuration("rebootSetting is required for Installation".into())
        })?;
    }

    if let Some(interval) = raw.maximum_assessment_interval.as_deref() {
        let _ = parse_iso8601_duration(interval).map_err(cfg)?;
    }

    Ok(Request {
        sequence,
        operation: raw.operation,
        activity_id,
        start_time,
        maximum_duration,
        reboot_setting,
        classifications_to_include,
        patches_to_include: raw.patches_to_include,
        patches_to_exclude: raw.patches_to_exclude,
        patch_mode: raw.patch_mode,
        assessment_mode: raw.assessment_mode,
        maximum_assessment_interval: raw.maximum_assessment_interval,
        extra: raw.extra,
    })
}

/// Parse one settings file's content.
pub(crate) fn parse_settings(content: &str) -> Result<RawSettings, AgentError> {
    serde_json::from_str(content)
        .map_err(|e| AgentError::Configuration(format!("parsing settings: {e}")))
}

fn sequence_of(name: &str) -> Option<u64> {
    name.strip_suffix(".settings")?.parse().ok()
}

/// Find the highest-numbered settings file. Returns the sequence and the
/// file content.
pub(crate) fn newest_sequence(config_dir: &Dir) -> Result<Option<(u64, String)>> {
    let mut newest: Option<u64> = None;
    for ent in config_dir.entries().context("Reading config directory")? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = sequence_of(name) {
            newest = Some(newest.map_or(seq, |n| n.max(seq)));
        }
    }
    let Some(seq) = newest else { return Ok(None) };
    let content = config_dir
        .read_to_string(format!("{seq}.settings"))
        .with_context(|| format!("Reading sequence {seq}"))?;
    Ok(Some((seq, content)))
}

/// Look for a sequence newer than `current` that carries a `NoOperation`
/// for the same activity. Used by the config watcher to observe
/// cancellation requests.
pub(crate) fn newer_no_operation(
    config_dir: &Dir,
    current: u64,
    activity_id: &str,
) -> Result<Option<u64>> {
    let mut found: Option<u64> = None;
    for ent in config_dir.entries().context("Reading config directory")? {
        let ent = ent?;
        let name = ent.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(seq) = sequence_of(name) else { continue };
        if seq <= current {
            continue;
        }
        let content = match config_dir.read_to_string(name) {
            Ok(c) => c,
            // The host may still be writing the file; the next poll will see it.
            Err(e) => {
                tracing::debug!("skipping {name}: {e}");
                continue;
            }
        };
        let Ok(raw) = parse_settings(&content) else {
            continue;
        };
        if raw.operation == Operation::NoOperation
            && raw.activity_id.as_deref() == Some(activity_id)
        {
            found = Some(found.map_or(seq, |n| n.max(seq)));
        }
    }
    Ok(found)
}

/// Automation modes persisted for the external assessment timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AutomationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) patch_mode: Option<PatchMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) assessment_mode: Option<AssessmentMode>,
    /// Kept as the original ISO-8601 string; the timer parses it itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) maximum_assessment_interval: Option<String>,
}

/// Persist the automation config atomically (tmp + rename).
pub(crate) fn persist_automation(state_dir: &Dir, cfg: &AutomationConfig) -> Result<()> {
    let tmp = format!("{AUTOMATION_FILE}.tmp");
    let buf = serde_json::to_vec_pretty(cfg)?;
    state_dir.write(&tmp, &buf).context("Writing automation config")?;
    state_dir
        .rename(&tmp, state_dir, AUTOMATION_FILE)
        .context("Persisting automation config")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const INSTALL_SETTINGS: &str = indoc! {r#"
        {
          "operation": "Installation",
          "activityId": "a-42",
          "startTime": "2024-01-01T00:00:00Z",
          "maximumDuration": "PT30M",
          "rebootSetting": "IfRequired",
          "classificationsToInclude": ["Critical", "Security"],
          "patchesToInclude": ["selinux-*"],
          "patchesToExclude": [],
          "futureField": {"nested": true}
        }
    "#};

    fn now() -> DateTime<Utc> {
        "2024-01-02T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_duration_parsing() {
        let cases = [
            ("PT30M", 30 * 60),
            ("PT1H30M", 90 * 60),
            ("PT90S", 90),
            ("P1DT2H", 26 * 3600),
            ("P2D", 2 * 86400),
            ("PT4H", 4 * 3600),
        ];
        for (s, secs) in cases {
            assert_eq!(
                parse_iso8601_duration(s).unwrap(),
                Duration::from_secs(secs),
                "{s}"
            );
        }
        for bad in ["", "30M", "P", "PT", "PT1X", "P1H", "PTM"] {
            assert!(parse_iso8601_duration(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_validate_installation() {
        let raw = parse_settings(INSTALL_SETTINGS).unwrap();
        let req = validate(raw, 3, now()).unwrap();
        assert_eq!(req.sequence, 3);
        assert_eq!(req.operation, Operation::Installation);
        assert_eq!(req.maximum_duration, Some(Duration::from_secs(30 * 60)));
        assert_eq!(req.reboot_setting, RebootSetting::IfRequired);
        assert_eq!(
            req.classifications_to_include,
            vec![Classification::Critical, Classification::Security]
        );
        // Unknown fields survive ingest
        assert!(req.extra.contains_key("futureField"));
    }

    #[test]
    fn test_duration_clamped_to_ceiling() {
        let content = INSTALL_SETTINGS.replace("PT30M", "PT12H");
        let req = validate(parse_settings(&content).unwrap(), 0, now()).unwrap();
        assert_eq!(req.maximum_duration, Some(MAX_INSTALL_DURATION));
        // Short windows are honored as-is; the deadline controller deals
        // with budgets too small to do anything.
        let content = INSTALL_SETTINGS.replace("PT30M", "PT1M");
        let req = validate(parse_settings(&content).unwrap(), 0, now()).unwrap();
        assert_eq!(req.maximum_duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_validate_rejections() {
        // Security without Critical
        let content = INSTALL_SETTINGS.replace(r#"["Critical", "Security"]"#, r#"["Security"]"#);
        assert!(validate(parse_settings(&content).unwrap(), 0, now()).is_err());
        // Missing duration
        let content = INSTALL_SETTINGS.replace(r#""maximumDuration": "PT30M","#, "");
        assert!(validate(parse_settings(&content).unwrap(), 0, now()).is_err());
        // Missing reboot setting
        let content = INSTALL_SETTINGS.replace(r#""rebootSetting": "IfRequired","#, "");
        assert!(validate(parse_settings(&content).unwrap(), 0, now()).is_err());
        // Stale start time
        let raw = parse_settings(INSTALL_SETTINGS).unwrap();
        let stale_now = "2024-03-01T00:00:00Z".parse().unwrap();
        assert!(validate(raw, 0, stale_now).is_err());
        // Bad glob
        let content = INSTALL_SETTINGS.replace("selinux-*", "selinux-[");
        assert!(validate(parse_settings(&content).unwrap(), 0, now()).is_err());
    }

    #[test]
    fn test_future_start_time_accepted() {
        let raw = parse_settings(INSTALL_SETTINGS).unwrap();
        let early: DateTime<Utc> = "2023-12-25T00:00:00Z".parse().unwrap();
        assert!(validate(raw, 0, early).is_ok());
    }

    #[test]
    fn test_newest_sequence_and_noop_detection() -> Result<()> {
        let td = cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        assert!(newest_sequence(&td)?.is_none());
        td.write("0.settings", INSTALL_SETTINGS)?;
        td.write("2.settings", INSTALL_SETTINGS)?;
        td.write("10.settings", INSTALL_SETTINGS)?;
        td.write("garbage.txt", "ignored")?;
        let (seq, _) = newest_sequence(&td)?.unwrap();
        assert_eq!(seq, 10);

        assert_eq!(newer_no_operation(&td, 10, "a-42")?, None);
        td.write(
            "11.settings",
            r#"{"operation": "NoOperation", "activityId": "a-42", "startTime": "2024-01-01T00:00:00Z"}"#,
        )?;
        // Different activity id must not cancel us
        td.write(
            "12.settings",
            r#"{"operation": "NoOperation", "activityId": "other", "startTime": "2024-01-01T00:00:00Z"}"#,
        )?;
        assert_eq!(newer_no_operation(&td, 10, "a-42")?, Some(11));
        Ok(())
    }

    #[test]
    fn test_persist_automation_roundtrip() -> Result<()> {
        let td = cap_std_ext::cap_tempfile::TempDir::new(cap_std::ambient_authority())?;
        let cfg = AutomationConfig {
            patch_mode: Some(PatchMode::AutomaticByPlatform),
            assessment_mode: Some(AssessmentMode::ImageDefault),
            maximum_assessment_interval: Some("PT6H".into()),
        };
        persist_automation(&td, &cfg)?;
        let read: AutomationConfig = serde_json::from_str(&td.read_to_string(AUTOMATION_FILE)?)?;
        similar_asserts::assert_eq!(cfg, read);
        assert!(!td.try_exists(format!("{AUTOMATION_FILE}.tmp"))?);
        Ok(())
    }
}
