//! The host-observable status document.
//!
//! One JSON file per sequence number, replaced atomically so an external
//! reader always sees a complete snapshot. A dedicated writer task owns the
//! file; the orchestrator enqueues run snapshots over a bounded channel.
//! Progress updates are coalesced and may be dropped under pressure;
//! terminal updates are always written and acknowledged.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::cap_std;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::model::{InstallState, Operation, PatchRecord, RebootStatus, RunRecord, RunStatus};

/// Handler name reported in the envelope.
const HANDLER_NAME: &str = "guestpatch";
/// Envelope schema version.
const ENVELOPE_VERSION: &str = "1.0";
/// At most one non-terminal write per this interval.
const MIN_WRITE_INTERVAL: Duration = Duration::from_millis(500);
/// Queue capacity between the orchestrator and the writer.
const QUEUE_CAPACITY: usize = 64;
/// Upper bound on the serialized document; the host agent truncates
/// anything bigger, so we truncate the patch table ourselves and say so.
const MAX_STATUS_BYTES: usize = 120 * 1024;

/// Coarse host-contract status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum HostStatus {
    Transitioning,
    Success,
    Warning,
    Error,
}

fn host_status(run: RunStatus) -> HostStatus {
    match run {
        RunStatus::InProgress => HostStatus::Transitioning,
        RunStatus::Succeeded => HostStatus::Success,
        // An abort is an honored request, not a fault
        RunStatus::CompletedWithErrors | RunStatus::Aborted => HostStatus::Warning,
        RunStatus::Failed => HostStatus::Error,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FormattedMessage {
    pub(crate) lang: String,
    pub(crate) message: String,
}

impl FormattedMessage {
    fn new(message: String) -> Self {
        Self {
            lang: "en-US".into(),
            message,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubstatusEntry {
    pub(crate) name: String,
    pub(crate) status: HostStatus,
    pub(crate) code: i32,
    pub(crate) formatted_message: FormattedMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusBody {
    pub(crate) name: String,
    pub(crate) operation: Operation,
    pub(crate) status: HostStatus,
    pub(crate) code: i32,
    pub(crate) formatted_message: FormattedMessage,
    pub(crate) substatus: Vec<SubstatusEntry>,
}

/// The outer array element of `<n>.status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StatusEnvelope {
    pub(crate) version: String,
    #[serde(rename = "timestampUTC")]
    pub(crate) timestamp_utc: DateTime<Utc>,
    pub(crate) status: StatusBody,
}

/// A run-level error surfaced in the nested payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ErrorDetail {
    pub(crate) code: String,
    pub(crate) message: String,
}

/// The structured payload carried (as a JSON string) inside
/// `formattedMessage.message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PatchPayload {
    pub(crate) activity_id: String,
    pub(crate) operation: Operation,
    pub(crate) status: RunStatus,
    pub(crate) reboot_status: RebootStatus,
    pub(crate) started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) patches: Vec<PatchRecord>,
    pub(crate) errors: Vec<ErrorDetail>,
    pub(crate) code: i32,
    /// Request fields this version did not recognize, echoed back.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) unrecognized: BTreeMap<String, serde_json::Value>,
}

fn payload_for(run: &RunRecord, extra: &BTreeMap<String, serde_json::Value>) -> PatchPayload {
    let errors = run
        .patches
        .iter()
        .filter(|p| p.install_state == InstallState::Failed)
        .map(|p| ErrorDetail {
            code: "PackageManagerFailed".into(),
            message: format!(
                "{} {}: {}",
                p.name,
                p.version,
                p.error_message.as_deref().unwrap_or("failed")
            ),
        })
        .collect();
    PatchPayload {
        activity_id: run.activity_id.clone(),
        operation: run.operation,
        status: run.status,
        reboot_status: run.reboot_status,
        started_at: run.started_at,
        completed_at: run.completed_at,
        patches: run.patches.clone(),
        errors,
        code: if run.status == RunStatus::Failed { 1 } else { 0 },
        unrecognized: extra.clone(),
    }
}

/// Serialize the full document. When the patch table pushes the document
/// over the size cap, trailing rows are dropped and a substatus entry
/// records how many.
pub(crate) fn build_document(
    run: &RunRecord,
    extra: &BTreeMap<String, serde_json::Value>,
    degraded: bool,
) -> Result<Vec<u8>> {
    let mut payload = payload_for(run, extra);
    let mut dropped = 0usize;
    let mut doc = render(run, &payload, dropped, degraded)?;
    while doc.len() > MAX_STATUS_BYTES && !payload.patches.is_empty() {
        let keep = payload.patches.len() / 2;
        dropped += payload.patches.len() - keep;
        payload.patches.truncate(keep);
        doc = render(run, &payload, dropped, degraded)?;
    }
    Ok(doc)
}

fn render(
    run: &RunRecord,
    payload: &PatchPayload,
    dropped: usize,
    degraded: bool,
) -> Result<Vec<u8>> {
    let mut substatus: Vec<SubstatusEntry> = run
        .substatus
        .iter()
        .map(|msg| SubstatusEntry {
            name: "progress".into(),
            status: HostStatus::Transitioning,
            code: 0,
            formatted_message: FormattedMessage::new(msg.clone()),
        })
        .collect();
    if dropped > 0 {
        substatus.push(SubstatusEntry {
            name: "truncation".into(),
            status: HostStatus::Warning,
            code: 0,
            formatted_message: FormattedMessage::new(format!(
                "patch table truncated; {dropped} trailing rows dropped to fit the size cap"
            )),
        });
    }
    if degraded {
        substatus.push(SubstatusEntry {
            name: "statusWriter".into(),
            status: HostStatus::Warning,
            code: 0,
            formatted_message: FormattedMessage::new(
                "earlier status writes failed and were retried".into(),
            ),
        });
    }
    let body = StatusBody {
        name: HANDLER_NAME.into(),
        operation: run.operation,
        status: host_status(run.status),
        code: payload.code,
        formatted_message: FormattedMessage::new(serde_json::to_string(payload)?),
        substatus,
    };
    let envelope = StatusEnvelope {
        version: ENVELOPE_VERSION.into(),
        timestamp_utc: Utc::now(),
        status: body,
    };
    Ok(serde_json::to_vec(&[envelope])?)
}

fn persist(dir: &Dir, sequence: u64, doc: &[u8]) -> Result<()> {
    let tmp = format!("{sequence}.status.tmp");
    let fin = format!("{sequence}.status");
    dir.write(&tmp, doc).context("Writing status tmp file")?;
    dir.rename(&tmp, dir, &fin).context("Renaming status file")?;
    Ok(())
}

/// Write one status snapshot synchronously. Used on startup paths (reboot
/// marker finalization, configuration errors) where the writer task is not
/// running.
pub(crate) fn write_status_once(
    status_dir: &Utf8Path,
    sequence: u64,
    run: &RunRecord,
    extra: &BTreeMap<String, serde_json::Value>,
) -> Result<()> {
    let dir = Dir::open_ambient_dir(status_dir, cap_std::ambient_authority())
        .with_context(|| format!("Opening {status_dir}"))?;
    let doc = build_document(run, extra, false)?;
    persist(&dir, sequence, &doc)
}

#[derive(Debug)]
struct Update {
    run: RunRecord,
    terminal: bool,
    ack: Option<oneshot::Sender<()>>,
}

/// Handle for enqueueing status snapshots.
#[derive(Debug, Clone)]
pub(crate) struct StatusWriter {
    tx: mpsc::Sender<Update>,
}

impl StatusWriter {
    /// Non-blocking progress update; dropped when the queue is full.
    pub(crate) fn send_progress(&self, run: &RunRecord) {
        let update = Update {
            run: run.clone(),
            terminal: false,
            ack: None,
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = self.tx.try_send(update) {
            tracing::debug!("status queue full; dropping progress update");
        }
    }

    /// Terminal update: blocks until the document is on disk (or the writer
    /// has given up and logged).
    pub(crate) async fn send_terminal(&self, run: &RunRecord) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let update = Update {
            run: run.clone(),
            terminal: true,
            ack: Some(ack_tx),
        };
        if self.tx.send(update).await.is_ok() {
            let _ = ack_rx.await;
        }
    }
}

/// Spawn the writer task for one sequence's status file.
pub(crate) fn spawn(
    status_dir: Utf8PathBuf,
    sequence: u64,
    extra: BTreeMap<String, serde_json::Value>,
) -> (StatusWriter, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    let handle = tokio::spawn(writer_loop(status_dir, sequence, extra, rx));
    (StatusWriter { tx }, handle)
}

async fn write_with_retry(dir: &Dir, sequence: u64, doc: &[u8]) -> bool {
    let r = guestpatch_utils::retry_with_backoff(3, Duration::from_secs(1), |_| async {
        match persist(dir, sequence, doc) {
            Ok(()) => Ok(guestpatch_utils::Attempt::Done(())),
            Err(e) => Ok(guestpatch_utils::Attempt::Retry(format!("{e:#}"))),
        }
    })
    .await;
    match r {
        Ok(()) => true,
        Err(e) => {
            // A status write failure never aborts the run.
            tracing::error!("status write failed: {e:#}");
            false
        }
    }
}

async fn writer_loop(
    status_dir: Utf8PathBuf,
    sequence: u64,
    extra: BTreeMap<String, serde_json::Value>,
    mut rx: mpsc::Receiver<Update>,
) {
    let dir = match Dir::open_ambient_dir(&status_dir, cap_std::ambient_authority()) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!("cannot open status directory {status_dir}: {e}");
            // Keep draining so senders never block on a dead writer.
            while let Some(update) = rx.recv().await {
                if let Some(ack) = update.ack {
                    let _ = ack.send(());
                }
            }
            return;
        }
    };
    let mut pending: Option<RunRecord> = None;
    let mut last_write: Option<Instant> = None;
    let mut degraded = false;

    loop {
        let flush_at = last_write
            .map(|t| t + MIN_WRITE_INTERVAL)
            .unwrap_or_else(Instant::now);
        tokio::select! {
            update = rx.recv() => {
                let Some(update) = update else { break };
                if update.terminal {
                    pending = None;
                    let ok = match build_document(&update.run, &extra, degraded) {
                        Ok(doc) => write_with_retry(&dir, sequence, &doc).await,
                        Err(e) => {
                            tracing::error!("cannot serialize status: {e:#}");
                            false
                        }
                    };
                    degraded = degraded || !ok;
                    last_write = Some(Instant::now());
                    if let Some(ack) = update.ack {
                        let _ = ack.send(());
                    }
                } else {
                    let due = last_write.is_none_or(|t| t.elapsed() >= MIN_WRITE_INTERVAL);
                    if due {
                        if let Ok(doc) = build_document(&update.run, &extra, degraded) {
                            degraded = degraded || !write_with_retry(&dir, sequence, &doc).await;
                        }
                        last_write = Some(Instant::now());
                    } else {
                        pending = Some(update.run);
                    }
                }
            }
            _ = tokio::time::sleep_until(flush_at), if pending.is_some() => {
                if let Some(run) = pending.take() {
                    if let Ok(doc) = build_document(&run, &extra, degraded) {
                        degraded = degraded || !write_with_retry(&dir, sequence, &doc).await;
                    }
                    last_write = Some(Instant::now());
                }
            }
        }
    }
    // Channel closed with an update still coalescing; flush it.
    if let Some(run) = pending.take() {
        if let Ok(doc) = build_document(&run, &extra, degraded) {
            let _ = write_with_retry(&dir, sequence, &doc).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Classification;

    fn sample_run() -> RunRecord {
        let mut run = RunRecord::new("a1", Operation::Assessment);
        let mut p = PatchRecord::new("openssl", "1.1.1k", Classification::Security);
        p.set_install_state(InstallState::NotStarted);
        run.patches.push(p);
        let mut p = PatchRecord::new("vim", "8.2", Classification::Other);
        p.mark_failed("dependency hell");
        run.patches.push(p);
        run
    }

    fn message_payload(doc: &[u8]) -> PatchPayload {
        let envelopes: Vec<StatusEnvelope> = serde_json::from_slice(doc).unwrap();
        assert_eq!(envelopes.len(), 1);
        serde_json::from_str(&envelopes[0].status.formatted_message.message).unwrap()
    }

    #[test]
    fn test_document_roundtrip() {
        let mut run = sample_run();
        run.seal(RunStatus::CompletedWithErrors);
        let extra = BTreeMap::from([("futureField".to_string(), serde_json::json!(42))]);
        let doc = build_document(&run, &extra, false).unwrap();
        let envelopes: Vec<StatusEnvelope> = serde_json::from_slice(&doc).unwrap();
        assert_eq!(envelopes[0].status.name, HANDLER_NAME);
        assert_eq!(envelopes[0].status.status, HostStatus::Warning);
        let payload = message_payload(&doc);
        assert_eq!(payload.activity_id, "a1");
        assert_eq!(payload.patches.len(), 2);
        assert_eq!(payload.errors.len(), 1);
        assert!(payload.errors[0].message.contains("vim"));
        assert_eq!(payload.unrecognized["futureField"], serde_json::json!(42));
    }

    #[test]
    fn test_status_mapping() {
        for (run_status, host) in [
            (RunStatus::InProgress, HostStatus::Transitioning),
            (RunStatus::Succeeded, HostStatus::Success),
            (RunStatus::CompletedWithErrors, HostStatus::Warning),
            (RunStatus::Aborted, HostStatus::Warning),
            (RunStatus::Failed, HostStatus::Error),
        ] {
            assert_eq!(host_status(run_status), host);
        }
    }

    #[test]
    fn test_truncation_keeps_document_bounded() {
        let mut run = sample_run();
        for i in 0..4000 {
            run.patches.push(PatchRecord::new(
                format!("package-with-a-rather-long-name-{i}"),
                "1.0.0-1.el8",
                Classification::Other,
            ));
        }
        let doc = build_document(&run, &BTreeMap::new(), false).unwrap();
        assert!(doc.len() <= MAX_STATUS_BYTES);
        let envelopes: Vec<StatusEnvelope> = serde_json::from_slice(&doc).unwrap();
        let truncated = envelopes[0]
            .status
            .substatus
            .iter()
            .any(|s| s.name == "truncation");
        assert!(truncated);
    }

    #[tokio::test]
    async fn test_writer_task_end_to_end() {
        let td = tempfile::tempdir().unwrap();
        let dir_path = Utf8PathBuf::try_from(td.path().to_path_buf()).unwrap();
        let (writer, handle) = spawn(dir_path.clone(), 7, BTreeMap::new());

        let mut run = sample_run();
        for _ in 0..20 {
            writer.send_progress(&run);
        }
        run.seal(RunStatus::Succeeded);
        writer.send_terminal(&run).await;

        // The terminal snapshot must be on disk before send_terminal returns
        let content = std::fs::read(dir_path.join("7.status")).unwrap();
        let payload = message_payload(&content);
        assert_eq!(payload.status, RunStatus::Succeeded);
        assert!(!dir_path.join("7.status.tmp").exists());

        drop(writer);
        handle.await.unwrap();
    }
}
