//! Crash-Report Collector (Section 4.7): correlates rich-core dumps produced
//! during a case with the telemetry URLs an external uploader eventually
//! publishes, tagged by a per-case UUID marker file.
//!
//! Four phases: Discovery (scan dumps dir for the UUID marker), Reconciliation
//! (match `uploadlog` entries against discovered reports), Wait loop (block on
//! a directory watch until the uploader catches up or times out), Fallback
//! fetch (pull down whatever is still unresolved when the wait loop gives up).

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use thiserror::Error;
use tlr_core::{CrashReportMap, EngineConfig, GetFile, RunContext, UUID_DASH_REPLACEMENT};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::executor::Executor;
use crate::get_processor::{process_get, NoopMeasurementEvaluator};

/// Failures internal to the Collector's own I/O, as opposed to an unresolved
/// crash report (which is not an error, just an incomplete reconciliation).
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to start crash-dump directory watch: {0}")]
    Watch(#[from] notify::Error),
}

/// Generate a marker-file-safe case UUID: the canonical 36-char v4 form with
/// every `-` replaced (Section 3, Section 4.3).
pub fn generate_case_uuid() -> String {
    Uuid::new_v4().to_string().replace('-', &UUID_DASH_REPLACEMENT.to_string())
}

/// Write the marker file that signals the device-side crash tagger to stamp
/// this UUID onto any core it captures during the case (Section 4.3 step 2).
pub fn write_marker_file(dir: &Path, uuid: &str) -> std::io::Result<PathBuf> {
    let marker = dir.join(uuid);
    fs::write(&marker, b"")?;
    Ok(marker)
}

pub fn remove_marker_file(marker: &Path) {
    if let Err(e) = fs::remove_file(marker) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %marker.display(), error = %e, "failed to remove crash marker file");
        }
    }
}

/// Phase A: scan `dumps_dir` for files whose name ends with `.{uuid}`, insert
/// their base name into `reports` with an unresolved (`None`) URL, and unlink
/// the matched file. Restarts the scan after every match since the directory
/// may be mutated concurrently by the device-side tagger.
fn discover(dumps_dir: &Path, uuid: &str, reports: &mut CrashReportMap) {
    let suffix = format!(".{uuid}");
    loop {
        let Ok(entries) = fs::read_dir(dumps_dir) else { return };
        let mut matched = None;
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else { continue };
            if !file_type.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(base) = name.strip_suffix(&suffix) {
                matched = Some((entry.path(), base.to_string()));
                break;
            }
        }
        match matched {
            Some((path, base)) => {
                reports.entry(base).or_insert(None);
                if let Err(e) = fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %e, "failed to unlink crash report marker");
                }
            }
            None => return,
        }
    }
}

/// Phase B: reconcile `reports` against the uploader's `uploadlog`. Returns
/// true iff at least one entry is still unresolved.
fn reconcile(uploadlog: &Path, reports: &mut CrashReportMap) -> bool {
    if let Ok(content) = fs::read_to_string(uploadlog) {
        for line in content.lines() {
            let Some((filename, url)) = line.rsplit_once(' ') else {
                debug!(line, "malformed uploadlog entry, skipping");
                continue;
            };
            if let Some(slot) = reports.get_mut(filename) {
                if slot.is_none() {
                    *slot = Some(url.to_string());
                }
            }
        }
    }
    reports.values().any(|v| v.is_none())
}

/// Phase C: block until reconciliation completes or `timeout` elapses,
/// re-reconciling on every dumps-directory change.
fn wait_for_uploads(dumps_dir: &Path, uploadlog: &Path, reports: &mut CrashReportMap, timeout: Duration) {
    if timeout.is_zero() {
        return;
    }
    let (tx, rx) = std::sync::mpsc::channel();
    let mut watcher = match notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %CollectorError::from(e), "failed to start crash-dump directory watch");
            return;
        }
    };
    if let Err(e) = watcher.watch(dumps_dir, RecursiveMode::NonRecursive) {
        warn!(error = %e, "failed to watch crash-dump directory");
        return;
    }

    loop {
        match rx.recv_timeout(timeout) {
            Ok(Ok(_event)) => {
                if !reconcile(uploadlog, reports) {
                    return;
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "crash-dump directory watch error, giving up");
                return;
            }
            Err(RecvTimeoutError::Timeout) => return,
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Phase D: fetch whatever is still unresolved via the Get Processor.
/// Returns the set of reports that were ultimately associated with the case.
fn fallback_fetch(dumps_dir: &Path, config: &EngineConfig, executor: &Executor, run_ctx: &RunContext, reports: &CrashReportMap) {
    for (base, url) in reports.iter() {
        if url.is_some() {
            continue;
        }
        let source = dumps_dir.join(base);
        let get = GetFile {
            path: source.to_string_lossy().to_string(),
            delete_after: true,
            measurement: false,
            series: false,
        };
        let mut evaluator = NoopMeasurementEvaluator;
        let _ = process_get(&get, config, executor, run_ctx, true, &mut evaluator);
    }
}

/// Run all four phases for a case's crash reports (Section 4.7). Returns true
/// iff at least one crash report was associated with the case.
pub fn collect(
    config: &EngineConfig,
    executor: &Executor,
    run_ctx: &RunContext,
    uuid: &str,
    reports: &mut CrashReportMap,
) -> bool {
    let dumps_dir = &config.rich_core_dir;
    let uploadlog = dumps_dir.join("uploadlog");

    discover(dumps_dir, uuid, reports);
    if reports.is_empty() {
        return false;
    }

    if reconcile(&uploadlog, reports) {
        wait_for_uploads(dumps_dir, &uploadlog, reports, Duration::from_secs(config.core_upload_timeout_sec));
    }

    fallback_fetch(dumps_dir, config, executor, run_ctx, reports);
    !reports.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uuid_has_no_dashes() {
        let uuid = generate_case_uuid();
        assert_eq!(uuid.len(), 36);
        assert!(!uuid.contains('-'));
    }

    #[test]
    fn discover_finds_and_unlinks_matching_reports() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = "deadbeef0000000000000000000000000000";
        let report = dir.path().join(format!("core.1234.{uuid}"));
        fs::write(&report, b"dump").unwrap();

        let mut reports = CrashReportMap::new();
        discover(dir.path(), uuid, &mut reports);

        assert!(reports.contains_key("core.1234"));
        assert!(!report.exists());
    }

    #[test]
    fn reconcile_fills_in_known_urls_and_reports_incomplete_state() {
        let dir = tempfile::tempdir().unwrap();
        let uploadlog = dir.path().join("uploadlog");
        fs::write(&uploadlog, "core.1234 https://example/core.1234\n").unwrap();

        let mut reports = CrashReportMap::new();
        reports.insert("core.1234".to_string(), None);
        reports.insert("core.5678".to_string(), None);

        let incomplete = reconcile(&uploadlog, &mut reports);
        assert_eq!(reports.get("core.1234").unwrap().as_deref(), Some("https://example/core.1234"));
        assert!(incomplete, "core.5678 still has no URL");
    }

    #[test]
    fn reconcile_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let uploadlog = dir.path().join("uploadlog");
        fs::write(&uploadlog, "nospaceatall\n").unwrap();
        let mut reports = CrashReportMap::new();
        reports.insert("core.1234".to_string(), None);
        assert!(reconcile(&uploadlog, &mut reports));
    }

    #[test]
    fn collect_returns_false_when_nothing_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.rich_core_dir = dir.path().to_path_buf();
        let executor = Executor::new();
        let run_ctx = RunContext::default();
        let mut reports = CrashReportMap::new();
        assert!(!collect(&config, &executor, &run_ctx, "nonexistent-uuid", &mut reports));
    }
}
