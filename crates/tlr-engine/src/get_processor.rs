//! Get Processor: fetches (and optionally deletes) artefacts named by a
//! `GetFile`, and evaluates case-level measurement files (Section 4.6).

use std::path::{Path, PathBuf};

use thiserror::Error;
use tlr_core::{EngineConfig, GetFile, RunContext};
use tracing::warn;

use crate::executor::{ExecConfig, Executor};

/// Raised when fetching an artefact fails outright (Section 4.6).
#[derive(Debug, Error)]
pub enum GetError {
    #[error("get failed for {path}: {reason}")]
    Fetch { path: String, reason: String },
}

/// Evaluates a parsed measurement file against acceptance criteria, flipping a
/// still-passing Case to FAIL when thresholds are exceeded. Out of scope to
/// implement a concrete parser/threshold format (Section 1 Non-goals list
/// detailed measurement semantics as engine-external); callers provide one.
pub trait MeasurementEvaluator {
    /// Returns `Some(failure_info)` if the measurement fails its criteria.
    fn evaluate(&mut self, measurement_file: &Path) -> Option<String>;
}

/// Evaluator that never fails a case; used when no measurement policy is configured.
#[derive(Debug, Default)]
pub struct NoopMeasurementEvaluator;

impl MeasurementEvaluator for NoopMeasurementEvaluator {
    fn evaluate(&mut self, _measurement_file: &Path) -> Option<String> {
        None
    }
}

fn compose_fetch_command(config: &EngineConfig, source_path: &str, dest_dir: &Path) -> (String, bool) {
    let dest = dest_dir.display();
    if let Some(ssh) = &config.ssh {
        let port_flag = ssh.target_port.map(|p| format!("-P {p} ")).unwrap_or_default();
        let key_flag = ssh.ssh_key.as_ref().map(|k| format!("-i {} ", k.display())).unwrap_or_default();
        let cmd = format!(
            "scp {port_flag}{key_flag}{user}@{host}:'{source_path}' {dest}",
            user = ssh.username,
            host = ssh.target_address,
        );
        (cmd, true)
    } else if let Some(template) = &config.remote_executor_template {
        let cmd = template
            .replace("<FILE>", source_path)
            .replace("<DEST>", &dest.to_string());
        (cmd, true)
    } else {
        (format!("cp {source_path} {dest}"), false)
    }
}

/// Run a single `GetFile` (Section 4.6). `case_measurement_evaluator` is invoked only
/// when `get.measurement` is set, the Case is still PASS, and
/// `config.verdicts_from_measurements` is enabled.
pub fn process_get(
    get: &GetFile,
    config: &EngineConfig,
    executor: &Executor,
    run_ctx: &RunContext,
    case_still_passing: bool,
    evaluator: &mut dyn MeasurementEvaluator,
) -> Option<String> {
    if run_ctx.is_bailed_out() {
        return None;
    }

    let source_path = match &config.chroot_folder {
        Some(prefix) => format!("{}{}", prefix.display(), get.path),
        None => get.path.clone(),
    };
    let (cmd, _remote_transport) = compose_fetch_command(config, &source_path, &config.output_folder);
    let exec_config = ExecConfig {
        soft_timeout_sec: config.common_soft_timeout_sec,
        hard_timeout_sec: config.common_hard_timeout_sec,
        chroot: config.chroot_folder.clone(),
        // `source_path` is already manually prefixed with `chroot_folder` above, so
        // once a chroot is configured the composed command must never be chrooted a
        // second time by the Executor, regardless of which transport composed it.
        disobey_chroot: config.chroot_folder.is_some(),
    };
    let outcome = executor.execute(&cmd, &exec_config);
    if outcome.result != 0 || outcome.signaled != 0 {
        warn!(path = %get.path, result = outcome.result, "get failed to fetch file");
        let reason = outcome.failure_info.unwrap_or_else(|| format!("exit code {}", outcome.result));
        return Some(GetError::Fetch { path: get.path.clone(), reason }.to_string());
    }

    if get.delete_after {
        let rm_cmd = format!("rm -f {source_path}");
        let _ = executor.execute(&rm_cmd, &exec_config);
    }

    if get.measurement {
        let filename = Path::new(&get.path).file_name().map(|f| f.to_owned()).unwrap_or_default();
        let local_dest: PathBuf = config.output_folder.join(filename);
        if get.series {
            // Series measurements accumulate over a run; nothing further to do here
            // beyond making the file available - the per-series rollup is engine-external.
        }
        if case_still_passing && config.verdicts_from_measurements {
            return evaluator.evaluate(&local_dest);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_get_uses_cp_without_transport() {
        let config = EngineConfig::default();
        let (cmd, remote) = compose_fetch_command(&config, "/tmp/src", Path::new("/tmp/dst"));
        assert!(cmd.starts_with("cp /tmp/src"));
        assert!(!remote);
    }

    #[test]
    fn ssh_get_uses_scp_and_flags_remote_transport() {
        let mut config = EngineConfig::default();
        config.ssh = Some(tlr_core::SshConfig {
            target_address: "target".to_string(),
            target_port: Some(2222),
            username: "root".to_string(),
            ssh_key: None,
        });
        let (cmd, remote) = compose_fetch_command(&config, "/tmp/src", Path::new("/tmp/dst"));
        assert!(cmd.contains("scp -P 2222"));
        assert!(cmd.contains("root@target:'/tmp/src'"));
        assert!(remote);
    }

    #[test]
    fn remote_executor_template_substitutes_placeholders() {
        let mut config = EngineConfig::default();
        config.remote_executor_template = Some("fetch <FILE> into <DEST>".to_string());
        let (cmd, remote) = compose_fetch_command(&config, "/tmp/src", Path::new("/tmp/dst"));
        assert_eq!(cmd, "fetch /tmp/src into /tmp/dst");
        assert!(remote);
    }

    #[test]
    fn bailed_out_run_context_makes_get_a_noop() {
        let get = GetFile { path: "/tmp/x".to_string(), delete_after: false, measurement: false, series: false };
        let config = EngineConfig::default();
        let executor = Executor::new();
        let mut run_ctx = RunContext::default();
        run_ctx.raise(111, "earlier connection failure");
        let mut evaluator = NoopMeasurementEvaluator;
        let result = process_get(&get, &config, &executor, &run_ctx, true, &mut evaluator);
        assert!(result.is_none());
    }

    #[test]
    fn successful_plain_copy_returns_none() {
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        let src = src_dir.path().join("src.txt");
        std::fs::write(&src, b"hi").unwrap();
        let get = GetFile {
            path: src.to_string_lossy().to_string(),
            delete_after: false,
            measurement: false,
            series: false,
        };
        let mut config = EngineConfig::default();
        config.output_folder = dest_dir.path().to_path_buf();
        let executor = Executor::new();
        let run_ctx = RunContext::default();
        let mut evaluator = NoopMeasurementEvaluator;
        let result = process_get(&get, &config, &executor, &run_ctx, true, &mut evaluator);
        assert!(result.is_none());
        assert!(dest_dir.path().join("src.txt").exists());
    }

    #[test]
    fn configured_chroot_does_not_double_chroot_a_plain_copy() {
        // With `chroot_folder` set, `source_path` is already manually prefixed, so
        // the Executor must run the `cp` directly rather than chrooting a second
        // time (which would fail outright for a non-root test process).
        let src_dir = tempfile::tempdir().unwrap();
        let dest_dir = tempfile::tempdir().unwrap();
        std::fs::write(src_dir.path().join("src.txt"), b"hi").unwrap();
        let mut config = EngineConfig::default();
        config.output_folder = dest_dir.path().to_path_buf();
        config.chroot_folder = Some(src_dir.path().to_path_buf());
        let get = GetFile { path: "/src.txt".to_string(), delete_after: false, measurement: false, series: false };
        let executor = Executor::new();
        let run_ctx = RunContext::default();
        let mut evaluator = NoopMeasurementEvaluator;
        let result = process_get(&get, &config, &executor, &run_ctx, true, &mut evaluator);
        assert!(result.is_none(), "plain copy under a configured chroot should not be double-chrooted: {result:?}");
        assert!(dest_dir.path().join("src.txt").exists());
    }
}
