//! Configuration for the test execution engine.
//!
//! Matches the `key=value` format precedence rule: CLI flags > `--config` file >
//! defaults. `EngineConfig` is the ambient value threading default timeouts, output
//! folder, chroot prefix, and transport settings into every component (Section 3.1).

use std::path::{Path, PathBuf};

use crate::errors::ConfigError;

/// How a Set Runner should behave once it reaches the resume checkpoint
/// (Section 4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeMode {
    /// Block until an external resume signal arrives, then continue normally.
    WaitForSignal,
    /// Restore the bail-out condition after the checkpoint so the Run Driver
    /// terminates once this set's post-processing finishes.
    ExitAfter,
}

/// SSH-shaped remote transport settings (Section 4.6, Section 6). This crate never
/// opens a socket; it only composes the `scp`/`ssh` command lines the Get Processor
/// hands to the Executor.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub target_address: String,
    pub target_port: Option<u16>,
    pub username: String,
    pub ssh_key: Option<PathBuf>,
}

/// Engine-wide configuration (Section 3.1).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default soft timeout for steps that don't set one explicitly (seconds).
    pub common_soft_timeout_sec: u32,
    /// Default hard timeout for the Executor's SIGKILL stage (seconds).
    pub common_hard_timeout_sec: u32,
    /// Directory `get`-ed files are copied into.
    pub output_folder: PathBuf,
    /// Optional chroot prefix applied to remote source paths (Section 4.6).
    pub chroot_folder: Option<PathBuf>,
    /// Whether crash-report collection (Section 4.7) is active for this run.
    pub dump_cores: bool,
    /// Directory scanned for rich core dumps and the marker file (Section 6).
    pub rich_core_dir: PathBuf,
    /// How long to wait for the uploader to reconcile telemetry URLs (Section 4.7).
    pub core_upload_timeout_sec: u64,
    /// Whether to start/stop the best-effort power measurement streamer.
    pub measure_power: bool,
    pub run_manual: bool,
    pub run_automatic: bool,
    pub case_filter: Option<String>,
    pub set_filter: Option<String>,
    /// Active run environment, matched against each Set's environment list.
    pub environment: String,
    pub ssh: Option<SshConfig>,
    /// Templated remote-executor command with `<FILE>`/`<DEST>`/`<CMD>` placeholders.
    pub remote_executor_template: Option<String>,
    pub resume_mode: Option<ResumeMode>,
    /// Whether a FAIL verdict from the measurement evaluator can flip a PASS case.
    pub verdicts_from_measurements: bool,
    /// Overrides the Definition's `hwid_detect_cmd` result when set, so a run can
    /// be pinned to a hardware id without invoking the detector command.
    pub forced_hwid: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            common_soft_timeout_sec: 90,
            common_hard_timeout_sec: 120,
            output_folder: PathBuf::from("."),
            chroot_folder: None,
            dump_cores: false,
            rich_core_dir: PathBuf::from("/var/crash"),
            core_upload_timeout_sec: 60,
            measure_power: false,
            run_manual: false,
            run_automatic: true,
            case_filter: None,
            set_filter: None,
            environment: "hardware".to_string(),
            ssh: None,
            remote_executor_template: None,
            resume_mode: None,
            verdicts_from_measurements: false,
            forced_hwid: None,
        }
    }
}

impl EngineConfig {
    /// Load config from a file, merging with defaults. CLI flags are applied by the
    /// caller afterwards so they take precedence over the file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Parse `key=value` config content, one setting per line. Blank lines and
    /// lines starting with `#` are ignored.
    fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };
            self.apply_value(key.trim(), Self::unquote(value.trim()).as_str())?;
        }
        Ok(())
    }

    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "common_soft_timeout_sec" => self.common_soft_timeout_sec = Self::parse_int(key, value)?,
            "common_hard_timeout_sec" => self.common_hard_timeout_sec = Self::parse_int(key, value)?,
            "output_folder" => self.output_folder = PathBuf::from(value),
            "chroot_folder" => {
                self.chroot_folder = if value.is_empty() { None } else { Some(PathBuf::from(value)) }
            }
            "dump_cores" => self.dump_cores = Self::parse_bool(key, value)?,
            "rich_core_dir" => self.rich_core_dir = PathBuf::from(value),
            "core_upload_timeout_sec" => {
                self.core_upload_timeout_sec = value.parse().map_err(|_| ConfigError::InvalidInt {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
            }
            "measure_power" => self.measure_power = Self::parse_bool(key, value)?,
            "run_manual" => self.run_manual = Self::parse_bool(key, value)?,
            "run_automatic" => self.run_automatic = Self::parse_bool(key, value)?,
            "case_filter" => self.case_filter = if value.is_empty() { None } else { Some(value.to_string()) },
            "set_filter" => self.set_filter = if value.is_empty() { None } else { Some(value.to_string()) },
            "environment" => self.environment = value.to_string(),
            "remote_executor_template" => {
                self.remote_executor_template =
                    if value.is_empty() { None } else { Some(value.to_string()) }
            }
            "verdicts_from_measurements" => {
                self.verdicts_from_measurements = Self::parse_bool(key, value)?
            }
            "forced_hwid" => self.forced_hwid = if value.is_empty() { None } else { Some(value.to_string()) },
            _ => return Err(ConfigError::InvalidLine(format!("unknown config key: {key}"))),
        }
        Ok(())
    }

    fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
        match value {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidBool { key: key.to_string(), value: value.to_string() }),
        }
    }

    fn parse_int(key: &str, value: &str) -> Result<u32, ConfigError> {
        value
            .parse()
            .map_err(|_| ConfigError::InvalidInt { key: key.to_string(), value: value.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = EngineConfig::default();
        assert!(cfg.common_hard_timeout_sec >= cfg.common_soft_timeout_sec);
        assert!(cfg.run_automatic);
        assert!(!cfg.run_manual);
    }

    #[test]
    fn parses_key_value_lines() {
        let mut cfg = EngineConfig::default();
        cfg.parse_content(
            "# comment\n\ncommon_soft_timeout_sec=30\ndump_cores=true\nenvironment=scratchbox\n",
        )
        .unwrap();
        assert_eq!(cfg.common_soft_timeout_sec, 30);
        assert!(cfg.dump_cores);
        assert_eq!(cfg.environment, "scratchbox");
    }

    #[test]
    fn rejects_unknown_key() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.parse_content("bogus_key=1\n").is_err());
    }

    #[test]
    fn rejects_malformed_line() {
        let mut cfg = EngineConfig::default();
        assert!(cfg.parse_content("not_a_key_value_pair\n").is_err());
    }
}
