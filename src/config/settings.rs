/// Grader configuration file
///
/// JSON, every key optional. Converts into the runtime configuration types
/// consumed by the sandbox, the repetition protocol and the fork supervisor.
use crate::config::policy::whitelist::Whitelist;
use crate::config::types::{InputMode, OutputMode, Result, SandboxConfig, SandboxError, StreamModes};
use crate::core::supervisor::ForkOptions;
use crate::verdict::repetition::RepetitionConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkSettings {
    pub handshake_timeout_ms: u64,
    pub retry_budget: u32,
    pub response_grace_ms: u64,
    pub host_binary: Option<PathBuf>,
}

impl Default for ForkSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 30_000,
            retry_budget: 3,
            response_grace_ms: 2_000,
            host_binary: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub repetitions: u32,
    pub per_repetition_timeout_ms: u64,
    pub aggregate_timeout_ms: u64,
    /// Built-in curated list when unset
    pub whitelist_file: Option<PathBuf>,
    /// Drop the whitelist entirely (trusted code only)
    pub unrestricted: bool,
    pub static_state_isolation: bool,
    pub stdin: InputMode,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
    pub memory_limit_mb: u64,
    pub parallelism: usize,
    pub forked: bool,
    pub fork: ForkSettings,
    pub audit_log: Option<PathBuf>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            repetitions: 7,
            per_repetition_timeout_ms: 6_000,
            aggregate_timeout_ms: 10_000,
            whitelist_file: None,
            unrestricted: false,
            static_state_isolation: true,
            stdin: InputMode::Normal,
            stdout: OutputMode::Normal,
            stderr: OutputMode::Normal,
            memory_limit_mb: 256,
            parallelism: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            forked: false,
            fork: ForkSettings::default(),
            audit_log: None,
        }
    }
}

impl GraderConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| SandboxError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Build the sandbox configuration, loading the whitelist file if one is
    /// named.
    pub fn sandbox_config(&self) -> Result<SandboxConfig> {
        let whitelist = if self.unrestricted {
            None
        } else {
            Some(match &self.whitelist_file {
                Some(path) => Whitelist::load(path)?,
                None => Whitelist::curated(),
            })
        };
        Ok(SandboxConfig {
            whitelist,
            timeout: Some(Duration::from_millis(self.per_repetition_timeout_ms)),
            static_state_isolation: self.static_state_isolation,
            streams: StreamModes {
                stdin: self.stdin,
                stdout: self.stdout,
                stderr: self.stderr,
            },
            memory_limit: self.memory_limit_mb.saturating_mul(1024 * 1024),
        })
    }

    pub fn repetition_config(&self) -> RepetitionConfig {
        RepetitionConfig {
            repetitions: self.repetitions,
            aggregate_timeout: Duration::from_millis(self.aggregate_timeout_ms),
        }
    }

    pub fn fork_options(&self) -> ForkOptions {
        ForkOptions {
            handshake_timeout: Duration::from_millis(self.fork.handshake_timeout_ms),
            retry_budget: self.fork.retry_budget,
            response_grace: Duration::from_millis(self.fork.response_grace_ms),
            host_binary: self.fork.host_binary.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: GraderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.repetitions, 7);
        assert_eq!(config.per_repetition_timeout_ms, 6000);
        assert_eq!(config.aggregate_timeout_ms, 10000);
        assert_eq!(config.memory_limit_mb, 256);
        assert!(config.static_state_isolation);
        assert!(!config.forked);
        assert_eq!(config.fork.retry_budget, 3);
        assert!(config.parallelism >= 1);
    }

    #[test]
    fn partial_file_overrides_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"repetitions": 3, "stdout": "RECORD", "fork": {{"retry_budget": 5}}}}"#
        )
        .unwrap();
        let config = GraderConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.repetitions, 3);
        assert_eq!(config.stdout, OutputMode::Record);
        assert_eq!(config.fork.retry_budget, 5);
        assert_eq!(config.fork.response_grace_ms, 2000);
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ repetitions: ").unwrap();
        assert!(matches!(
            GraderConfig::load_from_file(file.path()),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn conversions() {
        let config = GraderConfig {
            per_repetition_timeout_ms: 1500,
            memory_limit_mb: 16,
            unrestricted: true,
            ..GraderConfig::default()
        };
        let sandbox = config.sandbox_config().unwrap();
        assert!(sandbox.whitelist.is_none());
        assert_eq!(sandbox.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(sandbox.memory_limit, 16 * 1024 * 1024);
        assert_eq!(
            config.repetition_config().aggregate_timeout,
            Duration::from_millis(config.aggregate_timeout_ms)
        );
        assert_eq!(config.fork_options().handshake_timeout, Duration::from_secs(30));

        let restricted = GraderConfig::default().sandbox_config().unwrap();
        assert!(restricted.whitelist.is_some());
    }

    #[test]
    fn missing_whitelist_file_fails() {
        let config = GraderConfig {
            whitelist_file: Some(PathBuf::from("/nonexistent/gradebox/whitelist.txt")),
            ..GraderConfig::default()
        };
        assert!(matches!(
            config.sandbox_config(),
            Err(SandboxError::Whitelist(_))
        ));
    }
}
