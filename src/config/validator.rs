// Startup validation of the grader configuration.
// Errors make the configuration unusable; warnings are reported and ignored.

use crate::config::settings::GraderConfig;
use crate::config::types::{InputMode, Result, SandboxError};

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate a loaded configuration. Any error is fatal and returned as
/// `SandboxError::Config`; warnings come back in the result.
pub fn validate_config(config: &GraderConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_limits(config, &mut result);
    validate_paths(config, &mut result);
    validate_streams(config, &mut result);
    validate_fork(config, &mut result);

    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    for warning in &result.warnings {
        log::warn!("{}", warning);
    }
    Ok(result)
}

fn validate_limits(config: &GraderConfig, result: &mut ValidationResult) {
    if config.repetitions == 0 {
        result.add_error("repetitions cannot be zero".to_string());
    }
    if config.per_repetition_timeout_ms == 0 {
        result.add_error("per_repetition_timeout_ms cannot be zero".to_string());
    }
    if config.aggregate_timeout_ms == 0 {
        result.add_error("aggregate_timeout_ms cannot be zero".to_string());
    }
    if config.memory_limit_mb == 0 {
        result.add_error("memory_limit_mb cannot be zero".to_string());
    }
    if config.parallelism == 0 {
        result.add_error("parallelism cannot be zero".to_string());
    }

    if config.aggregate_timeout_ms < config.per_repetition_timeout_ms {
        result.add_warning(format!(
            "aggregate_timeout_ms ({}) is below per_repetition_timeout_ms ({}), at most one repetition may complete",
            config.aggregate_timeout_ms, config.per_repetition_timeout_ms
        ));
    }
}

fn validate_paths(config: &GraderConfig, result: &mut ValidationResult) {
    if let Some(ref whitelist) = config.whitelist_file {
        if config.unrestricted {
            result.add_warning(format!(
                "whitelist_file {:?} is ignored because unrestricted is set",
                whitelist
            ));
        } else if !whitelist.is_file() {
            result.add_error(format!("whitelist_file does not exist: {:?}", whitelist));
        }
    }

    if let Some(ref audit_log) = config.audit_log {
        if let Some(parent) = audit_log.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(format!(
                    "audit_log parent directory does not exist and will be created: {:?}",
                    parent
                ));
            }
        }
    }

    if let Some(ref binary) = config.fork.host_binary {
        if !binary.is_file() {
            result.add_error(format!("fork.host_binary does not exist: {:?}", binary));
        }
    }
}

fn validate_streams(config: &GraderConfig, result: &mut ValidationResult) {
    if config.unrestricted {
        result.add_warning("unrestricted mode disables the call whitelist; trusted code only".to_string());
    }
    if config.stdin == InputMode::Normal && config.parallelism > 1 {
        result.add_warning(
            "stdin NORMAL with parallelism > 1 lets concurrent invocations race on the real stdin"
                .to_string(),
        );
    }
    if config.forked && (config.stdout.records() || config.stderr.records()) {
        result.add_warning(
            "forked results carry no captured output; RECORD modes apply inside the child only"
                .to_string(),
        );
    }
}

fn validate_fork(config: &GraderConfig, result: &mut ValidationResult) {
    if !config.forked {
        return;
    }
    if config.fork.retry_budget == 0 {
        result.add_error("fork.retry_budget must allow at least one attempt".to_string());
    }
    if config.fork.handshake_timeout_ms == 0 {
        result.add_error("fork.handshake_timeout_ms cannot be zero".to_string());
    }
}
