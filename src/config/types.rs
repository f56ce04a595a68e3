/// Core types and structures for the gradebox system
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::config::policy::whitelist::{Whitelist, WhitelistError};

/// A value that can cross the isolation boundary.
///
/// Externally tagged on the wire: `{"I32": 3}`, `{"Str": "abc"}`, `"Unit"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    List(Vec<Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => write!(f, "()"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{:?}", v),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Identifies a static entry point and the arguments to call it with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub entry_type: String,
    pub entry_member: String,
    pub param_types: Vec<String>,
    pub args: Vec<Value>,
}

impl ExecutionRequest {
    pub fn new(entry_type: impl Into<String>, entry_member: impl Into<String>) -> Self {
        Self {
            entry_type: entry_type.into(),
            entry_member: entry_member.into(),
            param_types: Vec::new(),
            args: Vec::new(),
        }
    }

    /// Parse `fully.qualified.Type.member` into a request without arguments.
    pub fn parse_entry(entry: &str) -> Result<Self> {
        match entry.rsplit_once('.') {
            Some((entry_type, member)) if !entry_type.is_empty() && !member.is_empty() => {
                Ok(Self::new(entry_type, member))
            }
            _ => Err(SandboxError::Config(format!(
                "Invalid entry point '{}'. Use: Type.member",
                entry
            ))),
        }
    }

    pub fn with_arg(mut self, param_type: impl Into<String>, value: Value) -> Self {
        self.param_types.push(param_type.into());
        self.args.push(value);
        self
    }

    /// `Type.member` as used in logs and exception frames
    pub fn entry_name(&self) -> String {
        format!("{}.{}", self.entry_type, self.entry_member)
    }
}

/// Portable description of a failure raised inside the sandbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDescriptor {
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub frames: Vec<String>,
}

impl ExceptionDescriptor {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn with_frames(mut self, frames: Vec<String>) -> Self {
        self.frames = frames;
        self
    }
}

impl fmt::Display for ExceptionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Outcome of exactly one sandboxed invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Value),
    Exception(ExceptionDescriptor),
    Timeout,
    OutOfMemory(ExceptionDescriptor),
    IllegalOperation(String),
}

impl Outcome {
    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Success(_) => "success",
            Outcome::Exception(_) => "exception",
            Outcome::Timeout => "timeout",
            Outcome::OutOfMemory(_) => "out_of_memory",
            Outcome::IllegalOperation(_) => "illegal_operation",
        }
    }
}

/// Result of one sandboxed invocation plus any captured stream text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    /// Captured standard output (RECORD / RECORD_FORWARD only)
    pub stdout: Option<String>,
    /// Captured standard error (RECORD / RECORD_FORWARD only)
    pub stderr: Option<String>,
    /// Recorded text hit the per-stream bound and was cut short
    #[serde(default)]
    pub output_truncated: bool,
    /// Wall clock time of the invocation in milliseconds
    pub wall_time_ms: u64,
}

impl ExecutionResult {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            stdout: None,
            stderr: None,
            output_truncated: false,
            wall_time_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.outcome, Outcome::Timeout)
    }

    pub fn is_illegal_operation(&self) -> bool {
        matches!(self.outcome, Outcome::IllegalOperation(_))
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.outcome, Outcome::OutOfMemory(_))
    }

    pub fn is_exception(&self) -> bool {
        matches!(self.outcome, Outcome::Exception(_))
    }

    /// Returned value. Panics when the invocation did not succeed.
    pub fn value(&self) -> &Value {
        match &self.outcome {
            Outcome::Success(value) => value,
            other => panic!("value() called on a {} result", other.kind()),
        }
    }

    /// Raised exception. Panics unless the outcome is `Exception`.
    pub fn exception(&self) -> &ExceptionDescriptor {
        match &self.outcome {
            Outcome::Exception(cause) => cause,
            other => panic!("exception() called on a {} result", other.kind()),
        }
    }

    /// Exhaustion cause. Panics unless the outcome is `OutOfMemory`.
    pub fn out_of_memory(&self) -> &ExceptionDescriptor {
        match &self.outcome {
            Outcome::OutOfMemory(cause) => cause,
            other => panic!("out_of_memory() called on a {} result", other.kind()),
        }
    }

    /// Denied call description. Panics unless the outcome is `IllegalOperation`.
    pub fn violation(&self) -> &str {
        match &self.outcome {
            Outcome::IllegalOperation(message) => message,
            other => panic!("violation() called on a {} result", other.kind()),
        }
    }
}

/// Standard output/error handling for one invocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutputMode {
    /// Pass through to the real stream
    #[default]
    Normal,
    Discard,
    /// Captured, not forwarded
    Record,
    /// Captured and forwarded
    RecordForward,
}

impl OutputMode {
    pub fn records(self) -> bool {
        matches!(self, OutputMode::Record | OutputMode::RecordForward)
    }
}

/// Standard input handling for one invocation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputMode {
    #[default]
    Normal,
    /// Immediately exhausted
    Empty,
    /// Closed before the call; reads fail
    Closed,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamModes {
    pub stdin: InputMode,
    pub stdout: OutputMode,
    pub stderr: OutputMode,
}

impl StreamModes {
    pub fn is_passthrough(&self) -> bool {
        self.stdin == InputMode::Normal
            && self.stdout == OutputMode::Normal
            && self.stderr == OutputMode::Normal
    }
}

/// Immutable per-task sandbox configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// `None` means unrestricted (trusted code only)
    pub whitelist: Option<Whitelist>,
    /// Wall clock limit per invocation
    pub timeout: Option<Duration>,
    /// Fresh guest state for every invocation
    pub static_state_isolation: bool,
    pub streams: StreamModes,
    /// Upper bound for guest linear memory in bytes
    pub memory_limit: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            whitelist: Some(Whitelist::curated()),
            timeout: Some(Duration::from_secs(6)),
            static_state_isolation: true,
            streams: StreamModes::default(),
            memory_limit: 256 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Configuration without any call restriction, for trusted code.
    pub fn unrestricted() -> Self {
        Self {
            whitelist: None,
            ..Self::default()
        }
    }

    pub fn with_whitelist(mut self, whitelist: Option<Whitelist>) -> Self {
        self.whitelist = whitelist;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_static_state_isolation(mut self, enabled: bool) -> Self {
        self.static_state_isolation = enabled;
        self
    }

    pub fn with_streams(mut self, streams: StreamModes) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }
}

/// Custom error types for gradebox.
///
/// Only structural problems (caller misconfiguration) are reported through
/// this type; every behaviour of the code under test is an [`Outcome`].
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Whitelist error: {0}")]
    Whitelist(#[from] WhitelistError),

    #[error("Code unit '{0}' defined twice in one code path")]
    DuplicateUnit(String),

    #[error("Code unit '{name}' could not be compiled: {reason}")]
    InvalidUnit { name: String, reason: String },

    #[error("Entry type '{0}' not found")]
    EntryTypeNotFound(String),

    #[error("Entry member '{type_name}.{member}' not found")]
    EntryMemberNotFound { type_name: String, member: String },

    #[error("Signature mismatch for {entry}: {details}")]
    SignatureMismatch { entry: String, details: String },

    #[error("Unresolved import {type_name}.{member} required by '{unit}'")]
    UnresolvedImport {
        unit: String,
        type_name: String,
        member: String,
    },

    #[error("Cyclic dependency between code units through '{0}'")]
    CyclicDependency(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Forked host reported: {0}")]
    Remote(String),
}

/// Result type alias for gradebox operations
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_entry_splits_on_last_dot() {
        let req = ExecutionRequest::parse_entry("student.pkg.Calc.add").unwrap();
        assert_eq!(req.entry_type, "student.pkg.Calc");
        assert_eq!(req.entry_member, "add");
        assert!(ExecutionRequest::parse_entry("nodot").is_err());
        assert!(ExecutionRequest::parse_entry("Type.").is_err());
    }

    #[test]
    fn value_wire_shape_is_externally_tagged() {
        let json = serde_json::to_string(&Value::I32(3)).unwrap();
        assert_eq!(json, r#"{"I32":3}"#);
        let list: Value = serde_json::from_str(r#"{"List":[{"Str":"a"},"Unit"]}"#).unwrap();
        assert_eq!(
            list,
            Value::List(vec![Value::Str("a".to_string()), Value::Unit])
        );
    }

    #[test]
    fn accessor_returns_populated_variant() {
        let result = ExecutionResult::new(Outcome::Success(Value::I32(7)));
        assert_eq!(result.value(), &Value::I32(7));
        assert!(result.is_success());

        let denied = ExecutionResult::new(Outcome::IllegalOperation("rt.Files.<init>".into()));
        assert_eq!(denied.violation(), "rt.Files.<init>");
    }

    #[test]
    #[should_panic(expected = "value() called on a timeout result")]
    fn wrong_accessor_fails_fast() {
        let result = ExecutionResult::new(Outcome::Timeout);
        let _ = result.value();
    }

    #[test]
    fn stream_modes_use_screaming_case() {
        let modes: StreamModes =
            serde_json::from_str(r#"{"stdin":"EMPTY","stdout":"RECORD_FORWARD","stderr":"DISCARD"}"#)
                .unwrap();
        assert_eq!(modes.stdin, InputMode::Empty);
        assert_eq!(modes.stdout, OutputMode::RecordForward);
        assert!(modes.stdout.records());
        assert!(!modes.is_passthrough());
    }
}
