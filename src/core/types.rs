use crate::config::types::{
    ExceptionDescriptor, ExecutionRequest, ExecutionResult, Outcome, SandboxConfig, SandboxError,
    Value,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Frame separating guest frames from the forked host's own stack
pub const BOUNDARY_MARKER: &str = "<gradebox fork boundary>";

/// Host frames appended when re-rooting a remote exception
const MAX_HOST_FRAMES: usize = 32;

/// Type names reserved for outcomes that travel as exceptions.
pub mod reserved {
    pub const TIMEOUT: &str = "Timeout";
    pub const OUT_OF_MEMORY: &str = "OutOfMemory";
    pub const ILLEGAL_OPERATION: &str = "IllegalOperation";
    pub const STRUCTURAL_ERROR: &str = "StructuralError";
}

/// Everything a forked host needs to start serving.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForkHostLaunch {
    pub restricted: Vec<PathBuf>,
    pub support: Vec<PathBuf>,
    pub config: SandboxConfig,
}

/// One invocation on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub class_name: String,
    pub method_name: String,
    pub param_type_names: Vec<String>,
    pub args: Vec<Value>,
}

impl From<&ExecutionRequest> for RpcRequest {
    fn from(req: &ExecutionRequest) -> Self {
        Self {
            class_name: req.entry_type.clone(),
            method_name: req.entry_member.clone(),
            param_type_names: req.param_types.clone(),
            args: req.args.clone(),
        }
    }
}

impl From<RpcRequest> for ExecutionRequest {
    fn from(req: RpcRequest) -> Self {
        Self {
            entry_type: req.class_name,
            entry_member: req.method_name,
            param_types: req.param_type_names,
            args: req.args,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    ReturnedValue(Value),
    ThrownException(ExceptionDescriptor),
}

impl RpcResponse {
    /// Encode a forked host's local result.
    pub fn from_result(result: crate::config::types::Result<ExecutionResult>) -> Self {
        let outcome = match result {
            Ok(result) => result.outcome,
            Err(structural) => {
                return RpcResponse::ThrownException(ExceptionDescriptor::new(
                    reserved::STRUCTURAL_ERROR,
                    structural.to_string(),
                ))
            }
        };
        match outcome {
            Outcome::Success(value) => RpcResponse::ReturnedValue(value),
            Outcome::Exception(mut cause) => {
                cause.frames.push(BOUNDARY_MARKER.to_string());
                cause.frames.extend(capture_host_frames());
                RpcResponse::ThrownException(cause)
            }
            Outcome::Timeout => RpcResponse::ThrownException(ExceptionDescriptor::new(
                reserved::TIMEOUT,
                "invocation exceeded its deadline",
            )),
            Outcome::OutOfMemory(cause) => RpcResponse::ThrownException(
                ExceptionDescriptor::new(reserved::OUT_OF_MEMORY, cause.message)
                    .with_frames(cause.frames),
            ),
            Outcome::IllegalOperation(violation) => RpcResponse::ThrownException(
                ExceptionDescriptor::new(reserved::ILLEGAL_OPERATION, violation),
            ),
        }
    }

    /// Decode into a host-side outcome, re-rooting exception frames onto
    /// the calling stack.
    pub fn into_outcome(self, entry: &str) -> crate::config::types::Result<Outcome> {
        let cause = match self {
            RpcResponse::ReturnedValue(value) => return Ok(Outcome::Success(value)),
            RpcResponse::ThrownException(cause) => cause,
        };
        Ok(match cause.type_name.as_str() {
            reserved::TIMEOUT => Outcome::Timeout,
            reserved::OUT_OF_MEMORY => Outcome::OutOfMemory(cause),
            reserved::ILLEGAL_OPERATION => Outcome::IllegalOperation(cause.message),
            reserved::STRUCTURAL_ERROR => return Err(SandboxError::Remote(cause.message)),
            _ => {
                let frames = reroot(cause.frames, entry);
                Outcome::Exception(ExceptionDescriptor {
                    frames,
                    ..cause
                })
            }
        })
    }
}

/// Truncate at the boundary marker and continue on this process's stack.
pub fn reroot(mut frames: Vec<String>, entry: &str) -> Vec<String> {
    if let Some(pos) = frames.iter().position(|f| f == BOUNDARY_MARKER) {
        frames.truncate(pos);
    }
    frames.push(format!("<forked> {}", entry));
    frames.extend(capture_host_frames());
    frames
}

/// Symbol names of the current thread's stack, innermost first.
pub fn capture_host_frames() -> Vec<String> {
    let trace = std::backtrace::Backtrace::force_capture().to_string();
    parse_backtrace(&trace)
}

fn parse_backtrace(trace: &str) -> Vec<String> {
    trace
        .lines()
        .filter_map(|line| {
            let (index, symbol) = line.trim_start().split_once(": ")?;
            index.parse::<usize>().ok()?;
            Some(symbol.trim().to_string())
        })
        .filter(|symbol| !symbol.starts_with("std::backtrace"))
        .take(MAX_HOST_FRAMES)
        .collect()
}

/// Write one JSON message followed by a newline.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> io::Result<()> {
    let mut line = serde_json::to_vec(message)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Read one JSON line. `Ok(None)` on a clean end of stream.
pub fn read_message<R: BufRead, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
