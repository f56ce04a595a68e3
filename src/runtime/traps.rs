//! Error payloads raised from host code into the guest.
//!
//! They leave wasmtime wrapped in `anyhow::Error` and are recovered with
//! `downcast_ref` when the invocation is classified.

use thiserror::Error;

/// A restricted unit called something the whitelist does not allow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PermissionViolation(pub String);

/// Guest linear memory growth past the configured limit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("memory limit exceeded: requested {requested} bytes, limit {limit} bytes")]
pub struct ResourceExhausted {
    pub requested: usize,
    pub limit: u64,
}

/// Exception raised by host library code on behalf of the guest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{type_name}: {message}")]
pub struct GuestException {
    pub type_name: String,
    pub message: String,
}

impl GuestException {
    pub fn new(type_name: &str, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.to_string(),
            message: message.into(),
        }
    }
}

/// The invocation's kill switch fired.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("execution interrupted")]
pub struct Interrupted;
