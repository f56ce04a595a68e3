//! gradebox: a sandboxed execution engine for grading untrusted code
//!
//! Restricted code runs as WebAssembly units inside a guest runtime. Every
//! import that leaves the restricted code is checked against a call
//! whitelist at load time, every invocation runs on its own killable worker,
//! and standard streams are virtualised per worker thread.
//!
//! # Architecture
//!
//! ## Configuration & Policy ([`config`])
//! - [`config::types`]: Values, requests, results, sandbox configuration, errors
//! - [`config::policy::whitelist`]: Call whitelist parsing and matching
//! - [`config::settings`]: JSON configuration file
//! - [`config::validator`]: Startup validation
//!
//! ## Guest Runtime ([`runtime`], [`loader`])
//! - [`runtime::engine`]: Shared engine, module cache, kill switch, memory limiter
//! - [`runtime::traps`]: Error payloads raised by host code inside the guest
//! - [`loader`]: Code units and code paths
//! - [`loader::isolated`]: Whitelist-enforcing import resolution and invocation
//! - [`loader::hostlib`]: Trusted host library (`rt.*`)
//!
//! ## Execution Control ([`exec`])
//! - [`exec::streams`]: Per-thread stream virtualisation
//! - [`exec::timeout`]: Killable workers with escalating termination
//! - [`exec::pool`]: Bounded worker pool
//!
//! ## Sandbox ([`core`])
//! - [`core::sandbox`]: In-process sandbox
//! - [`core::supervisor`]: Forked-process sandbox (host side)
//! - [`core::proxy`]: Forked-process sandbox (child side)
//! - [`core::types`]: RPC wire types
//!
//! ## Verdicts ([`verdict`])
//! - [`verdict::verdict`]: Error classification
//! - [`verdict::repetition`]: Repetition protocol
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured security audit events

// Configuration & Policy
pub mod config;

// Guest runtime
pub mod runtime;

// Code units and isolated loading
pub mod loader;

// Execution Control
pub mod exec;

// In-process and forked sandboxes
pub mod core;

// Verdicts
pub mod verdict;

// Observability
pub mod observability;

// CLI entrypoint
pub mod cli;

// Re-export commonly used types for convenience
pub use crate::config::types::*;
pub use crate::config::policy::whitelist::{CallKind, Whitelist};
pub use crate::core::sandbox::{Executor, Sandbox};
pub use crate::core::supervisor::{ForkOptions, ForkedSandbox};
pub use crate::loader::{CodePath, CodeUnit};
pub use crate::verdict::repetition::{repeat, RepetitionConfig, RepetitionOutcome};
