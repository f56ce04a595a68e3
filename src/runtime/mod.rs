//! Guest runtime
//!
//! Shared wasm engine, per-invocation stores and the error payloads that
//! travel out of guest code.

pub mod engine;
pub mod traps;
