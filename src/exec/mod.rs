//! Execution control
//!
//! Per-thread stream virtualisation, killable timed workers and the
//! bounded worker pool.

pub mod pool;
pub mod streams;
pub mod timeout;
