//! Sandbox core.
//!
//! The in-process sandbox composes the isolated loader, stream virtualiser
//! and timeout driver. The forked variant runs the same sandbox in a child
//! process behind a loopback JSON RPC.

pub mod proxy;
pub mod sandbox;
pub mod supervisor;
pub mod types;
