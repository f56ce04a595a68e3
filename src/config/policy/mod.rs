//! Policy modules
//!
//! Call-level permission policy for restricted code.

pub mod whitelist;

pub use whitelist::{CallKind, Whitelist, WhitelistEntry, WhitelistError};
