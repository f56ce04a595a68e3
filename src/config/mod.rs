//! Configuration and policy
//!
//! Runtime types, the call whitelist, the configuration file and its
//! validation.

pub mod policy;
pub mod settings;
pub mod types;
pub mod validator;
