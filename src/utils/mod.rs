//! Shared utilities: configuration and error types

pub mod config;
pub mod errors;

pub use config::GovernorConfig;
pub use errors::{GovernorError, Result, ViolationKind};
