//! `taskmill-core`: configuration and shared error types.
//!
//! Every other crate in the workspace reads its settings from
//! [`config::TaskmillConfig`], loaded once at startup by the binary.

pub mod config;
pub mod error;

pub use config::TaskmillConfig;
pub use error::{Result, TaskmillError};
