//! Shared types and plumbing used by every Cinder process: the error
//! taxonomy, configuration loading, logging setup, credential signing,
//! and metrics registration.

pub mod config;
pub mod credential;
pub mod error;
pub mod ids;
pub mod logging;
pub mod metrics;
pub mod time;

pub use error::{Error, ErrorKind, Result};
