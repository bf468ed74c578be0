//! The orchestrator daemon: an HTTP intake gateway plus a runner loop that
//! claims jobs off the filesystem queue and drives them through their steps.

pub mod callback;
pub mod config;
pub mod retention;
pub mod runner;
pub mod secrets_check;
pub mod server;

pub use config::{Config, ConfigError};

/// Crate-wide result alias for the outer (main/server/runner) layer, matching
/// `loopd`'s convention of an `eyre`-backed application error type rather
/// than a bespoke enum at this boundary.
pub type AppResult<T> = eyre::Result<T>;
