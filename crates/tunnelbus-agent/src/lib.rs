//! Agent bootstrap
//!
//! Loads the agent configuration, waits for the signed-in profile and runs
//! every relay for that user until shutdown.

pub mod config;
pub mod profile;
pub mod worker;

pub use config::{AgentConfig, ConfigError, ConfigFile, Overrides};
pub use profile::{profile_channel, Profile};
pub use worker::{Worker, WorkerError};
