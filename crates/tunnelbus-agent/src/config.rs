//! Agent configuration file and its resolution against CLI overrides

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tunnelbus_bus::RetryPolicy;
use tunnelbus_proto::ExposedProject;
use tunnelbus_relay::TcpConfig;

use crate::profile::Profile;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,

    /// Profile used until sign-in is wired in
    #[serde(default)]
    pub profile: ProfileSection,

    #[serde(default)]
    pub tcp: TcpSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BrokerSection {
    /// AMQP URL of the broker
    #[serde(default)]
    pub url: String,

    /// Connection attempts before giving up
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    /// Seconds between two connection attempts
    #[serde(default = "default_connect_delay_secs")]
    pub connect_delay_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_attempts: default_connect_attempts(),
            connect_delay_secs: default_connect_delay_secs(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProfileSection {
    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub projects: Vec<ExposedProject>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TcpSection {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    #[serde(default = "default_backing_host")]
    pub backing_host: String,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for TcpSection {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            backing_host: default_backing_host(),
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_connect_attempts() -> usize {
    RetryPolicy::default().max_attempts
}

fn default_connect_delay_secs() -> u64 {
    RetryPolicy::default().delay.as_secs()
}

fn default_listen_host() -> String {
    TcpConfig::default().listen_host
}

fn default_backing_host() -> String {
    TcpConfig::default().backing_host
}

fn default_chunk_size() -> usize {
    TcpConfig::default().chunk_size
}

/// Values given on the command line or through the environment
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub broker_url: Option<String>,
    pub username: Option<String>,
}

/// Validated settings the binary runs with
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub broker_url: String,
    pub retry: RetryPolicy,
    pub profile: Profile,
    pub tcp: TcpConfig,
}

impl ConfigFile {
    /// Load configuration from a YAML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Merge `overrides` into the file values and validate the result
    ///
    /// Overrides win over the file.
    pub fn resolve(self, overrides: Overrides) -> Result<AgentConfig, ConfigError> {
        let broker_url = overrides.broker_url.unwrap_or(self.broker.url);
        let username = overrides.username.unwrap_or(self.profile.username);

        if broker_url.trim().is_empty() {
            return Err(ConfigError::Missing(
                "Broker URL (use --broker-url or broker.url)",
            ));
        }
        if username.trim().is_empty() {
            return Err(ConfigError::Missing(
                "Username (use --username or profile.username)",
            ));
        }
        if self.broker.connect_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "broker.connect_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.tcp.chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "tcp.chunk_size",
                reason: "must be greater than 0".to_string(),
            });
        }

        Ok(AgentConfig {
            broker_url,
            retry: RetryPolicy {
                max_attempts: self.broker.connect_attempts,
                delay: Duration::from_secs(self.broker.connect_delay_secs),
            },
            profile: Profile::new(username, self.profile.projects),
            tcp: TcpConfig {
                listen_host: self.tcp.listen_host,
                backing_host: self.tcp.backing_host,
                chunk_size: self.tcp.chunk_size,
            },
        })
    }
}
