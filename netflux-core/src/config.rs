//! Agent and collector YAML configuration, loaded with `serde_yaml` and
//! validated before any worker starts — configuration errors are fatal at
//! startup.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

fn default_collector_address() -> String {
    "127.0.0.1".to_string()
}

fn default_collector_port() -> u16 {
    9999
}

fn default_cache_limit() -> usize {
    1024
}

fn default_active_timeout() -> f64 {
    1800.0
}

fn default_inactive_timeout() -> f64 {
    15.0
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    9999
}

fn default_workers() -> usize {
    1
}

fn default_token_ttl() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub interfaces: Vec<String>,
    #[serde(default = "default_collector_address")]
    pub collector_address: String,
    #[serde(default = "default_collector_port")]
    pub collector_port: u16,
    #[serde(default = "default_cache_limit")]
    pub cache_limit: usize,
    #[serde(default = "default_active_timeout")]
    pub cache_active_timeout: f64,
    #[serde(default = "default_inactive_timeout")]
    pub cache_inactive_timeout: f64,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    #[serde(default = "default_workers")]
    pub writers_number: usize,
    #[serde(default = "default_workers")]
    pub processors_number: usize,
    #[serde(default)]
    pub agents: HashMap<String, String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl: u64,
    pub db_name: String,
    #[serde(default)]
    pub influx_params: Option<InfluxParams>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InfluxParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("configuration file {path} does not exist"))]
    NotFound { path: String },
    #[snafu(display("failed to read configuration file {path}: {source}"))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("failed to parse YAML in {path}: {source}"))]
    Parse { path: String, source: serde_yaml::Error },
    #[snafu(display("agent configuration has no interfaces"))]
    NoInterfaces,
    #[snafu(display("interface {ifname} was not found on this host"))]
    UnknownInterface { ifname: String },
    #[snafu(display("agent configuration key is not valid base64: {source}"))]
    BadKey { source: crate::wire::TokenError },
    #[snafu(display("collector configuration has an empty agent whitelist"))]
    EmptyWhitelist,
}

fn load_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let path_str = path.display().to_string();
    if !path.exists() {
        return Err(ConfigError::NotFound { path: path_str });
    }
    let contents = std::fs::read_to_string(path).with_context(|_| ReadSnafu { path: path_str.clone() })?;
    serde_yaml::from_str(&contents).with_context(|_| ParseSnafu { path: path_str })
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: AgentConfig = load_yaml(path)?;
        config.validate(true)?;
        Ok(config)
    }

    /// Validates the parsed configuration: non-empty interface list,
    /// interfaces resolvable on the host (`check_interfaces` gated off
    /// because unit tests don't run on a fixed set of NICs), and a
    /// well-formed shared key.
    pub fn validate(&self, check_interfaces: bool) -> Result<(), ConfigError> {
        if self.interfaces.is_empty() {
            return Err(ConfigError::NoInterfaces);
        }
        if check_interfaces {
            let known = crate::agent::sniffer::list_interfaces();
            for ifname in &self.interfaces {
                if !known.contains(ifname) {
                    return Err(ConfigError::UnknownInterface { ifname: ifname.clone() });
                }
            }
        }
        crate::wire::SharedKey::from_base64(&self.key).context(BadKeySnafu)?;
        Ok(())
    }
}

impl CollectorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config: CollectorConfig = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::EmptyWhitelist);
        }
        for key in self.agents.values() {
            crate::wire::SharedKey::from_base64(key).context(BadKeySnafu)?;
        }
        Ok(())
    }
}
