use serde::Deserialize;
use serde_inline_default::serde_inline_default;
use thiserror::Error;
use crate::context::{NetworkSettings, PollingSettings};
use crate::poll::Policy;

const DEFAULT_CONFIG: &str = include_str!("../../default.toml");

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    Read { path: String, err: std::io::Error },

    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
}

/// An imgcap.toml file.
#[derive(Deserialize, Debug)]
pub struct File {
    pub description: Option<String>,
    /// Without it the script bundled for the source VM's OS runs.
    pub script_uri: Option<String>,
    pub image_version_major: u32,
    #[serde(default = "Default::default")]
    pub polling: Polling,
    #[serde(default = "Default::default")]
    pub network: Network,
    pub azure: Azure,
}

impl Default for File {
    fn default() -> Self {
        // The default config is compiled into the program, so
        // make sure to test default() to catch panics compile-time.
        toml::from_str(DEFAULT_CONFIG).unwrap()
    }
}

impl File {
    /// The built-in defaults with every key set in `path` overriding its default.
    /// Tables are merged key by key, so a user file only needs the keys it changes.
    pub fn default_with_user_config_file(path: &str) -> Result<Self, Error> {
        let user = std::fs::read_to_string(path).map_err(|err| Error::Read {
            path: path.to_string(),
            err,
        })?;
        Self::merged(&user)
    }

    fn merged(user: &str) -> Result<Self, Error> {
        let mut merged: toml::Table = DEFAULT_CONFIG.parse()?;
        merge(&mut merged, user.parse()?);
        Ok(toml::Value::Table(merged).try_into()?)
    }
}

fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(overlay) if base.get(&key).is_some_and(toml::Value::is_table) => {
                if let Some(toml::Value::Table(base)) = base.get_mut(&key) {
                    merge(base, overlay);
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

#[serde_inline_default]
#[derive(Deserialize, Debug, Clone)]
pub struct Polling {
    #[serde_inline_default(30)]
    pub running_interval_secs: u64,
    #[serde_inline_default(7)]
    pub running_attempts: u32,
    #[serde_inline_default(15)]
    pub stopped_interval_secs: u64,
    #[serde_inline_default(11)]
    pub stopped_attempts: u32,
    /// Long-running resource manager operations.
    #[serde_inline_default(5)]
    pub operation_interval_secs: u64,
    #[serde_inline_default(360)]
    pub operation_attempts: u32,
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            running_interval_secs: 30,
            running_attempts: 7,
            stopped_interval_secs: 15,
            stopped_attempts: 11,
            operation_interval_secs: 5,
            operation_attempts: 360,
        }
    }
}

impl Polling {
    pub fn settings(&self) -> PollingSettings {
        PollingSettings {
            running: Policy::from_secs(self.running_interval_secs, self.running_attempts),
            stopped: Policy::from_secs(self.stopped_interval_secs, self.stopped_attempts),
        }
    }

    pub fn operation_policy(&self) -> Policy {
        Policy::from_secs(self.operation_interval_secs, self.operation_attempts)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Network {
    pub address_prefix: String,
    pub subnet_prefix: String,
    /// Inbound port opened on the temporary VM. Defaults to RDP or SSH
    /// depending on the source VM's OS.
    pub remote_admin_port: Option<u16>,
}

impl Default for Network {
    fn default() -> Self {
        let defaults = NetworkSettings::default();
        Self {
            address_prefix: defaults.address_prefix,
            subnet_prefix: defaults.subnet_prefix,
            remote_admin_port: defaults.remote_admin_port,
        }
    }
}

impl From<&Network> for NetworkSettings {
    fn from(network: &Network) -> Self {
        Self {
            address_prefix: network.address_prefix.clone(),
            subnet_prefix: network.subnet_prefix.clone(),
            remote_admin_port: network.remote_admin_port,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Azure {
    pub management_endpoint: String,
    pub authority_host: String,
    pub subscription: Option<String>,
}
