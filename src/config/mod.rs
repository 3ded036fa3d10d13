//! Daemon configuration, loaded from a YAML file.
//!
//! Per-field `#[serde(default = "...")]` functions rather than a
//! single hand-rolled merge step, so a partial YAML document layers
//! cleanly over the built-in defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::ResourceLimits;

fn default_unix_domain_path() -> PathBuf {
    PathBuf::from("/tmp/warden.sock")
}

fn default_unix_domain_permissions() -> u32 {
    0o755
}

fn default_container_grace_time() -> u64 {
    300
}

fn default_container_rlimits() -> ResourceLimits {
    ResourceLimits {
        as_: Some(4_294_967_296),
        nofile: Some(8192),
        nproc: Some(512),
        ..Default::default()
    }
}

fn default_disk_quota_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfiguration {
    #[serde(default = "default_disk_quota_enabled")]
    pub disk_quota_enabled: bool,
}

impl Default for QuotaConfiguration {
    fn default() -> Self {
        Self {
            disk_quota_enabled: default_disk_quota_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfiguration {
    #[serde(default = "default_unix_domain_path")]
    pub unix_domain_path: PathBuf,

    #[serde(default = "default_unix_domain_permissions")]
    pub unix_domain_permissions: u32,

    pub container_rootfs_path: PathBuf,
    pub container_depot_path: PathBuf,
    pub container_script_path: PathBuf,

    #[serde(default = "default_container_grace_time")]
    pub container_grace_time: u64,

    #[serde(default = "default_container_rlimits")]
    pub container_rlimits: ResourceLimits,

    #[serde(default)]
    pub quota: QuotaConfiguration,
}

impl Default for ServerConfiguration {
    fn default() -> Self {
        Self {
            unix_domain_path: default_unix_domain_path(),
            unix_domain_permissions: default_unix_domain_permissions(),
            container_rootfs_path: PathBuf::new(),
            container_depot_path: PathBuf::new(),
            container_script_path: PathBuf::new(),
            container_grace_time: default_container_grace_time(),
            container_rlimits: default_container_rlimits(),
            quota: QuotaConfiguration::default(),
        }
    }
}

fn default_network_pool_start_address() -> String {
    "10.254.0.0".to_string()
}

fn default_network_pool_size() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfiguration {
    #[serde(default = "default_network_pool_start_address")]
    pub pool_start_address: String,

    #[serde(default = "default_network_pool_size")]
    pub pool_size: usize,

    #[serde(default)]
    pub deny_networks: Vec<String>,

    #[serde(default)]
    pub allow_networks: Vec<String>,
}

impl Default for NetworkConfiguration {
    fn default() -> Self {
        Self {
            pool_start_address: default_network_pool_start_address(),
            pool_size: default_network_pool_size(),
            deny_networks: Vec::new(),
            allow_networks: Vec::new(),
        }
    }
}

fn default_user_pool_start_uid() -> u32 {
    10000
}

fn default_user_pool_size() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfiguration {
    #[serde(default = "default_user_pool_start_uid")]
    pub pool_start_uid: u32,

    #[serde(default = "default_user_pool_size")]
    pub pool_size: usize,
}

impl Default for UserConfiguration {
    fn default() -> Self {
        Self {
            pool_start_uid: default_user_pool_start_uid(),
            pool_size: default_user_pool_size(),
        }
    }
}

/// Root configuration document, one field group per `## 4` subsystem
/// that needs runtime parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(default)]
    pub server: ServerConfiguration,

    #[serde(default)]
    pub network: NetworkConfiguration,

    #[serde(default)]
    pub user: UserConfiguration,
}

impl Configuration {
    /// Load from a YAML file on disk, layering file contents over the
    /// built-in defaults (missing keys keep their default value).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Configuration = serde_yaml::from_str(&contents)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = Configuration::default();
        assert_eq!(config.server.container_grace_time, 300);
        assert_eq!(config.server.unix_domain_permissions, 0o755);
        assert_eq!(config.server.container_rlimits.nofile, Some(8192));
        assert_eq!(config.server.container_rlimits.nproc, Some(512));
        assert!(config.server.quota.disk_quota_enabled);
        assert_eq!(config.network.pool_start_address, "10.254.0.0");
        assert_eq!(config.network.pool_size, 256);
        assert_eq!(config.user.pool_start_uid, 10000);
        assert_eq!(config.user.pool_size, 256);
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let yaml = "server:\n  container_grace_time: 60\n";
        let config: Configuration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.container_grace_time, 60);
        assert_eq!(config.network.pool_size, 256);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Configuration::load("/no/such/path.yml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
