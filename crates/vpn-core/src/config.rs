//! vpn-indexer.toml configuration parser.
//!
//! Every section has defaults, so an empty file parses into a preprod
//! configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::WgSubnet;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("error parsing config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
    pub indexer: IndexerConfig,
    pub database: DatabaseConfig,
    pub vpn: VpnConfig,
    pub wireguard: WireguardConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub debug: bool,
    pub json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub address: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub script_address: String,
    pub reference_token: String,
    pub intersect_hash: String,
    pub intersect_slot: u64,
    /// Newline-delimited JSON chain events to replay.
    pub events: Option<PathBuf>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        // The block just before the preprod script and reference token appear.
        Self {
            script_address: "addr_test1zrmx2wvrdqurqgp2wg4v8v9g27zugxezyt75as9zkycyda2jduk3c6ecrpkrk8qqlr4ep37cx03ytlcn70n93zyemj6s4mgt63".to_string(),
            reference_token: "85b95fee1b7cf6f2a7dca818e77b901ff3c1b6aae4473219cf56902b.61646d696e".to_string(),
            intersect_hash: "833506cade5ebd129065f76bc13260147e185797e0f265658499b6d57fe5b584".to_string(),
            intersect_slot: 97_153_054,
            events: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.vpn-indexer"),
        }
    }
}

impl DatabaseConfig {
    pub fn db_path(&self) -> PathBuf {
        self.dir.join("state.redb")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VpnProtocol {
    #[default]
    Openvpn,
    Wireguard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VpnConfig {
    pub region: String,
    pub domain: String,
    pub port: u16,
    pub protocol: VpnProtocol,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            domain: "test.domain".to_string(),
            port: 443,
            protocol: VpnProtocol::default(),
        }
    }
}

impl VpnConfig {
    /// Hostname clients connect to in this region.
    pub fn host(&self) -> String {
        format!("{}.{}", self.region, self.domain)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    pub subnet: String,
    pub max_devices: usize,
    pub container_url: String,
    pub jwt_key_file: Option<PathBuf>,
    pub server_pubkey: String,
    pub endpoint: String,
    pub dns: String,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            subnet: "10.8.0".to_string(),
            max_devices: 3,
            container_url: "http://127.0.0.1:8080".to_string(),
            jwt_key_file: None,
            server_pubkey: String::new(),
            endpoint: String::new(),
            dns: "10.8.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub dir: PathBuf,
    pub timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./.vpn-indexer/ledger"),
            timeout_secs: 30,
            list_timeout_secs: 120,
            max_retries: 3,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Checks the settings the daemon cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vpn.region.trim().is_empty() {
            return Err(ConfigError::Invalid("vpn.region must be set".to_string()));
        }
        if self.vpn.domain.trim().is_empty() {
            return Err(ConfigError::Invalid("vpn.domain must be set".to_string()));
        }
        WgSubnet::parse(&self.wireguard.subnet)
            .map_err(|e| ConfigError::Invalid(format!("wireguard.subnet: {e}")))?;
        if self.wireguard.max_devices == 0 {
            return Err(ConfigError::Invalid(
                "wireguard.max_devices must be at least 1".to_string(),
            ));
        }
        if self.ledger.max_retries == 0 {
            return Err(ConfigError::Invalid(
                "ledger.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.metrics.port, 8081);
        assert_eq!(config.indexer.intersect_slot, 97_153_054);
        assert_eq!(config.wireguard.subnet, "10.8.0");
        assert_eq!(config.wireguard.max_devices, 3);
        assert_eq!(config.wireguard.dns, "10.8.0.1");
        assert_eq!(config.ledger.timeout_secs, 30);
        assert_eq!(config.ledger.list_timeout_secs, 120);
        assert_eq!(config.ledger.max_retries, 3);
        assert_eq!(config.vpn.protocol, VpnProtocol::Openvpn);
        assert_eq!(config.database.dir, PathBuf::from("./.vpn-indexer"));
    }

    #[test]
    fn parse_sections() {
        let config = Config::from_toml(
            r#"
[logging]
debug = true

[vpn]
region = "us-east"
domain = "vpn.example.com"
protocol = "wireguard"

[wireguard]
subnet = "10.9.1"
max_devices = 5
"#,
        )
        .unwrap();
        assert!(config.logging.debug);
        assert_eq!(config.vpn.protocol, VpnProtocol::Wireguard);
        assert_eq!(config.vpn.host(), "us-east.vpn.example.com");
        assert_eq!(config.wireguard.max_devices, 5);
        assert_eq!(config.vpn.port, 443);
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_missing_region_and_bad_subnet() {
        let config = Config::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.vpn.region = "eu-west".to_string();
        config.wireguard.subnet = "10.8".to_string();
        assert!(config.validate().is_err());

        config.wireguard.subnet = "10.8.0".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn unknown_protocol_is_a_parse_error() {
        let err = Config::from_toml("[vpn]\nprotocol = \"ipsec\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = Config::default();
        config.vpn.region = "ap-south".to_string();
        let text = config.to_toml_string().unwrap();
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.vpn.region, "ap-south");
    }

    #[test]
    fn example_config_is_valid() {
        let config = Config::from_toml(include_str!("../../../vpn-indexer.example.toml")).unwrap();
        config.validate().unwrap();
        assert_eq!(config.vpn.protocol, VpnProtocol::Wireguard);
        assert_eq!(config.indexer.events, None);
        assert_eq!(config.wireguard.jwt_key_file, None);
    }
}
