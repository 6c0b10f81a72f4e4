use serde::{Deserialize, Serialize};
use snapshot_lib::chain::Url;
use snapshot_lib::Address;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// `Registry` predeploy, the same on every Celo network.
pub const DEFAULT_REGISTRY: &str = "0x000000000000000000000000000000000000ce10";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error("no rpc url configured")]
    MissingRpcUrl,
    #[error("invalid rpc url {url:?}: {reason}")]
    InvalidRpcUrl { url: String, reason: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde(default)]
    pub rpc_url: String,
    #[serde(default = "default_registry_address")]
    pub registry_address: Address,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
    /// Signers whose misses are reported through `/monitored-health`.
    #[serde(default)]
    pub monitored_signers: Vec<Address>,
    /// Validator groups snapshotted every cycle.
    #[serde(default)]
    pub groups: Vec<Address>,
    #[serde(default = "default_proposal_concurrency")]
    pub proposal_concurrency: usize,
    /// Wallets whose combined balance is read every cycle. Empty disables the
    /// balance stage.
    #[serde(default)]
    pub balance_wallets: Vec<Address>,
}

fn default_registry_address() -> Address {
    Address::from_str(DEFAULT_REGISTRY).unwrap_or_default()
}

fn default_database_url() -> String {
    "sqlite://validator-monitor.db".to_string()
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_poll_interval_secs() -> u64 {
    3
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_metadata_timeout_secs() -> u64 {
    10
}

fn default_proposal_concurrency() -> usize {
    8
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            rpc_url: String::new(),
            registry_address: default_registry_address(),
            database_url: default_database_url(),
            listen_addr: default_listen_addr(),
            poll_interval_secs: default_poll_interval_secs(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
            monitored_signers: Vec::new(),
            groups: Vec::new(),
            proposal_concurrency: default_proposal_concurrency(),
            balance_wallets: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rpc_url()?;
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero("poll_interval_secs"));
        }
        if self.rpc_timeout_secs == 0 {
            return Err(ConfigError::Zero("rpc_timeout_secs"));
        }
        if self.metadata_timeout_secs == 0 {
            return Err(ConfigError::Zero("metadata_timeout_secs"));
        }
        if self.proposal_concurrency == 0 {
            return Err(ConfigError::Zero("proposal_concurrency"));
        }
        Ok(())
    }

    pub fn rpc_url(&self) -> Result<Url, ConfigError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigError::MissingRpcUrl);
        }
        Url::parse(self.rpc_url.trim()).map_err(|err| ConfigError::InvalidRpcUrl {
            url: self.rpc_url.clone(),
            reason: err.to_string(),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

/// Parses a comma separated address list. Hex digits may use any case and
/// empty entries are ignored.
pub fn parse_address_list(value: &str) -> Result<Vec<Address>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            Address::from_str(entry).map_err(|_| ConfigError::InvalidAddress(entry.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_strategy::proptest;

    #[proptest]
    fn address_lists_parse_in_any_case(
        #[strategy(proptest::collection::vec(any::<[u8; 20]>(), 0..8))] raw: Vec<[u8; 20]>,
        upper: bool,
    ) {
        let addresses = raw.into_iter().map(Address::from).collect::<Vec<_>>();
        let list = addresses
            .iter()
            .map(|address| {
                let digits = address
                    .iter()
                    .map(|byte| format!("{byte:02x}"))
                    .collect::<String>();
                let digits = if upper { digits.to_uppercase() } else { digits };
                format!(" 0x{digits} ")
            })
            .collect::<Vec<_>>()
            .join(",");
        prop_assert_eq!(parse_address_list(&list).unwrap(), addresses);
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: MonitorConfig = toml::from_str(r#"rpc_url = "http://localhost:8545""#).unwrap();
        assert_eq!(
            config,
            MonitorConfig {
                rpc_url: "http://localhost:8545".to_string(),
                ..Default::default()
            }
        );
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.poll_interval(), Duration::from_secs(3));
        assert_eq!(config.registry_address.as_slice()[18..], [0xce, 0x10]);
        assert!(config.registry_address.as_slice()[..18].iter().all(|b| *b == 0));
        config.validate().unwrap();
    }

    #[test]
    fn full_config_parses() {
        let config: MonitorConfig = toml::from_str(
            r#"
            rpc_url = "https://forno.celo.org"
            database_url = "sqlite::memory:"
            listen_addr = "127.0.0.1:8080"
            poll_interval_secs = 5
            monitored_signers = ["0x00000000000000000000000000000000000000AA"]
            groups = ["0x00000000000000000000000000000000000000bb"]
            proposal_concurrency = 2
            balance_wallets = ["0x00000000000000000000000000000000000000Cc"]
            "#,
        )
        .unwrap();
        assert_eq!(config.monitored_signers, vec![Address::with_last_byte(0xaa)]);
        assert_eq!(config.groups, vec![Address::with_last_byte(0xbb)]);
        assert_eq!(config.balance_wallets, vec![Address::with_last_byte(0xcc)]);
        assert_eq!(config.rpc_url().unwrap().host_str(), Some("forno.celo.org"));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(toml::from_str::<MonitorConfig>("rpc = 'x'").is_err());
    }

    #[test]
    fn validation_errors() {
        let config = MonitorConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingRpcUrl)));

        let config = MonitorConfig {
            rpc_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRpcUrl { .. })
        ));

        let config = MonitorConfig {
            rpc_url: "http://localhost:8545".to_string(),
            proposal_concurrency: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("proposal_concurrency"))
        ));
    }

    #[test]
    fn address_lists_ignore_case_and_blanks() {
        let parsed = parse_address_list(
            " 0x00000000000000000000000000000000000000aA, ,0x00000000000000000000000000000000000000BB ",
        )
        .unwrap();
        assert_eq!(
            parsed,
            vec![Address::with_last_byte(0xaa), Address::with_last_byte(0xbb)]
        );
        assert!(parse_address_list("").unwrap().is_empty());
        assert!(matches!(
            parse_address_list("0x1234"),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
