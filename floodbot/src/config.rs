// Standard library imports
use std::{fmt, path::Path};

// Third party imports
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

// Internal imports
use crate::{
    account_pool::{AccountPoolConfig, MAX_BATCH_SIZE},
    dispatch::DispatchConfig,
    driver::DriverOptions,
};
use flood_blockchain::{EndpointPoolConfig, EndpointSpec};
use flood_common::{config::load_config, logger::LogConfig};

/// Scenario selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    /// Registered scenario name
    pub name: String,
    /// Scenario specific options, passed through untouched
    pub options: serde_json::Value,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            name: "transfer".to_string(),
            options: serde_json::Value::Null,
        }
    }
}

/// Process configuration
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodConfig {
    /// Endpoint specs, see [`EndpointSpec`]
    pub rpc_hosts: Vec<String>,
    /// Hex private key of the root account
    pub private_key: String,
    pub log: LogConfig,
    pub endpoint_pool: EndpointPoolConfig,
    pub account_pool: AccountPoolConfig,
    pub dispatch: DispatchConfig,
    pub driver: DriverOptions,
    pub scenario: ScenarioConfig,
    /// Grace period for teardown after a stop signal (seconds)
    pub stop_timeout: u64,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            rpc_hosts: Vec::new(),
            private_key: String::new(),
            log: LogConfig::default(),
            endpoint_pool: EndpointPoolConfig::default(),
            account_pool: AccountPoolConfig::default(),
            dispatch: DispatchConfig::default(),
            driver: DriverOptions::default(),
            scenario: ScenarioConfig::default(),
            stop_timeout: 30,
        }
    }
}

impl fmt::Debug for FloodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FloodConfig")
            .field("rpc_hosts", &self.rpc_hosts)
            .field("private_key", &"<redacted>")
            .field("log", &self.log)
            .field("endpoint_pool", &self.endpoint_pool)
            .field("account_pool", &self.account_pool)
            .field("dispatch", &self.dispatch)
            .field("driver", &self.driver)
            .field("scenario", &self.scenario)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

impl FloodConfig {
    /// Reads the optional file plus `FLOOD__` environment overrides and validates
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_hosts.is_empty() {
            bail!("rpc_hosts must list at least one endpoint");
        }
        for host in &self.rpc_hosts {
            if let Err(err) = host.parse::<EndpointSpec>() {
                bail!("invalid rpc host: {err}");
            }
        }
        if self.private_key.trim().is_empty() {
            bail!("private_key is required");
        }
        if self.account_pool.refill_interval == 0 {
            bail!("account_pool.refill_interval must be positive");
        }
        if self.account_pool.batch_size == 0 || self.account_pool.batch_size > MAX_BATCH_SIZE {
            bail!("account_pool.batch_size must be between 1 and {MAX_BATCH_SIZE}");
        }
        if self.dispatch.submit_attempts == 0 {
            bail!("dispatch.submit_attempts must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> FloodConfig {
        FloodConfig {
            rpc_hosts: vec!["http://127.0.0.1:8545".to_string()],
            private_key: "0x01".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = FloodConfig::default();
        assert_eq!(config.stop_timeout, 30);
        assert_eq!(config.dispatch.rebroadcast.max_attempts, 10);
        assert_eq!(config.scenario.name, "transfer");
    }

    #[test]
    fn test_validate() {
        assert!(valid().validate().is_ok());

        let mut config = valid();
        config.rpc_hosts.clear();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.rpc_hosts.push("name(x)".to_string());
        assert!(config.validate().is_err());

        let mut config = valid();
        config.account_pool.batch_size = MAX_BATCH_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let rendered = format!("{:?}", valid());
        assert!(!rendered.contains("0x01"));
    }

    #[test]
    fn test_partial_document() {
        let config: FloodConfig = serde_json::from_value(serde_json::json!({
            "rpc_hosts": ["http://a"],
            "private_key": "0x01",
            "account_pool": { "wallet_count": 5, "refill_balance": "1000000000000000000", "unknown": 1 },
            "dispatch": { "rebroadcast": { "max_attempts": 3 } }
        }))
        .unwrap();
        assert_eq!(config.account_pool.wallet_count, 5);
        assert_eq!(config.account_pool.refill_balance, ethers::types::U256::exp10(18));
        assert_eq!(config.dispatch.rebroadcast.max_attempts, 3);
        assert_eq!(config.dispatch.rebroadcast.base_interval, 20);
    }
}
