// Standard library imports
use std::path::Path;

// Third party imports
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use ethers::core::types::U256;
use serde::{de::DeserializeOwned, Deserialize, Deserializer};

use crate::units::parse_wei;

/// Prefix for environment overrides, e.g. `FLOOD__ACCOUNT_POOL__WALLET_COUNT=20`
pub const ENV_PREFIX: &str = "FLOOD";

/// Loads a configuration document from an optional file plus `FLOOD__*` environment
/// variables (a `.env` file in the working directory is honoured).
pub fn load_config<T: DeserializeOwned>(path: Option<&Path>) -> Result<T> {
    dotenv::dotenv().ok();

    let mut builder = Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }
    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .context("failed to read configuration sources")?
        .try_deserialize::<T>()
        .context("failed to deserialize configuration")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WeiRepr {
    Int(u64),
    Text(String),
}

/// Accepts wei amounts as integers, decimal strings or `0x` hex strings
pub fn deserialize_wei<'de, D>(deserializer: D) -> Result<U256, D::Error>
where
    D: Deserializer<'de>,
{
    match WeiRepr::deserialize(deserializer)? {
        WeiRepr::Int(value) => Ok(U256::from(value)),
        WeiRepr::Text(text) => parse_wei(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Amounts {
        #[serde(deserialize_with = "deserialize_wei")]
        small: U256,
        #[serde(deserialize_with = "deserialize_wei")]
        large: U256,
        #[serde(deserialize_with = "deserialize_wei")]
        hex: U256,
    }

    #[test]
    fn test_deserialize_wei_forms() {
        let json = r#"{"small": 21000, "large": "100000000000000000000", "hex": "0x10"}"#;
        let amounts: Amounts = serde_json::from_str(json).unwrap();
        assert_eq!(amounts.small, U256::from(21000));
        assert_eq!(amounts.large, U256::exp10(20));
        assert_eq!(amounts.hex, U256::from(16));
    }

    #[test]
    fn test_deserialize_wei_rejects_garbage() {
        let json = r#"{"small": "lots", "large": "1", "hex": "0x1"}"#;
        assert!(serde_json::from_str::<Amounts>(json).is_err());
    }
}
