//! Scenario contract between the dispatch substrate and transaction builders.

mod transfer;

// Standard library imports
use std::sync::Arc;

// Third party imports
use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// Internal imports
use crate::{account_pool::AccountPool, config::FloodConfig};

pub use transfer::{TransferOptions, TransferScenario};

/// Everything a scenario gets at initialization
#[derive(Clone)]
pub struct ScenarioOptions {
    pub account_pool: Arc<AccountPool>,
    /// Scenario specific section of the configuration
    pub config: serde_json::Value,
    pub global_config: Arc<FloodConfig>,
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&mut self, options: ScenarioOptions) -> Result<()>;

    /// Runs until the scenario is done or `cancel` fires
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// Registered scenario names
pub const SCENARIOS: &[&str] = &[TransferScenario::NAME];

pub fn create(name: &str) -> Result<Box<dyn Scenario>> {
    match name {
        TransferScenario::NAME => Ok(Box::new(TransferScenario::default())),
        other => bail!("unknown scenario '{other}', available: {}", SCENARIOS.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create() {
        assert_eq!(create("transfer").unwrap().name(), "transfer");
        let err = create("nope").err().unwrap().to_string();
        assert!(err.contains("transfer"));
    }
}
