// Standard library imports
use std::sync::Arc;

// Third party imports
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

// Internal imports
use super::{Scenario, ScenarioOptions};
use crate::{
    account_pool::{AccountPool, AccountSelection},
    dispatch::SendOptions,
    driver::{Driver, DriverOptions, SlotGuard, TxProducer},
};
use flood_blockchain::SelectionMode;
use flood_common::{error::FloodError, units::gwei_to_wei};
use flood_wallet::transfer_request;

/// Plain value transfer options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    /// Value per transfer (gwei)
    pub amount: u64,
    /// Random value between 0 and `amount`
    pub random_amount: bool,
    /// Random child as recipient instead of the next one
    pub random_target: bool,
    /// Fee cap override (gwei)
    pub base_fee: Option<f64>,
    /// Tip override (gwei)
    pub tip_fee: Option<f64>,
    pub gas_limit: u64,
    pub rebroadcast: bool,
    pub wallet_selection: AccountSelection,
    /// Endpoint group, the default group when empty
    pub endpoint_group: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            amount: 20,
            random_amount: false,
            random_target: false,
            base_fee: None,
            tip_fee: None,
            gas_limit: 21_000,
            rebroadcast: true,
            wallet_selection: AccountSelection::RoundRobin,
            endpoint_group: String::new(),
        }
    }
}

/// Sends value transfers between the pool's children
#[derive(Default)]
pub struct TransferScenario {
    options: TransferOptions,
    pool: Option<Arc<AccountPool>>,
    driver: DriverOptions,
}

impl TransferScenario {
    pub const NAME: &'static str = "transfer";

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }
}

#[async_trait]
impl Scenario for TransferScenario {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn init(&mut self, options: ScenarioOptions) -> Result<()> {
        if !options.config.is_null() {
            self.options = serde_json::from_value(options.config).context("invalid transfer options")?;
        }
        self.driver = options.global_config.driver.clone();
        self.pool = Some(options.account_pool);
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let pool = self.pool.clone().ok_or_else(|| anyhow!("transfer scenario not initialized"))?;
        let producer = Arc::new(TransferProducer {
            pool: pool.clone(),
            options: self.options.clone(),
        });
        let report = Driver::new(self.driver.clone())
            .with_block_stats(pool)
            .run(cancel, producer)
            .await?;
        info!(succeeded = report.succeeded, failed = report.failed, "transfer scenario finished");
        Ok(())
    }
}

struct TransferProducer {
    pool: Arc<AccountPool>,
    options: TransferOptions,
}

#[async_trait]
impl TxProducer for TransferProducer {
    async fn produce(&self, _cancel: CancellationToken, index: u64, slot: SlotGuard) -> Result<()> {
        let options = &self.options;
        let sender = self
            .pool
            .get(options.wallet_selection, index as usize)
            .context("account pool is empty")?;
        let target = if options.random_target {
            self.pool.get(AccountSelection::Random, 0)
        } else {
            self.pool.get(AccountSelection::ByIndex, index as usize + 1)
        }
        .map_or(sender.address(), |account| account.address());

        let amount = if options.random_amount {
            rand::thread_rng().gen_range(0..=options.amount)
        } else {
            options.amount
        };

        let engine = self.pool.engine();
        let endpoint = engine
            .endpoints()
            .get(SelectionMode::ByIndex, index as usize, &options.endpoint_group)
            .ok_or_else(|| FloodError::NoEndpoint(options.endpoint_group.clone()))?;
        let (fee_cap, tip) = engine.suggested_fees(&endpoint, options.base_fee, options.tip_fee).await?;

        let tx = transfer_request(target, gwei_to_wei(amount as f64), options.gas_limit, fee_cap, tip);
        let send_options = SendOptions::new()
            .endpoint(endpoint)
            .group(options.endpoint_group.clone())
            .rebroadcast(options.rebroadcast)
            .on_complete(move |_tx, result| slot.release(result.is_ok()));
        engine.send(&sender, tx, send_options).await?;
        Ok(())
    }
}
