// Standard library imports
use std::{path::PathBuf, sync::Arc, time::Duration};

// Third party imports
use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

// Internal imports
use flood_blockchain::{EndpointPool, SelectionMode};
use flood_common::logger::init_logging;
use floodbot::{
    scenario::{self, ScenarioOptions},
    AccountPool, DispatchEngine, FloodConfig, RootAccount,
};

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Arc::new(FloodConfig::load(path.as_deref())?);
    let _log_guard = init_logging(&config.log)?;
    info!(config = ?config, "starting floodbot");

    // Scenario and refills stop first, the watcher keeps confirming the reclaim sweep
    let cancel = CancellationToken::new();
    let background = CancellationToken::new();

    let endpoints = Arc::new(EndpointPool::from_hosts(&config.rpc_hosts, config.endpoint_pool.clone()));
    let chain_id = endpoints.prepare().await.context("endpoint pool preparation failed")?;
    let health = endpoints.start_health_loop(background.clone());
    info!(chain_id, healthy = endpoints.healthy().len(), "endpoints ready");

    let endpoint = endpoints
        .get(SelectionMode::Random, 0, "")
        .context("no endpoint available")?;
    let root = RootAccount::init(&config.private_key, &endpoint).await?;
    info!(root = ?root.account().address(), balance = %root.account().balance(), "root account loaded");

    let engine = Arc::new(DispatchEngine::new(endpoints.clone(), config.dispatch.clone()));
    let watcher = engine.start(background.clone());

    let seed = match config.account_pool.seed.as_str() {
        "" => Uuid::new_v4().to_string(),
        seed => seed.to_string(),
    };
    let pool = Arc::new(AccountPool::new(
        config.scenario.name.clone(),
        root,
        engine.clone(),
        config.account_pool.clone(),
    ));
    pool.prepare(&seed).await.context("account pool preparation failed")?;
    let refill = pool.start_refill_loop(cancel.clone());

    let mut scenario = scenario::create(&config.scenario.name)?;
    scenario
        .init(ScenarioOptions {
            account_pool: pool.clone(),
            config: config.scenario.options.clone(),
            global_config: config.clone(),
        })
        .await?;

    info!(scenario = scenario.name(), wallets = pool.len(), "running scenario");
    tokio::select! {
        result = scenario.run(cancel.clone()) => {
            if let Err(err) = result {
                error!(error = %err, "scenario failed");
            }
        }
        _ = signal::ctrl_c() => info!("stop signal received"),
    }

    cancel.cancel();
    let _ = refill.await;
    let stop_timeout = Duration::from_secs(config.stop_timeout);
    match tokio::time::timeout(stop_timeout, pool.reclaim()).await {
        Ok(Ok(swept)) => info!(swept, "children reclaimed"),
        Ok(Err(err)) => warn!(error = %err, "reclaim failed"),
        Err(_) => warn!(timeout = ?stop_timeout, "reclaim timed out"),
    }
    background.cancel();
    let _ = tokio::join!(watcher, health);
    info!("floodbot stopped");
    Ok(())
}
