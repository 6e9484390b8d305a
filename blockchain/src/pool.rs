// Standard library imports
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

// Third party imports
use futures::future::join_all;
use once_cell::sync::OnceCell;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

// Internal imports
use crate::{
    client::EthersClient,
    endpoint::{Endpoint, EndpointSpec, EndpointStats, DEFAULT_GROUP},
};
use flood_common::{
    error::{FloodError, FloodResult},
    task::{spawn_supervised, DEFAULT_RESTART_DELAY},
};

/// Group name matching every enabled endpoint
pub const ANY_GROUP: &str = "*";

/// How a pool picks one candidate out of several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Rotate through candidates
    RoundRobin,
    /// Uniformly random candidate
    Random,
    /// `index % candidates`
    ByIndex,
}

/// Endpoint pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPoolConfig {
    /// Interval between health checks (seconds)
    pub health_check_interval: u64,
    /// Interval after a check round that saw failures (seconds)
    pub health_retry_interval: u64,
    /// Consecutive failed checks before an endpoint is unhealthy
    pub unhealthy_after: u32,
    /// Blocks an endpoint may lag behind the highest one and stay healthy
    pub max_height_lag: u64,
    /// Timeout of a single RPC request (ms)
    pub request_timeout: u64,
}

impl Default for EndpointPoolConfig {
    fn default() -> Self {
        Self {
            health_check_interval: 30,
            health_retry_interval: 10,
            unhealthy_after: 3,
            max_height_lag: 2,
            request_timeout: 30_000,
        }
    }
}

/// Set of RPC endpoints with health tracking and selection policies
pub struct EndpointPool {
    endpoints: Vec<Arc<Endpoint>>,
    config: EndpointPoolConfig,
    chain_id: OnceCell<u64>,
    round_robin: AtomicUsize,
}

impl EndpointPool {
    pub fn new(endpoints: Vec<Arc<Endpoint>>, config: EndpointPoolConfig) -> Self {
        Self {
            endpoints,
            config,
            chain_id: OnceCell::new(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Builds `ethers`-backed endpoints from host strings. Hosts that cannot be
    /// parsed are logged and skipped.
    pub fn from_hosts(hosts: &[String], config: EndpointPoolConfig) -> Self {
        let timeout = Duration::from_millis(config.request_timeout);
        let mut endpoints = Vec::with_capacity(hosts.len());
        for host in hosts {
            let spec = match host.parse::<EndpointSpec>() {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(host = %host, error = %err, "skipping endpoint");
                    continue;
                }
            };
            match EthersClient::new(&spec.url, &spec.headers, timeout) {
                Ok(client) => {
                    endpoints.push(Arc::new(Endpoint::new(endpoints.len(), spec, Arc::new(client))))
                }
                Err(err) => warn!(endpoint = %spec.name, error = %err, "skipping endpoint"),
            }
        }
        Self::new(endpoints, config)
    }

    pub fn config(&self) -> &EndpointPoolConfig {
        &self.config
    }

    /// Chain id agreed on by the pool, `None` before [`prepare`](Self::prepare)
    pub fn chain_id(&self) -> Option<u64> {
        self.chain_id.get().copied()
    }

    /// Connects to every endpoint and establishes the chain id.
    ///
    /// The first reachable endpoint (in configured order) defines the chain id.
    /// Endpoints on another chain are disabled, unreachable ones stay unhealthy
    /// until a later check succeeds.
    pub async fn prepare(&self) -> FloodResult<u64> {
        let checks = join_all(self.endpoints.iter().map(|endpoint| async move {
            let chain_id = endpoint.chain_id().await;
            let height = endpoint.block_number().await;
            (endpoint, chain_id, height)
        }))
        .await;

        let mut reachable = 0usize;
        for (endpoint, chain_id, height) in checks {
            match (chain_id, height) {
                (Ok(chain_id), Ok(height)) => {
                    let expected = *self.chain_id.get_or_init(|| chain_id);
                    if chain_id != expected {
                        warn!(
                            endpoint = %endpoint.name(),
                            chain_id,
                            expected,
                            "endpoint serves another chain, disabling"
                        );
                        endpoint.set_enabled(false);
                        continue;
                    }
                    reachable += 1;
                    endpoint.record_check_success(height);
                    endpoint.set_healthy(true);
                }
                (Err(err), _) | (_, Err(err)) => {
                    warn!(endpoint = %endpoint.name(), error = %err, "endpoint unreachable");
                    endpoint.record_check_failure();
                    endpoint.set_healthy(false);
                }
            }
        }

        let chain_id = match self.chain_id.get() {
            Some(chain_id) if reachable > 0 => *chain_id,
            _ => return Err(FloodError::NoReachableEndpoint(self.endpoints.len())),
        };
        self.apply_height_lag();

        info!(
            chain_id,
            reachable,
            total = self.endpoints.len(),
            "endpoint pool prepared"
        );
        Ok(chain_id)
    }

    /// Checks every enabled endpoint once. Returns `true` if any check failed.
    pub async fn refresh_health(&self) -> bool {
        let enabled: Vec<&Arc<Endpoint>> = self.endpoints.iter().filter(|e| e.is_enabled()).collect();
        let results = join_all(enabled.iter().map(|endpoint| endpoint.block_number())).await;

        let mut any_failed = false;
        for (endpoint, result) in enabled.iter().zip(results) {
            match result {
                Ok(height) => {
                    endpoint.record_check_success(height);
                    endpoint.set_healthy(true);
                }
                Err(err) => {
                    any_failed = true;
                    let failures = endpoint.record_check_failure();
                    debug!(endpoint = %endpoint.name(), failures, error = %err, "health check failed");
                    if failures >= self.config.unhealthy_after {
                        endpoint.set_healthy(false);
                    }
                }
            }
        }
        self.apply_height_lag();
        any_failed
    }

    /// Marks responsive endpoints that lag too far behind the tip as unhealthy
    fn apply_height_lag(&self) {
        let responsive: Vec<&Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|e| e.is_enabled() && e.consecutive_failures() == 0)
            .collect();
        let highest = responsive.iter().map(|e| e.last_height()).max().unwrap_or(0);
        for endpoint in responsive {
            let in_sync = endpoint.last_height() + self.config.max_height_lag >= highest;
            endpoint.set_healthy(in_sync);
        }
    }

    /// Starts the background health check
    pub fn start_health_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let span = info_span!("endpoint_pool");
        let _entered = span.enter();
        spawn_supervised("endpoint_health", cancel.clone(), DEFAULT_RESTART_DELAY, move || {
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move {
                let mut delay = Duration::from_secs(pool.config.health_check_interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    let failed = pool.refresh_health().await;
                    delay = Duration::from_secs(if failed {
                        pool.config.health_retry_interval
                    } else {
                        pool.config.health_check_interval
                    });
                }
            }
        })
    }

    /// Every registered endpoint
    pub fn all(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.clone()
    }

    /// Enabled endpoints that passed their last health evaluation
    pub fn healthy(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.iter().filter(|e| e.is_available()).cloned().collect()
    }

    pub fn stats(&self) -> Vec<EndpointStats> {
        self.endpoints.iter().map(|e| e.stats()).collect()
    }

    /// Enabled endpoints matching `group`, healthy ones only if any are healthy.
    ///
    /// An empty group selects the `default` group and falls back to every enabled
    /// endpoint when that group is empty. `*` selects every enabled endpoint.
    pub fn candidates(&self, group: &str) -> Vec<Arc<Endpoint>> {
        let enabled = self.endpoints.iter().filter(|e| e.is_enabled());
        let mut matching: Vec<Arc<Endpoint>> = match group {
            ANY_GROUP => enabled.cloned().collect(),
            "" => {
                let defaults: Vec<_> = enabled.clone().filter(|e| e.has_group(DEFAULT_GROUP)).cloned().collect();
                if defaults.is_empty() {
                    enabled.cloned().collect()
                } else {
                    defaults
                }
            }
            name => enabled.filter(|e| e.has_group(name)).cloned().collect(),
        };

        if matching.iter().any(|e| e.is_healthy()) {
            matching.retain(|e| e.is_healthy());
        }
        matching
    }

    /// Picks one endpoint, `None` only if no enabled endpoint matches `group`
    pub fn get(&self, mode: SelectionMode, index: usize, group: &str) -> Option<Arc<Endpoint>> {
        let candidates = self.candidates(group);
        if candidates.is_empty() {
            return None;
        }
        let position = match mode {
            SelectionMode::ByIndex => index % candidates.len(),
            SelectionMode::Random => rand::thread_rng().gen_range(0..candidates.len()),
            SelectionMode::RoundRobin => {
                self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
        };
        Some(candidates[position].clone())
    }

    /// Like [`get`](Self::get) but never returns an endpoint listed in `exclude`
    pub fn get_excluding(&self, group: &str, exclude: &[usize]) -> Option<Arc<Endpoint>> {
        let candidates: Vec<_> = self
            .candidates(group)
            .into_iter()
            .filter(|e| !exclude.contains(&e.index()))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let position = self.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[position].clone())
    }

    /// Highest height any enabled endpoint reported, with the endpoint that reported it
    pub fn highest(&self) -> Option<(u64, Arc<Endpoint>)> {
        self.endpoints
            .iter()
            .filter(|e| e.is_available())
            .max_by_key(|e| e.last_height())
            .map(|e| (e.last_height(), e.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockChain;

    fn pool_with(chain: &Arc<MockChain>, hosts: &[&str]) -> (EndpointPool, Vec<Arc<crate::testing::MockClient>>) {
        let mut clients = Vec::new();
        let endpoints = hosts
            .iter()
            .enumerate()
            .map(|(i, host)| {
                let client = chain.client();
                clients.push(client.clone());
                Arc::new(Endpoint::new(i, host.parse().unwrap(), client))
            })
            .collect();
        (EndpointPool::new(endpoints, EndpointPoolConfig::default()), clients)
    }

    #[tokio::test]
    async fn test_prepare_fails_without_reachable_endpoint() {
        let chain = MockChain::new(1337);
        let (pool, clients) = pool_with(&chain, &["http://a", "http://b"]);
        for client in &clients {
            client.set_offline(true);
        }
        let err = pool.prepare().await.unwrap_err();
        assert!(matches!(err, FloodError::NoReachableEndpoint(2)));
    }

    #[tokio::test]
    async fn test_prepare_marks_unreachable_unhealthy() {
        let chain = MockChain::new(1337);
        let (pool, clients) = pool_with(&chain, &["http://a", "http://b", "http://c"]);
        clients[1].set_offline(true);
        assert_eq!(pool.prepare().await.unwrap(), 1337);
        let healthy: Vec<String> = pool.healthy().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(healthy, vec!["a".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn test_offline_endpoint_excluded_after_failed_checks() {
        let chain = MockChain::new(1337);
        let (pool, clients) = pool_with(&chain, &["http://a", "http://b", "http://c"]);
        pool.prepare().await.unwrap();
        assert_eq!(pool.healthy().len(), 3);

        clients[2].set_offline(true);
        for _ in 0..pool.config().unhealthy_after {
            pool.refresh_health().await;
        }
        assert_eq!(pool.healthy().len(), 2);
        for i in 0..50 {
            for mode in [SelectionMode::RoundRobin, SelectionMode::Random, SelectionMode::ByIndex] {
                let endpoint = pool.get(mode, i, "").unwrap();
                assert_ne!(endpoint.name(), "c");
            }
        }

        clients[2].set_offline(false);
        assert!(!pool.refresh_health().await);
        assert_eq!(pool.healthy().len(), 3);
    }

    #[tokio::test]
    async fn test_lagging_endpoint_unhealthy() {
        let chain = MockChain::new(1337);
        let (pool, clients) = pool_with(&chain, &["http://a", "http://b"]);
        chain.mine_empty_blocks(10);
        pool.prepare().await.unwrap();
        clients[1].set_height_override(Some(5));
        pool.refresh_health().await;
        let healthy: Vec<String> = pool.healthy().iter().map(|e| e.name().to_string()).collect();
        assert_eq!(healthy, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_group_selection() {
        let chain = MockChain::new(1337);
        let (pool, _clients) = pool_with(
            &chain,
            &["http://a", "group(builder)http://b", "group(builder,default)http://c"],
        );
        pool.prepare().await.unwrap();

        let builders: Vec<String> = pool.candidates("builder").iter().map(|e| e.name().to_string()).collect();
        assert_eq!(builders, vec!["b".to_string(), "c".to_string()]);
        let defaults: Vec<String> = pool.candidates("").iter().map(|e| e.name().to_string()).collect();
        assert_eq!(defaults, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(pool.candidates(ANY_GROUP).len(), 3);
        assert!(pool.get(SelectionMode::RoundRobin, 0, "missing").is_none());
        assert_eq!(pool.get(SelectionMode::ByIndex, 3, "builder").unwrap().name(), "c");
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let chain = MockChain::new(1337);
        let (pool, _clients) = pool_with(&chain, &["http://a", "http://b"]);
        pool.prepare().await.unwrap();
        let first = pool.get(SelectionMode::RoundRobin, 0, "").unwrap();
        let second = pool.get(SelectionMode::RoundRobin, 0, "").unwrap();
        assert_ne!(first.name(), second.name());
        let other = pool.get_excluding("", &[first.index()]).unwrap();
        assert_ne!(other.index(), first.index());
    }
}
