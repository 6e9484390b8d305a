// Standard library imports
use std::{
    fmt,
    future::Future,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

// Third party imports
use ethers::{
    providers::{Http, Provider},
    types::{Address, Block, Bytes, Transaction, TransactionReceipt, H256, U256},
};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, info, warn};

// Internal imports
use crate::client::RpcClient;
use flood_common::{error::RpcError, units::gwei_to_wei};

/// How long fee suggestions and heights are served from cache
pub const CACHE_TTL: Duration = Duration::from_secs(12);

/// Group every endpoint belongs to unless configured otherwise
pub const DEFAULT_GROUP: &str = "default";

/// Tip used when the node does not implement `eth_maxPriorityFeePerGas`
const FALLBACK_TIP_GWEI: f64 = 2.0;

/// Configured endpoint, parsed from strings like
/// `group(fast,archive)name(geth-1)headers(X-Key:abc|X-Team:load)http://10.0.0.1:8545`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointSpec {
    pub url: String,
    pub name: String,
    pub groups: Vec<String>,
    pub headers: Vec<(String, String)>,
}

impl FromStr for EndpointSpec {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut rest = input.trim();
        let mut name = None;
        let mut groups = Vec::new();
        let mut headers = Vec::new();

        loop {
            let Some((key, after_key)) = ["group(", "name(", "headers("]
                .iter()
                .find_map(|prefix| rest.strip_prefix(prefix).map(|r| (*prefix, r)))
            else {
                break;
            };
            let end = after_key
                .find(')')
                .ok_or_else(|| format!("unterminated {key}..) in endpoint '{input}'"))?;
            let value = &after_key[..end];
            rest = &after_key[end + 1..];

            match key {
                "group(" => groups.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|g| !g.is_empty())
                        .map(str::to_string),
                ),
                "name(" => name = Some(value.trim().to_string()),
                _ => {
                    for pair in value.split('|').filter(|p| !p.is_empty()) {
                        let (k, v) = pair
                            .split_once(':')
                            .ok_or_else(|| format!("invalid header '{pair}' in endpoint '{input}'"))?;
                        headers.push((k.trim().to_string(), v.trim().to_string()));
                    }
                }
            }
        }

        if rest.is_empty() {
            return Err(format!("missing url in endpoint '{input}'"));
        }
        if groups.is_empty() {
            groups.push(DEFAULT_GROUP.to_string());
        }
        let url = rest.to_string();
        let name = name.unwrap_or_else(|| host_of(&url));

        Ok(Self { url, name, groups, headers })
    }
}

fn host_of(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Point-in-time view of an endpoint for observability consumers
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub name: String,
    pub url: String,
    pub groups: Vec<String>,
    pub enabled: bool,
    pub healthy: bool,
    pub last_height: u64,
    pub total_requests: u64,
    pub tx_requests: u64,
    pub failures: u64,
}

/// Network fee view of one endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSnapshot {
    /// `eth_gasPrice`
    pub gas_price: U256,
    /// Suggested priority fee
    pub tip: U256,
    /// Base fee of the latest block, zero before London
    pub base_fee: U256,
}

#[derive(Debug, Clone, Copy)]
struct CachedFees {
    fetched_at: Instant,
    snapshot: FeeSnapshot,
}

/// One RPC node with health state and request counters.
///
/// All chain access goes through the forwarding methods so that counters stay
/// accurate and connectivity failures flip the health flag immediately.
pub struct Endpoint {
    index: usize,
    spec: EndpointSpec,
    client: Arc<dyn RpcClient>,
    enabled: AtomicBool,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    last_height: AtomicU64,
    last_seen: Mutex<Option<Instant>>,
    total_requests: AtomicU64,
    tx_requests: AtomicU64,
    failures: AtomicU64,
    fee_cache: tokio::sync::Mutex<Option<CachedFees>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("index", &self.index)
            .field("name", &self.spec.name)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

impl Endpoint {
    /// Wraps a client. New endpoints start enabled and unhealthy until checked.
    pub fn new(index: usize, spec: EndpointSpec, client: Arc<dyn RpcClient>) -> Self {
        Self {
            index,
            spec,
            client,
            enabled: AtomicBool::new(true),
            healthy: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_height: AtomicU64::new(0),
            last_seen: Mutex::new(None),
            total_requests: AtomicU64::new(0),
            tx_requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            fee_cache: tokio::sync::Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn url(&self) -> &str {
        &self.spec.url
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.spec.groups.iter().any(|g| g == group)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Usable for selection
    pub fn is_available(&self) -> bool {
        self.is_enabled() && self.is_healthy()
    }

    pub fn last_height(&self) -> u64 {
        self.last_height.load(Ordering::Acquire)
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen.lock().ok().and_then(|seen| *seen)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Underlying `ethers` provider for scenario-specific calls
    pub fn provider(&self) -> Option<Arc<Provider<Http>>> {
        self.client.provider()
    }

    pub fn stats(&self) -> EndpointStats {
        EndpointStats {
            name: self.spec.name.clone(),
            url: self.spec.url.clone(),
            groups: self.spec.groups.clone(),
            enabled: self.is_enabled(),
            healthy: self.is_healthy(),
            last_height: self.last_height(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            tx_requests: self.tx_requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        if was != healthy {
            if healthy {
                info!(endpoint = %self.spec.name, height = self.last_height(), "endpoint healthy");
            } else {
                warn!(
                    endpoint = %self.spec.name,
                    failures = self.consecutive_failures(),
                    "endpoint unhealthy"
                );
            }
            metrics::gauge!(
                "floodbot_endpoint_healthy",
                if healthy { 1.0 } else { 0.0 },
                "endpoint" => self.spec.name.clone()
            );
        }
    }

    /// Records a successful health check. Health is decided by the pool, which knows the
    /// highest height across endpoints.
    pub(crate) fn record_check_success(&self, height: u64) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_height.store(height, Ordering::Release);
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Some(Instant::now());
        }
    }

    /// Records a failed health check and returns the consecutive failure count
    pub(crate) fn record_check_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    async fn track<T, F>(&self, is_tx: bool, request: F) -> Result<T, RpcError>
    where
        F: Future<Output = Result<T, RpcError>>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if is_tx {
            self.tx_requests.fetch_add(1, Ordering::Relaxed);
        }
        counter!(
            "floodbot_rpc_requests_total",
            1,
            "endpoint" => self.spec.name.clone(),
            "kind" => if is_tx { "tx" } else { "query" }
        );

        let result = request.await;
        if let Err(err) = &result {
            self.failures.fetch_add(1, Ordering::Relaxed);
            counter!("floodbot_rpc_failures_total", 1, "endpoint" => self.spec.name.clone());
            if err.is_connectivity() {
                debug!(endpoint = %self.spec.name, error = %err, "connectivity failure");
                self.set_healthy(false);
            }
        }
        result
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        self.track(false, self.client.chain_id()).await
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let height = self.track(false, self.client.block_number()).await?;
        self.last_height.fetch_max(height, Ordering::AcqRel);
        Ok(height)
    }

    pub async fn block_with_txs(&self, number: u64) -> Result<Option<Block<Transaction>>, RpcError> {
        self.track(false, self.client.block_with_txs(number)).await
    }

    pub async fn block_receipts(&self, number: u64) -> Result<Vec<TransactionReceipt>, RpcError> {
        self.track(false, self.client.block_receipts(number)).await
    }

    pub async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, RpcError> {
        self.track(false, self.client.transaction_receipt(hash)).await
    }

    pub async fn nonce(&self, address: Address, pending: bool) -> Result<u64, RpcError> {
        self.track(false, self.client.nonce(address, pending)).await
    }

    pub async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        self.track(false, self.client.balance(address)).await
    }

    pub async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError> {
        self.track(true, self.client.send_raw_transaction(raw)).await
    }

    /// Network fee suggestion, cached for [`CACHE_TTL`]
    pub async fn fee_snapshot(&self) -> Result<FeeSnapshot, RpcError> {
        let mut cache = self.fee_cache.lock().await;
        if let Some(cached) = *cache {
            if cached.fetched_at.elapsed() < CACHE_TTL {
                return Ok(cached.snapshot);
            }
        }

        let gas_price = self.track(false, self.client.gas_price()).await?;
        let tip = match self.track(false, self.client.max_priority_fee()).await {
            Ok(tip) => tip,
            Err(err) => {
                debug!(endpoint = %self.spec.name, error = %err, "tip suggestion unavailable");
                gwei_to_wei(FALLBACK_TIP_GWEI)
            }
        };
        let base_fee = self
            .track(false, self.client.base_fee())
            .await?
            .unwrap_or_default();

        let snapshot = FeeSnapshot { gas_price, tip, base_fee };
        *cache = Some(CachedFees {
            fetched_at: Instant::now(),
            snapshot,
        });
        Ok(snapshot)
    }

    /// Drops the cached fee suggestion, used after a node rejected our fees
    pub async fn invalidate_fee_cache(&self) {
        *self.fee_cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRpcClient;

    #[test]
    fn test_parse_plain_url() {
        let spec: EndpointSpec = "http://10.0.0.1:8545/rpc".parse().unwrap();
        assert_eq!(spec.url, "http://10.0.0.1:8545/rpc");
        assert_eq!(spec.name, "10.0.0.1:8545");
        assert_eq!(spec.groups, vec!["default".to_string()]);
        assert!(spec.headers.is_empty());
    }

    #[test]
    fn test_parse_prefixed_url() {
        let spec: EndpointSpec = "group(fast, archive)name(geth-1)headers(X-Key:abc|X-Team:load)https://node"
            .parse()
            .unwrap();
        assert_eq!(spec.name, "geth-1");
        assert_eq!(spec.groups, vec!["fast".to_string(), "archive".to_string()]);
        assert_eq!(
            spec.headers,
            vec![
                ("X-Key".to_string(), "abc".to_string()),
                ("X-Team".to_string(), "load".to_string())
            ]
        );
        assert_eq!(spec.url, "https://node");
    }

    #[test]
    fn test_parse_errors() {
        assert!("group(a".parse::<EndpointSpec>().is_err());
        assert!("name(x)".parse::<EndpointSpec>().is_err());
        assert!("headers(novalue)http://x".parse::<EndpointSpec>().is_err());
    }

    #[tokio::test]
    async fn test_counters_and_connectivity_failure() {
        let mut client = MockRpcClient::new();
        client
            .expect_send_raw_transaction()
            .times(1)
            .returning(|_| Err(RpcError::Connection("refused".into())));
        client.expect_block_number().times(1).returning(|| Ok(42));

        let spec: EndpointSpec = "http://a".parse().unwrap();
        let endpoint = Endpoint::new(0, spec, Arc::new(client));
        endpoint.set_healthy(true);

        assert_eq!(endpoint.block_number().await.unwrap(), 42);
        assert!(endpoint.send_raw_transaction(Bytes::default()).await.is_err());

        let stats = endpoint.stats();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.tx_requests, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.last_height, 42);
        assert!(!endpoint.is_healthy());
    }

    #[tokio::test]
    async fn test_fee_suggestion_cached_with_tip_fallback() {
        let mut client = MockRpcClient::new();
        client
            .expect_gas_price()
            .times(1)
            .returning(|| Ok(U256::from(30_000_000_000u64)));
        client
            .expect_max_priority_fee()
            .times(1)
            .returning(|| Err(RpcError::Rejected { code: -32601, message: "method not found".into() }));
        client
            .expect_base_fee()
            .times(1)
            .returning(|| Ok(Some(U256::from(7_000_000_000u64))));

        let endpoint = Endpoint::new(0, "http://a".parse().unwrap(), Arc::new(client));
        let first = endpoint.fee_snapshot().await.unwrap();
        let second = endpoint.fee_snapshot().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.tip, gwei_to_wei(2.0));
        assert_eq!(first.base_fee, U256::from(7_000_000_000u64));
    }
}
