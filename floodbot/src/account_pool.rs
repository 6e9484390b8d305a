//! Root account plus derived child accounts for one run, with funding and refills.

// Standard library imports
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

// Third party imports
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, U256, U64};
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

// Internal imports
use crate::dispatch::{funding_fees, reclaim_fees, suggested_fees, DispatchEngine, SendOptions, ROOT_POOL};
use flood_blockchain::{Endpoint, SelectionMode};
use flood_common::{
    config::deserialize_wei,
    error::{FloodError, FloodResult},
    task::{spawn_supervised, DEFAULT_RESTART_DELAY},
    units::ether,
};
use flood_wallet::{transfer_request, Account};

/// Transfers packed into one batcher call
pub const MAX_BATCH_SIZE: usize = 50;

const BATCHER_BASE_GAS: u64 = 50_000;
const BATCHER_GAS_PER_TRANSFER: u64 = 35_000;

/// Low balance notifications arriving within this window share one funding round
const FUNDING_AGGREGATION: Duration = Duration::from_secs(30);
/// Minimum spacing between funding rounds
const MIN_FUNDING_GAP: Duration = Duration::from_secs(30);
/// Delay before a failed funding round is retried
const FUNDING_RETRY_DELAY: Duration = Duration::from_secs(60);

/// How [`AccountPool::get`] picks a child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSelection {
    RoundRobin,
    Random,
    /// `index % len`
    ByIndex,
    /// Fewest unconfirmed transactions, ties broken by `index`
    ByPendingCount,
}

/// Account pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountPoolConfig {
    /// Child key derivation seed, a random one is used when empty
    pub seed: String,
    /// Balance a refilled child ends up with at least (wei)
    #[serde(deserialize_with = "deserialize_wei")]
    pub refill_amount: U256,
    /// Refill threshold (wei)
    #[serde(deserialize_with = "deserialize_wei")]
    pub refill_balance: U256,
    /// Interval between balance checks (seconds)
    pub refill_interval: u64,
    /// Number of child accounts
    pub wallet_count: u64,
    /// Gas limit of funding and reclaim transfers
    pub funding_gas_limit: u64,
    /// Pre-deployed batcher contract, individual transfers when unset
    pub batcher_address: Option<Address>,
    /// Transfers per batcher call
    pub batch_size: usize,
}

impl Default for AccountPoolConfig {
    fn default() -> Self {
        Self {
            seed: String::new(),
            refill_amount: ether() * 5,
            refill_balance: ether(),
            refill_interval: 600,
            wallet_count: 0,
            funding_gas_limit: 21_000,
            batcher_address: None,
            batch_size: MAX_BATCH_SIZE,
        }
    }
}

/// Root account shared by every pool of a process. Funding rounds from it run one
/// at a time.
pub struct RootAccount {
    account: Arc<Account>,
    funding_lock: Mutex<()>,
}

impl RootAccount {
    pub fn new(account: Arc<Account>) -> Arc<Self> {
        Arc::new(Self {
            account,
            funding_lock: Mutex::new(()),
        })
    }

    pub async fn init(private_key: &str, endpoint: &Endpoint) -> FloodResult<Arc<Self>> {
        Ok(Self::new(Account::init_root(private_key, endpoint).await?))
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }
}

/// Amount a child has to receive
#[derive(Debug, Clone)]
pub struct FundingRequest {
    pub account: Arc<Account>,
    pub amount: U256,
}

/// Transfer that lifts `balance` to at least `refill_amount` and above `refill_balance`
pub fn funding_amount(balance: U256, refill_amount: U256, refill_balance: U256) -> U256 {
    refill_amount.max(refill_balance.saturating_sub(balance))
}

/// Batcher calldata: one 32 byte word per transfer, the recipient followed by a
/// 96 bit amount
pub fn batch_calldata(requests: &[FundingRequest]) -> FloodResult<Bytes> {
    let mut data = Vec::with_capacity(requests.len() * 32);
    for request in requests {
        if request.amount.bits() > 96 {
            return Err(FloodError::InvalidTransaction(format!(
                "batched amount {} exceeds 96 bits",
                request.amount
            )));
        }
        let mut word = [0u8; 32];
        request.amount.to_big_endian(&mut word);
        word[..20].copy_from_slice(request.account.address().as_bytes());
        data.extend_from_slice(&word);
    }
    Ok(data.into())
}

/// Child accounts of one run
pub struct AccountPool {
    id: String,
    root: Arc<RootAccount>,
    engine: Arc<DispatchEngine>,
    config: AccountPoolConfig,
    wallet_count: AtomicU64,
    children: RwLock<Vec<Arc<Account>>>,
    prepared: AtomicBool,
    reclaimed: AtomicBool,
    round_robin: AtomicUsize,
    low_balance: Arc<Notify>,
}

impl AccountPool {
    pub fn new(
        id: impl Into<String>,
        root: Arc<RootAccount>,
        engine: Arc<DispatchEngine>,
        config: AccountPoolConfig,
    ) -> Self {
        Self {
            id: id.into(),
            root,
            engine,
            wallet_count: AtomicU64::new(config.wallet_count),
            config,
            children: RwLock::new(Vec::new()),
            prepared: AtomicBool::new(false),
            reclaimed: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            low_balance: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn root(&self) -> &Arc<RootAccount> {
        &self.root
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn config(&self) -> &AccountPoolConfig {
        &self.config
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::Acquire)
    }

    /// Fixes the number of children, only before [`prepare`](Self::prepare)
    pub fn set_count(&self, count: u64) -> FloodResult<()> {
        if self.is_prepared() {
            return Err(FloodError::Config("wallet count is fixed once the pool is prepared".to_string()));
        }
        self.wallet_count.store(count, Ordering::Release);
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.wallet_count.load(Ordering::Acquire)
    }

    pub fn children(&self) -> Vec<Arc<Account>> {
        self.children.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn endpoint(&self) -> FloodResult<Arc<Endpoint>> {
        self.engine
            .endpoints()
            .get(SelectionMode::Random, 0, "")
            .ok_or_else(|| FloodError::NoEndpoint(String::new()))
    }

    /// Derives the children from `seed`, loads their state and funds every child
    /// below `refill_balance`. Fails without sending anything when the root cannot
    /// cover the funding.
    pub async fn prepare(&self, seed: &str) -> FloodResult<()> {
        if self.is_prepared() {
            return Err(FloodError::Config(format!("account pool {} already prepared", self.id)));
        }
        let endpoint = self.endpoint()?;
        let count = self.count();

        let children = (0..count)
            .map(|index| self.root.account.derive_child(index, seed).map(Arc::new))
            .collect::<FloodResult<Vec<_>>>()?;
        for result in join_all(children.iter().map(|child| child.sync(&endpoint))).await {
            result?;
        }

        self.engine.track_accounts(ROOT_POOL, std::slice::from_ref(&self.root.account));
        self.engine.track_accounts(&self.id, &children);
        for child in &children {
            child.watch_low_balance(self.config.refill_balance, self.low_balance.clone());
        }

        let requests = self.funding_requests(&children);
        info!(
            pool = %self.id,
            children = children.len(),
            underfunded = requests.len(),
            "account pool derived"
        );
        self.fund(requests).await?;

        *self.children.write().unwrap_or_else(|p| p.into_inner()) = children;
        self.prepared.store(true, Ordering::Release);
        Ok(())
    }

    fn funding_requests(&self, accounts: &[Arc<Account>]) -> Vec<FundingRequest> {
        accounts
            .iter()
            .filter(|account| account.balance() < self.config.refill_balance)
            .map(|account| FundingRequest {
                account: account.clone(),
                amount: funding_amount(account.balance(), self.config.refill_amount, self.config.refill_balance),
            })
            .collect()
    }

    /// Picks one child, `None` before preparation
    pub fn get(&self, selection: AccountSelection, index: usize) -> Option<Arc<Account>> {
        let children = self.children.read().unwrap_or_else(|p| p.into_inner());
        if children.is_empty() {
            return None;
        }
        let position = match selection {
            AccountSelection::ByIndex => index % children.len(),
            AccountSelection::Random => rand::thread_rng().gen_range(0..children.len()),
            AccountSelection::RoundRobin => self.round_robin.fetch_add(1, Ordering::Relaxed) % children.len(),
            AccountSelection::ByPendingCount => {
                let least = children.iter().map(|c| c.pending_count()).min().unwrap_or(0);
                let ties: Vec<usize> = children
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.pending_count() == least)
                    .map(|(i, _)| i)
                    .collect();
                ties[index % ties.len()]
            }
        };
        Some(children[position].clone())
    }

    /// Reloads child balances and funds the ones below `refill_balance`
    pub async fn refill_once(&self) -> FloodResult<()> {
        if self.is_reclaimed() {
            return Ok(());
        }
        let endpoint = self.endpoint()?;
        let children = self.children();
        let balances = join_all(children.iter().map(|child| endpoint.balance(child.address()))).await;
        for (child, balance) in children.iter().zip(balances) {
            child.set_balance(balance?);
        }

        let requests = self.funding_requests(&children);
        if requests.is_empty() {
            debug!(pool = %self.id, "balances checked, no funding needed");
            return Ok(());
        }
        self.fund(requests).await
    }

    /// Sends the requested amounts from the root, batched when a batcher is configured
    pub async fn fund(&self, requests: Vec<FundingRequest>) -> FloodResult<()> {
        if requests.is_empty() {
            return Ok(());
        }
        let root = &self.root.account;
        let _lock = self.root.funding_lock.lock().await;

        let endpoint = self.endpoint()?;
        root.sync(&endpoint).await?;
        let (fee_cap, tip) = suggested_fees(&endpoint, None, None).await?;
        let (fee_cap, tip) = funding_fees(fee_cap, tip);

        let batches: Vec<Vec<FundingRequest>> = match self.config.batcher_address {
            Some(_) => requests
                .chunks(self.config.batch_size.clamp(1, MAX_BATCH_SIZE))
                .map(|chunk| chunk.to_vec())
                .collect(),
            None => requests.into_iter().map(|r| vec![r]).collect(),
        };

        let mut txs = Vec::with_capacity(batches.len());
        let mut required = U256::zero();
        for batch in &batches {
            let value = batch.iter().fold(U256::zero(), |sum, r| sum.saturating_add(r.amount));
            let tx = match self.config.batcher_address {
                None => transfer_request(
                    batch[0].account.address(),
                    value,
                    self.config.funding_gas_limit,
                    fee_cap,
                    tip,
                ),
                Some(batcher) => {
                    let gas = BATCHER_BASE_GAS + BATCHER_GAS_PER_TRANSFER * batch.len() as u64;
                    Eip1559TransactionRequest::new()
                        .to(batcher)
                        .value(value)
                        .data(batch_calldata(batch)?)
                        .gas(gas)
                        .max_fee_per_gas(fee_cap)
                        .max_priority_fee_per_gas(tip)
                        .into()
                }
            };
            let gas = tx.gas().copied().unwrap_or_default();
            required = required
                .saturating_add(value)
                .saturating_add(gas.saturating_mul(fee_cap));
            txs.push(tx);
        }

        let available = root.balance();
        if available < required {
            return Err(FloodError::InsufficientRootFunds { required, available });
        }

        info!(pool = %self.id, txs = txs.len(), total = %required, "funding child accounts");
        let results = join_all(
            txs.into_iter()
                .map(|tx| {
                    let options = SendOptions::new().endpoint(endpoint.clone()).rebroadcast(true);
                    self.engine.send_and_await(root, tx, options)
                }),
        )
        .await;

        let mut first_error = None;
        for (batch, result) in batches.iter().zip(results) {
            match result {
                Ok(receipt) if succeeded(&receipt) => {
                    for request in batch {
                        request.account.add_balance(request.amount);
                    }
                }
                Ok(receipt) => {
                    warn!(pool = %self.id, tx = ?receipt.transaction_hash, "funding transaction reverted");
                    first_error.get_or_insert(FloodError::InvalidTransaction("funding transaction reverted".to_string()));
                }
                Err(err) => {
                    warn!(pool = %self.id, error = %err, "funding transaction failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Starts the periodic and low-balance triggered refill checks
    pub fn start_refill_loop(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let span = info_span!("account_pool", pool = %self.id);
        let _entered = span.enter();
        spawn_supervised("account_refill", cancel.clone(), DEFAULT_RESTART_DELAY, move || {
            let pool = pool.clone();
            let cancel = cancel.clone();
            async move {
                let interval = Duration::from_secs(pool.config.refill_interval.max(1));
                let mut next_check = Instant::now() + interval;
                let mut aggregation: Option<Instant> = None;
                let mut last_funding: Option<Instant> = None;

                loop {
                    let deadline = aggregation.map_or(next_check, |at| at.min(next_check));
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = pool.low_balance.notified(), if aggregation.is_none() => {
                            debug!("low balance reported, aggregating");
                            aggregation = Some(Instant::now() + FUNDING_AGGREGATION);
                            continue;
                        }
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                    if pool.is_reclaimed() {
                        return;
                    }
                    if let Some(last) = last_funding {
                        if last.elapsed() < MIN_FUNDING_GAP {
                            aggregation = Some(last + MIN_FUNDING_GAP);
                            continue;
                        }
                    }

                    aggregation = None;
                    last_funding = Some(Instant::now());
                    let delay = match pool.refill_once().await {
                        Ok(()) => interval,
                        Err(err) => {
                            warn!(error = %err, "refill failed, retrying later");
                            FUNDING_RETRY_DELAY
                        }
                    };
                    next_check = Instant::now() + delay;
                }
            }
        })
    }

    /// Sweeps every child's balance minus the transfer fee back to the root.
    /// Failures are logged per child. Funding stops for good afterwards.
    /// Returns the number of children swept.
    pub async fn reclaim(&self) -> FloodResult<usize> {
        self.reclaimed.store(true, Ordering::Release);
        let endpoint = self.endpoint()?;
        let target = self.root.account.address();
        let children = self.children();

        let results = join_all(children.iter().map(|child| self.reclaim_child(&endpoint, child, target))).await;
        let mut swept = 0;
        for (child, result) in children.iter().zip(results) {
            match result {
                Ok(true) => swept += 1,
                Ok(false) => {}
                Err(err) => warn!(pool = %self.id, account = ?child.address(), error = %err, "reclaim failed"),
            }
        }
        info!(pool = %self.id, swept, total = children.len(), "funds reclaimed");
        Ok(swept)
    }

    async fn reclaim_child(&self, endpoint: &Arc<Endpoint>, child: &Arc<Account>, target: Address) -> FloodResult<bool> {
        let balance = endpoint.balance(child.address()).await?;
        child.set_balance(balance);
        let (fee_cap, _) = suggested_fees(endpoint, None, None).await?;
        let (fee_cap, tip) = reclaim_fees(fee_cap);
        let fee = fee_cap.saturating_mul(U256::from(self.config.funding_gas_limit));
        if balance <= fee {
            return Ok(false);
        }
        let tx = transfer_request(target, balance - fee, self.config.funding_gas_limit, fee_cap, tip);
        let receipt = self
            .engine
            .send_and_await(child, tx, SendOptions::new().endpoint(endpoint.clone()))
            .await?;
        Ok(succeeded(&receipt))
    }
}

fn succeeded(receipt: &TransactionReceipt) -> bool {
    receipt.status != Some(U64::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchConfig;
    use flood_blockchain::{testing::MockChain, EndpointPool, EndpointPoolConfig};
    use std::collections::HashMap;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    struct Harness {
        chain: Arc<MockChain>,
        engine: Arc<DispatchEngine>,
        root: Arc<RootAccount>,
        cancel: CancellationToken,
        miner: JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
            self.miner.abort();
        }
    }

    async fn harness(root_balance: U256) -> Harness {
        let chain = MockChain::new(1337);
        let endpoint = Arc::new(Endpoint::new(0, "http://a".parse().unwrap(), chain.client()));
        let endpoints = Arc::new(EndpointPool::new(vec![endpoint.clone()], EndpointPoolConfig::default()));
        endpoints.prepare().await.unwrap();

        let address = Account::from_private_key(KEY, 1337).unwrap().address();
        chain.set_balance(address, root_balance);
        let root = RootAccount::init(KEY, &endpoint).await.unwrap();

        let engine = Arc::new(DispatchEngine::new(
            endpoints,
            DispatchConfig {
                block_poll_interval: 10,
                ..Default::default()
            },
        ));
        let cancel = CancellationToken::new();
        engine.start(cancel.clone());
        let miner = chain.spawn_miner(Duration::from_millis(20));
        Harness { chain, engine, root, cancel, miner }
    }

    fn config(wallet_count: u64) -> AccountPoolConfig {
        AccountPoolConfig {
            wallet_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_funding_amount() {
        let eth = ether();
        assert_eq!(funding_amount(eth * 9 / 10, eth * 5, eth), eth * 5);
        assert_eq!(funding_amount(U256::zero(), eth, eth * 3), eth * 3);
    }

    #[test]
    fn test_batch_calldata_layout() {
        let child = Arc::new(Account::from_private_key(KEY, 1).unwrap());
        let request = FundingRequest {
            account: child.clone(),
            amount: U256::from(0x0102u64),
        };
        let data = batch_calldata(&[request.clone(), request]).unwrap();
        assert_eq!(data.len(), 64);
        assert_eq!(&data[..20], child.address().as_bytes());
        assert_eq!(&data[20..30], &[0u8; 10]);
        assert_eq!(&data[30..32], &[0x01, 0x02]);

        let too_large = FundingRequest {
            account: child,
            amount: U256::one() << 96,
        };
        assert!(batch_calldata(&[too_large]).is_err());
    }

    #[tokio::test]
    async fn test_prepare_funds_children() {
        let h = harness(ether() * 100).await;
        let pool = AccountPool::new("p1", h.root.clone(), h.engine.clone(), config(5));
        pool.prepare("seed").await.unwrap();

        assert_eq!(pool.len(), 5);
        assert!(pool.set_count(6).is_err());
        for child in pool.children() {
            assert_eq!(child.balance(), ether() * 5);
            assert_eq!(h.chain.balance_of(child.address()), ether() * 5);
        }
    }

    #[tokio::test]
    async fn test_prepare_fails_on_insufficient_root_funds() {
        let h = harness(ether()).await;
        let pool = AccountPool::new("p1", h.root.clone(), h.engine.clone(), config(5));
        let result = pool.prepare("seed").await;
        assert!(matches!(result, Err(FloodError::InsufficientRootFunds { .. })));
        assert_eq!(h.chain.accepted_sends(), 0);
        assert!(!pool.is_prepared());
        assert!(pool.get(AccountSelection::RoundRobin, 0).is_none());
    }

    #[tokio::test]
    async fn test_root_funding_attributed_to_root_pool() {
        let h = harness(ether() * 100).await;
        let confirmed = Arc::new(std::sync::Mutex::new(HashMap::<String, u64>::new()));
        let sink = confirmed.clone();
        h.engine.subscribe_bulk_block_updates(move |update| {
            let mut confirmed = sink.lock().unwrap();
            for (pool, stats) in &update.pools {
                *confirmed.entry(pool.clone()).or_default() += stats.confirmed;
            }
        });

        for id in ["p1", "p2"] {
            let pool = AccountPool::new(id, h.root.clone(), h.engine.clone(), config(2));
            pool.prepare(id).await.unwrap();
        }

        let settled = tokio::time::timeout(Duration::from_secs(10), async {
            while confirmed.lock().unwrap().get(ROOT_POOL).copied().unwrap_or_default() < 4 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
        let confirmed = confirmed.lock().unwrap();
        assert_eq!(confirmed.get("p1").copied().unwrap_or_default(), 0);
        assert_eq!(confirmed.get("p2").copied().unwrap_or_default(), 0);
    }

    #[tokio::test]
    async fn test_refill_below_threshold() {
        let h = harness(ether() * 100).await;
        let pool = AccountPool::new("p1", h.root.clone(), h.engine.clone(), config(5));
        pool.prepare("seed").await.unwrap();

        let child = pool.get(AccountSelection::ByIndex, 0).unwrap();
        h.chain.set_balance(child.address(), ether() * 9 / 10);
        pool.refill_once().await.unwrap();

        assert!(h.chain.balance_of(child.address()) >= ether() * 5);
        assert!(child.balance() >= ether() * 5);
        let other = pool.get(AccountSelection::ByIndex, 1).unwrap();
        assert_eq!(h.chain.balance_of(other.address()), ether() * 5);
    }

    #[tokio::test]
    async fn test_selection_modes() {
        let h = harness(ether() * 100).await;
        let pool = AccountPool::new("p1", h.root.clone(), h.engine.clone(), config(3));
        pool.prepare("seed").await.unwrap();
        let children = pool.children();

        let first = pool.get(AccountSelection::RoundRobin, 0).unwrap();
        let second = pool.get(AccountSelection::RoundRobin, 0).unwrap();
        assert_ne!(first.address(), second.address());
        assert_eq!(
            pool.get(AccountSelection::ByIndex, 4).unwrap().address(),
            children[1].address()
        );

        children[0].claim_nonce();
        children[1].claim_nonce();
        assert_eq!(
            pool.get(AccountSelection::ByPendingCount, 0).unwrap().address(),
            children[2].address()
        );
    }

    #[tokio::test]
    async fn test_reclaim_sweeps_and_stops_refills() {
        let h = harness(ether() * 100).await;
        let pool = AccountPool::new("p1", h.root.clone(), h.engine.clone(), config(2));
        pool.prepare("seed").await.unwrap();

        let swept = pool.reclaim().await.unwrap();
        assert_eq!(swept, 2);
        for child in pool.children() {
            assert!(h.chain.balance_of(child.address()) < U256::from(10u64).pow(15.into()));
        }
        assert!(pool.is_reclaimed());

        let child = pool.get(AccountSelection::ByIndex, 0).unwrap();
        h.chain.set_balance(child.address(), U256::zero());
        pool.refill_once().await.unwrap();
        assert_eq!(h.chain.balance_of(child.address()), U256::zero());
    }

    #[tokio::test]
    async fn test_refill_loop_runs_on_interval() {
        let h = harness(ether() * 100).await;
        let pool = Arc::new(AccountPool::new(
            "p1",
            h.root.clone(),
            h.engine.clone(),
            AccountPoolConfig {
                wallet_count: 1,
                refill_interval: 1,
                ..Default::default()
            },
        ));
        pool.prepare("seed").await.unwrap();
        let child = pool.get(AccountSelection::ByIndex, 0).unwrap();
        h.chain.set_balance(child.address(), U256::zero());

        let handle = pool.start_refill_loop(h.cancel.clone());
        let refilled = tokio::time::timeout(Duration::from_secs(10), async {
            while h.chain.balance_of(child.address()) < ether() * 5 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        assert!(refilled.is_ok());
        h.cancel.cancel();
        let _ = handle.await;
    }
}
