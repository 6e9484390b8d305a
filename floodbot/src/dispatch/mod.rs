//! Transaction dispatch and confirmation tracking.
//!
//! The engine owns one pending map per account, keyed by nonce. `send` registers an
//! entry before the first submission, and the entry leaves the map exactly once:
//! when a block includes its nonce, when it fails outright, or when its rebroadcast
//! budget runs out. Whoever removes the entry fires its completion.

mod fees;
mod pending;
mod rebroadcast;
mod subscription;

// Standard library imports
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

// Third party imports
use dashmap::DashMap;
use ethers::types::{
    transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest, Transaction,
    TransactionReceipt, H256, U256,
};
use futures::future::join_all;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};

// Internal imports
use flood_blockchain::{Endpoint, EndpointPool, SelectionMode};
use flood_common::{
    error::{FloodError, FloodResult, RecoveryAction, RpcError},
    task::{spawn_supervised, DEFAULT_RESTART_DELAY},
    units::bump_by_percent,
};
use flood_wallet::{transfer_request, Account};

pub use fees::{apply_fees, fees_of, funding_fees, reclaim_fees, replace_fees, suggested_fees};
pub use pending::{CompletionCallback, CompletionResult, LogCallback, SendOptions, SubmitEvent};
pub use rebroadcast::RebroadcastConfig;
pub use subscription::{BulkBlockHandler, BulkBlockUpdate, PoolBlockHandler, PoolBlockStats};

use pending::{CompletionToken, PendingMap, PendingTx};
use subscription::SubscriptionRegistry;

/// Pool label of accounts sent from without being tracked first
pub const UNPOOLED: &str = "unpooled";

/// Pool label of root accounts, shared by every account pool they fund
pub const ROOT_POOL: &str = "root";

/// Fee increase that guarantees a node accepts a same-nonce replacement
const REPLACEMENT_BUMP_PERCENT: u64 = 12;

/// Gas of a plain value transfer
const TRANSFER_GAS: u64 = 21_000;

/// Processed blocks remembered for fork detection
const REORG_HISTORY: usize = 64;

/// Dispatch engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Interval between new-block polls (ms)
    pub block_poll_interval: u64,
    /// Endpoints tried for one submission before it fails
    pub submit_attempts: u32,
    /// Blocks without a confirmation before the on-chain nonce is checked
    pub stale_check_blocks: u64,
    /// Attempts to load the receipts of a block
    pub receipt_attempts: u32,
    /// Delay between receipt attempts (ms)
    pub receipt_retry_delay: u64,
    pub rebroadcast: RebroadcastConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            block_poll_interval: 3000,
            submit_attempts: 3,
            stale_check_blocks: 10,
            receipt_attempts: 5,
            receipt_retry_delay: 1000,
            rebroadcast: RebroadcastConfig::default(),
        }
    }
}

/// Account registered with the engine
struct TrackedAccount {
    account: Arc<Account>,
    pool: String,
    pending: Mutex<PendingMap>,
    last_confirmation_block: AtomicU64,
}

impl TrackedAccount {
    fn pending(&self) -> MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Submission failure, with whether the nonce was consumed on chain
type SubmitFailure = (FloodError, bool);

/// What processing a block changed, kept so it can be undone if the block is orphaned
struct ProcessedBlock {
    hash: H256,
    debits: HashMap<Address, U256>,
    /// Included transactions of tracked accounts
    included: Vec<Transaction>,
}

enum BlockOutcome {
    Processed(ProcessedBlock),
    /// Not served by the endpoint yet
    Unavailable,
    /// Parent hash does not match the block processed before
    Orphaned,
}

#[derive(Default)]
struct BlockCursor {
    last: Option<u64>,
    history: BTreeMap<u64, ProcessedBlock>,
}

impl BlockCursor {
    fn push(&mut self, number: u64, block: ProcessedBlock) {
        self.history.insert(number, block);
        self.last = Some(number);
        while self.history.len() > REORG_HISTORY {
            self.history.pop_first();
        }
    }
}

/// Shared submission and confirmation state machine
pub struct DispatchEngine {
    endpoints: Arc<EndpointPool>,
    config: DispatchConfig,
    accounts: DashMap<Address, Arc<TrackedAccount>>,
    subscriptions: SubscriptionRegistry,
    cursor: tokio::sync::Mutex<BlockCursor>,
}

impl DispatchEngine {
    pub fn new(endpoints: Arc<EndpointPool>, config: DispatchConfig) -> Self {
        Self {
            endpoints,
            config,
            accounts: DashMap::new(),
            subscriptions: SubscriptionRegistry::default(),
            cursor: tokio::sync::Mutex::new(BlockCursor::default()),
        }
    }

    pub fn endpoints(&self) -> &Arc<EndpointPool> {
        &self.endpoints
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Registers accounts so their inclusions are attributed to `pool_id`
    pub fn track_accounts(&self, pool_id: &str, accounts: &[Arc<Account>]) {
        for account in accounts {
            self.accounts
                .entry(account.address())
                .or_insert_with(|| Arc::new(Self::new_tracked(account.clone(), pool_id)));
        }
    }

    fn new_tracked(account: Arc<Account>, pool: &str) -> TrackedAccount {
        TrackedAccount {
            account,
            pool: pool.to_string(),
            pending: Mutex::new(PendingMap::new()),
            last_confirmation_block: AtomicU64::new(0),
        }
    }

    fn tracked(&self, account: &Arc<Account>) -> Arc<TrackedAccount> {
        self.accounts
            .entry(account.address())
            .or_insert_with(|| Arc::new(Self::new_tracked(account.clone(), UNPOOLED)))
            .clone()
    }

    /// Unconfirmed entries of one account
    pub fn pending_count(&self, address: Address) -> usize {
        self.accounts
            .get(&address)
            .map(|tracked| tracked.pending().len())
            .unwrap_or(0)
    }

    /// Unconfirmed entries across every account
    pub fn pending_total(&self) -> usize {
        self.accounts.iter().map(|tracked| tracked.pending().len()).sum()
    }

    pub fn subscribe_bulk_block_updates<F>(&self, handler: F) -> u64
    where
        F: Fn(&BulkBlockUpdate) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(Arc::new(handler))
    }

    /// Per block updates narrowed to the accounts tracked under `pool_id`
    pub fn subscribe_block_updates<F>(&self, pool_id: &str, handler: F) -> u64
    where
        F: Fn(&BulkBlockUpdate, &PoolBlockStats) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe_pool(pool_id, Arc::new(handler))
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        self.subscriptions.unsubscribe(id)
    }

    /// Fee cap and tip for `endpoint`, see [`suggested_fees`]
    pub async fn suggested_fees(
        &self,
        endpoint: &Endpoint,
        base_fee_gwei: Option<f64>,
        tip_fee_gwei: Option<f64>,
    ) -> FloodResult<(U256, U256)> {
        suggested_fees(endpoint, base_fee_gwei, tip_fee_gwei).await
    }

    /// Signs and submits `tx` from `account`.
    ///
    /// A nonce set on `tx` is used as is, otherwise one is claimed from the account.
    /// Missing fee fields are filled from the endpoint's suggestion. Returns the hash
    /// once a node accepted the transaction. On an outright failure the completion
    /// callback receives the same error that is returned.
    pub async fn send(
        &self,
        account: &Arc<Account>,
        mut tx: TypedTransaction,
        mut options: SendOptions,
    ) -> FloodResult<H256> {
        let tracked = self.tracked(account);
        let completion = options.on_complete.take();
        let (nonce, claimed) = match tx.nonce() {
            Some(nonce) => (nonce.low_u64(), false),
            None => {
                let nonce = account.claim_nonce();
                tx.set_nonce(nonce);
                (nonce, true)
            }
        };
        self.dispatch(&tracked, tx, nonce, claimed, options, completion, false)
            .await
    }

    /// Sends `tx` and waits until it is included or fails
    pub async fn send_and_await(
        &self,
        account: &Arc<Account>,
        tx: TypedTransaction,
        mut options: SendOptions,
    ) -> FloodResult<TransactionReceipt> {
        let (sender, receiver) = oneshot::channel();
        let inner = options.on_complete.take();
        options.on_complete = Some(Box::new(move |tx: &TypedTransaction, result: CompletionResult| {
            if let Some(inner) = inner {
                inner(tx, result.clone());
            }
            let _ = sender.send(result);
        }));

        self.send(account, tx, options).await?;
        receiver.await.map_err(|_| FloodError::Cancelled)?
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        tracked: &Arc<TrackedAccount>,
        tx: TypedTransaction,
        nonce: u64,
        claimed: bool,
        options: SendOptions,
        completion: Option<CompletionCallback>,
        filler: bool,
    ) -> FloodResult<H256> {
        let SendOptions {
            endpoint,
            group,
            rebroadcast,
            on_log,
            ..
        } = options;
        let original = tx.clone();
        let (tx, raw, hash, endpoint) = match self.prepare(&tracked.account, tx, endpoint, &group).await {
            Ok(prepared) => prepared,
            Err(error) => {
                if claimed {
                    tracked.account.release_nonce(nonce);
                }
                return fail(completion, &original, error);
            }
        };

        {
            let mut pending = tracked.pending();
            if pending.contains_key(&nonce) {
                drop(pending);
                return fail(
                    completion,
                    &tx,
                    FloodError::InvalidTransaction(format!("nonce {nonce} is already pending")),
                );
            }
            let mut entry = PendingTx::new(nonce, tx.clone(), raw.clone(), hash, self.config.rebroadcast.backoff());
            entry.endpoint = endpoint.name().to_string();
            entry.group = group.clone();
            entry.rebroadcast = rebroadcast;
            entry.completion = completion.map(CompletionToken::new);
            entry.on_log = on_log.clone();
            entry.filler = filler;
            pending.insert(nonce, entry);
        }

        let submitted = self
            .submit(tracked, nonce, endpoint, &group, tx, raw, hash, on_log.as_ref())
            .await;
        match submitted {
            Ok(hash) => {
                counter!("floodbot_tx_submitted_total", 1, "pool" => tracked.pool.clone());
                debug!(account = ?tracked.account.address(), nonce, ?hash, "transaction submitted");
                Ok(hash)
            }
            Err((error, consumed)) => {
                let entry = tracked.pending().remove(&nonce);
                if claimed && !consumed {
                    tracked.account.release_nonce(nonce);
                }
                debug!(account = ?tracked.account.address(), nonce, %error, "submission failed");
                if let Some(entry) = entry {
                    entry.complete(Err(error.clone()));
                }
                Err(error)
            }
        }
    }

    async fn prepare(
        &self,
        account: &Account,
        mut tx: TypedTransaction,
        endpoint: Option<Arc<Endpoint>>,
        group: &str,
    ) -> FloodResult<(TypedTransaction, Bytes, H256, Arc<Endpoint>)> {
        if tx.gas().is_none() {
            return Err(FloodError::InvalidTransaction("gas limit not set".to_string()));
        }
        let endpoint = endpoint
            .or_else(|| self.endpoints.get(SelectionMode::RoundRobin, 0, group))
            .ok_or_else(|| FloodError::NoEndpoint(group.to_string()))?;
        if needs_fees(&tx) {
            let (fee_cap, tip) = suggested_fees(&endpoint, None, None).await?;
            apply_fees(&mut tx, fee_cap, tip);
        }
        let (raw, hash) = account.sign(&mut tx)?;
        Ok((tx, raw, hash, endpoint))
    }

    /// Submits until a node accepts, failing over on connectivity errors and
    /// refreshing fees once on a fee rejection
    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        tracked: &TrackedAccount,
        nonce: u64,
        mut endpoint: Arc<Endpoint>,
        group: &str,
        mut tx: TypedTransaction,
        mut raw: Bytes,
        mut hash: H256,
        on_log: Option<&LogCallback>,
    ) -> Result<H256, SubmitFailure> {
        let mut tried = Vec::new();
        let mut fees_refreshed = false;
        let mut retry = 0u32;

        loop {
            let result = endpoint.send_raw_transaction(raw.clone()).await;
            if let Some(on_log) = on_log {
                on_log(&SubmitEvent {
                    endpoint: endpoint.name().to_string(),
                    nonce,
                    hash,
                    retry,
                    rebroadcast: 0,
                    error: result.as_ref().err().map(|e| e.to_string()),
                });
            }
            let error = match result {
                Ok(_) => return Ok(hash),
                Err(error) => error,
            };
            retry += 1;

            if error.is_connectivity() {
                tried.push(endpoint.index());
                let next = if retry < self.config.submit_attempts {
                    self.endpoints.get_excluding(group, &tried)
                } else {
                    None
                };
                match next {
                    Some(next) => {
                        debug!(from = %endpoint.name(), to = %next.name(), nonce, "failing over");
                        endpoint = next;
                        continue;
                    }
                    None => return Err((error.into(), false)),
                }
            }

            let Some(kind) = error.rejection() else {
                return Err((error.into(), false));
            };
            let rejected = FloodError::Rejected {
                kind,
                message: rejection_message(&error),
            };
            match kind.recovery() {
                RecoveryAction::TreatAsSubmitted => return Ok(hash),
                RecoveryAction::RefreshFeesAndRetry if !fees_refreshed => {
                    fees_refreshed = true;
                    endpoint.invalidate_fee_cache().await;
                    let (fee_cap, tip) = suggested_fees(&endpoint, None, None)
                        .await
                        .map_err(|e| (e, false))?;
                    let (old_cap, old_tip) = fees_of(&tx);
                    replace_fees(
                        &mut tx,
                        fee_cap.max(bump_by_percent(old_cap, REPLACEMENT_BUMP_PERCENT)),
                        tip.max(bump_by_percent(old_tip, REPLACEMENT_BUMP_PERCENT)),
                    );
                    let (new_raw, new_hash) = tracked.account.sign(&mut tx).map_err(|e| (e, false))?;
                    raw = new_raw;
                    hash = new_hash;
                    if let Some(entry) = tracked.pending().get_mut(&nonce) {
                        entry.replace(tx.clone(), raw.clone(), hash);
                    }
                    info!(
                        account = ?tracked.account.address(),
                        nonce,
                        ?kind,
                        fee_cap = %fees_of(&tx).0,
                        "fees refreshed after rejection"
                    );
                }
                RecoveryAction::ResyncNonce => {
                    self.resync(&tracked.account, &endpoint).await;
                    return Err((rejected, true));
                }
                _ => return Err((rejected, false)),
            }
        }
    }

    async fn resync(&self, account: &Account, endpoint: &Endpoint) {
        let address = account.address();
        match (endpoint.nonce(address, false).await, endpoint.nonce(address, true).await) {
            (Ok(confirmed), Ok(pending)) => account.set_nonces(confirmed, pending),
            (Err(err), _) | (_, Err(err)) => {
                warn!(account = ?address, error = %err, "nonce resync failed")
            }
        }
    }

    /// Starts the confirmation watcher
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = self.clone();
        let span = info_span!("dispatch");
        let _entered = span.enter();
        spawn_supervised("dispatch_watch", cancel.clone(), DEFAULT_RESTART_DELAY, move || {
            let engine = engine.clone();
            let cancel = cancel.clone();
            async move {
                let interval = Duration::from_millis(engine.config.block_poll_interval.max(1));
                loop {
                    if let Err(err) = engine.poll_blocks().await {
                        debug!(error = %err, "block poll failed");
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
            }
        })
    }

    /// Processes every block since the last poll in order, then services
    /// rebroadcasts and stale entries. The first poll starts at the current head.
    /// A reorganization rewinds to the common ancestor before moving on.
    pub async fn poll_blocks(&self) -> FloodResult<()> {
        let mut cursor = self.cursor.lock().await;
        let endpoint = self
            .endpoints
            .get(SelectionMode::ByIndex, 0, "")
            .ok_or_else(|| FloodError::NoEndpoint(String::new()))?;
        let head = endpoint.block_number().await?;

        if let Some(ancestor) = self.find_fork(&endpoint, &cursor).await? {
            self.rewind(&endpoint, &mut cursor, ancestor).await;
        }
        let mut number = cursor.last.map(|last| last + 1).unwrap_or(head);
        while number <= head {
            let parent = number
                .checked_sub(1)
                .and_then(|parent| cursor.history.get(&parent))
                .map(|block| block.hash);
            match self.process_block(&endpoint, number, parent).await? {
                BlockOutcome::Processed(block) => {
                    cursor.push(number, block);
                    number += 1;
                }
                BlockOutcome::Unavailable => break,
                BlockOutcome::Orphaned => match self.find_fork(&endpoint, &cursor).await? {
                    Some(ancestor) => {
                        self.rewind(&endpoint, &mut cursor, ancestor).await;
                        number = ancestor + 1;
                    }
                    None => break,
                },
            }
        }
        let processed = cursor.last.unwrap_or(head);
        drop(cursor);

        self.check_pending(&endpoint, processed).await;
        Ok(())
    }

    /// Highest remembered block still on the canonical chain, when the last
    /// processed block is no longer part of it
    async fn find_fork(&self, endpoint: &Endpoint, cursor: &BlockCursor) -> FloodResult<Option<u64>> {
        let Some((&last, latest)) = cursor.history.iter().next_back() else {
            return Ok(None);
        };
        if canonical_hash(endpoint, last).await? == Some(latest.hash) {
            return Ok(None);
        }
        for (&number, block) in cursor.history.iter().rev().skip(1) {
            if canonical_hash(endpoint, number).await? == Some(block.hash) {
                return Ok(Some(number));
            }
        }
        // deeper than the remembered history
        Ok(cursor.history.keys().next().map(|oldest| oldest.saturating_sub(1)))
    }

    /// Undoes the blocks above `ancestor`: debits are credited back, confirmed
    /// nonces are resynced and orphaned transactions above the on-chain nonce are
    /// tracked again so rebroadcasting gets them included. Completions that already
    /// fired are not repeated.
    async fn rewind(&self, endpoint: &Endpoint, cursor: &mut BlockCursor, ancestor: u64) {
        let orphaned = cursor.history.split_off(&(ancestor + 1));
        cursor.last = Some(ancestor);

        let mut affected: HashMap<Address, Vec<Transaction>> = HashMap::new();
        let blocks = orphaned.len();
        for block in orphaned.into_values() {
            for (address, debit) in block.debits {
                if let Some(tracked) = self.accounts.get(&address) {
                    tracked.account.add_balance(debit);
                }
            }
            for tx in block.included {
                affected.entry(tx.from).or_default().push(tx);
            }
        }
        warn!(ancestor, blocks, accounts = affected.len(), "chain reorganization");

        for (address, txs) in affected {
            let Some(tracked) = self.accounts.get(&address).map(|t| t.clone()) else {
                continue;
            };
            let on_chain = match endpoint.nonce(address, false).await {
                Ok(nonce) => nonce,
                Err(err) => {
                    warn!(account = ?address, error = %err, "nonce resync after reorganization failed");
                    continue;
                }
            };
            tracked.account.set_nonces(on_chain, tracked.account.pending_nonce());
            tracked.last_confirmation_block.store(ancestor, Ordering::Release);

            let mut pending = tracked.pending();
            for tx in txs {
                let nonce = tx.nonce.low_u64();
                if nonce < on_chain || pending.contains_key(&nonce) {
                    continue;
                }
                let mut request = <Eip1559TransactionRequest as From<&Transaction>>::from(&tx);
                if request.max_fee_per_gas.is_none() {
                    request.max_fee_per_gas = tx.gas_price;
                    request.max_priority_fee_per_gas = tx.gas_price;
                }
                let mut typed: TypedTransaction = request.into();
                match tracked.account.sign(&mut typed) {
                    Ok((raw, hash)) => {
                        let mut entry = PendingTx::new(nonce, typed, raw, hash, self.config.rebroadcast.backoff());
                        entry.rebroadcast = true;
                        entry.next_rebroadcast = Instant::now();
                        pending.insert(nonce, entry);
                    }
                    Err(err) => warn!(account = ?address, nonce, error = %err, "re-signing orphaned transaction failed"),
                }
            }
        }
    }

    async fn process_block(&self, endpoint: &Endpoint, number: u64, parent: Option<H256>) -> FloodResult<BlockOutcome> {
        let Some(block) = endpoint.block_with_txs(number).await? else {
            return Ok(BlockOutcome::Unavailable);
        };
        if parent.is_some_and(|parent| parent != block.parent_hash) {
            return Ok(BlockOutcome::Orphaned);
        }

        let mut matched: HashMap<Address, Vec<&Transaction>> = HashMap::new();
        for tx in &block.transactions {
            if self.accounts.contains_key(&tx.from) {
                matched.entry(tx.from).or_default().push(tx);
            }
        }
        let receipts = if matched.is_empty() {
            HashMap::new()
        } else {
            let hashes: Vec<H256> = matched.values().flatten().map(|tx| tx.hash).collect();
            self.load_receipts(endpoint, number, &hashes).await?
        };

        let mut update = BulkBlockUpdate {
            number,
            hash: block.hash.unwrap_or_default(),
            gas_used: block.gas_used,
            base_fee: block.base_fee_per_gas.unwrap_or_default(),
            tx_count: block.transactions.len(),
            pools: HashMap::new(),
        };
        let mut processed = ProcessedBlock {
            hash: update.hash,
            debits: HashMap::new(),
            included: Vec::new(),
        };

        for (address, txs) in matched {
            let Some(tracked) = self.accounts.get(&address).map(|t| t.clone()) else {
                continue;
            };
            let stats = update.pools.entry(tracked.pool.clone()).or_default();
            let mut max_nonce = 0u64;
            let mut debit = U256::zero();
            for tx in &txs {
                let fee = receipts
                    .get(&tx.hash)
                    .map(receipt_fee)
                    .unwrap_or_default();
                debit = debit.saturating_add(tx.value.saturating_add(fee));
                stats.total_fees = stats.total_fees.saturating_add(fee);
                max_nonce = max_nonce.max(tx.nonce.low_u64());
                processed.included.push((*tx).clone());
            }
            tracked.account.sub_balance(debit);
            processed.debits.insert(address, debit);
            stats.confirmed += txs.len() as u64;
            stats.affected_accounts.insert(address);

            tracked.account.confirm_through(max_nonce);
            tracked.last_confirmation_block.store(number, Ordering::Release);
            counter!("floodbot_tx_confirmed_total", txs.len() as u64, "pool" => tracked.pool.clone());

            let resolved = take_through(&tracked, max_nonce);
            self.resolve(endpoint, &tracked, resolved, &receipts).await;
        }

        for tracked in self.accounts.iter() {
            let pending = tracked.pending().len() as u64;
            if pending > 0 {
                update.pools.entry(tracked.pool.clone()).or_default().pending += pending;
            }
        }

        if update.confirmed() > 0 {
            info!(
                block = number,
                confirmed = update.confirmed(),
                txs = update.tx_count,
                "block processed"
            );
        }
        self.subscriptions.publish(&update);
        Ok(BlockOutcome::Processed(processed))
    }

    /// Receipts for `hashes` included in block `number`, by hash
    async fn load_receipts(
        &self,
        endpoint: &Endpoint,
        number: u64,
        hashes: &[H256],
    ) -> FloodResult<HashMap<H256, TransactionReceipt>> {
        let attempts = self.config.receipt_attempts.max(1);
        let delay = Duration::from_millis(self.config.receipt_retry_delay);

        for attempt in 1..=attempts {
            match endpoint.block_receipts(number).await {
                Ok(receipts) => {
                    let by_hash: HashMap<H256, TransactionReceipt> = receipts
                        .into_iter()
                        .map(|r| (r.transaction_hash, r))
                        .collect();
                    if hashes.iter().all(|h| by_hash.contains_key(h)) {
                        return Ok(by_hash);
                    }
                    break;
                }
                Err(err) => {
                    debug!(block = number, attempt, error = %err, "block receipts unavailable");
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        // per transaction fallback
        let mut by_hash = HashMap::new();
        for hash in hashes {
            let mut last_error = None;
            for attempt in 1..=attempts {
                match endpoint.transaction_receipt(*hash).await {
                    Ok(Some(receipt)) => {
                        by_hash.insert(*hash, receipt);
                        last_error = None;
                        break;
                    }
                    Ok(None) => last_error = Some(RpcError::Decode(format!("receipt {hash:?} missing"))),
                    Err(err) => last_error = Some(err),
                }
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            if let Some(err) = last_error {
                warn!(block = number, ?hash, error = %err, "receipt fetch failed, retrying next tick");
                return Err(err.into());
            }
        }
        Ok(by_hash)
    }

    /// Completes entries whose nonce is confirmed. Entries whose receipt cannot be
    /// fetched go back into the map for a later round.
    async fn resolve(
        &self,
        endpoint: &Endpoint,
        tracked: &TrackedAccount,
        entries: Vec<PendingTx>,
        receipts: &HashMap<H256, TransactionReceipt>,
    ) {
        for entry in entries {
            if let Some(receipt) = entry.hashes.iter().rev().find_map(|h| receipts.get(h)) {
                let receipt = receipt.clone();
                entry.complete(Ok(receipt));
                continue;
            }
            match lookup_receipt(endpoint, &entry.hashes).await {
                Ok(Some(receipt)) => entry.complete(Ok(receipt)),
                Ok(None) => {
                    debug!(account = ?tracked.account.address(), nonce = entry.nonce, "nonce consumed elsewhere");
                    let nonce = entry.nonce;
                    entry.complete(Err(FloodError::NonceConsumed(nonce)));
                }
                Err(err) => {
                    debug!(nonce = entry.nonce, error = %err, "receipt lookup failed, keeping entry");
                    tracked.pending().insert(entry.nonce, entry);
                }
            }
        }
    }

    /// Stale recovery and rebroadcasts for every tracked account
    async fn check_pending(&self, endpoint: &Arc<Endpoint>, height: u64) {
        let accounts: Vec<Arc<TrackedAccount>> = self.accounts.iter().map(|t| t.value().clone()).collect();
        for tracked in accounts {
            if tracked.pending().is_empty() {
                tracked.last_confirmation_block.store(height, Ordering::Release);
                continue;
            }
            let last = tracked.last_confirmation_block.load(Ordering::Acquire);
            if height >= last + self.config.stale_check_blocks {
                self.recover_stale(endpoint, &tracked).await;
                tracked.last_confirmation_block.store(height, Ordering::Release);
            }
            self.rebroadcast_due(&tracked).await;
        }
    }

    /// Resolves entries below the on-chain nonce, then fills every hole that keeps
    /// pending entries from being included: released nonces below the highest entry
    /// and unused nonces between the on-chain nonce and the lowest entry.
    async fn recover_stale(&self, endpoint: &Arc<Endpoint>, tracked: &Arc<TrackedAccount>) {
        let address = tracked.account.address();
        let on_chain = match endpoint.nonce(address, false).await {
            Ok(nonce) => nonce,
            Err(err) => {
                debug!(account = ?address, error = %err, "stale check skipped");
                return;
            }
        };
        if on_chain > 0 {
            tracked.account.confirm_through(on_chain - 1);
            let resolved = take_through(tracked, on_chain - 1);
            if !resolved.is_empty() {
                info!(account = ?address, resolved = resolved.len(), on_chain, "recovering stale entries");
            }
            self.resolve(endpoint, tracked, resolved, &HashMap::new()).await;
        }

        let Some(highest) = tracked.pending().keys().next_back().copied() else {
            return;
        };
        loop {
            let nonce = tracked.account.claim_nonce();
            if nonce > highest || tracked.pending().contains_key(&nonce) {
                tracked.account.release_nonce(nonce);
                break;
            }
            if let Err(err) = self.fill_gap(tracked, nonce, None, true).await {
                warn!(account = ?address, nonce, error = %err, "gap filler failed");
                break;
            }
        }

        let Some(lowest) = tracked.pending().keys().next().copied() else {
            return;
        };
        for nonce in on_chain..lowest {
            if tracked.pending().contains_key(&nonce) {
                continue;
            }
            if let Err(err) = self.fill_gap(tracked, nonce, None, false).await {
                warn!(account = ?address, nonce, error = %err, "gap filler failed");
                break;
            }
        }
    }

    /// Resubmits due entries among the lowest `window` pending nonces
    async fn rebroadcast_due(&self, tracked: &Arc<TrackedAccount>) {
        let policy = &self.config.rebroadcast;
        let now = Instant::now();
        let due: Vec<u64> = tracked
            .pending()
            .values()
            .take(policy.window.max(1))
            .filter(|entry| entry.rebroadcast && entry.next_rebroadcast <= now)
            .map(|entry| entry.nonce)
            .collect();

        for nonce in due {
            let exhausted = tracked
                .pending()
                .get(&nonce)
                .map(|entry| entry.rebroadcasts >= policy.max_attempts);
            match exhausted {
                None => continue,
                Some(true) => self.time_out(tracked, nonce).await,
                Some(false) => self.rebroadcast(tracked, nonce).await,
            }
        }
    }

    async fn rebroadcast(&self, tracked: &Arc<TrackedAccount>, nonce: u64) {
        let policy = &self.config.rebroadcast;
        let Some((mut tx, mut raw, group)) = tracked
            .pending()
            .get(&nonce)
            .map(|entry| (entry.tx.clone(), entry.raw.clone(), entry.group.clone()))
        else {
            return;
        };

        if policy.fee_bump_percent > 0 {
            let (fee_cap, tip) = fees_of(&tx);
            replace_fees(
                &mut tx,
                bump_by_percent(fee_cap, policy.fee_bump_percent),
                bump_by_percent(tip, policy.fee_bump_percent),
            );
            match tracked.account.sign(&mut tx) {
                Ok((new_raw, hash)) => {
                    raw = new_raw;
                    if let Some(entry) = tracked.pending().get_mut(&nonce) {
                        entry.replace(tx.clone(), raw.clone(), hash);
                    }
                }
                Err(err) => warn!(nonce, error = %err, "re-signing for rebroadcast failed"),
            }
        }

        let targets: Vec<Arc<Endpoint>> = self
            .endpoints
            .candidates(&group)
            .into_iter()
            .take(policy.fanout.max(1))
            .collect();
        let results = join_all(targets.iter().map(|e| e.send_raw_transaction(raw.clone()))).await;

        let mut guard = tracked.pending();
        let Some(entry) = guard.get_mut(&nonce) else {
            return;
        };
        entry.schedule_next();
        counter!("floodbot_tx_rebroadcast_total", 1, "pool" => tracked.pool.clone());
        for (endpoint, result) in targets.iter().zip(results) {
            entry.emit(SubmitEvent {
                endpoint: endpoint.name().to_string(),
                nonce,
                hash: entry.hash(),
                retry: 0,
                rebroadcast: entry.rebroadcasts,
                error: result.err().map(|e| e.to_string()),
            });
        }
        debug!(
            account = ?tracked.account.address(),
            nonce,
            attempt = entry.rebroadcasts,
            fanout = targets.len(),
            "rebroadcast"
        );
    }

    /// Completes an entry whose rebroadcast budget is spent and plugs the hole it
    /// leaves when higher nonces are waiting behind it
    async fn time_out(&self, tracked: &Arc<TrackedAccount>, nonce: u64) {
        let (entry, blocks_others) = {
            let mut pending = tracked.pending();
            let entry = pending.remove(&nonce);
            let blocks_others = pending.range(nonce + 1..).next().is_some();
            (entry, blocks_others)
        };
        let Some(entry) = entry else { return };

        let attempts = entry.rebroadcasts;
        let previous_fees = fees_of(&entry.tx);
        let was_filler = entry.filler;
        warn!(
            account = ?tracked.account.address(),
            nonce,
            attempts,
            waited_secs = entry.submitted_at.elapsed().as_secs(),
            "confirmation timeout"
        );
        entry.complete(Err(FloodError::ConfirmationTimeout { nonce, attempts }));

        if blocks_others && !was_filler {
            if let Err(err) = self.fill_gap(tracked, nonce, Some(previous_fees), false).await {
                warn!(account = ?tracked.account.address(), nonce, error = %err, "gap filler failed");
            }
        }
    }

    /// Zero value self transfer at `nonce`, priced above `previous` when given.
    /// `claimed` marks a nonce freshly taken from `claim_nonce`, which goes back to
    /// the account if the filler never reaches a node.
    async fn fill_gap(
        &self,
        tracked: &Arc<TrackedAccount>,
        nonce: u64,
        previous: Option<(U256, U256)>,
        claimed: bool,
    ) -> FloodResult<H256> {
        let endpoint = self
            .endpoints
            .get(SelectionMode::RoundRobin, 0, "")
            .ok_or_else(|| FloodError::NoEndpoint(String::new()))?;
        let (mut fee_cap, mut tip) = suggested_fees(&endpoint, None, None).await?;
        if let Some((old_cap, old_tip)) = previous {
            fee_cap = fee_cap.max(bump_by_percent(old_cap, REPLACEMENT_BUMP_PERCENT));
            tip = tip.max(bump_by_percent(old_tip, REPLACEMENT_BUMP_PERCENT));
        }
        let address = tracked.account.address();
        let mut tx = transfer_request(address, U256::zero(), TRANSFER_GAS, fee_cap, tip.min(fee_cap));
        tx.set_nonce(nonce);
        info!(account = ?address, nonce, "sending gap filler");
        let options = SendOptions::new().endpoint(endpoint).rebroadcast(true);
        self.dispatch(tracked, tx, nonce, claimed, options, None, true).await
    }
}

fn fail(completion: Option<CompletionCallback>, tx: &TypedTransaction, error: FloodError) -> FloodResult<H256> {
    if let Some(callback) = completion {
        callback(tx, Err(error.clone()));
    }
    Err(error)
}

fn needs_fees(tx: &TypedTransaction) -> bool {
    match tx {
        TypedTransaction::Eip1559(inner) => {
            inner.max_fee_per_gas.is_none() || inner.max_priority_fee_per_gas.is_none()
        }
        _ => tx.gas_price().is_none(),
    }
}

fn rejection_message(error: &RpcError) -> String {
    match error {
        RpcError::Rejected { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn receipt_fee(receipt: &TransactionReceipt) -> U256 {
    receipt
        .gas_used
        .unwrap_or_default()
        .saturating_mul(receipt.effective_gas_price.unwrap_or_default())
}

/// Removes every entry with a nonce up to and including `nonce`
fn take_through(tracked: &TrackedAccount, nonce: u64) -> Vec<PendingTx> {
    let mut pending = tracked.pending();
    let keep = pending.split_off(&(nonce + 1));
    let taken = std::mem::replace(&mut *pending, keep);
    taken.into_values().collect()
}

async fn canonical_hash(endpoint: &Endpoint, number: u64) -> FloodResult<Option<H256>> {
    Ok(endpoint.block_with_txs(number).await?.and_then(|block| block.hash))
}

async fn lookup_receipt(endpoint: &Endpoint, hashes: &[H256]) -> Result<Option<TransactionReceipt>, RpcError> {
    let unique: HashSet<&H256> = hashes.iter().collect();
    for hash in unique {
        if let Some(receipt) = endpoint.transaction_receipt(*hash).await? {
            return Ok(Some(receipt));
        }
    }
    Ok(None)
}
