//! Scriptable in-memory chain implementing [`RpcClient`], used by tests across the
//! workspace. Transactions are decoded and sender-recovered like a real node would,
//! kept in a mempool and included by [`MockChain::mine_block`].

// Standard library imports
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

// Third party imports
use async_trait::async_trait;
use ethers::{
    types::{
        transaction::eip2718::TypedTransaction, Address, Block, Bytes, Transaction,
        TransactionReceipt, H256, U256, U64,
    },
    utils::{keccak256, rlp::Rlp},
};
use tokio::task::JoinHandle;

// Internal imports
use crate::client::RpcClient;
use flood_common::error::RpcError;

#[derive(Debug, Clone)]
struct PooledTx {
    hash: H256,
    from: Address,
    nonce: u64,
    tx: TypedTransaction,
    max_fee: U256,
    tip: U256,
}

#[derive(Debug, Clone, Default)]
struct MinedBlock {
    block: Block<Transaction>,
    receipts: Vec<TransactionReceipt>,
    /// Included transactions as they sat in the mempool
    pooled: Vec<PooledTx>,
    /// Account state before the block, restored when it is reorganized away
    pre_balances: HashMap<Address, U256>,
    pre_nonces: HashMap<Address, u64>,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    base_fee: U256,
    gas_price: U256,
    tip: U256,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    mempool: Vec<PooledTx>,
    blocks: BTreeMap<u64, MinedBlock>,
    receipts: HashMap<H256, TransactionReceipt>,
    send_errors: VecDeque<RpcError>,
    accepted_sends: u64,
    receipts_unavailable: bool,
    /// Bumped on every reorganization so replacement blocks get new hashes
    fork: u64,
}

impl ChainState {
    fn open_block(&self, height: u64) -> MinedBlock {
        let parent_hash = self
            .blocks
            .get(&(height - 1))
            .and_then(|b| b.block.hash)
            .unwrap_or_else(|| block_hash(height - 1, 0));
        let mut block = empty_block(height, self.base_fee, self.fork);
        block.block.parent_hash = parent_hash;
        block.pre_balances = self.balances.clone();
        block.pre_nonces = self.nonces.clone();
        block
    }
}

/// Shared simulated chain
#[derive(Debug)]
pub struct MockChain {
    chain_id: u64,
    state: Mutex<ChainState>,
}

impl MockChain {
    /// Fresh chain at height 0 with a 1 gwei base fee
    pub fn new(chain_id: u64) -> Arc<Self> {
        let state = ChainState {
            base_fee: U256::from(1_000_000_000u64),
            gas_price: U256::from(2_000_000_000u64),
            tip: U256::from(1_000_000_000u64),
            ..Default::default()
        };
        Arc::new(Self {
            chain_id,
            state: Mutex::new(state),
        })
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// New client handle, each with its own online flag
    pub fn client(self: &Arc<Self>) -> Arc<MockClient> {
        Arc::new(MockClient {
            chain: self.clone(),
            offline: AtomicBool::new(false),
            height_override: Mutex::new(None),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn height(&self) -> u64 {
        self.state().height
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state().balances.insert(address, balance);
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state().balances.get(&address).copied().unwrap_or_default()
    }

    pub fn nonce_of(&self, address: Address) -> u64 {
        self.state().nonces.get(&address).copied().unwrap_or_default()
    }

    pub fn set_base_fee(&self, base_fee: U256) {
        self.state().base_fee = base_fee;
    }

    pub fn base_fee(&self) -> U256 {
        self.state().base_fee
    }

    /// Makes the next send fail with `error` regardless of content
    pub fn push_send_error(&self, error: RpcError) {
        self.state().send_errors.push_back(error);
    }

    /// Receipt queries fail while set
    pub fn set_receipts_unavailable(&self, unavailable: bool) {
        self.state().receipts_unavailable = unavailable;
    }

    /// Number of sends the chain accepted into its mempool
    pub fn accepted_sends(&self) -> u64 {
        self.state().accepted_sends
    }

    pub fn mempool_len(&self) -> usize {
        self.state().mempool.len()
    }

    /// Nonces waiting in the mempool for `address`
    pub fn mempool_nonces(&self, address: Address) -> Vec<u64> {
        let mut nonces: Vec<u64> = self
            .state()
            .mempool
            .iter()
            .filter(|tx| tx.from == address)
            .map(|tx| tx.nonce)
            .collect();
        nonces.sort_unstable();
        nonces
    }

    /// Forgets every pooled transaction, as if the node restarted
    pub fn clear_mempool(&self) {
        self.state().mempool.clear();
    }

    pub fn mine_empty_blocks(&self, count: u64) {
        let mut state = self.state();
        for _ in 0..count {
            let height = state.height + 1;
            let block = state.open_block(height);
            state.blocks.insert(height, block);
            state.height = height;
        }
    }

    /// Drops the last `depth` blocks and rolls account state back to before them.
    /// Their transactions return to the mempool when `repend` is set, otherwise
    /// they are lost.
    pub fn reorg(&self, depth: u64, repend: bool) {
        let mut state = self.state();
        let depth = depth.min(state.height);
        if depth == 0 {
            return;
        }
        let first = state.height - depth + 1;
        let orphaned = state.blocks.split_off(&first);
        if let Some(oldest) = orphaned.values().next() {
            state.balances = oldest.pre_balances.clone();
            state.nonces = oldest.pre_nonces.clone();
        }
        for block in orphaned.into_values() {
            for tx in &block.block.transactions {
                state.receipts.remove(&tx.hash);
            }
            if repend {
                state.mempool.extend(block.pooled);
            }
        }
        state.height = first - 1;
        state.fork += 1;
    }

    /// Includes every executable pooled transaction in a new block and returns its height
    pub fn mine_block(&self) -> u64 {
        let mut state = self.state();
        let height = state.height + 1;
        let base_fee = state.base_fee;
        let mut block = state.open_block(height);
        let block_hash = block.block.hash.unwrap_or_default();

        let mut transactions = Vec::new();
        let mut receipts = Vec::new();
        let mut gas_used_total = U256::zero();

        loop {
            let next = state.mempool.iter().position(|tx| {
                let expected = state.nonces.get(&tx.from).copied().unwrap_or_default();
                let balance = state.balances.get(&tx.from).copied().unwrap_or_default();
                let price = effective_price(tx, base_fee);
                let cost = tx.tx.value().copied().unwrap_or_default()
                    + tx.tx.gas().copied().unwrap_or_default() * price;
                tx.nonce == expected && tx.max_fee >= base_fee && balance >= cost
            });
            let Some(position) = next else { break };
            let pooled = state.mempool.remove(position);

            let price = effective_price(&pooled, base_fee);
            let gas = pooled.tx.gas().copied().unwrap_or_default();
            let value = pooled.tx.value().copied().unwrap_or_default();
            let to = pooled.tx.to().and_then(|t| t.as_address().copied());

            let sender_balance = state.balances.entry(pooled.from).or_default();
            *sender_balance -= value + gas * price;
            if let Some(to) = to {
                *state.balances.entry(to).or_default() += value;
            }
            state.nonces.insert(pooled.from, pooled.nonce + 1);
            gas_used_total += gas;

            let index = transactions.len() as u64;
            transactions.push(Transaction {
                hash: pooled.hash,
                nonce: U256::from(pooled.nonce),
                block_hash: Some(block_hash),
                block_number: Some(U64::from(height)),
                transaction_index: Some(U64::from(index)),
                from: pooled.from,
                to,
                value,
                gas,
                gas_price: Some(price),
                max_fee_per_gas: Some(pooled.max_fee),
                max_priority_fee_per_gas: Some(pooled.tip),
                input: pooled.tx.data().cloned().unwrap_or_default(),
                chain_id: Some(U256::from(self.chain_id)),
                ..Default::default()
            });
            let receipt = TransactionReceipt {
                transaction_hash: pooled.hash,
                transaction_index: U64::from(index),
                block_hash: Some(block_hash),
                block_number: Some(U64::from(height)),
                from: pooled.from,
                to,
                cumulative_gas_used: gas_used_total,
                gas_used: Some(gas),
                effective_gas_price: Some(price),
                status: Some(U64::from(1)),
                ..Default::default()
            };
            state.receipts.insert(pooled.hash, receipt.clone());
            receipts.push(receipt);
            block.pooled.push(pooled);
        }

        let nonces = state.nonces.clone();
        state
            .mempool
            .retain(|tx| tx.nonce >= nonces.get(&tx.from).copied().unwrap_or_default());

        block.block.transactions = transactions;
        block.block.gas_used = gas_used_total;
        block.receipts = receipts;
        state.blocks.insert(height, block);
        state.height = height;
        height
    }

    /// Mines a block every `interval` until the handle is aborted
    pub fn spawn_miner(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                chain.mine_block();
            }
        })
    }

    fn submit(&self, raw: Bytes) -> Result<H256, RpcError> {
        let rlp = Rlp::new(raw.as_ref());
        let (tx, signature) = TypedTransaction::decode_signed(&rlp)
            .map_err(|e| rejected(format!("invalid transaction: {e}")))?;
        let from = signature
            .recover(tx.sighash())
            .map_err(|e| rejected(format!("invalid signature: {e}")))?;
        let hash = H256::from(keccak256(raw.as_ref()));
        let nonce = tx.nonce().map(|n| n.as_u64()).unwrap_or_default();
        let max_fee = tx.gas_price().unwrap_or_default();
        let tip = tx
            .as_eip1559_ref()
            .and_then(|t| t.max_priority_fee_per_gas)
            .unwrap_or(max_fee);

        let mut state = self.state();
        if let Some(error) = state.send_errors.pop_front() {
            return Err(error);
        }
        if nonce < state.nonces.get(&from).copied().unwrap_or_default() {
            return Err(rejected("nonce too low"));
        }
        if state.mempool.iter().any(|pooled| pooled.hash == hash) {
            return Err(rejected("already known"));
        }
        if max_fee < state.base_fee {
            return Err(rejected(format!(
                "max fee per gas less than block base fee: maxFeePerGas: {}, baseFee: {}",
                max_fee, state.base_fee
            )));
        }
        if let Some(existing) = state
            .mempool
            .iter()
            .position(|pooled| pooled.from == from && pooled.nonce == nonce)
        {
            let current = state.mempool[existing].max_fee;
            if max_fee * 100 < current * 110 {
                return Err(rejected("replacement transaction underpriced"));
            }
            state.mempool.remove(existing);
        }

        state.mempool.push(PooledTx { hash, from, nonce, tx, max_fee, tip });
        state.accepted_sends += 1;
        Ok(hash)
    }
}

fn rejected(message: impl Into<String>) -> RpcError {
    RpcError::Rejected {
        code: -32000,
        message: message.into(),
    }
}

fn block_hash(height: u64, fork: u64) -> H256 {
    H256::from_low_u64_be((fork << 40) | (height + 1))
}

fn effective_price(tx: &PooledTx, base_fee: U256) -> U256 {
    std::cmp::min(tx.max_fee, base_fee + tx.tip)
}

fn empty_block(height: u64, base_fee: U256, fork: u64) -> MinedBlock {
    MinedBlock {
        block: Block {
            hash: Some(block_hash(height, fork)),
            number: Some(U64::from(height)),
            base_fee_per_gas: Some(base_fee),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// One connection to a [`MockChain`]
#[derive(Debug)]
pub struct MockClient {
    chain: Arc<MockChain>,
    offline: AtomicBool,
    height_override: Mutex<Option<u64>>,
}

impl MockClient {
    /// Offline clients fail every call with a connection error
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Reports a fixed height instead of the chain's, to simulate a lagging node
    pub fn set_height_override(&self, height: Option<u64>) {
        if let Ok(mut slot) = self.height_override.lock() {
            *slot = height;
        }
    }

    fn online(&self) -> Result<&MockChain, RpcError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RpcError::Connection("connection refused".to_string()))
        } else {
            Ok(&self.chain)
        }
    }
}

#[async_trait]
impl RpcClient for MockClient {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.online()?.chain_id)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let chain = self.online()?;
        let overridden = self.height_override.lock().ok().and_then(|h| *h);
        Ok(overridden.unwrap_or_else(|| chain.height()))
    }

    async fn block_with_txs(&self, number: u64) -> Result<Option<Block<Transaction>>, RpcError> {
        let state = self.online()?.state();
        if number > state.height {
            return Ok(None);
        }
        Ok(Some(
            state
                .blocks
                .get(&number)
                .cloned()
                .unwrap_or_else(|| empty_block(number, state.base_fee, 0))
                .block,
        ))
    }

    async fn block_receipts(&self, number: u64) -> Result<Vec<TransactionReceipt>, RpcError> {
        let state = self.online()?.state();
        if state.receipts_unavailable {
            return Err(RpcError::Connection("receipts unavailable".to_string()));
        }
        Ok(state
            .blocks
            .get(&number)
            .map(|b| b.receipts.clone())
            .unwrap_or_default())
    }

    async fn transaction_receipt(&self, hash: H256) -> Result<Option<TransactionReceipt>, RpcError> {
        let state = self.online()?.state();
        if state.receipts_unavailable {
            return Err(RpcError::Connection("receipts unavailable".to_string()));
        }
        Ok(state.receipts.get(&hash).cloned())
    }

    async fn nonce(&self, address: Address, pending: bool) -> Result<u64, RpcError> {
        let state = self.online()?.state();
        let confirmed = state.nonces.get(&address).copied().unwrap_or_default();
        if !pending {
            return Ok(confirmed);
        }
        let mut next = confirmed;
        let mut nonces: Vec<u64> = state
            .mempool
            .iter()
            .filter(|tx| tx.from == address)
            .map(|tx| tx.nonce)
            .collect();
        nonces.sort_unstable();
        for nonce in nonces {
            if nonce == next {
                next += 1;
            }
        }
        Ok(next)
    }

    async fn balance(&self, address: Address) -> Result<U256, RpcError> {
        Ok(self.online()?.balance_of(address))
    }

    async fn gas_price(&self) -> Result<U256, RpcError> {
        Ok(self.online()?.state().gas_price)
    }

    async fn max_priority_fee(&self) -> Result<U256, RpcError> {
        Ok(self.online()?.state().tip)
    }

    async fn base_fee(&self) -> Result<Option<U256>, RpcError> {
        Ok(Some(self.online()?.state().base_fee))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<H256, RpcError> {
        self.online()?.submit(raw)
    }
}
