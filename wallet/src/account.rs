// Standard library imports
use std::{
    collections::BTreeSet,
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

// Third party imports
use ethers::{
    signers::{LocalWallet, Signer},
    types::{
        transaction::eip2718::TypedTransaction, Address, Bytes, Eip1559TransactionRequest, H256, U256,
    },
    utils::keccak256,
};
use tokio::sync::Notify;
use tracing::{debug, info};
use zeroize::Zeroizing;

// Internal imports
use crate::derive::derive_child_key;
use flood_blockchain::Endpoint;
use flood_common::error::{FloodError, FloodResult};

/// Locally tracked sequence numbers
#[derive(Debug, Default)]
struct NonceState {
    /// Next never-issued nonce
    next: u64,
    /// Every nonce below this is included on chain
    confirmed: u64,
    /// Issued nonces handed back before reaching the network, reused first
    released: BTreeSet<u64>,
}

/// Copy of an account's sequence counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceSnapshot {
    pub pending: u64,
    pub confirmed: u64,
    pub released: usize,
}

#[derive(Debug)]
struct LowBalanceWatch {
    threshold: U256,
    notify: Arc<Notify>,
}

/// One key-controlled chain identity.
///
/// The account owns its sequence space: nonces are only handed out through
/// [`claim_nonce`](Account::claim_nonce) and only move back through
/// [`release_nonce`](Account::release_nonce), [`confirm_through`](Account::confirm_through)
/// and [`set_nonces`](Account::set_nonces).
pub struct Account {
    signer: LocalWallet,
    chain_id: u64,
    nonces: Mutex<NonceState>,
    balance: Mutex<U256>,
    low_balance: Mutex<Option<LowBalanceWatch>>,
    submitted: AtomicU64,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .field("nonces", &self.nonce_snapshot())
            .field("balance", &self.balance())
            .finish()
    }
}

impl Account {
    /// Parses a hex private key, with or without `0x`
    pub fn from_private_key(private_key: &str, chain_id: u64) -> FloodResult<Self> {
        let trimmed = private_key.trim();
        let trimmed = trimmed.strip_prefix("0x").unwrap_or(trimmed);
        let signer = LocalWallet::from_str(trimmed)
            .map_err(|e| FloodError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signer(signer, chain_id))
    }

    /// Builds an account from raw secret key bytes
    pub fn from_key_bytes(key: &[u8], chain_id: u64) -> FloodResult<Self> {
        let signer = LocalWallet::from_bytes(key).map_err(|e| FloodError::InvalidKey(e.to_string()))?;
        Ok(Self::from_signer(signer, chain_id))
    }

    fn from_signer(signer: LocalWallet, chain_id: u64) -> Self {
        Self {
            signer: signer.with_chain_id(chain_id),
            chain_id,
            nonces: Mutex::new(NonceState::default()),
            balance: Mutex::new(U256::zero()),
            low_balance: Mutex::new(None),
            submitted: AtomicU64::new(0),
        }
    }

    /// Creates the root account for `private_key` and loads its chain id,
    /// sequence numbers and balance from `endpoint`.
    pub async fn init_root(private_key: &str, endpoint: &Endpoint) -> FloodResult<Arc<Self>> {
        let chain_id = endpoint.chain_id().await?;
        let account = Self::from_private_key(private_key, chain_id)?;
        account.sync(endpoint).await?;
        info!(
            address = ?account.address(),
            chain_id,
            nonce = account.pending_nonce(),
            balance = %account.balance(),
            "root account initialized"
        );
        Ok(Arc::new(account))
    }

    /// Deterministically derives child `index` of this account
    pub fn derive_child(&self, index: u64, seed: &str) -> FloodResult<Self> {
        let parent = self.secret_bytes();
        let child_key = derive_child_key(parent.as_slice(), index, seed);
        Self::from_key_bytes(child_key.as_slice(), self.chain_id)
    }

    fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.signer.signer().to_bytes().to_vec())
    }

    /// Reloads confirmed nonce, pending nonce and balance from the chain
    pub async fn sync(&self, endpoint: &Endpoint) -> FloodResult<()> {
        let address = self.address();
        let confirmed = endpoint.nonce(address, false).await?;
        let pending = endpoint.nonce(address, true).await?;
        let balance = endpoint.balance(address).await?;
        self.set_nonces(confirmed, pending);
        self.set_balance(balance);
        Ok(())
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn nonce_state(&self) -> MutexGuard<'_, NonceState> {
        self.nonces.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hands out the next unused nonce. Released nonces are reused lowest first
    /// so the on-chain sequence stays gapless.
    pub fn claim_nonce(&self) -> u64 {
        let mut state = self.nonce_state();
        if let Some(nonce) = state.released.pop_first() {
            return nonce;
        }
        let nonce = state.next;
        state.next += 1;
        nonce
    }

    /// Returns a claimed nonce whose transaction never reached the network
    pub fn release_nonce(&self, nonce: u64) {
        let mut state = self.nonce_state();
        if nonce < state.confirmed || nonce >= state.next {
            return;
        }
        if nonce + 1 == state.next {
            state.next -= 1;
            // fold trailing released nonces back into `next`
            while state.next > state.confirmed {
                let last = state.next - 1;
                if !state.released.remove(&last) {
                    break;
                }
                state.next = last;
            }
        } else {
            state.released.insert(nonce);
        }
    }

    /// Marks every nonce up to and including `nonce` as included on chain
    pub fn confirm_through(&self, nonce: u64) {
        let mut state = self.nonce_state();
        if nonce + 1 > state.confirmed {
            state.confirmed = nonce + 1;
        }
        if state.next < state.confirmed {
            state.next = state.confirmed;
        }
        let confirmed = state.confirmed;
        state.released.retain(|n| *n >= confirmed);
    }

    /// Applies chain-reported counters: `confirmed` is authoritative, `pending` only
    /// moves the next nonce forward.
    pub fn set_nonces(&self, confirmed: u64, pending: u64) {
        let mut state = self.nonce_state();
        state.confirmed = confirmed;
        state.next = state.next.max(pending).max(confirmed);
        state.released.retain(|n| *n >= confirmed);
        debug!(address = ?self.signer.address(), confirmed, next = state.next, "nonces updated");
    }

    pub fn pending_nonce(&self) -> u64 {
        self.nonce_state().next
    }

    pub fn confirmed_nonce(&self) -> u64 {
        self.nonce_state().confirmed
    }

    /// Issued and not yet confirmed nonces
    pub fn pending_count(&self) -> u64 {
        let state = self.nonce_state();
        state.next - state.confirmed - state.released.len() as u64
    }

    pub fn nonce_snapshot(&self) -> NonceSnapshot {
        let state = self.nonce_state();
        NonceSnapshot {
            pending: state.next,
            confirmed: state.confirmed,
            released: state.released.len(),
        }
    }

    pub fn balance(&self) -> U256 {
        *self.balance.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_balance(&self, balance: U256) {
        *self.balance.lock().unwrap_or_else(|p| p.into_inner()) = balance;
        self.check_low_balance(balance);
    }

    pub fn add_balance(&self, amount: U256) {
        let mut balance = self.balance.lock().unwrap_or_else(|p| p.into_inner());
        *balance = balance.saturating_add(amount);
    }

    /// Debits the cached balance, saturating at zero
    pub fn sub_balance(&self, amount: U256) {
        let updated = {
            let mut balance = self.balance.lock().unwrap_or_else(|p| p.into_inner());
            *balance = balance.saturating_sub(amount);
            *balance
        };
        self.check_low_balance(updated);
    }

    /// Wakes `notify` whenever the cached balance drops below `threshold`
    pub fn watch_low_balance(&self, threshold: U256, notify: Arc<Notify>) {
        *self.low_balance.lock().unwrap_or_else(|p| p.into_inner()) =
            Some(LowBalanceWatch { threshold, notify });
    }

    fn check_low_balance(&self, balance: U256) {
        let watch = self.low_balance.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(watch) = watch.as_ref() {
            if balance < watch.threshold {
                watch.notify.notify_one();
            }
        }
    }

    /// Number of transactions signed by this account
    pub fn submitted_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Signs `tx` for this account's chain, returning the raw encoding and its hash
    pub fn sign(&self, tx: &mut TypedTransaction) -> FloodResult<(Bytes, H256)> {
        tx.set_from(self.address());
        tx.set_chain_id(self.chain_id);
        let signature = self
            .signer
            .sign_transaction_sync(tx)
            .map_err(|e| FloodError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);
        let hash = H256::from(keccak256(raw.as_ref()));
        self.submitted.fetch_add(1, Ordering::Relaxed);
        Ok((raw, hash))
    }
}

/// Plain value transfer as an EIP-1559 request, nonce left for the dispatcher
pub fn transfer_request(to: Address, value: U256, gas_limit: u64, fee_cap: U256, tip: U256) -> TypedTransaction {
    Eip1559TransactionRequest::new()
        .to(to)
        .value(value)
        .gas(gas_limit)
        .max_fee_per_gas(fee_cap)
        .max_priority_fee_per_gas(tip)
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flood_blockchain::{testing::MockChain, EndpointSpec};
    use std::collections::HashSet;

    const KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    fn account() -> Account {
        Account::from_private_key(KEY, 1337).unwrap()
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert!(matches!(
            Account::from_private_key("zz", 1),
            Err(FloodError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_claims_are_sequential() {
        let account = account();
        account.set_nonces(5, 5);
        assert_eq!((0..4).map(|_| account.claim_nonce()).collect::<Vec<_>>(), vec![5, 6, 7, 8]);
        assert_eq!(account.pending_count(), 4);
    }

    #[test]
    fn test_released_nonce_reused() {
        let account = account();
        let claimed: Vec<u64> = (0..4).map(|_| account.claim_nonce()).collect();
        assert_eq!(claimed, vec![0, 1, 2, 3]);

        account.release_nonce(1);
        assert_eq!(account.pending_count(), 3);
        assert_eq!(account.claim_nonce(), 1);
        assert_eq!(account.claim_nonce(), 4);

        // releasing the tail folds back into `next`
        account.release_nonce(3);
        account.release_nonce(4);
        assert_eq!(account.pending_nonce(), 3);
        assert_eq!(account.claim_nonce(), 3);
    }

    #[test]
    fn test_confirm_through_advances() {
        let account = account();
        for _ in 0..3 {
            account.claim_nonce();
        }
        account.confirm_through(1);
        assert_eq!(account.confirmed_nonce(), 2);
        assert_eq!(account.pending_count(), 1);
        account.confirm_through(0);
        assert_eq!(account.confirmed_nonce(), 2);
        account.confirm_through(9);
        assert_eq!(account.pending_nonce(), 10);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_gapless() {
        let account = Arc::new(account());
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let account = account.clone();
                tokio::spawn(async move { account.claim_nonce() })
            })
            .collect();
        let claimed: HashSet<u64> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(claimed, (0..100).collect::<HashSet<_>>());
    }

    #[test]
    fn test_low_balance_notification() {
        let account = account();
        let notify = Arc::new(Notify::new());
        account.set_balance(U256::from(100));
        account.watch_low_balance(U256::from(50), notify.clone());
        account.sub_balance(U256::from(20));
        assert!(tokio_test::task::spawn(notify.notified()).poll().is_pending());
        account.sub_balance(U256::from(40));
        assert!(tokio_test::task::spawn(notify.notified()).poll().is_ready());
        account.sub_balance(U256::from(1000));
        assert_eq!(account.balance(), U256::zero());
    }

    #[test]
    fn test_child_derivation_deterministic() {
        let root = account();
        let a = root.derive_child(0, "seed").unwrap();
        let b = root.derive_child(0, "seed").unwrap();
        let c = root.derive_child(1, "seed").unwrap();
        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
        assert_eq!(a.chain_id(), 1337);
    }

    #[tokio::test]
    async fn test_init_root_loads_state() {
        let chain = MockChain::new(1337);
        let root = Account::from_private_key(KEY, 1337).unwrap();
        chain.set_balance(root.address(), U256::exp10(18));
        let spec: EndpointSpec = "http://node".parse().unwrap();
        let endpoint = Endpoint::new(0, spec, chain.client());

        let root = Account::init_root(KEY, &endpoint).await.unwrap();
        assert_eq!(root.chain_id(), 1337);
        assert_eq!(root.balance(), U256::exp10(18));
        assert_eq!(root.pending_nonce(), 0);
    }

    #[tokio::test]
    async fn test_init_root_fails_on_unreachable_endpoint() {
        let chain = MockChain::new(1337);
        let client = chain.client();
        client.set_offline(true);
        let endpoint = Endpoint::new(0, "http://node".parse().unwrap(), client);
        assert!(Account::init_root(KEY, &endpoint).await.is_err());
    }

    #[test]
    fn test_signed_transfer_round_trips() {
        let account = account();
        let mut tx = transfer_request(Address::repeat_byte(9), U256::from(1), 21_000, U256::from(10), U256::from(1));
        tx.set_nonce(0u64);
        let (raw, hash) = account.sign(&mut tx).unwrap();
        assert_eq!(hash, H256::from(keccak256(raw.as_ref())));
        let (decoded, signature) =
            TypedTransaction::decode_signed(&ethers::utils::rlp::Rlp::new(raw.as_ref())).unwrap();
        assert_eq!(signature.recover(decoded.sighash()).unwrap(), account.address());
        assert_eq!(account.submitted_count(), 1);
    }
}
