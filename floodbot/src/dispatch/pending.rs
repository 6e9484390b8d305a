// Standard library imports
use std::{collections::BTreeMap, fmt, sync::Arc};

// Third party imports
use backoff::{backoff::Backoff, ExponentialBackoff};
use ethers::types::{transaction::eip2718::TypedTransaction, Bytes, TransactionReceipt, H256};
use tokio::time::Instant;

// Internal imports
use flood_blockchain::Endpoint;
use flood_common::error::FloodError;

/// Outcome handed to a completion callback
pub type CompletionResult = Result<TransactionReceipt, FloodError>;

/// Invoked once per submitted transaction with its receipt or terminal error
pub type CompletionCallback = Box<dyn FnOnce(&TypedTransaction, CompletionResult) + Send + 'static>;

/// Invoked after every submission attempt
pub type LogCallback = Arc<dyn Fn(&SubmitEvent) + Send + Sync + 'static>;

/// One submission attempt, reported through [`LogCallback`]
#[derive(Debug, Clone)]
pub struct SubmitEvent {
    pub endpoint: String,
    pub nonce: u64,
    pub hash: H256,
    pub retry: u32,
    pub rebroadcast: u32,
    pub error: Option<String>,
}

/// Completion handle that can only be fulfilled once
pub struct CompletionToken {
    callback: CompletionCallback,
}

impl CompletionToken {
    pub fn new(callback: CompletionCallback) -> Self {
        Self { callback }
    }

    pub fn fulfil(self, tx: &TypedTransaction, result: CompletionResult) {
        (self.callback)(tx, result)
    }
}

impl fmt::Debug for CompletionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CompletionToken")
    }
}

/// Per-send options
#[derive(Default)]
pub struct SendOptions {
    /// Endpoint for the first attempt, pool-selected when `None`
    pub endpoint: Option<Arc<Endpoint>>,
    /// Endpoint group used for selection and failover
    pub group: String,
    /// Resubmit while unconfirmed
    pub rebroadcast: bool,
    pub on_complete: Option<CompletionCallback>,
    pub on_log: Option<LogCallback>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: Arc<Endpoint>) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn rebroadcast(mut self, rebroadcast: bool) -> Self {
        self.rebroadcast = rebroadcast;
        self
    }

    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(&TypedTransaction, CompletionResult) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn on_log<F>(mut self, callback: F) -> Self
    where
        F: Fn(&SubmitEvent) + Send + Sync + 'static,
    {
        self.on_log = Some(Arc::new(callback));
        self
    }
}

/// In-flight submission tracked until confirmation, terminal failure or shutdown
pub(crate) struct PendingTx {
    pub nonce: u64,
    pub tx: TypedTransaction,
    pub raw: Bytes,
    /// Every broadcast version, newest last
    pub hashes: Vec<H256>,
    pub submitted_at: Instant,
    pub endpoint: String,
    pub group: String,
    pub rebroadcast: bool,
    pub rebroadcasts: u32,
    pub next_rebroadcast: Instant,
    pub backoff: ExponentialBackoff,
    pub completion: Option<CompletionToken>,
    pub on_log: Option<LogCallback>,
    /// Gap filler sent by the engine itself
    pub filler: bool,
}

impl PendingTx {
    pub fn new(
        nonce: u64,
        tx: TypedTransaction,
        raw: Bytes,
        hash: H256,
        mut backoff: ExponentialBackoff,
    ) -> Self {
        let now = Instant::now();
        let first_delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
        Self {
            nonce,
            tx,
            raw,
            hashes: vec![hash],
            submitted_at: now,
            endpoint: String::new(),
            group: String::new(),
            rebroadcast: false,
            rebroadcasts: 0,
            next_rebroadcast: now + first_delay,
            backoff,
            completion: None,
            on_log: None,
            filler: false,
        }
    }

    pub fn hash(&self) -> H256 {
        self.hashes.last().copied().unwrap_or_default()
    }

    /// Swaps in a re-signed version of the same nonce
    pub fn replace(&mut self, tx: TypedTransaction, raw: Bytes, hash: H256) {
        self.tx = tx;
        self.raw = raw;
        if !self.hashes.contains(&hash) {
            self.hashes.push(hash);
        }
    }

    /// Schedules the next rebroadcast after one was sent
    pub fn schedule_next(&mut self) {
        self.rebroadcasts += 1;
        let delay = self.backoff.next_backoff().unwrap_or(self.backoff.max_interval);
        self.next_rebroadcast = Instant::now() + delay;
    }

    pub fn emit(&self, event: SubmitEvent) {
        if let Some(on_log) = &self.on_log {
            on_log(&event);
        }
    }

    /// Resolves the entry, firing its callback if it has one
    pub fn complete(self, result: CompletionResult) {
        if let Some(token) = self.completion {
            token.fulfil(&self.tx, result);
        }
    }
}

/// Pending entries of one account ordered by nonce
pub(crate) type PendingMap = BTreeMap<u64, PendingTx>;
