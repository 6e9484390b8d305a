// Standard library imports
use std::{
    collections::{HashMap, HashSet},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

// Third party imports
use ethers::types::{Address, H256, U256};
use serde::Serialize;
use tracing::error;

// Internal imports
use flood_common::task::panic_message;

/// Per account pool activity within one block
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolBlockStats {
    /// Transactions of the pool included in the block
    pub confirmed: u64,
    /// Transactions of the pool still pending after the block
    pub pending: u64,
    /// Sum of `gas_used * effective_gas_price` of the included transactions
    pub total_fees: U256,
    /// Accounts with at least one included transaction
    pub affected_accounts: HashSet<Address>,
}

/// Aggregate published once per processed block
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkBlockUpdate {
    pub number: u64,
    pub hash: H256,
    pub gas_used: U256,
    pub base_fee: U256,
    pub tx_count: usize,
    /// Keyed by account pool id
    pub pools: HashMap<String, PoolBlockStats>,
}

impl BulkBlockUpdate {
    /// Confirmed transactions across every pool
    pub fn confirmed(&self) -> u64 {
        self.pools.values().map(|p| p.confirmed).sum()
    }
}

pub type BulkBlockHandler = Arc<dyn Fn(&BulkBlockUpdate) + Send + Sync + 'static>;

/// Receives every block together with one pool's share of it
pub type PoolBlockHandler = Arc<dyn Fn(&BulkBlockUpdate, &PoolBlockStats) + Send + Sync + 'static>;

#[derive(Clone)]
enum Subscriber {
    Bulk(BulkBlockHandler),
    Pool { pool: String, handler: PoolBlockHandler },
}

/// Block update subscribers. A panicking handler is logged and does not affect
/// the others.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    next_id: AtomicU64,
    subscribers: RwLock<Vec<(u64, Subscriber)>>,
}

impl SubscriptionRegistry {
    pub fn subscribe(&self, handler: BulkBlockHandler) -> u64 {
        self.insert(Subscriber::Bulk(handler))
    }

    /// `handler` runs on every block, with empty stats when the pool had no activity
    pub fn subscribe_pool(&self, pool: &str, handler: PoolBlockHandler) -> u64 {
        self.insert(Subscriber::Pool {
            pool: pool.to_string(),
            handler,
        })
    }

    fn insert(&self, subscriber: Subscriber) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push((id, subscriber));
        id
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
        subscribers.len() != before
    }

    pub fn publish(&self, update: &BulkBlockUpdate) {
        let subscribers: Vec<(u64, Subscriber)> = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let idle = PoolBlockStats::default();
        for (id, subscriber) in subscribers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| match &subscriber {
                Subscriber::Bulk(handler) => handler(update),
                Subscriber::Pool { pool, handler } => handler(update, update.pools.get(pool).unwrap_or(&idle)),
            }));
            if let Err(payload) = delivered {
                error!(
                    subscription = id,
                    block = update.number,
                    panic = %panic_message(payload.as_ref()),
                    "block subscriber panicked"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let registry = SubscriptionRegistry::default();
        let seen = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_| panic!("subscriber bug")));
        let counter = seen.clone();
        let id = registry.subscribe(Arc::new(move |update| {
            counter.fetch_add(update.tx_count, Ordering::SeqCst);
        }));

        let update = BulkBlockUpdate {
            number: 1,
            tx_count: 3,
            ..Default::default()
        };
        registry.publish(&update);
        registry.publish(&update);
        assert_eq!(seen.load(Ordering::SeqCst), 6);

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.publish(&update);
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_pool_subscriber_sees_own_stats() {
        let registry = SubscriptionRegistry::default();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry.subscribe_pool(
            "flood",
            Arc::new(move |update, stats| {
                sink.lock().unwrap().push((update.number, stats.confirmed));
            }),
        );

        let mut update = BulkBlockUpdate {
            number: 7,
            ..Default::default()
        };
        update.pools.insert(
            "other".to_string(),
            PoolBlockStats {
                confirmed: 4,
                ..Default::default()
            },
        );
        registry.publish(&update);

        update.number = 8;
        update.pools.insert(
            "flood".to_string(),
            PoolBlockStats {
                confirmed: 2,
                ..Default::default()
            },
        );
        registry.publish(&update);
        assert_eq!(*seen.lock().unwrap(), vec![(7, 0), (8, 2)]);
    }
}
