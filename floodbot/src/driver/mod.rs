//! Throughput-paced production loop shared by all scenarios.
//!
//! The driver admits one index at a time, bounded by a rate limiter and by the number of
//! outstanding [`SlotGuard`]s. A producer owns its slot until it resolves it or drops it.

mod limiter;
mod throughput;

// Standard library imports
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

// Third party imports
use async_trait::async_trait;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

// Internal imports
use crate::account_pool::AccountPool;
use flood_common::{error::FloodError, task::catch_panic};

pub use limiter::RateLimiter;
pub use throughput::ThroughputTracker;

/// Pause between productions while no endpoint is available
const NO_ENDPOINT_BACKOFF: Duration = Duration::from_secs(2);

/// Driver options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    /// Indices to produce, 0 = unbounded
    pub total_count: u64,
    /// New submissions per slot window, 0 = unbounded
    pub throughput: u64,
    /// Outstanding slots, 0 = unbounded
    pub max_pending: u64,
    /// Slot window (seconds)
    pub slot_duration: u64,
    /// Stop producing after this long (seconds)
    pub timeout: Option<u64>,
    /// Raise throughput by one every interval (seconds), 0 = fixed
    pub throughput_increment_interval: u64,
    /// Wait for outstanding slots before returning
    pub await_completion: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            total_count: 0,
            throughput: 0,
            max_pending: 0,
            slot_duration: 12,
            timeout: None,
            throughput_increment_interval: 0,
            await_completion: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DriverState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Outcome of one run
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriverReport {
    pub run_id: String,
    /// Indices handed to the producer
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Highest number of simultaneously outstanding slots
    pub peak_in_flight: u64,
    pub cancelled: bool,
    pub timed_out: bool,
}

/// Counters shared by the driver and its slots
struct SlotTracker {
    run_id: String,
    succeeded: AtomicU64,
    failed: AtomicU64,
    peak: AtomicU64,
    in_flight: watch::Sender<u64>,
}

impl SlotTracker {
    fn new(run_id: String) -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            run_id,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            in_flight,
        }
    }

    fn open(&self) {
        let mut current = 0;
        self.in_flight.send_modify(|n| {
            *n += 1;
            current = *n;
        });
        self.peak.fetch_max(current, Ordering::Relaxed);
        gauge!("floodbot_driver_in_flight", current as f64, "run" => self.run_id.clone());
    }

    fn close(&self, success: bool) {
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut current = 0;
        self.in_flight.send_modify(|n| {
            *n = n.saturating_sub(1);
            current = *n;
        });
        gauge!("floodbot_driver_in_flight", current as f64, "run" => self.run_id.clone());
    }

    fn in_flight(&self) -> u64 {
        *self.in_flight.borrow()
    }

    async fn drained(&self) {
        let mut receiver = self.in_flight.subscribe();
        let _ = receiver.wait_for(|n| *n == 0).await;
    }
}

/// Admission slot for one produced index.
///
/// Resolved exactly once: explicitly through [`success`](Self::success) or
/// [`failure`](Self::failure), or as a failure when dropped.
pub struct SlotGuard {
    index: u64,
    tracker: Arc<SlotTracker>,
    permit: Option<OwnedSemaphorePermit>,
    resolved: bool,
}

impl SlotGuard {
    fn new(index: u64, tracker: Arc<SlotTracker>, permit: Option<OwnedSemaphorePermit>) -> Self {
        tracker.open();
        Self {
            index,
            tracker,
            permit,
            resolved: false,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn release(mut self, success: bool) {
        self.resolve(success);
    }

    pub fn success(self) {
        self.release(true)
    }

    pub fn failure(self) {
        self.release(false)
    }

    fn resolve(&mut self, success: bool) {
        if self.resolved {
            return;
        }
        self.resolved = true;
        self.tracker.close(success);
        self.permit.take();
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.resolve(false);
    }
}

/// Builds and submits the transaction for one index
#[async_trait]
pub trait TxProducer: Send + Sync {
    async fn produce(&self, cancel: CancellationToken, index: u64, slot: SlotGuard) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> TxProducer for F
where
    F: Fn(CancellationToken, u64, SlotGuard) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn produce(&self, cancel: CancellationToken, index: u64, slot: SlotGuard) -> anyhow::Result<()> {
        (self)(cancel, index, slot).await
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}

fn is_no_endpoint(err: &anyhow::Error) -> bool {
    err.downcast_ref::<FloodError>().map_or(false, FloodError::is_no_endpoint)
}

/// Throughput-paced driver, runs once
pub struct Driver {
    options: DriverOptions,
    run_id: Uuid,
    state: watch::Sender<DriverState>,
    stats_pool: Option<Arc<AccountPool>>,
}

impl Driver {
    pub fn new(options: DriverOptions) -> Self {
        let (state, _) = watch::channel(DriverState::Idle);
        Self {
            options,
            run_id: Uuid::new_v4(),
            state,
            stats_pool: None,
        }
    }

    /// Logs per-block throughput of `pool` while running
    pub fn with_block_stats(mut self, pool: Arc<AccountPool>) -> Self {
        self.stats_pool = Some(pool);
        self
    }

    pub fn options(&self) -> &DriverOptions {
        &self.options
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    /// Produces until `total_count` is reached, the timeout passes or `cancel` fires.
    ///
    /// After a normal stop the outstanding slots are drained when `await_completion`
    /// is set. Cancellation returns right away and leaves outstanding slots alone.
    pub async fn run<P>(&self, cancel: CancellationToken, producer: Arc<P>) -> anyhow::Result<DriverReport>
    where
        P: TxProducer + ?Sized + 'static,
    {
        if self.state() != DriverState::Idle {
            anyhow::bail!("driver {} already ran", self.run_id);
        }
        let span = info_span!("driver", run = %self.run_id);
        self.run_inner(cancel, producer).instrument(span).await
    }

    async fn run_inner<P>(&self, cancel: CancellationToken, producer: Arc<P>) -> anyhow::Result<DriverReport>
    where
        P: TxProducer + ?Sized + 'static,
    {
        let options = &self.options;
        let run_cancel = cancel.child_token();
        let tracker = Arc::new(SlotTracker::new(self.run_id.to_string()));
        let limiter = Arc::new(RateLimiter::new(
            options.throughput,
            Duration::from_secs(options.slot_duration.max(1)),
        ));
        let semaphore = (options.max_pending > 0).then(|| Arc::new(Semaphore::new(options.max_pending as usize)));
        let deadline = options.timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
        let no_endpoint = Arc::new(AtomicBool::new(false));

        self.state.send_replace(DriverState::Running);
        info!(
            total = options.total_count,
            throughput = options.throughput,
            max_pending = options.max_pending,
            "driver started"
        );

        if options.throughput_increment_interval > 0 && options.throughput > 0 {
            self.spawn_throughput_ramp(run_cancel.clone(), limiter.clone(), semaphore.clone());
        }
        let subscription = self.stats_pool.as_ref().map(|pool| subscribe_block_stats(pool));

        let mut index = 0u64;
        let mut cancelled = false;
        let mut timed_out = false;
        loop {
            if options.total_count > 0 && index >= options.total_count {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => { cancelled = true; break; }
                _ = sleep_until_deadline(deadline) => { timed_out = true; break; }
                _ = limiter.acquire() => {}
            }
            let permit = match &semaphore {
                Some(semaphore) => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => { cancelled = true; break; }
                    _ = sleep_until_deadline(deadline) => { timed_out = true; break; }
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            if no_endpoint.load(Ordering::Relaxed) {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => { cancelled = true; break; }
                    _ = tokio::time::sleep(NO_ENDPOINT_BACKOFF) => {}
                }
            }

            let slot = SlotGuard::new(index, tracker.clone(), permit);
            let producer = producer.clone();
            let produce_cancel = run_cancel.clone();
            let no_endpoint = no_endpoint.clone();
            tokio::spawn(
                async move {
                    match catch_panic(producer.produce(produce_cancel, index, slot)).await {
                        Ok(Ok(())) => no_endpoint.store(false, Ordering::Relaxed),
                        Ok(Err(err)) => {
                            no_endpoint.store(is_no_endpoint(&err), Ordering::Relaxed);
                            debug!(index, error = %err, "production failed");
                        }
                        Err(panic) => error!(index, panic = %panic, "producer panicked"),
                    }
                }
                .in_current_span(),
            );
            index += 1;
        }

        if !cancelled && options.await_completion {
            self.state.send_replace(DriverState::Draining);
            debug!(outstanding = tracker.in_flight(), "draining");
            tokio::select! {
                _ = cancel.cancelled() => cancelled = true,
                _ = tracker.drained() => {}
            }
        }

        run_cancel.cancel();
        if let (Some(pool), Some(id)) = (&self.stats_pool, subscription) {
            pool.engine().unsubscribe(id);
        }
        self.state.send_replace(DriverState::Stopped);

        let report = DriverReport {
            run_id: self.run_id.to_string(),
            started: index,
            succeeded: tracker.succeeded.load(Ordering::Relaxed),
            failed: tracker.failed.load(Ordering::Relaxed),
            peak_in_flight: tracker.peak.load(Ordering::Relaxed),
            cancelled,
            timed_out,
        };
        info!(
            started = report.started,
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled,
            timed_out,
            "driver stopped"
        );
        Ok(report)
    }

    /// Raises throughput by one per interval and scales the pending bound along
    fn spawn_throughput_ramp(
        &self,
        cancel: CancellationToken,
        limiter: Arc<RateLimiter>,
        semaphore: Option<Arc<Semaphore>>,
    ) {
        let interval = Duration::from_secs(self.options.throughput_increment_interval);
        let ratio = self.options.max_pending as f64 / self.options.throughput as f64;
        let mut max_pending = self.options.max_pending;
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(interval) => {}
                    }
                    let throughput = limiter.throughput() + 1;
                    limiter.set_throughput(throughput);
                    if let Some(semaphore) = &semaphore {
                        let raised = (throughput as f64 * ratio) as u64;
                        if raised > max_pending {
                            semaphore.add_permits((raised - max_pending) as usize);
                            max_pending = raised;
                        }
                    }
                    info!(throughput, max_pending, "throughput raised");
                }
            }
            .in_current_span(),
        );
    }
}

fn subscribe_block_stats(pool: &Arc<AccountPool>) -> u64 {
    let tracker = Mutex::new(ThroughputTracker::new());
    let last_submitted = AtomicU64::new(submitted_total(pool));
    let weak = Arc::downgrade(pool);
    pool.engine().subscribe_block_updates(pool.id(), move |update, stats| {
        let Some(pool) = weak.upgrade() else {
            return;
        };
        let pending: u64 = pool.children().iter().map(|c| c.pending_count()).sum();
        let submitted = submitted_total(&pool);
        let submitted_in_block = submitted.saturating_sub(last_submitted.swap(submitted, Ordering::Relaxed));

        let mut tracker = tracker.lock().unwrap_or_else(|p| p.into_inner());
        tracker.record(update.number, stats.confirmed);
        info!(
            block = update.number,
            submitted = submitted_in_block,
            pending,
            confirmed = stats.confirmed,
            wallets = stats.affected_accounts.len(),
            tps_5 = %format!("{:.2}", tracker.average(5, update.number)),
            tps_20 = %format!("{:.2}", tracker.average(20, update.number)),
            tps_60 = %format!("{:.2}", tracker.average(60, update.number)),
            "block stats"
        );
    })
}

fn submitted_total(pool: &AccountPool) -> u64 {
    pool.children().iter().map(|c| c.submitted_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn options(total_count: u64, max_pending: u64) -> DriverOptions {
        DriverOptions {
            total_count,
            max_pending,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admission_bound_and_completions() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let producer = Arc::new(move |_cancel: CancellationToken, _index: u64, slot: SlotGuard| {
            let (active, peak) = (a.clone(), p.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    slot.success();
                });
                anyhow::Ok(())
            }
        });

        let driver = Driver::new(options(1000, 50));
        let report = driver.run(CancellationToken::new(), producer).await.unwrap();
        assert_eq!(report.started, 1000);
        assert_eq!(report.succeeded, 1000);
        assert_eq!(report.failed, 0);
        assert!(report.peak_in_flight <= 50);
        assert!(peak.load(Ordering::SeqCst) <= 50);
        assert_eq!(driver.state(), DriverState::Stopped);
    }

    #[tokio::test]
    async fn test_dropped_slots_and_panics_count_as_failures() {
        let producer = Arc::new(|_cancel: CancellationToken, index: u64, slot: SlotGuard| async move {
            match index % 3 {
                0 => slot.success(),
                1 => drop(slot),
                _ => panic!("producer bug"),
            }
            anyhow::Ok(())
        });
        let report = Driver::new(options(9, 0))
            .run(CancellationToken::new(), producer)
            .await
            .unwrap();
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.failed, 6);
    }

    #[tokio::test]
    async fn test_cancellation_skips_drain() {
        let producer = Arc::new(|_cancel: CancellationToken, _index: u64, slot: SlotGuard| async move {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                drop(slot);
            });
            anyhow::Ok(())
        });
        let cancel = CancellationToken::new();
        let driver = Driver::new(options(0, 2));
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let report = tokio::time::timeout(Duration::from_secs(1), driver.run(cancel, producer))
            .await
            .expect("driver should stop promptly")
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.started, 2);
        assert_eq!(report.succeeded + report.failed, 0);
        assert_eq!(driver.state(), DriverState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_stops_production() {
        let producer = Arc::new(|_cancel: CancellationToken, _index: u64, slot: SlotGuard| async move {
            slot.success();
            anyhow::Ok(())
        });
        let driver = Driver::new(DriverOptions {
            throughput: 12,
            timeout: Some(5),
            ..Default::default()
        });
        let report = driver.run(CancellationToken::new(), producer).await.unwrap();
        assert!(report.timed_out);
        assert!((5..=6).contains(&report.started));
        assert_eq!(report.succeeded, report.started);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_endpoint_backs_off() {
        let producer = Arc::new(|_cancel: CancellationToken, index: u64, slot: SlotGuard| async move {
            if index == 0 {
                return Err(anyhow::Error::from(FloodError::NoEndpoint("default".to_string())));
            }
            slot.success();
            anyhow::Ok(())
        });
        let start = Instant::now();
        let driver = Driver::new(DriverOptions {
            total_count: 2,
            max_pending: 1,
            ..Default::default()
        });
        let report = driver.run(CancellationToken::new(), producer).await.unwrap();
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert!(start.elapsed() >= NO_ENDPOINT_BACKOFF);
    }

    #[tokio::test]
    async fn test_runs_once() {
        let producer = Arc::new(|_cancel: CancellationToken, _index: u64, slot: SlotGuard| async move {
            slot.success();
            anyhow::Ok(())
        });
        let driver = Driver::new(options(1, 0));
        driver.run(CancellationToken::new(), producer.clone()).await.unwrap();
        assert!(driver.run(CancellationToken::new(), producer).await.is_err());
    }
}
