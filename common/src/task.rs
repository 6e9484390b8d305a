// Standard library imports
use std::{any::Any, future::Future, panic::AssertUnwindSafe, time::Duration};

// Third party imports
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

/// Delay before a panicked background loop is started again
pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(5);

/// Spawns a background loop under a supervisor.
///
/// `factory` builds a fresh loop future for every (re)start. A panic inside the loop is
/// caught and logged, and the loop is restarted after `restart_delay`. A loop that returns
/// normally or observes `cancel` is not restarted.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    cancel: CancellationToken,
    restart_delay: Duration,
    mut factory: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let span = tracing::Span::current();
    tokio::spawn(
        async move {
            loop {
                let run = AssertUnwindSafe(factory()).catch_unwind();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = run => match result {
                        Ok(()) => {
                            debug!(task = name, "background task finished");
                            break;
                        }
                        Err(payload) => {
                            error!(
                                task = name,
                                panic = %panic_message(payload.as_ref()),
                                "background task panicked, restarting"
                            );
                        }
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(restart_delay) => {}
                }
            }
        }
        .instrument(span),
    )
}

/// Runs a future and turns a panic into an error string
pub async fn catch_panic<F: Future>(future: F) -> Result<F::Output, String> {
    AssertUnwindSafe(future)
        .catch_unwind()
        .await
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// Extracts a printable message from a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn test_supervisor_restarts_after_panic() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_supervised(
            "flaky",
            CancellationToken::new(),
            Duration::from_millis(10),
            move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("first run fails");
                    }
                }
            },
        );
        handle.await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_supervisor_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn_supervised("forever", cancel.clone(), Duration::from_millis(10), || {
            futures::future::pending::<()>()
        });
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("supervisor should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_catch_panic() {
        let ok = catch_panic(async { 5 }).await;
        assert_eq!(ok, Ok(5));
        let err = catch_panic(async { panic!("boom") }).await;
        assert_eq!(err, Err::<(), _>("boom".to_string()));
    }
}
