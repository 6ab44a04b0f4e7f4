use std::future::Future;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Run `job` every `period` until `shutdown` is cancelled.
///
/// The first run happens one full period after the call. A run that
/// overruns its period delays the next tick instead of bursting.
pub async fn run_periodic<F, Fut>(name: &str, period: Duration, shutdown: CancellationToken, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("Starting {} loop every {:?}", name, period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("{} loop shutting down", name);
                break;
            }
            _ = ticker.tick() => {
                debug!("{} tick", name);
                job().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_waits_one_period_then_repeats() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let handle = {
            let runs = runs.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_periodic("test", Duration::from_secs(10), shutdown, || {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .await;
            })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_loop_returns() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio_test::assert_ready!(tokio_test::task::spawn(
            run_periodic("idle", Duration::from_secs(3600), shutdown, || async {})
        ).poll());
    }
}
