use std::sync::Arc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::FetcherSettings;
use crate::crawler::client::{PageFetcher, PeerClient};
use crate::crawler::task::TaskPack;
use crate::storage::pages::PageStore;
use crate::storage::queue::TaskQueue;
use crate::utils::metrics::MetricsCollector;

/// Fetcher-side pool of workers draining the intake queue
pub struct FetchWorkerPool {
    settings: FetcherSettings,
    queue: Arc<TaskQueue>,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<dyn PageStore>,
    client: PeerClient,
    metrics: MetricsCollector,
}

impl FetchWorkerPool {
    pub fn new(
        settings: FetcherSettings,
        queue: Arc<TaskQueue>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn PageStore>,
        client: PeerClient,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            settings,
            queue,
            fetcher,
            store,
            client,
            metrics,
        }
    }

    /// Fetch, store, and report one pack; returns the reported outcome.
    ///
    /// A page that was fetched but could not be stored still counts as done.
    pub async fn process(&self, pack: &TaskPack) -> bool {
        let url = pack.url();
        let timer = self.metrics.start_timer();

        let done = match self.fetcher.fetch(&url).await {
            Ok(page) => {
                self.metrics.record_fetch(true, timer.end()).await;
                debug!("Fetched task {} from {} ({} bytes)", pack.task_id, url, page.len());

                if let Err(e) = self.store.save(&pack.domain, &pack.urlpath, &page).await {
                    error!("Failed to store page of task {} ({}): {:#}", pack.task_id, url, e);
                    self.metrics.record_store_failure().await;
                }
                true
            },
            Err(e) => {
                self.metrics.record_fetch(false, timer.end()).await;
                warn!("Failed to fetch task {} ({}): {}", pack.task_id, url, e);
                false
            }
        };

        if let Err(e) = self.client.report_task(&self.settings.scheduler_addr, pack.task_id, done).await {
            error!("Failed to report task {} (done={}): {}", pack.task_id, done, e);
            self.metrics.record_report_failure().await;
        }

        done
    }

    /// One worker: take packs until shutdown, finishing the current one first
    async fn work(&self, worker_id: usize, shutdown: CancellationToken) {
        debug!("Worker {} started", worker_id);

        loop {
            let pack = tokio::select! {
                _ = shutdown.cancelled() => break,
                pack = self.queue.dequeue() => match pack {
                    Some(pack) => pack,
                    None => break,
                },
            };

            self.metrics.set_queue_depth(self.queue.depth()).await;
            self.process(&pack).await;
        }

        debug!("Worker {} stopped", worker_id);
    }

    /// Run every worker until `shutdown` is cancelled; returns once all
    /// of them have exited
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Starting {} fetch workers", self.settings.workers);

        let workers = (0..self.settings.workers).map(|worker_id| {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { pool.work(worker_id, shutdown).await })
        });

        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!("Fetch worker panicked: {}", e);
            }
        }

        info!("All fetch workers stopped");
    }
}
