use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Result, Context};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, error};

use crate::cli::config::DispatchConfig;
use crate::crawler::client::{HttpPageFetcher, PeerClient};
use crate::crawler::politeness::PolitenessTracker;
use crate::crawler::scheduler::DispatchEngine;
use crate::crawler::worker::FetchWorkerPool;
use crate::server::{self, fetcher::FetcherState, scheduler::SchedulerState};
use crate::storage::pages::PageStoreFactory;
use crate::storage::queue::TaskQueue;
use crate::storage::repository::TaskRepositoryFactory;
use crate::storage::visits::VisitCacheFactory;
use crate::utils::metrics::MetricsCollector;

/// Run the dispatch engine with its completion-report endpoint
pub async fn scheduler(config_path: Option<PathBuf>) -> Result<()> {
    let config = DispatchConfig::load(config_path.as_deref())?;
    let settings = config.scheduler.clone();

    let repository = TaskRepositoryFactory::create(&config.storage.repository)
        .await
        .context("Failed to open the task repository")?;
    let visits = VisitCacheFactory::create(&config.storage.visit_cache)
        .await
        .context("Failed to open the visit cache")?;

    let politeness = PolitenessTracker::new(
        visits,
        settings.min_host_visit_interval_secs,
        settings.politeness_fail_open,
    );
    let client = PeerClient::new(settings.push_timeout(), &settings.push_path, &config.fetcher.report_path)?;
    let metrics = MetricsCollector::new();

    let engine = Arc::new(DispatchEngine::new(
        settings.clone(),
        repository.clone(),
        politeness,
        client,
        metrics.clone(),
    ));

    let app = server::scheduler::router(
        SchedulerState { repository, metrics },
        &config.fetcher.report_path,
    );

    info!("Scheduler dispatching to {} fetchers", settings.fetchers.len());

    let shutdown = shutdown_on_ctrl_c();
    let (served, _) = tokio::join!(
        serve_until_stopped(&settings.listen_addr, app, shutdown.clone()),
        engine.run(shutdown.clone()),
    );

    info!("Scheduler stopped");
    served
}

/// Run a fetch worker pool with its intake endpoint
pub async fn fetcher(config_path: Option<PathBuf>, workers: Option<usize>) -> Result<()> {
    let mut config = DispatchConfig::load(config_path.as_deref())?;
    if let Some(workers) = workers {
        if workers == 0 {
            anyhow::bail!("Fetcher needs at least one worker");
        }
        config.fetcher.workers = workers;
    }
    let settings = config.fetcher.clone();

    let store = PageStoreFactory::create(&settings.page_store)
        .await
        .context("Failed to open the page store")?;
    let page_fetcher = HttpPageFetcher::new(settings.fetch_timeout(), &settings.user_agent)?;
    let client = PeerClient::new(settings.fetch_timeout(), &config.scheduler.push_path, &settings.report_path)?;

    let queue = Arc::new(TaskQueue::new(settings.queue_capacity));
    let metrics = MetricsCollector::new();

    info!("Fetcher running {} workers over a queue of {}", settings.workers, queue.capacity());

    let pool = Arc::new(FetchWorkerPool::new(
        settings.clone(),
        queue.clone(),
        Arc::new(page_fetcher),
        store,
        client,
        metrics.clone(),
    ));

    let app = server::fetcher::router(
        FetcherState {
            queue,
            admission_window: settings.admission_window(),
            metrics,
        },
        &config.scheduler.push_path,
    );

    let shutdown = shutdown_on_ctrl_c();
    let (served, _) = tokio::join!(
        serve_until_stopped(&settings.listen_addr, app, shutdown.clone()),
        pool.run(shutdown.clone()),
    );

    info!("Fetcher stopped");
    served
}

/// Print the configuration as YAML
pub fn show_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = DispatchConfig::load(config_path.as_deref())?;
    let path = config_path.unwrap_or_else(DispatchConfig::default_path);

    println!("# {}", path.display());
    print!("{}", serde_yaml::to_string(&config).context("Failed to serialize configuration")?);

    Ok(())
}

/// Write the default configuration, keeping an existing file untouched
pub fn init_config(config_path: Option<PathBuf>) -> Result<()> {
    let path = config_path.unwrap_or_else(DispatchConfig::default_path);

    if path.exists() {
        warn!("Configuration already exists at {}, leaving it unchanged", path.display());
        return Ok(());
    }

    DispatchConfig::default().save_to_file(&path)?;
    println!("Created default configuration: {}", path.display());

    Ok(())
}

/// Serve an HTTP surface; a server that stops early takes the loops down too
async fn serve_until_stopped(addr: &str, app: axum::Router, shutdown: CancellationToken) -> Result<()> {
    let result = server::serve(addr, app, shutdown.clone()).await;
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    shutdown.cancel();
    result
}

/// Token cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                trigger.cancel();
            },
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    shutdown
}
