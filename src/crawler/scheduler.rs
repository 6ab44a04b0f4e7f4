use std::collections::HashSet;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::SchedulerSettings;
use crate::crawler::client::PeerClient;
use crate::crawler::cron::run_periodic;
use crate::crawler::politeness::PolitenessTracker;
use crate::crawler::ranker::Ranker;
use crate::crawler::task::{Task, TaskPack};
use crate::storage::repository::{rules_to_mark, RepositoryError, TaskRepository, UpsertOutcome};
use crate::utils::metrics::MetricsCollector;

/// Outcome of one rule-import cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportSummary {
    /// Rules found due
    pub due: usize,

    /// Tasks newly created by the upsert
    pub created: usize,

    /// Rules moved to ADDED
    pub marked: u64,
}

/// What one fetcher received in a dispatch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetcherBatch {
    pub fetcher: String,

    /// Task ids selected for this fetcher, in rank order
    pub selected: Vec<i64>,

    /// Task ids the fetcher confirmed
    pub admitted: Vec<i64>,

    /// Whether the push itself failed
    pub push_failed: bool,
}

/// Outcome of one dispatch cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Tasks eligible for dispatch this cycle
    pub candidates: usize,

    /// Non-empty batches, in fetcher order
    pub batches: Vec<FetcherBatch>,
}

impl DispatchSummary {
    pub fn dispatched(&self) -> usize {
        self.batches.iter().map(|b| b.selected.len()).sum()
    }

    pub fn admitted(&self) -> usize {
        self.batches.iter().map(|b| b.admitted.len()).sum()
    }

    pub fn push_failures(&self) -> usize {
        self.batches.iter().filter(|b| b.push_failed).count()
    }
}

/// Scheduler-side engine: turns rules into tasks and hands tasks to fetchers
pub struct DispatchEngine {
    settings: SchedulerSettings,
    repository: Arc<dyn TaskRepository>,
    politeness: PolitenessTracker,
    client: PeerClient,
    metrics: MetricsCollector,
}

impl DispatchEngine {
    pub fn new(
        settings: SchedulerSettings,
        repository: Arc<dyn TaskRepository>,
        politeness: PolitenessTracker,
        client: PeerClient,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            settings,
            repository,
            politeness,
            client,
            metrics,
        }
    }

    /// Run one rule-import cycle now
    pub async fn import_rules(&self) -> Result<ImportSummary, RepositoryError> {
        self.import_rules_at(Utc::now()).await
    }

    /// Materialize every due rule as a task and mark the rules whose task
    /// was newly created.
    ///
    /// A rule whose task already existed stays NORMAL and is considered
    /// again next cycle.
    pub async fn import_rules_at(&self, now: DateTime<Utc>) -> Result<ImportSummary, RepositoryError> {
        let rules = self.repository.due_rules(now).await?;
        if rules.is_empty() {
            debug!("No due rules");
            return Ok(ImportSummary::default());
        }

        let tasks: Vec<Task> = rules.iter().map(|rule| rule.to_task(now)).collect();
        let report = self.repository.upsert_tasks(&tasks).await?;

        for (rule, outcome) in rules.iter().zip(&report.outcomes) {
            if let UpsertOutcome::Failed(reason) = outcome {
                warn!("Failed to upsert task for rule {} ({}{}): {}", rule.id, rule.domain, rule.urlpath, reason);
            }
        }

        let rule_ids = match rules_to_mark(&rules, &report.outcomes) {
            Ok(ids) => ids,
            Err(RepositoryError::NoTasks) => {
                warn!("Upsert of {} tasks reported no outcomes", tasks.len());
                return Ok(ImportSummary { due: rules.len(), ..Default::default() });
            },
            Err(e) => return Err(e),
        };

        let marked = self.repository.mark_rules_added(&rule_ids, now).await?;

        let summary = ImportSummary {
            due: rules.len(),
            created: report.created(),
            marked,
        };

        info!("Imported {} due rules: {} new tasks, {} rules marked added", summary.due, summary.created, summary.marked);
        self.metrics.record_import(summary.created, summary.marked as usize).await;

        Ok(summary)
    }

    /// Run one dispatch cycle now
    pub async fn dispatch(&self) -> Result<DispatchSummary, RepositoryError> {
        self.dispatch_at(Utc::now()).await
    }

    /// Rank waiting tasks and push a politeness-filtered batch to every
    /// fetcher, in configured order.
    ///
    /// No task lands in two batches of the same cycle. Every selected task
    /// reserves its (domain, fetcher host) visit before the push, and that
    /// reservation stands even if the push fails.
    pub async fn dispatch_at(&self, now: DateTime<Utc>) -> Result<DispatchSummary, RepositoryError> {
        let mut tasks = self.repository
            .waiting_tasks(now, self.settings.crawling_timeout())
            .await?;

        if tasks.is_empty() {
            debug!("No waiting tasks to dispatch");
            self.metrics.record_dispatch(0, 0, 0).await;
            return Ok(DispatchSummary::default());
        }

        let timestamp = now.timestamp();
        Ranker::new(timestamp).rank(&mut tasks);

        let mut summary = DispatchSummary {
            candidates: tasks.len(),
            batches: Vec::new(),
        };
        let mut picked: HashSet<i64> = HashSet::new();

        for fetcher in &self.settings.fetchers {
            let batch = self.select_batch(fetcher, &tasks, &mut picked, timestamp).await;
            if batch.is_empty() {
                debug!("Nothing to dispatch to {}", fetcher);
                continue;
            }

            summary.batches.push(self.push_batch(fetcher, &batch, now).await);
        }

        info!(
            "Dispatch cycle: {} candidates, {} dispatched, {} admitted, {} push failures",
            summary.candidates,
            summary.dispatched(),
            summary.admitted(),
            summary.push_failures()
        );
        self.metrics
            .record_dispatch(summary.dispatched(), summary.admitted(), summary.push_failures())
            .await;

        Ok(summary)
    }

    /// Pick the tasks `fetcher` may visit now, reserving each visit
    async fn select_batch<'a>(
        &self,
        fetcher: &str,
        ranked: &'a [Task],
        picked: &mut HashSet<i64>,
        timestamp: i64,
    ) -> Vec<&'a Task> {
        let mut batch = Vec::new();

        for task in ranked {
            if picked.contains(&task.id) {
                continue;
            }

            match self.politeness.is_polite_at(&task.domain, fetcher, timestamp).await {
                Ok(true) => {},
                Ok(false) => {
                    debug!("Task {} skipped for {}: {} visited too recently", task.id, fetcher, task.domain);
                    continue;
                },
                Err(e) => {
                    warn!("Task {} skipped for {}: {}", task.id, fetcher, e);
                    continue;
                }
            }

            if let Err(e) = self.politeness.record_visit(&task.domain, fetcher, timestamp).await {
                warn!("Task {} skipped for {}: could not reserve visit: {}", task.id, fetcher, e);
                continue;
            }

            picked.insert(task.id);
            batch.push(task);
        }

        batch
    }

    /// Claim, push, and release whatever the fetcher did not take
    async fn push_batch(&self, fetcher: &str, batch: &[&Task], now: DateTime<Utc>) -> FetcherBatch {
        let selected: Vec<i64> = batch.iter().map(|task| task.id).collect();
        let mut result = FetcherBatch {
            fetcher: fetcher.to_string(),
            selected: selected.clone(),
            ..Default::default()
        };

        let claimed = match self.repository
            .claim_tasks(&selected, now, self.settings.crawling_timeout())
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                error!("Failed to claim {} tasks for {}, not pushing: {}", selected.len(), fetcher, e);
                result.push_failed = true;
                return result;
            }
        };

        if claimed.len() < selected.len() {
            debug!("{} of {} tasks for {} changed status before the claim", selected.len() - claimed.len(), selected.len(), fetcher);
        }
        if claimed.is_empty() {
            return result;
        }

        let packs: Vec<TaskPack> = batch
            .iter()
            .filter(|task| claimed.contains(&task.id))
            .map(|task| TaskPack::from(*task))
            .collect();

        match self.client.push_tasks(fetcher, &packs).await {
            Ok(admitted) => {
                let admitted: HashSet<i64> = admitted.iter().map(|pack| pack.task_id).collect();
                result.admitted = selected.iter().copied().filter(|id| admitted.contains(id) && claimed.contains(id)).collect();
                debug!("{} admitted {} of {} tasks", fetcher, result.admitted.len(), packs.len());
            },
            Err(e) => {
                error!("Push of {} tasks to {} failed: {}", packs.len(), fetcher, e);
                result.push_failed = true;
            }
        }

        let rejected: Vec<i64> = claimed
            .iter()
            .copied()
            .filter(|id| !result.admitted.contains(id))
            .collect();

        // Only tasks still CRAWLING go back; a report may already have landed
        if !rejected.is_empty() {
            if let Err(e) = self.repository.release_tasks(&rejected, Utc::now()).await {
                warn!("Failed to release {} tasks not taken by {}: {}", rejected.len(), fetcher, e);
            }
        }

        result
    }

    /// Run both periodic loops until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let import_engine = self.clone();
        let import_loop = run_periodic(
            "rule import",
            self.settings.rule_import_period(),
            shutdown.clone(),
            move || {
                let engine = import_engine.clone();
                async move {
                    if let Err(e) = engine.import_rules().await {
                        error!("Rule import failed: {}", e);
                    }
                }
            },
        );

        let dispatch_engine = self.clone();
        let dispatch_loop = run_periodic(
            "dispatch",
            self.settings.dispatch_period(),
            shutdown,
            move || {
                let engine = dispatch_engine.clone();
                async move {
                    if let Err(e) = engine.dispatch().await {
                        error!("Dispatch failed: {}", e);
                    }
                }
            },
        );

        tokio::join!(import_loop, dispatch_loop);
    }
}
