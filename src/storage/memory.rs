//! In-process storage backends for single-node runs and tests.
//!
//! Both keep the same observable semantics as their networked
//! counterparts, but their state dies with the process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::crawler::task::{Rule, RuleStatus, Task, TaskStatus};
use crate::storage::repository::{RepositoryError, TaskRepository, UpsertOutcome, UpsertReport};
use crate::storage::visits::{VisitCache, VisitCacheError};

#[derive(Debug, Default)]
struct MemoryState {
    rules: Vec<Rule>,
    tasks: Vec<Task>,
    next_rule_id: i64,
    next_task_id: i64,
}

/// Task repository held in memory
#[derive(Debug, Default)]
pub struct MemoryTaskRepository {
    state: Mutex<MemoryState>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a rule, assigning it an id
    pub async fn insert_rule(&self, mut rule: Rule) -> i64 {
        let mut state = self.state.lock().await;
        state.next_rule_id += 1;
        rule.id = state.next_rule_id;
        state.rules.push(rule);
        state.next_rule_id
    }

    /// Snapshot of a rule by id
    pub async fn rule(&self, id: i64) -> Option<Rule> {
        let state = self.state.lock().await;
        state.rules.iter().find(|r| r.id == id).cloned()
    }

    /// Snapshot of a task by id
    pub async fn task(&self, id: i64) -> Option<Task> {
        let state = self.state.lock().await;
        state.tasks.iter().find(|t| t.id == id).cloned()
    }

    /// Snapshot of every stored task
    pub async fn tasks(&self) -> Vec<Task> {
        self.state.lock().await.tasks.clone()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .rules
            .iter()
            .filter(|r| r.status == RuleStatus::Normal && r.next_crawl_time <= now.timestamp())
            .cloned()
            .collect())
    }

    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<UpsertReport, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut report = UpsertReport::default();

        for task in tasks {
            let existing = state
                .tasks
                .iter()
                .position(|t| t.domain == task.domain && t.urlpath == task.urlpath);

            match existing {
                Some(index) => {
                    let stored = &mut state.tasks[index];
                    stored.priority = task.priority;
                    stored.cycle = task.cycle;
                    stored.updated_at = task.updated_at;
                    report.outcomes.push(UpsertOutcome::Updated);
                },
                None => {
                    state.next_task_id += 1;
                    let mut stored = task.clone();
                    stored.id = state.next_task_id;
                    state.tasks.push(stored);
                    report.outcomes.push(UpsertOutcome::Created);
                }
            }
            report.affected += 1;
        }

        Ok(report)
    }

    async fn mark_rules_added(&self, rule_ids: &[i64], now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        let mut state = self.state.lock().await;
        let mut affected = 0;

        for rule in state.rules.iter_mut().filter(|r| rule_ids.contains(&r.id)) {
            rule.status = RuleStatus::Added;
            rule.updated_at = now;
            affected += 1;
        }

        Ok(affected)
    }

    async fn waiting_tasks(
        &self,
        now: DateTime<Utc>,
        crawling_timeout: chrono::Duration,
    ) -> Result<Vec<Task>, RepositoryError> {
        let state = self.state.lock().await;

        Ok(state
            .tasks
            .iter()
            .filter(|t| dispatchable(t, now, crawling_timeout))
            .cloned()
            .collect())
    }

    async fn set_status(
        &self,
        task_ids: &[i64],
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        if task_ids.is_empty() {
            return Err(RepositoryError::NoTasks);
        }

        let mut state = self.state.lock().await;
        let mut affected = 0;

        for task in state.tasks.iter_mut().filter(|t| task_ids.contains(&t.id)) {
            task.status = status;
            task.updated_at = now;
            if status == TaskStatus::Finished {
                task.last_crawl_time = now.timestamp();
                task.crawl_times += 1;
            }
            affected += 1;
        }

        Ok(affected)
    }

    async fn claim_tasks(
        &self,
        task_ids: &[i64],
        now: DateTime<Utc>,
        crawling_timeout: chrono::Duration,
    ) -> Result<Vec<i64>, RepositoryError> {
        if task_ids.is_empty() {
            return Err(RepositoryError::NoTasks);
        }

        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();

        for task in state.tasks.iter_mut().filter(|t| task_ids.contains(&t.id)) {
            if dispatchable(task, now, crawling_timeout) {
                task.status = TaskStatus::Crawling;
                task.updated_at = now;
                claimed.push(task.id);
            }
        }

        Ok(claimed)
    }

    async fn release_tasks(&self, task_ids: &[i64], now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        if task_ids.is_empty() {
            return Err(RepositoryError::NoTasks);
        }

        let mut state = self.state.lock().await;
        let mut affected = 0;

        for task in state.tasks.iter_mut() {
            if task_ids.contains(&task.id) && task.status == TaskStatus::Crawling {
                task.status = TaskStatus::Waiting;
                task.updated_at = now;
                affected += 1;
            }
        }

        Ok(affected)
    }
}

/// WAITING, FINISHED and due, or CRAWLING past the timeout
fn dispatchable(task: &Task, now: DateTime<Utc>, crawling_timeout: chrono::Duration) -> bool {
    match task.status {
        TaskStatus::Waiting => true,
        TaskStatus::Finished => task.cycle + task.last_crawl_time <= now.timestamp(),
        TaskStatus::Crawling => task.updated_at <= now - crawling_timeout,
        _ => false,
    }
}

/// Visit cache held in memory; only shared within one process
#[derive(Debug, Default)]
pub struct MemoryVisitCache {
    visits: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl MemoryVisitCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VisitCache for MemoryVisitCache {
    async fn last_visit(&self, host: &str, domain: &str) -> Result<Option<i64>, VisitCacheError> {
        let visits = self.visits.lock().await;
        Ok(visits.get(host).and_then(|domains| domains.get(domain)).copied())
    }

    async fn record_visit(&self, host: &str, domain: &str, timestamp: i64) -> Result<(), VisitCacheError> {
        let mut visits = self.visits.lock().await;
        visits
            .entry(host.to_string())
            .or_default()
            .insert(domain.to_string(), timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(urlpath: &str, status: RuleStatus, next_crawl_time: i64) -> Rule {
        let now = Utc::now();
        Rule {
            id: 0,
            domain: "http://example.com".to_string(),
            urlpath: urlpath.to_string(),
            xpath: String::new(),
            cycle: 120,
            priority: 1,
            status,
            next_crawl_time,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_due_rules_filters_status_and_time() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        repo.insert_rule(rule("/a", RuleStatus::Normal, 0)).await;
        repo.insert_rule(rule("/b", RuleStatus::Paused, 0)).await;
        repo.insert_rule(rule("/c", RuleStatus::Added, 0)).await;
        repo.insert_rule(rule("/d", RuleStatus::Normal, now.timestamp() + 3600)).await;

        let due = repo.due_rules(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].urlpath, "/a");
    }

    #[tokio::test]
    async fn test_upsert_converges_on_domain_and_path() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        let mut task = rule("/a", RuleStatus::Normal, 0).to_task(now);

        let first = repo.upsert_tasks(&[task.clone()]).await.unwrap();
        assert_eq!(first.outcomes, vec![UpsertOutcome::Created]);

        task.priority = 9;
        task.cycle = 30;
        let second = repo.upsert_tasks(&[task]).await.unwrap();
        assert_eq!(second.outcomes, vec![UpsertOutcome::Updated]);
        assert_eq!(second.affected, 1);

        let tasks = repo.tasks().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].priority, 9);
        assert_eq!(tasks[0].cycle, 30);
    }

    #[tokio::test]
    async fn test_set_status_finished_and_failed() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        repo.upsert_tasks(&[rule("/a", RuleStatus::Normal, 0).to_task(now)]).await.unwrap();

        let later = now + chrono::Duration::seconds(90);
        assert_eq!(repo.set_status(&[1], TaskStatus::Finished, later).await.unwrap(), 1);
        let task = repo.task(1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        assert_eq!(task.crawl_times, 1);
        assert_eq!(task.last_crawl_time, later.timestamp());

        let even_later = later + chrono::Duration::seconds(90);
        repo.set_status(&[1], TaskStatus::Failed, even_later).await.unwrap();
        let task = repo.task(1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.crawl_times, 1);
        assert_eq!(task.last_crawl_time, later.timestamp());
    }

    #[tokio::test]
    async fn test_set_status_refuses_empty_ids() {
        let repo = MemoryTaskRepository::new();
        let result = repo.set_status(&[], TaskStatus::Finished, Utc::now()).await;
        assert!(matches!(result, Err(RepositoryError::NoTasks)));
    }

    #[tokio::test]
    async fn test_waiting_tasks_union() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        let tasks: Vec<Task> = ["/waiting", "/due", "/fresh", "/failed", "/stuck", "/crawling"]
            .iter()
            .map(|p| rule(p, RuleStatus::Normal, 0).to_task(now))
            .collect();
        repo.upsert_tasks(&tasks).await.unwrap();

        let long_ago = now - chrono::Duration::seconds(3600);
        // "/due" finished an hour ago with a 120s cycle, "/fresh" just now
        repo.set_status(&[2], TaskStatus::Finished, long_ago).await.unwrap();
        repo.set_status(&[3], TaskStatus::Finished, now).await.unwrap();
        repo.set_status(&[4], TaskStatus::Failed, now).await.unwrap();
        repo.set_status(&[5], TaskStatus::Crawling, long_ago).await.unwrap();
        repo.set_status(&[6], TaskStatus::Crawling, now).await.unwrap();

        let waiting = repo.waiting_tasks(now, chrono::Duration::seconds(600)).await.unwrap();
        let paths: Vec<&str> = waiting.iter().map(|t| t.urlpath.as_str()).collect();
        assert_eq!(paths, vec!["/waiting", "/due", "/stuck"]);
    }

    #[tokio::test]
    async fn test_claim_skips_tasks_no_longer_dispatchable() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        let tasks: Vec<Task> = ["/a", "/b", "/c"]
            .iter()
            .map(|p| rule(p, RuleStatus::Normal, 0).to_task(now))
            .collect();
        repo.upsert_tasks(&tasks).await.unwrap();

        // Reported between the read and the claim
        repo.set_status(&[2], TaskStatus::Finished, now).await.unwrap();
        repo.set_status(&[3], TaskStatus::Failed, now).await.unwrap();

        let claimed = repo.claim_tasks(&[1, 2, 3], now, chrono::Duration::seconds(600)).await.unwrap();
        assert_eq!(claimed, vec![1]);
        assert_eq!(repo.task(1).await.unwrap().status, TaskStatus::Crawling);
        assert_eq!(repo.task(2).await.unwrap().status, TaskStatus::Finished);
        assert_eq!(repo.task(3).await.unwrap().status, TaskStatus::Failed);

        // Claimed once, not again until the crawling timeout
        assert!(repo.claim_tasks(&[1], now, chrono::Duration::seconds(600)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_reported_status() {
        let repo = MemoryTaskRepository::new();
        let now = Utc::now();
        let tasks: Vec<Task> = ["/a", "/b", "/c"]
            .iter()
            .map(|p| rule(p, RuleStatus::Normal, 0).to_task(now))
            .collect();
        repo.upsert_tasks(&tasks).await.unwrap();
        repo.claim_tasks(&[1, 2, 3], now, chrono::Duration::seconds(600)).await.unwrap();

        let later = now + chrono::Duration::seconds(5);
        repo.set_status(&[1], TaskStatus::Finished, later).await.unwrap();
        repo.set_status(&[2], TaskStatus::Failed, later).await.unwrap();

        assert_eq!(repo.release_tasks(&[1, 2, 3], later).await.unwrap(), 1);

        let finished = repo.task(1).await.unwrap();
        assert_eq!(finished.status, TaskStatus::Finished);
        assert_eq!(finished.crawl_times, 1);
        assert_eq!(repo.task(2).await.unwrap().status, TaskStatus::Failed);
        assert_eq!(repo.task(3).await.unwrap().status, TaskStatus::Waiting);
    }

    #[tokio::test]
    async fn test_mark_rules_added_empty_is_noop() {
        let repo = MemoryTaskRepository::new();
        let id = repo.insert_rule(rule("/a", RuleStatus::Normal, 0)).await;

        assert_eq!(repo.mark_rules_added(&[], Utc::now()).await.unwrap(), 0);
        assert_eq!(repo.rule(id).await.unwrap().status, RuleStatus::Normal);

        assert_eq!(repo.mark_rules_added(&[id], Utc::now()).await.unwrap(), 1);
        assert_eq!(repo.rule(id).await.unwrap().status, RuleStatus::Added);
    }

    #[tokio::test]
    async fn test_visit_cache_roundtrip() {
        let cache = MemoryVisitCache::new();
        assert_eq!(cache.last_visit("10.0.0.1", "example.com").await.unwrap(), None);

        cache.record_visit("10.0.0.1", "example.com", 42).await.unwrap();
        assert_eq!(cache.last_visit("10.0.0.1", "example.com").await.unwrap(), Some(42));
        assert_eq!(cache.last_visit("10.0.0.2", "example.com").await.unwrap(), None);
    }
}
