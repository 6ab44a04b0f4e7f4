use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cli::config::RepositorySettings;
use crate::crawler::task::{Rule, RuleStatus, Task, TaskStatus};
use crate::storage::memory::MemoryTaskRepository;

/// Errors raised by a task repository
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The operation was given nothing to work on
    #[error("no tasks to operate on")]
    NoTasks,

    /// Parallel collections handed in by the caller do not line up
    #[error("{rules} rules do not match {outcomes} upsert outcomes")]
    LengthMismatch { rules: usize, outcomes: usize },

    /// A stored row carries a status code this build does not know
    #[error("unknown status code {0} in storage")]
    InvalidStatus(i32),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What happened to one task of an upsert batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was inserted
    Created,

    /// A row with the same (domain, urlpath) existed and was updated
    Updated,

    /// The row could not be written; the rest of the batch went on
    Failed(String),
}

impl UpsertOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, UpsertOutcome::Created)
    }
}

/// Aggregate result of an upsert batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertReport {
    /// Rows inserted or updated
    pub affected: u64,

    /// One outcome per input task, in input order
    pub outcomes: Vec<UpsertOutcome>,
}

impl UpsertReport {
    pub fn created(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_created()).count()
    }
}

/// Durable record of rules and tasks
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Rules in NORMAL status whose next crawl time has come
    async fn due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, RepositoryError>;

    /// Insert tasks, or update priority/cycle of an existing (domain, urlpath)
    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<UpsertReport, RepositoryError>;

    /// Move rules to ADDED; an empty id list is a no-op
    async fn mark_rules_added(&self, rule_ids: &[i64], now: DateTime<Utc>) -> Result<u64, RepositoryError>;

    /// WAITING tasks, FINISHED tasks due for re-crawl, and CRAWLING tasks
    /// left unreported for longer than `crawling_timeout`
    async fn waiting_tasks(
        &self,
        now: DateTime<Utc>,
        crawling_timeout: chrono::Duration,
    ) -> Result<Vec<Task>, RepositoryError>;

    /// Bulk status transition; FINISHED also stamps the crawl time and
    /// increments the crawl counter
    async fn set_status(
        &self,
        task_ids: &[i64],
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError>;

    /// Move to CRAWLING those of `task_ids` that `waiting_tasks` would
    /// still return; yields the ids actually claimed
    async fn claim_tasks(
        &self,
        task_ids: &[i64],
        now: DateTime<Utc>,
        crawling_timeout: chrono::Duration,
    ) -> Result<Vec<i64>, RepositoryError>;

    /// Move back to WAITING those of `task_ids` still in CRAWLING. A task
    /// already reported FINISHED or FAILED keeps its status.
    async fn release_tasks(&self, task_ids: &[i64], now: DateTime<Utc>) -> Result<u64, RepositoryError>;
}

/// Pick the rules whose task was freshly created by an upsert batch.
///
/// `outcomes` must be the per-item result of upserting the tasks converted
/// from `rules`, in the same order.
pub fn rules_to_mark(rules: &[Rule], outcomes: &[UpsertOutcome]) -> Result<Vec<i64>, RepositoryError> {
    if outcomes.is_empty() {
        return Err(RepositoryError::NoTasks);
    }
    if rules.len() != outcomes.len() {
        return Err(RepositoryError::LengthMismatch {
            rules: rules.len(),
            outcomes: outcomes.len(),
        });
    }

    Ok(rules
        .iter()
        .zip(outcomes)
        .filter(|(_, outcome)| outcome.is_created())
        .map(|(rule, _)| rule.id)
        .collect())
}

/// Factory for creating a TaskRepository implementation
pub struct TaskRepositoryFactory;

impl TaskRepositoryFactory {
    /// Create a new TaskRepository instance based on the settings
    pub async fn create(settings: &RepositorySettings) -> anyhow::Result<Arc<dyn TaskRepository>> {
        match settings.storage_type.as_str() {
            "postgresql" => {
                let repository = PostgresTaskRepository::new(settings).await?;
                Ok(Arc::new(repository))
            },
            "memory" => {
                warn!("Using in-memory task repository; state is lost on exit");
                Ok(Arc::new(MemoryTaskRepository::new()))
            },
            _ => {
                anyhow::bail!("Unsupported task repository type: {}", settings.storage_type);
            }
        }
    }
}

/// PostgreSQL implementation of TaskRepository
pub struct PostgresTaskRepository {
    /// PostgreSQL connection pool
    pool: Pool<Postgres>,

    /// Schema name
    schema: String,

    /// Table prefix
    table_prefix: String,
}

const RULE_COLUMNS: &str = "id, domain, urlpath, xpath, cycle, priority, status, next_crawl_time, create_time, update_time";
const TASK_COLUMNS: &str = "id, domain, urlpath, priority, cycle, status, last_crawl_time, crawl_times, create_time, update_time";

#[derive(Debug, sqlx::FromRow)]
struct RuleRow {
    id: i64,
    domain: String,
    urlpath: String,
    xpath: String,
    cycle: i64,
    priority: i32,
    status: i32,
    next_crawl_time: i64,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = RepositoryError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(Rule {
            id: row.id,
            domain: row.domain,
            urlpath: row.urlpath,
            xpath: row.xpath,
            cycle: row.cycle,
            priority: row.priority,
            status: RuleStatus::try_from(row.status).map_err(RepositoryError::InvalidStatus)?,
            next_crawl_time: row.next_crawl_time,
            created_at: row.create_time,
            updated_at: row.update_time,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: i64,
    domain: String,
    urlpath: String,
    priority: i32,
    cycle: i64,
    status: i32,
    last_crawl_time: i64,
    crawl_times: i64,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
}

impl TryFrom<TaskRow> for Task {
    type Error = RepositoryError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Task {
            id: row.id,
            domain: row.domain,
            urlpath: row.urlpath,
            priority: row.priority,
            cycle: row.cycle,
            status: TaskStatus::try_from(row.status).map_err(RepositoryError::InvalidStatus)?,
            last_crawl_time: row.last_crawl_time,
            crawl_times: row.crawl_times,
            created_at: row.create_time,
            updated_at: row.update_time,
        })
    }
}

impl PostgresTaskRepository {
    /// Create a new PostgreSQL repository instance
    pub async fn new(settings: &RepositorySettings) -> anyhow::Result<Self> {
        // Create connection pool
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(&settings.connection_string)
            .await
            .context(format!("Failed to connect to PostgreSQL: {}", settings.connection_string))?;

        let repository = Self {
            pool,
            schema: settings.schema_name.clone(),
            table_prefix: settings.table_prefix.clone(),
        };

        repository.ensure_schema().await?;

        debug!("Connected to PostgreSQL database");

        Ok(repository)
    }

    fn rules_table(&self) -> String {
        format!("{}.{}_rules", self.schema, self.table_prefix)
    }

    fn tasks_table(&self) -> String {
        format!("{}.{}_tasks", self.schema, self.table_prefix)
    }

    /// Ensure the schema and both tables exist
    async fn ensure_schema(&self) -> anyhow::Result<()> {
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {}", self.schema),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    domain TEXT NOT NULL,
                    urlpath TEXT NOT NULL,
                    xpath TEXT NOT NULL DEFAULT '',
                    cycle BIGINT NOT NULL DEFAULT 0,
                    priority INTEGER NOT NULL DEFAULT 0,
                    status INTEGER NOT NULL DEFAULT 0,
                    next_crawl_time BIGINT NOT NULL DEFAULT 0,
                    create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    update_time TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )",
                self.rules_table()
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGSERIAL PRIMARY KEY,
                    domain TEXT NOT NULL,
                    urlpath TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    cycle BIGINT NOT NULL DEFAULT 0,
                    status INTEGER NOT NULL DEFAULT 0,
                    last_crawl_time BIGINT NOT NULL DEFAULT 0,
                    crawl_times BIGINT NOT NULL DEFAULT 0,
                    create_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    update_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    UNIQUE (domain, urlpath)
                )",
                self.tasks_table()
            ),
        ];

        for statement in &statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context(format!("Failed to prepare schema: {}", self.schema))?;
        }

        debug!("Ensured rule and task tables exist in schema: {}", self.schema);

        Ok(())
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    async fn due_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, RepositoryError> {
        let query = format!(
            "SELECT {} FROM {} WHERE status = $1 AND next_crawl_time <= $2 ORDER BY id",
            RULE_COLUMNS,
            self.rules_table()
        );

        let rows: Vec<RuleRow> = sqlx::query_as(&query)
            .bind(RuleStatus::Normal.code())
            .bind(now.timestamp())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Rule::try_from).collect()
    }

    async fn upsert_tasks(&self, tasks: &[Task]) -> Result<UpsertReport, RepositoryError> {
        let query = format!(
            "INSERT INTO {} (domain, urlpath, priority, cycle, status, last_crawl_time, crawl_times, create_time, update_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (domain, urlpath) DO UPDATE
             SET priority = EXCLUDED.priority, cycle = EXCLUDED.cycle, update_time = EXCLUDED.update_time
             RETURNING (xmax = 0) AS inserted",
            self.tasks_table()
        );

        let mut tx = self.pool.begin().await?;
        let mut report = UpsertReport::default();

        for task in tasks {
            // Each row gets its own savepoint so a failure does not poison the batch
            sqlx::query("SAVEPOINT upsert_task").execute(&mut *tx).await?;

            let inserted = sqlx::query_scalar::<_, bool>(&query)
                .bind(&task.domain)
                .bind(&task.urlpath)
                .bind(task.priority)
                .bind(task.cycle)
                .bind(task.status.code())
                .bind(task.last_crawl_time)
                .bind(task.crawl_times)
                .bind(task.created_at)
                .bind(task.updated_at)
                .fetch_one(&mut *tx)
                .await;

            match inserted {
                Ok(inserted) => {
                    sqlx::query("RELEASE SAVEPOINT upsert_task").execute(&mut *tx).await?;
                    report.affected += 1;
                    report.outcomes.push(if inserted {
                        UpsertOutcome::Created
                    } else {
                        UpsertOutcome::Updated
                    });
                },
                Err(e) => {
                    error!("Failed to upsert task {}{}: {}", task.domain, task.urlpath, e);
                    sqlx::query("ROLLBACK TO SAVEPOINT upsert_task").execute(&mut *tx).await?;
                    report.outcomes.push(UpsertOutcome::Failed(e.to_string()));
                }
            }
        }

        tx.commit().await?;

        debug!("Upserted {} of {} tasks", report.affected, tasks.len());

        Ok(report)
    }

    async fn mark_rules_added(&self, rule_ids: &[i64], now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        if rule_ids.is_empty() {
            return Ok(0);
        }

        let query = format!(
            "UPDATE {} SET status = $1, update_time = $2 WHERE id = ANY($3)",
            self.rules_table()
        );

        let result = sqlx::query(&query)
            .bind(RuleStatus::Added.code())
            .bind(now)
            .bind(rule_ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn waiting_tasks(
        &self,
        now: DateTime<Utc>,
        crawling_timeout: chrono::Duration,
    ) -> Result<Vec<Task>, RepositoryError> {
        let query = format!(
            "SELECT {} FROM {}
             WHERE status = $1
                OR (status = $2 AND cycle + last_crawl_time <= $3)
                OR (status = $4 AND update_time <= $5)
             ORDER BY id",
            TASK_COLUMNS,
            self.tasks_table()
        );

        let rows: Vec<TaskRow> = sqlx::query_as(&query)
            .bind(TaskStatus::Waiting.code())
            .bind(TaskStatus::Finished.code())
            .bind(now.timestamp())
            .bind(TaskStatus::Crawling.code())
            .bind(now - crawling_timeout)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Task::try_from).collect()
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

        let result = if status == TaskStatus::Finished {
            let query = format!(
                "UPDATE {} SET status = $1, last_crawl_time = $2, crawl_times = crawl_times + 1, update_time = $3
                 WHERE id = ANY($4)",
                self.tasks_table()
            );
            sqlx::query(&query)
                .bind(status.code())
                .bind(now.timestamp())
                .bind(now)
                .bind(task_ids)
                .execute(&self.pool)
                .await?
        } else {
            let query = format!(
                "UPDATE {} SET status = $1, update_time = $2 WHERE id = ANY($3)",
                self.tasks_table()
            );
            sqlx::query(&query)
                .bind(status.code())
                .bind(now)
                .bind(task_ids)
                .execute(&self.pool)
                .await?
        };

        Ok(result.rows_affected())
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

        // Same eligibility as waiting_tasks, re-checked under the row lock
        let query = format!(
            "UPDATE {} SET status = $1, update_time = $2
             WHERE id = ANY($3)
               AND (status = $4
                    OR (status = $5 AND cycle + last_crawl_time <= $6)
                    OR (status = $1 AND update_time <= $7))
             RETURNING id",
            self.tasks_table()
        );

        let mut claimed: Vec<i64> = sqlx::query_scalar(&query)
            .bind(TaskStatus::Crawling.code())
            .bind(now)
            .bind(task_ids)
            .bind(TaskStatus::Waiting.code())
            .bind(TaskStatus::Finished.code())
            .bind(now.timestamp())
            .bind(now - crawling_timeout)
            .fetch_all(&self.pool)
            .await?;
        claimed.sort_unstable();

        Ok(claimed)
    }

    async fn release_tasks(&self, task_ids: &[i64], now: DateTime<Utc>) -> Result<u64, RepositoryError> {
        if task_ids.is_empty() {
            return Err(RepositoryError::NoTasks);
        }

        let query = format!(
            "UPDATE {} SET status = $1, update_time = $2 WHERE id = ANY($3) AND status = $4",
            self.tasks_table()
        );

        let result = sqlx::query(&query)
            .bind(TaskStatus::Waiting.code())
            .bind(now)
            .bind(task_ids)
            .bind(TaskStatus::Crawling.code())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
