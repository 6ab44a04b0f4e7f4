use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use std::fmt;

/// Lifecycle of a crawl task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum TaskStatus {
    Canceled,
    Waiting,
    Crawling,
    Finished,
    Failed,
}

impl TaskStatus {
    /// Integer code stored in the task table
    pub fn code(self) -> i32 {
        match self {
            TaskStatus::Canceled => -1,
            TaskStatus::Waiting => 0,
            TaskStatus::Crawling => 1,
            TaskStatus::Finished => 2,
            TaskStatus::Failed => 3,
        }
    }
}

impl From<TaskStatus> for i32 {
    fn from(status: TaskStatus) -> i32 {
        status.code()
    }
}

impl TryFrom<i32> for TaskStatus {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(TaskStatus::Canceled),
            0 => Ok(TaskStatus::Waiting),
            1 => Ok(TaskStatus::Crawling),
            2 => Ok(TaskStatus::Finished),
            3 => Ok(TaskStatus::Failed),
            other => Err(other),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskStatus::Canceled => "canceled",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Crawling => "crawling",
            TaskStatus::Finished => "finished",
            TaskStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a crawl rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum RuleStatus {
    Paused,
    Normal,
    Added,
}

impl RuleStatus {
    /// Integer code stored in the rule table
    pub fn code(self) -> i32 {
        match self {
            RuleStatus::Paused => -1,
            RuleStatus::Normal => 0,
            RuleStatus::Added => 1,
        }
    }
}

impl From<RuleStatus> for i32 {
    fn from(status: RuleStatus) -> i32 {
        status.code()
    }
}

impl TryFrom<i32> for RuleStatus {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            -1 => Ok(RuleStatus::Paused),
            0 => Ok(RuleStatus::Normal),
            1 => Ok(RuleStatus::Added),
            other => Err(other),
        }
    }
}

/// Operator-defined recurring crawl target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,

    /// Site the rule targets, optionally with a scheme prefix
    pub domain: String,

    /// Path on the site, appended to the domain when fetching
    pub urlpath: String,

    /// Extraction hint carried for downstream consumers
    pub xpath: String,

    /// Re-crawl period in seconds
    pub cycle: i64,

    /// Operator priority (higher values = dispatched earlier)
    pub priority: i32,

    pub status: RuleStatus,

    /// Unix seconds before which the rule is not imported
    pub next_crawl_time: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Materialize the task this rule describes
    pub fn to_task(&self, now: DateTime<Utc>) -> Task {
        Task {
            id: 0,
            domain: self.domain.clone(),
            urlpath: self.urlpath.clone(),
            priority: self.priority,
            cycle: self.cycle,
            status: TaskStatus::Waiting,
            last_crawl_time: 0,
            crawl_times: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One schedulable unit of crawl work, unique per (domain, urlpath)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Storage-assigned identifier (0 before the task is persisted)
    pub id: i64,
    pub domain: String,
    pub urlpath: String,
    pub priority: i32,

    /// Re-crawl period in seconds
    pub cycle: i64,

    pub status: TaskStatus,

    /// Unix seconds of the last finished crawl (0 if never crawled)
    pub last_crawl_time: i64,

    /// Number of finished crawls
    pub crawl_times: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Minimal wire payload pushed to a fetch worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPack {
    pub task_id: i64,
    pub domain: String,
    pub urlpath: String,

    #[serde(rename = "follow", default)]
    pub follow_links: bool,
}

impl TaskPack {
    /// Destination URL of the page this pack asks for
    pub fn url(&self) -> String {
        if self.domain.contains("://") {
            format!("{}{}", self.domain, self.urlpath)
        } else {
            format!("http://{}{}", self.domain, self.urlpath)
        }
    }
}

impl From<&Task> for TaskPack {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            domain: task.domain.clone(),
            urlpath: task.urlpath.clone(),
            follow_links: false,
        }
    }
}

/// Strip the scheme prefix (everything up to and including the first `//`)
pub fn canonical_domain(domain: &str) -> &str {
    match domain.split_once("//") {
        Some((_, rest)) => rest,
        None => domain,
    }
}
