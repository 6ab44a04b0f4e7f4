use std::collections::HashMap;
use std::sync::Arc;
use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::crawler::task::TaskStatus;
use crate::server::envelope::{JsonResult, ERR_DB, ERR_INPUT};
use crate::storage::repository::TaskRepository;
use crate::utils::metrics::{Metrics, MetricsCollector};

/// Shared state of the completion-report surface
#[derive(Clone)]
pub struct SchedulerState {
    pub repository: Arc<dyn TaskRepository>,
    pub metrics: MetricsCollector,
}

/// Build the scheduler router, serving completion reports on `report_path`
pub fn router(state: SchedulerState, report_path: &str) -> Router {
    Router::new()
        .route(report_path, get(report_task))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A validated completion report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Report {
    task_id: i64,
    done: bool,
}

impl Report {
    fn status(self) -> TaskStatus {
        if self.done {
            TaskStatus::Finished
        } else {
            TaskStatus::Failed
        }
    }
}

fn required_int(params: &HashMap<String, String>, key: &str) -> Result<i64, String> {
    let value = params
        .get(key)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("missing http param: {}", key))?;

    value
        .parse::<i64>()
        .map_err(|_| format!("http param '{}' type error, require int", key))
}

fn parse_report(params: &HashMap<String, String>) -> Result<Report, String> {
    let task_id = required_int(params, "task_id")?;
    let done = match required_int(params, "done")? {
        0 => false,
        1 => true,
        other => return Err(format!("http param 'done' must be 0 or 1, got {}", other)),
    };

    Ok(Report { task_id, done })
}

async fn report_task(
    State(state): State<SchedulerState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<JsonResult<()>> {
    let report = match parse_report(&params) {
        Ok(report) => report,
        Err(msg) => {
            debug!("Rejected completion report: {}", msg);
            state.metrics.record_report(false).await;
            return JsonResult::error(ERR_INPUT, msg).into_json();
        }
    };

    let status = report.status();
    match state.repository.set_status(&[report.task_id], status, Utc::now()).await {
        Ok(affected) => {
            info!("Set task {} status to {} ({} rows)", report.task_id, status, affected);
            state.metrics.record_report(true).await;
            JsonResult::ok(None).into_json()
        },
        Err(e) => {
            let msg = format!("set task {} status to {}, error: {}", report.task_id, status, e);
            error!("{}", msg);
            state.metrics.record_report(false).await;
            JsonResult::error(ERR_DB, msg).into_json()
        }
    }
}

async fn stats(State(state): State<SchedulerState>) -> Json<JsonResult<Metrics>> {
    JsonResult::ok(Some(state.metrics.get_metrics().await)).into_json()
}
