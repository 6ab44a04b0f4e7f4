use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::crawler::task::TaskPack;
use crate::server::envelope::{JsonResult, ERR_DATA, ERR_INPUT};
use crate::storage::queue::TaskQueue;
use crate::utils::metrics::{Metrics, MetricsCollector};

/// Shared state of the intake surface
#[derive(Clone)]
pub struct FetcherState {
    pub queue: Arc<TaskQueue>,

    /// Time budget for admitting one pushed batch
    pub admission_window: Duration,

    pub metrics: MetricsCollector,
}

/// Build the fetcher router, accepting pushed batches on `push_path`
pub fn router(state: FetcherState, push_path: &str) -> Router {
    Router::new()
        .route(push_path, post(push_tasks))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn push_tasks(
    State(state): State<FetcherState>,
    form: Result<Form<HashMap<String, String>>, FormRejection>,
) -> Json<JsonResult<Vec<TaskPack>>> {
    let tasks = match &form {
        Ok(Form(fields)) => fields.get("tasks").filter(|t| !t.is_empty()),
        Err(e) => {
            debug!("Unreadable intake form: {}", e);
            None
        }
    };

    let Some(tasks) = tasks else {
        let msg = "missing `tasks` key or has no content in the POST request.";
        warn!("{}", msg);
        return JsonResult::error(ERR_INPUT, msg).into_json();
    };

    let packs: Vec<TaskPack> = match serde_json::from_str(tasks) {
        Ok(packs) => packs,
        Err(e) => {
            let msg = format!("Unmarshal task packs error: {}", e);
            warn!("{}", msg);
            return JsonResult::error(ERR_DATA, msg).into_json();
        }
    };

    let submitted = packs.len();
    let admitted = state.queue.admit(packs, state.admission_window).await;
    let depth = state.queue.depth();

    info!("Admitted {} of {} pushed tasks, queue depth {}", admitted.len(), submitted, depth);
    state.metrics
        .record_intake(admitted.len(), submitted - admitted.len(), depth)
        .await;

    JsonResult::ok(Some(admitted)).into_json()
}

async fn stats(State(state): State<FetcherState>) -> Json<JsonResult<Metrics>> {
    state.metrics.set_queue_depth(state.queue.depth()).await;
    JsonResult::ok(Some(state.metrics.get_metrics().await)).into_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use tower::ServiceExt;

    fn packs(ids: std::ops::Range<i64>) -> Vec<TaskPack> {
        ids.map(|id| TaskPack {
            task_id: id,
            domain: "example.com".to_string(),
            urlpath: format!("/{}", id),
            follow_links: false,
        })
        .collect()
    }

    fn state(capacity: usize, window: Duration) -> FetcherState {
        FetcherState {
            queue: Arc::new(TaskQueue::new(capacity)),
            admission_window: window,
            metrics: MetricsCollector::new(),
        }
    }

    fn form_body(fields: &[(&str, &str)]) -> String {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in fields {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    async fn push(state: FetcherState, body: String) -> JsonResult<Vec<TaskPack>> {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/push/tasks")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap();

        let response = router(state, "/push/tasks").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_push_admits_batch_in_order() {
        let state = state(10, Duration::from_millis(200));
        let submitted = packs(1..4);
        let body = form_body(&[("tasks", &serde_json::to_string(&submitted).unwrap())]);

        let result = push(state.clone(), body).await;
        assert_eq!(result.err, 0);
        assert_eq!(result.data.unwrap(), submitted);
        assert_eq!(state.queue.depth(), 3);

        let metrics = state.metrics.get_metrics().await;
        assert_eq!(metrics.intake_accepted, 3);
        assert_eq!(metrics.queue_depth, 3);
    }

    #[tokio::test]
    async fn test_push_to_full_queue_returns_prefix() {
        let state = state(2, Duration::from_secs(1));
        state.queue.admit(packs(100..102), Duration::from_millis(50)).await;

        let submitted = packs(1..6);
        let body = form_body(&[("tasks", &serde_json::to_string(&submitted).unwrap())]);

        let result = push(state.clone(), body).await;
        assert_eq!(result.err, 0);

        let admitted = result.data.unwrap_or_default();
        assert!(admitted.len() < submitted.len());
        assert_eq!(admitted[..], submitted[..admitted.len()]);
        assert_eq!(state.metrics.get_metrics().await.intake_rejected, submitted.len() - admitted.len());
    }

    #[tokio::test]
    async fn test_missing_or_empty_tasks_is_input_error() {
        for body in [String::new(), form_body(&[("tasks", "")]), form_body(&[("other", "1")])] {
            let state = state(2, Duration::from_millis(50));
            let result = push(state.clone(), body).await;
            assert_eq!(result.err, ERR_INPUT);
            assert_eq!(state.queue.depth(), 0);
        }
    }

    #[tokio::test]
    async fn test_malformed_json_is_data_error() {
        let state = state(2, Duration::from_millis(50));
        let body = form_body(&[("tasks", "[{\"task_id\": \"one\"")]);

        let result = push(state.clone(), body).await;
        assert_eq!(result.err, ERR_DATA);
        assert!(result.data.is_none());
        assert_eq!(state.queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_follow_flag_decodes_from_wire_name() {
        let state = state(2, Duration::from_millis(50));
        let body = form_body(&[(
            "tasks",
            r#"[{"task_id":9,"domain":"http://example.com","urlpath":"/a","follow":true}]"#,
        )]);

        let result = push(state.clone(), body).await;
        let admitted = result.data.unwrap();
        assert_eq!(admitted.len(), 1);
        assert!(admitted[0].follow_links);
    }
}
