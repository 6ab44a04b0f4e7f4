use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::crawler::task::TaskPack;
use crate::server::envelope::JsonResult;

/// Errors talking to the other role over HTTP
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("peer answered with HTTP {0}")]
    Status(u16),

    #[error("undecodable peer response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("peer rejected the request with err={err}: {msg}")]
    Rejected { err: i32, msg: String },
}

/// HTTP client for scheduler <-> fetcher calls
#[derive(Clone)]
pub struct PeerClient {
    client: Client,

    /// Intake path on fetchers
    push_path: String,

    /// Completion-report path on the scheduler
    report_path: String,
}

impl PeerClient {
    pub fn new(timeout: Duration, push_path: &str, report_path: &str) -> Result<Self, PeerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            push_path: push_path.to_string(),
            report_path: report_path.to_string(),
        })
    }

    /// Push a batch to a fetcher; returns the packs it admitted
    pub async fn push_tasks(&self, fetcher: &str, packs: &[TaskPack]) -> Result<Vec<TaskPack>, PeerError> {
        let url = endpoint(fetcher, &self.push_path);
        let tasks = serde_json::to_string(packs)?;

        debug!("Pushing {} tasks to {}", packs.len(), url);

        let response = self.client.post(&url)
            .form(&[("tasks", tasks.as_str())])
            .send()
            .await?;

        let result: JsonResult<Vec<TaskPack>> = decode(response).await?;
        Ok(result.data.unwrap_or_default())
    }

    /// Report the outcome of one task to the scheduler
    pub async fn report_task(&self, scheduler: &str, task_id: i64, done: bool) -> Result<(), PeerError> {
        let url = endpoint(scheduler, &self.report_path);
        let done = if done { "1" } else { "0" };
        let task_id = task_id.to_string();

        let response = self.client.get(&url)
            .query(&[("task_id", task_id.as_str()), ("done", done)])
            .send()
            .await?;

        let _: JsonResult<serde_json::Value> = decode(response).await?;
        Ok(())
    }
}

/// Check the HTTP status and the result envelope of a peer response
async fn decode<T>(response: reqwest::Response) -> Result<JsonResult<T>, PeerError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        return Err(PeerError::Status(status.as_u16()));
    }

    let body = response.bytes().await?;
    let result: JsonResult<T> = serde_json::from_slice(&body)?;

    if !result.is_ok() {
        return Err(PeerError::Rejected {
            err: result.err,
            msg: result.msg.unwrap_or_default(),
        });
    }

    Ok(result)
}

/// Join a peer address (`host:port` or a full base URL) and a path
pub fn endpoint(addr: &str, path: &str) -> String {
    let base = addr.trim_end_matches('/');
    if base.contains("://") {
        format!("{}{}", base, path)
    } else {
        format!("http://{}{}", base, path)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl { url: String, source: url::ParseError },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("server answered with HTTP {0}")]
    Status(u16),
}

/// Retrieves the page behind a URL
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

/// Plain HTTP GET page fetcher
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        let response = self.client.get(parsed).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        // reqwest decodes the body using the charset of the Content-Type
        Ok(response.text().await?)
    }
}
