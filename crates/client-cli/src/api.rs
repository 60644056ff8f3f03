//! HTTP client for the analysis and scheduler service.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    DbTestRequest, DbTestResponse, HealthResponse, LogsResponse, RunRequest, RunResponse,
    ScheduleAddResponse, ScheduleDeleteResponse, ScheduleJobRequest, ScheduleListResponse,
};
use thiserror::Error;

pub const DEFAULT_LOG_LIMIT: usize = 200;

#[derive(Debug, Error)]
pub enum ApiError {
    /// The service answered with a non-2xx status
    #[error("{0}")]
    Status(StatusCode),

    #[error("{0}")]
    Request(#[from] reqwest::Error),
}

/// Connection testing and analysis runs
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn test_connection(&self, req: &DbTestRequest) -> Result<DbTestResponse, ApiError>;
    async fn run(&self, req: &RunRequest) -> Result<RunResponse, ApiError>;
}

/// Server-side recurring jobs
#[async_trait]
pub trait SchedulerService: Send + Sync {
    async fn add_job(&self, req: &ScheduleJobRequest) -> Result<ScheduleAddResponse, ApiError>;
    async fn list_jobs(&self) -> Result<ScheduleListResponse, ApiError>;
    async fn delete_job(&self, job_id: &str) -> Result<ScheduleDeleteResponse, ApiError>;
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    async fn send<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        tracing::debug!("{} {}", method, url);

        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        if !resp.status().is_success() {
            tracing::warn!("{} returned {}", url, resp.status());
            return Err(ApiError::Status(resp.status()));
        }

        Ok(resp.json().await?)
    }

    pub async fn health(&self) -> Result<HealthResponse, ApiError> {
        self.send::<(), _>(Method::GET, "/health", None).await
    }

    pub async fn logs(&self, limit: usize) -> Result<LogsResponse, ApiError> {
        self.send::<(), _>(Method::GET, &format!("/logs?limit={}", limit), None)
            .await
    }
}

#[async_trait]
impl AnalysisService for ApiClient {
    async fn test_connection(&self, req: &DbTestRequest) -> Result<DbTestResponse, ApiError> {
        self.send(Method::POST, "/db/test", Some(req)).await
    }

    async fn run(&self, req: &RunRequest) -> Result<RunResponse, ApiError> {
        self.send(Method::POST, "/run", Some(req)).await
    }
}

#[async_trait]
impl SchedulerService for ApiClient {
    async fn add_job(&self, req: &ScheduleJobRequest) -> Result<ScheduleAddResponse, ApiError> {
        self.send(Method::POST, "/scheduler/add", Some(req)).await
    }

    async fn list_jobs(&self) -> Result<ScheduleListResponse, ApiError> {
        self.send::<(), _>(Method::GET, "/scheduler/list", None).await
    }

    async fn delete_job(&self, job_id: &str) -> Result<ScheduleDeleteResponse, ApiError> {
        let path = format!("/scheduler/{}", urlencoding::encode(job_id));
        self.send::<(), _>(Method::DELETE, &path, None).await
    }
}
