//! Run orchestration: the `idle -> running -> success | error` state machine.

use shared::{
    require_email, require_table, ConnectionConfig, DbTestRequest, EmailConfig, Record, RunRequest,
    ValidationError,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use crate::api::AnalysisService;
use crate::artifacts::artifact_url;
use crate::error::ClientError;

/// Shown when the service reports a failed run without saying why
pub const SERVICE_ERROR_MESSAGE: &str = "Check logs for details";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Success,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Everything the UI shows about the latest run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    pub status: RunStatus,
    pub run_id: Option<String>,
    pub preview: Vec<Record>,
    /// Artifact name to server-relative path
    pub artifacts: BTreeMap<String, String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The response was applied; this is the resulting state
    Completed(RunState),
    /// A newer submission was issued before this one came back; its response was dropped
    Superseded,
}

pub struct RunOrchestrator<S> {
    service: S,
    base_url: String,
    state: watch::Sender<RunState>,
    /// Last generation handed out; only its response may touch `state`
    generation: AtomicU64,
}

impl<S: AnalysisService> RunOrchestrator<S> {
    pub fn new(service: S, base_url: &str) -> Self {
        let (state, _) = watch::channel(RunState::default());
        Self {
            service,
            base_url: base_url.to_string(),
            state,
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Ask the service to sample the table. Returns the number of rows sampled.
    ///
    /// Independent of the run state machine.
    pub async fn test_connection(&self, connection: &ConnectionConfig) -> Result<usize, ClientError> {
        require_table(connection)?;

        let req = DbTestRequest::new(connection.resolve());
        let res = self.service.test_connection(&req).await?;

        if !res.is_success() {
            let message = res
                .error
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| "Connection failed".to_string());
            return Err(ClientError::Service(message));
        }

        let rows = res.rows.map(|r| r.len()).unwrap_or(0);
        tracing::info!("Connection test sampled {} rows", rows);
        Ok(rows)
    }

    /// Submit an analysis run.
    ///
    /// Validation failures return before any state change or network call.
    /// Transport and service failures are not errors here: they land in
    /// the returned state with status `Error`.
    pub async fn submit_run(
        &self,
        question: &str,
        connection: &ConnectionConfig,
        email: &EmailConfig,
    ) -> Result<RunOutcome, ValidationError> {
        require_table(connection)?;
        require_email(email)?;

        let req = RunRequest::new(question, connection.resolve(), email.resolve());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.state.send_modify(|state| {
            state.status = RunStatus::Running;
            state.preview.clear();
            state.artifacts.clear();
            state.error = None;
        });
        tracing::info!("Run #{} submitted: {}", generation, req.question);

        let result = self.service.run(&req).await;

        if self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("Dropping response for superseded run #{}", generation);
            return Ok(RunOutcome::Superseded);
        }

        self.state.send_modify(|state| match result {
            Ok(res) => {
                if res.is_error() {
                    state.status = RunStatus::Error;
                    state.error = Some(SERVICE_ERROR_MESSAGE.to_string());
                } else {
                    state.status = RunStatus::Success;
                }
                state.preview = res.preview;
                state.artifacts = res
                    .artifacts
                    .into_iter()
                    .filter_map(|(name, path)| path.filter(|p| !p.is_empty()).map(|p| (name, p)))
                    .collect();
                state.run_id = res.run_id;
            }
            Err(err) => {
                tracing::warn!("Run #{} failed: {}", generation, err);
                state.status = RunStatus::Error;
                state.error = Some(err.to_string());
            }
        });

        let state = self.state();
        tracing::info!("Run #{} finished with status {}", generation, state.status);
        Ok(RunOutcome::Completed(state))
    }

    /// Fully-qualified download URLs for the current artifacts
    pub fn artifact_urls(&self) -> BTreeMap<String, String> {
        self.state
            .borrow()
            .artifacts
            .iter()
            .map(|(name, path)| (name.clone(), artifact_url(&self.base_url, path)))
            .collect()
    }
}
