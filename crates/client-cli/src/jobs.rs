//! Local view of the server's scheduled jobs.
//!
//! Mutations never patch `jobs` in place. Every add or delete is followed by
//! [`JobRegistry::refresh`], so the list is always a snapshot the server
//! confirmed.

use shared::{
    parse_schedule_time, require_email, require_question, require_table, ConnectionConfig,
    EmailConfig, Frequency, ScheduleJobRequest, ScheduledJob, SCHEDULER_USER_ID,
};

use crate::api::SchedulerService;
use crate::error::ClientError;

/// Scheduling form input
#[derive(Debug, Clone)]
pub struct JobDraft {
    pub question: String,
    pub frequency: Frequency,
    /// HH:MM, 24h
    pub time: String,
}

impl Default for JobDraft {
    fn default() -> Self {
        Self {
            question: String::new(),
            frequency: Frequency::Daily,
            time: "09:00".to_string(),
        }
    }
}

pub struct JobRegistry<S> {
    service: S,
    jobs: Vec<ScheduledJob>,
}

impl<S: SchedulerService> JobRegistry<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            jobs: Vec::new(),
        }
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Replace the local list with the server's. On failure the previous list stays.
    pub async fn refresh(&mut self) -> Result<&[ScheduledJob], ClientError> {
        let res = self.service.list_jobs().await?;
        tracing::debug!("Scheduler reported {} jobs", res.jobs.len());
        self.jobs = res.jobs;
        Ok(&self.jobs)
    }

    /// Schedule the drafted question. Clears `draft.question` on success.
    pub async fn add_job(
        &mut self,
        draft: &mut JobDraft,
        connection: &ConnectionConfig,
        email: &EmailConfig,
    ) -> Result<String, ClientError> {
        require_question(&draft.question)?;
        require_table(connection)?;
        // Scheduled runs email their report too, so manual email must be complete
        require_email(email)?;
        let time = parse_schedule_time(&draft.time)?;

        let req = ScheduleJobRequest {
            question: draft.question.clone(),
            frequency: draft.frequency,
            time: time.format("%H:%M").to_string(),
            user_id: SCHEDULER_USER_ID.to_string(),
            connection: connection.resolve(),
        };

        let res = self.service.add_job(&req).await?;
        let job_id = match (res.status.as_str(), res.job_id) {
            ("success", Some(id)) => id,
            _ => return Err(ClientError::Service("Failed to schedule job".to_string())),
        };
        tracing::info!("Scheduled job {} ({} at {})", job_id, req.frequency, req.time);

        self.refresh().await?;
        draft.question.clear();
        Ok(job_id)
    }

    /// Delete a job by its server id, then resync whatever the outcome.
    pub async fn delete_job(&mut self, job_id: &str) -> Result<(), ClientError> {
        let deleted = self.service.delete_job(job_id).await;

        if let Err(err) = self.refresh().await {
            tracing::warn!("Failed to refresh jobs after delete: {}", err);
        }

        let res = deleted?;
        if res.status != "success" || !res.deleted {
            return Err(ClientError::Service("Failed to delete job".to_string()));
        }
        tracing::info!("Deleted job {}", job_id);
        Ok(())
    }
}
