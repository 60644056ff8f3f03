use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{ConnectionPayload, EmailOverride};

/// One row of tabular output, column name to value
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Database engine tag sent with connection tests and runs
pub const DB_TYPE_POSTGRES: &str = "postgres";

/// Question used when the user submits a blank one
pub const DEFAULT_QUESTION: &str = "Show sample";

pub const RUN_USER_ID: &str = "default";
pub const SCHEDULER_USER_ID: &str = "scheduler";

/// Treat an explicit `null` the same as a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Requests
// ============================================================================

/// Body of `POST /db/test`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbTestRequest {
    pub db_type: String,
    #[serde(flatten)]
    pub connection: ConnectionPayload,
}

impl DbTestRequest {
    pub fn new(connection: ConnectionPayload) -> Self {
        Self {
            db_type: DB_TYPE_POSTGRES.to_string(),
            connection,
        }
    }
}

/// Body of `POST /run`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    pub question: String,
    pub user_id: String,
    pub db_type: String,
    #[serde(flatten)]
    pub connection: ConnectionPayload,
    #[serde(flatten)]
    pub email: EmailOverride,
}

impl RunRequest {
    pub fn new(question: &str, connection: ConnectionPayload, email: EmailOverride) -> Self {
        let question = if question.trim().is_empty() {
            DEFAULT_QUESTION.to_string()
        } else {
            question.to_string()
        };

        Self {
            question,
            user_id: RUN_USER_ID.to_string(),
            db_type: DB_TYPE_POSTGRES.to_string(),
            connection,
            email,
        }
    }
}

/// Body of `POST /scheduler/add`; carries connection overrides but no `db_type`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleJobRequest {
    pub question: String,
    pub frequency: Frequency,
    pub time: String,
    pub user_id: String,
    #[serde(flatten)]
    pub connection: ConnectionPayload,
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbTestResponse {
    pub status: String,
    #[serde(default)]
    pub rows: Option<Vec<Record>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DbTestResponse {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunResponse {
    #[serde(default)]
    pub status: Option<String>,
    /// Artifact name (e.g. `csv_path`, `pdf_path`) to server-relative path
    #[serde(default, deserialize_with = "null_as_default")]
    pub artifacts: BTreeMap<String, Option<String>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub preview: Vec<Record>,
    #[serde(default)]
    pub run_id: Option<String>,
}

impl RunResponse {
    /// Only an explicit `"error"` counts as failure; a missing status means success.
    pub fn is_error(&self) -> bool {
        self.status.as_deref() == Some("error")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub logs: Vec<Record>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleAddResponse {
    pub status: String,
    #[serde(default)]
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleListResponse {
    pub status: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub jobs: Vec<ScheduledJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDeleteResponse {
    pub status: String,
    #[serde(default)]
    pub deleted: bool,
}

// ============================================================================
// Shared Types
// ============================================================================

/// How often a scheduled job fires
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            other => Err(format!("Unknown frequency: {}. Valid values: daily, weekly, monthly", other)),
        }
    }
}

/// A recurring analysis as reported by the scheduler service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledJob {
    /// Server-assigned id
    pub id: String,
    pub question: String,
    pub frequency: Frequency,
    /// HH:MM, 24h
    pub time: String,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub next_run: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    /// Resolved settings the service stored with the job
    #[serde(default, deserialize_with = "null_as_default")]
    pub overrides: HashMap<String, serde_json::Value>,
}

impl ScheduledJob {
    /// Target table, falling back to the `DATA_TABLE` override the scheduler stores
    pub fn table(&self) -> Option<&str> {
        self.table
            .as_deref()
            .or_else(|| self.overrides.get("DATA_TABLE").and_then(|v| v.as_str()))
    }

    /// Parse `next_run`, which may or may not carry an offset.
    pub fn next_run_at(&self) -> Option<chrono::NaiveDateTime> {
        let raw = self.next_run.as_deref()?;
        chrono::DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.naive_utc())
            .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionConfig, ConnectionMode, EmailConfig};

    fn manual_connection() -> ConnectionConfig {
        ConnectionConfig {
            use_env: false,
            mode: ConnectionMode::Manual,
            host: "db.local".to_string(),
            port: "5432".to_string(),
            name: "postgres".to_string(),
            table: "public.emp".to_string(),
            ..Default::default()
        }
    }

    fn manual_email() -> EmailConfig {
        EmailConfig {
            use_env: false,
            from: "reports@example.com".to_string(),
            to: "team@example.com".to_string(),
            api_key: "SG.key".to_string(),
        }
    }

    #[test]
    fn test_run_request_manual_scenario() {
        let req = RunRequest::new("x", manual_connection().resolve(), manual_email().resolve());
        let json = serde_json::to_value(&req).unwrap();

        assert_eq!(json["question"], "x");
        assert_eq!(json["user_id"], "default");
        assert_eq!(json["db_type"], "postgres");
        assert_eq!(json["host"], "db.local");
        assert_eq!(json["port"], 5432);
        assert_eq!(json["name"], "postgres");
        assert_eq!(json["table"], "public.emp");
        assert_eq!(json["email_from"], "reports@example.com");
        assert_eq!(json["email_to"], "team@example.com");
        assert_eq!(json["email_key"], "SG.key");
        assert!(json.get("dsn").is_none());
    }

    #[test]
    fn test_run_request_blank_question_defaults() {
        let req = RunRequest::new("   ", ConnectionConfig::default().resolve(), EmailOverride::default());
        assert_eq!(req.question, DEFAULT_QUESTION);
    }

    #[test]
    fn test_db_test_request_serialization() {
        let req = DbTestRequest::new(manual_connection().resolve());
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"db_type\":\"postgres\""));
        assert!(json.contains("\"use_env\":false"));
        assert!(json.contains("\"table\":\"public.emp\""));
    }

    #[test]
    fn test_schedule_request_has_no_db_type() {
        let req = ScheduleJobRequest {
            question: "Weekly headcount".to_string(),
            frequency: Frequency::Weekly,
            time: "09:00".to_string(),
            user_id: SCHEDULER_USER_ID.to_string(),
            connection: ConnectionConfig {
                table: "public.emp".to_string(),
                ..Default::default()
            }
            .resolve(),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("db_type").is_none());
        assert_eq!(json["frequency"], "weekly");
        assert_eq!(json["user_id"], "scheduler");
        assert_eq!(json["table"], "public.emp");
    }

    #[test]
    fn test_run_response_nulls_decode_as_empty() {
        let json = r#"{"status":null,"artifacts":null,"preview":null,"run_id":null}"#;
        let res: RunResponse = serde_json::from_str(json).unwrap();
        assert!(res.status.is_none());
        assert!(res.artifacts.is_empty());
        assert!(res.preview.is_empty());
        assert!(!res.is_error());
    }

    #[test]
    fn test_run_response_with_artifacts() {
        let json = r#"{
            "status":"success",
            "artifacts":{"csv_path":"./artifacts/out.csv","pdf_path":null},
            "preview":[{"employment_type":"Full-time","count":12}],
            "run_id":"run-7"
        }"#;
        let res: RunResponse = serde_json::from_str(json).unwrap();
        assert_eq!(res.artifacts.get("csv_path"), Some(&Some("./artifacts/out.csv".to_string())));
        assert_eq!(res.artifacts.get("pdf_path"), Some(&None));
        assert_eq!(res.preview.len(), 1);
        assert_eq!(res.preview[0]["count"], 12);
        assert_eq!(res.run_id.as_deref(), Some("run-7"));
    }

    #[test]
    fn test_scheduled_job_from_list_response() {
        let json = r#"{"status":"success","jobs":[{
            "id":"scheduled_1a2b3c4d",
            "question":"Weekly headcount",
            "frequency":"weekly",
            "time":"09:00",
            "overrides":{"DATA_DB_TYPE":"postgres","DATA_TABLE":"public.emp"},
            "created_at":"2026-01-05T08:00:00.123456",
            "next_run":"2026-01-12T09:00:00+00:00"
        }]}"#;
        let res: ScheduleListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(res.jobs.len(), 1);

        let job = &res.jobs[0];
        assert_eq!(job.frequency, Frequency::Weekly);
        assert_eq!(job.table(), Some("public.emp"));
        let next = job.next_run_at().unwrap();
        assert_eq!(next.to_string(), "2026-01-12 09:00:00");
    }

    #[test]
    fn test_scheduled_job_naive_next_run() {
        let job = ScheduledJob {
            id: "1".to_string(),
            question: "q".to_string(),
            frequency: Frequency::Daily,
            time: "07:15".to_string(),
            table: Some("public.t".to_string()),
            next_run: Some("2026-03-01T07:15:00".to_string()),
            created_at: None,
            overrides: HashMap::new(),
        };
        assert_eq!(job.table(), Some("public.t"));
        assert!(job.next_run_at().is_some());
    }

    #[test]
    fn test_frequency_round_trip_names() {
        assert_eq!("Monthly".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert_eq!(Frequency::Daily.to_string(), "daily");
        assert!("hourly".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_delete_response_defaults() {
        let res: ScheduleDeleteResponse = serde_json::from_str(r#"{"status":"error"}"#).unwrap();
        assert!(!res.deleted);
    }
}
