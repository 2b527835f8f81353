use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod api;
pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod queue;
pub mod server;
pub mod stats;
pub mod status;
pub mod submit;
pub mod table;
pub mod telemetry;
pub mod worker;

pub use error::{Error, Result};

/// Submitter attributed to uploads that carry no user id.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Destination table used when the submitter names none.
pub const DEFAULT_TABLE: &str = "default_table";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// A finished job never goes back to `queued` or `processing`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !(self.is_terminal() && !next.is_terminal())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one uploaded file, as kept in the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: Uuid,
    pub user_id: String,
    pub file_name: String,
    pub file_path: String,
    pub table_name: String,
    pub file_size: u64,
    pub timestamp: DateTime<Utc>,
    pub status: JobStatus,
    pub message: String,
}

impl JobRecord {
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            job_id: self.job_id,
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            table_name: self.table_name.clone(),
            attempt: 0,
        }
    }
}

/// Queue payload: everything a worker needs without reading the status store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub file_path: String,
    pub file_name: String,
    #[serde(default)]
    pub table_name: String,
    /// Zero-based processing attempt, bumped on every retry.
    #[serde(default)]
    pub attempt: u32,
}

impl JobDescriptor {
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// Destination table, falling back to [`DEFAULT_TABLE`] when blank.
    pub fn table(&self) -> &str {
        let name = self.table_name.trim();
        if name.is_empty() {
            DEFAULT_TABLE
        } else {
            name
        }
    }
}

/// Table names double as lake directory names, so keep them to identifiers.
pub fn is_valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_do_not_reopen() {
        for terminal in [JobStatus::Completed, JobStatus::Failed] {
            assert!(!terminal.can_transition_to(JobStatus::Queued));
            assert!(!terminal.can_transition_to(JobStatus::Processing));
            assert!(terminal.can_transition_to(JobStatus::Failed));
        }
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Queued));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn descriptor_ignores_unknown_fields() {
        let job_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "jobId": job_id,
            "filePath": format!("uploads/{job_id}/orders.csv"),
            "fileName": "orders.csv",
            "tableName": "orders",
            "userId": "alice",
            "status": "queued",
            "fileSize": 120,
        });

        let descriptor: JobDescriptor = serde_json::from_value(payload).unwrap();
        assert_eq!(descriptor.job_id, job_id);
        assert_eq!(descriptor.table(), "orders");
        assert_eq!(descriptor.attempt, 0);
    }

    #[test]
    fn blank_table_falls_back_to_default() {
        let descriptor = JobDescriptor {
            job_id: Uuid::new_v4(),
            file_path: "uploads/x/a.csv".into(),
            file_name: "a.csv".into(),
            table_name: "  ".into(),
            attempt: 0,
        };
        assert_eq!(descriptor.table(), DEFAULT_TABLE);
        assert_eq!(descriptor.next_attempt().attempt, 1);
    }

    #[test]
    fn record_uses_camel_case_and_lowercase_status() {
        let record = JobRecord {
            job_id: Uuid::new_v4(),
            user_id: ANONYMOUS_USER.into(),
            file_name: "a.csv".into(),
            file_path: "uploads/x/a.csv".into(),
            table_name: DEFAULT_TABLE.into(),
            file_size: 10,
            timestamp: Utc::now(),
            status: JobStatus::Queued,
            message: "File received and queued".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["status"], "queued");
        assert_eq!(value["fileSize"], 10);
        assert!(value.get("jobId").is_some());
    }

    #[test]
    fn table_names_are_identifiers() {
        assert!(is_valid_table_name("orders_2024"));
        assert!(!is_valid_table_name(""));
        assert!(!is_valid_table_name("../etc"));
        assert!(!is_valid_table_name("db.orders"));
    }
}
