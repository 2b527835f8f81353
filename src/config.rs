use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::{ANONYMOUS_USER, DEFAULT_TABLE};

/// Which halves of the pipeline this process runs.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// HTTP submission and status endpoints only
    Api,
    /// Queue consumers only
    Worker,
    /// Both, in one process
    All,
}

impl Role {
    pub fn runs_api(self) -> bool {
        matches!(self, Role::Api | Role::All)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::Worker | Role::All)
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Overwrite the destination table with this job's rows
    #[default]
    CreateOrReplace,
    /// Add this job's rows as their own part, replacing only an earlier run of the same job
    Append,
}

#[derive(Parser, Clone, Debug, PartialEq)]
#[command(author, version)]
pub struct ConfigContext {
    #[arg(
        short = 'r',
        long = "role",
        env = "LAKEQ_ROLE",
        help = "Which components to run",
        value_enum,
        default_value = "all"
    )]
    pub role: Role,

    #[arg(
        short = 'c',
        long = "connect_url",
        env = "DATABASE_URL",
        help = "PostgreSQL Connection URL (in-memory queue and status store when omitted)"
    )]
    pub connect_url: Option<String>,

    #[arg(
        short = 'n',
        long = "number_active",
        env = "LAKEQ_WORKERS",
        help = "Number of Active Jobs in Parallel",
        default_value = "3"
    )]
    pub num: u16,

    #[arg(
        short = 'l',
        long = "listen",
        env = "LAKEQ_LISTEN",
        help = "HTTP listen address",
        default_value = "127.0.0.1:8080"
    )]
    pub listen: SocketAddr,

    #[arg(
        long = "queue_name",
        env = "LAKEQ_QUEUE",
        help = "Name of the job queue",
        default_value = "file.processing.queue"
    )]
    pub queue_name: String,

    #[arg(
        long = "blob_root",
        env = "LAKEQ_BLOB_ROOT",
        help = "Directory backing the blob store",
        default_value = "./data/blobs"
    )]
    pub blob_root: PathBuf,

    #[arg(
        long = "lake_root",
        env = "LAKEQ_LAKE_ROOT",
        help = "Directory holding the lake tables",
        default_value = "./data/lake"
    )]
    pub lake_root: PathBuf,

    #[arg(
        long = "scratch_dir",
        env = "LAKEQ_SCRATCH_DIR",
        help = "Directory for worker scratch files (system temp dir when omitted)"
    )]
    pub scratch_dir: Option<PathBuf>,

    #[arg(
        long = "write_mode",
        env = "LAKEQ_WRITE_MODE",
        help = "How workers write into the destination table",
        value_enum,
        default_value = "create-or-replace"
    )]
    pub write_mode: WriteMode,

    #[arg(
        long = "max_attempts",
        env = "LAKEQ_MAX_ATTEMPTS",
        help = "Attempts per job before a transient failure is final",
        default_value = "3"
    )]
    pub max_attempts: u32,

    #[arg(
        long = "retry_backoff_ms",
        env = "LAKEQ_RETRY_BACKOFF_MS",
        help = "Base delay before a failed job is republished, multiplied by the attempt",
        default_value = "1000"
    )]
    pub retry_backoff_ms: u64,

    #[arg(
        long = "status_ttl_secs",
        env = "LAKEQ_STATUS_TTL_SECS",
        help = "Lifetime of a job status record after its last write",
        default_value = "3600"
    )]
    pub status_ttl_secs: u64,

    #[arg(
        long = "poll_interval_ms",
        env = "LAKEQ_POLL_INTERVAL_MS",
        help = "Idle polling interval of PostgreSQL queue consumers",
        default_value = "500"
    )]
    pub poll_interval_ms: u64,

    #[arg(
        long = "max_upload_bytes",
        env = "LAKEQ_MAX_UPLOAD_BYTES",
        help = "Largest accepted upload",
        default_value = "104857600"
    )]
    pub max_upload_bytes: usize,

    #[arg(
        long = "jaeger_endpoint",
        env = "LAKEQ_JAEGER_ENDPOINT",
        help = "Jaeger collector endpoint, e.g. http://jaeger:14268/api/traces"
    )]
    pub jaeger_endpoint: Option<String>,
}

impl ConfigContext {
    pub fn status(&self) -> StatusConfig {
        StatusConfig {
            ttl: Duration::from_secs(self.status_ttl_secs),
        }
    }

    pub fn queue(&self) -> QueueConfig {
        QueueConfig {
            name: self.queue_name.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..QueueConfig::default()
        }
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            scratch_dir: self
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
            write_mode: self.write_mode,
            max_attempts: self.max_attempts.max(1),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    pub fn submission(&self) -> SubmissionConfig {
        SubmissionConfig::default()
    }

    pub fn api(&self) -> ApiConfig {
        ApiConfig {
            listen: self.listen,
            max_upload_bytes: self.max_upload_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusConfig {
    pub ttl: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub poll_interval: Duration,
    /// A consumer silent for this long is presumed dead and its deliveries are released.
    pub consumer_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "file.processing.queue".to_string(),
            poll_interval: Duration::from_millis(500),
            consumer_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub scratch_dir: PathBuf,
    pub write_mode: WriteMode,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
            write_mode: WriteMode::CreateOrReplace,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionConfig {
    pub anonymous_user: String,
    pub default_table: String,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            anonymous_user: ANONYMOUS_USER.to_string(),
            default_table: DEFAULT_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    pub max_upload_bytes: usize,
}
