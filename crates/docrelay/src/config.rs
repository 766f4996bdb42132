//! Configuration for the relay
//!
//! Loaded from a TOML file (see [`RelayConfig::load`]); secrets may be
//! supplied through the environment instead of the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::extraction::ExtractionSchema;
use crate::processing::RetryPolicy;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "DOCRELAY_CONFIG";

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Webhook server configuration
    pub server: ServerConfig,
    /// Durable queue configuration
    pub queue: QueueConfig,
    /// Worker pool configuration
    pub worker: WorkerConfig,
    /// Image preprocessing limits
    pub preprocess: PreprocessConfig,
    /// Document extraction configuration
    pub extraction: ExtractionConfig,
    /// Upload policy shared by both sinks
    pub upload: UploadConfig,
    /// First storage backend
    pub primary_sink: SinkConfig,
    /// Second, independent storage backend
    pub secondary_sink: SinkConfig,
    /// Chat platform (LINE WORKS) configuration
    pub chat: ChatConfig,
    /// GCP configuration (Document AI, GCS)
    pub gcp: Option<GcpConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Budget for verify + enqueue before answering the platform
    pub ack_deadline_ms: u64,
    /// Maximum accepted callback body size
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ack_deadline_ms: 800,
            max_body_size: 1024 * 1024, // 1MB
        }
    }
}

/// Durable queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite file backing the queue
    pub database_path: PathBuf,
    /// Deliveries before a task is dead-lettered
    pub max_attempts: u32,
    /// First redelivery delay
    pub min_backoff_ms: u64,
    /// Upper bound on redelivery delay
    pub max_backoff_ms: u64,
    /// Lease length; an unacknowledged lease is redelivered after this.
    /// Must outlast a whole attempt including its notification.
    pub lease_secs: u64,
    /// Tasks older than this are dead-lettered instead of run
    pub max_task_age_secs: u64,
    /// Longest idle sleep of the dispatcher
    pub poll_interval_ms: u64,
    /// How long finished rows are kept for deduplication
    pub ledger_retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            max_attempts: 5,
            min_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            lease_secs: 600,
            max_task_age_secs: 24 * 3600,
            poll_interval_ms: 5_000,
            ledger_retention_secs: 7 * 24 * 3600,
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("docrelay")
        .join("tasks.db")
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Concurrent tasks (default: CPU count, max 8)
    pub concurrency: Option<usize>,
    /// Upper bound for a single pipeline attempt
    pub task_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            task_timeout_secs: 240,
        }
    }
}

/// Image preprocessing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub max_image_bytes: usize,
    /// Decoded images above this pixel count are rejected
    pub max_pixels: u64,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            max_image_bytes: 20 * 1024 * 1024, // 20MB
            max_pixels: 40_000_000,
        }
    }
}

/// Document AI extraction configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Processor location (e.g. "us", "eu")
    pub location: String,
    pub processor_id: String,
    /// Pinned processor version; the default version is used when unset
    pub processor_version: Option<String>,
    /// Local retries for transient provider errors
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub timeout_secs: u64,
    /// Column layout of the produced CSV
    pub schema: ExtractionSchema,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            location: "us".to_string(),
            processor_id: String::new(),
            processor_version: None,
            max_retries: 3,
            initial_backoff_ms: 500,
            timeout_secs: 60,
            schema: ExtractionSchema::default(),
        }
    }
}

/// Upload policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Prepended to `<event-id>.csv`
    pub key_prefix: String,
    /// Local retries per sink per attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    /// Keep source and processed images of low-confidence results
    pub archive_review_images: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            key_prefix: String::new(),
            max_retries: 3,
            initial_backoff_ms: 500,
            archive_review_images: true,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    /// Google Cloud Storage bucket
    Gcs { bucket: String },
    /// S3 or S3-compatible bucket
    S3 {
        bucket: String,
        region: String,
        /// Custom endpoint for S3-compatible stores
        #[serde(default)]
        endpoint: Option<String>,
        #[serde(default)]
        access_key_id: String,
        #[serde(default)]
        secret_access_key: String,
    },
    /// Local directory (development)
    Filesystem { root: PathBuf },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::Filesystem {
            root: PathBuf::from("./data/sink"),
        }
    }
}

impl SinkConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::Gcs { .. } => "gcs",
            SinkConfig::S3 { .. } => "s3",
            SinkConfig::Filesystem { .. } => "filesystem",
        }
    }
}

/// LINE WORKS bot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub api_base: String,
    pub token_url: String,
    pub bot_id: String,
    /// Shared secret for callback signatures
    pub bot_secret: String,
    pub client_id: String,
    pub client_secret: String,
    pub service_account: String,
    /// PKCS#8 PEM private key of the service account
    pub private_key_path: PathBuf,
    pub scope: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.worksapis.com/v1.0".to_string(),
            token_url: "https://auth.worksmobile.com/oauth2/v2.0/token".to_string(),
            bot_id: String::new(),
            bot_secret: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            service_account: String::new(),
            private_key_path: PathBuf::from("./secrets/lineworks.key"),
            scope: "bot bot.message user.read".to_string(),
            timeout_secs: 30,
            max_retries: 3,
        }
    }
}

impl ChatConfig {
    /// Local retry policy for downloads and notifications
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(500))
    }

    /// Longest a notification can take with all its retries
    pub fn notify_budget(&self) -> Duration {
        self.retry_policy()
            .worst_case(Duration::from_secs(self.timeout_secs))
    }
}

/// GCP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcpConfig {
    /// GCP project ID
    pub project_id: String,
    /// Path to service account JSON key
    pub service_account_key_path: PathBuf,
}

impl RelayConfig {
    /// Load configuration from `path`, or from `$DOCRELAY_CONFIG`, or from
    /// `docrelay.toml`. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new("docrelay.toml").exists() => Self::from_file(Path::new("docrelay.toml"))?,
            None => Self::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Parse a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }

    /// Override secrets from the environment
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("LINEWORKS_BOT_SECRET") {
            self.chat.bot_secret = v;
        }
        if let Some(v) = lookup("LINEWORKS_CLIENT_SECRET") {
            self.chat.client_secret = v;
        }
        let key_id = lookup("AWS_ACCESS_KEY_ID");
        let secret = lookup("AWS_SECRET_ACCESS_KEY");
        for sink in [&mut self.primary_sink, &mut self.secondary_sink] {
            if let SinkConfig::S3 { access_key_id, secret_access_key, .. } = sink {
                if let Some(v) = &key_id {
                    *access_key_id = v.clone();
                }
                if let Some(v) = &secret {
                    *secret_access_key = v.clone();
                }
            }
        }
    }

    /// Check fields the running server cannot do without
    pub fn validate(&self) -> Result<()> {
        if self.chat.bot_secret.is_empty() {
            return Err(Error::Config("chat.bot_secret is required".to_string()));
        }
        if self.chat.bot_id.is_empty() {
            return Err(Error::Config("chat.bot_id is required".to_string()));
        }
        if self.extraction.processor_id.is_empty() {
            return Err(Error::Config("extraction.processor_id is required".to_string()));
        }
        if self.gcp.is_none() {
            return Err(Error::Config("gcp section is required for Document AI".to_string()));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".to_string()));
        }
        if self.queue.min_backoff_ms > self.queue.max_backoff_ms {
            return Err(Error::Config(
                "queue.min_backoff_ms must not exceed queue.max_backoff_ms".to_string(),
            ));
        }
        let held = Duration::from_secs(self.worker.task_timeout_secs) + self.chat.notify_budget();
        if held >= Duration::from_secs(self.queue.lease_secs) {
            return Err(Error::Config(format!(
                "queue.lease_secs ({}s) must exceed worker.task_timeout_secs plus the notification budget ({:.1}s)",
                self.queue.lease_secs,
                held.as_secs_f64()
            )));
        }
        self.extraction.schema.validate()?;
        for (name, sink) in [("primary_sink", &self.primary_sink), ("secondary_sink", &self.secondary_sink)] {
            if let SinkConfig::S3 { access_key_id, secret_access_key, .. } = sink {
                if access_key_id.is_empty() || secret_access_key.is_empty() {
                    return Err(Error::Config(format!("{} is missing S3 credentials", name)));
                }
            }
        }
        Ok(())
    }
}
