use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_MAX_CONCURRENCY: usize = 20;
pub const DEFAULT_LOCK_LIFETIME_SECS: u64 = 600; // 10 minutes
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_CLEANUP_CRON: &str = "0 0 3 * * *"; // daily, 03:00 UTC

/// Top-level config (classroom.toml + CLASSROOM_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassroomConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Poll loop and worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between poll ticks.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound of random jitter added to each poll sleep, in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
    /// Global cap on in-flight jobs across all job names.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Lock lifetime used when a job definition does not set its own.
    #[serde(default = "default_lock_lifetime_secs")]
    pub default_lock_lifetime_secs: u64,
    /// Maximum number of due jobs fetched per poll tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Identity written to `locked_by`. Generated at startup when unset.
    pub worker_id: Option<String>,
    /// Cron expression (with seconds field) for the notification cleanup job.
    #[serde(default = "default_cleanup_cron")]
    pub cleanup_cron: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            jitter_ms: default_jitter_ms(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            default_lock_lifetime_secs: DEFAULT_LOCK_LIFETIME_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_id: None,
            cleanup_cron: DEFAULT_CLEANUP_CRON.to_string(),
        }
    }
}

/// Offsets used when deriving trigger times from a class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_fifteen")]
    pub reminder_lead_mins: i64,
    #[serde(default = "default_fifteen")]
    pub no_show_grace_mins: i64,
    #[serde(default = "default_review_delay_mins")]
    pub review_delay_mins: i64,
    /// Lifecycle notifications older than this are removed by the cleanup job.
    #[serde(default = "default_retention_hours")]
    pub notification_retention_hours: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            reminder_lead_mins: 15,
            no_show_grace_mins: 15,
            review_delay_mins: default_review_delay_mins(),
            notification_retention_hours: default_retention_hours(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.classroom/classroom.db", home)
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_lock_lifetime_secs() -> u64 {
    DEFAULT_LOCK_LIFETIME_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_cleanup_cron() -> String {
    DEFAULT_CLEANUP_CRON.to_string()
}
fn default_fifteen() -> i64 {
    15
}
fn default_review_delay_mins() -> i64 {
    5
}
fn default_retention_hours() -> i64 {
    4
}

impl ClassroomConfig {
    /// Load config from a TOML file with CLASSROOM_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.classroom/classroom.toml
    ///
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Self::from_figment(
            Figment::from(Serialized::defaults(ClassroomConfig::default()))
                .merge(Toml::file(&path))
                .merge(Env::prefixed("CLASSROOM_").split("__")),
        )
    }

    /// Extract from an already-assembled figment (used by `load` and tests).
    pub fn from_figment(figment: Figment) -> crate::error::Result<Self> {
        figment
            .extract()
            .map_err(|e| crate::error::ClassroomError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.classroom/classroom.toml", home)
}
