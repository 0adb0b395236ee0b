//! Application configuration.
//!
//! Scheduler settings come from `ECSS_`-prefixed environment variables.
//! Values may contain `{NAME}` placeholders that are substituted from the
//! process environment at read time. An optional YAML file
//! (`ECSS_CONFIG_FILE`) supplies extended backend parameters; its top-level
//! key names the backend it configures, and the overlay is applied by an
//! explicit merge function. AWS credentials use the standard `AWS_*` names.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "ECSS_";
const DEFAULT_STARTED_BY: &str = "ecs-scheduler";
const DEFAULT_LOCK_FILE: &str = "/tmp/ecs-scheduler.lock";

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required environment variable ECSS_{0} is not set")]
    MissingVar(&'static str),

    #[error("failed to read config file {path}: {reason}")]
    UnreadableFile { path: PathBuf, reason: String },

    #[error("invalid config file {path}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },
}

/// Substitute `{NAME}` placeholders from the process environment.
///
/// Unknown names are left in place so a typo is visible in logs rather than
/// silently erased.
pub fn substitute_placeholders(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => {
                let name = &rest[open + 1..open + close];
                match env::var(name) {
                    Ok(replacement) => out.push_str(&replacement),
                    Err(_) => out.push_str(&rest[open..=open + close]),
                }
                rest = &rest[open + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

fn env_opt(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key))
        .ok()
        .filter(|s| !s.is_empty())
        .map(|s| substitute_placeholders(&s))
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

// ── Top-level config ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target orchestrator cluster.
    pub ecs_cluster: String,
    /// Label attached to launched tasks (the `startedBy` field).
    pub started_by: String,
    pub server: ServerConfig,
    pub log: LogConfig,
    pub store: StoreConfig,
    pub aws: AwsConfig,
    /// Advisory lock guarding the single-scheduler-process constraint.
    pub lock_file: PathBuf,
}

impl Config {
    /// Build config from the environment (call `load_dotenv()` first),
    /// applying the YAML overlay when `ECSS_CONFIG_FILE` is set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ecs_cluster = env_opt("ECS_CLUSTER").ok_or(ConfigError::MissingVar("ECS_CLUSTER"))?;

        let mut store = StoreConfig::from_env();
        if let Some(path) = env_opt("CONFIG_FILE").map(PathBuf::from) {
            let overlay = ConfigFile::load(&path)?;
            store = overlay.merge_into(store);
        }

        Ok(Self {
            ecs_cluster,
            started_by: env_or("NAME", DEFAULT_STARTED_BY),
            server: ServerConfig::from_env(),
            log: LogConfig::from_env(),
            store,
            aws: AwsConfig::from_env(),
            lock_file: PathBuf::from(env_or("LOCK_FILE", DEFAULT_LOCK_FILE)),
        })
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!("  cluster:    {}", self.ecs_cluster);
        tracing::info!("  started_by: {}", self.started_by);
        tracing::info!("  server:     {}:{}", self.server.host, self.server.port);
        tracing::info!("  store:      {}", self.store.describe());
        tracing::info!("  aws:        region={}", self.aws.region);
    }
}

// ── Server ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    fn from_env() -> Self {
        Self {
            host: env_or("HOST", "0.0.0.0"),
            port: env_opt("PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// DEBUG/INFO/WARNING/ERROR/CRITICAL.
    pub level: Option<String>,
    /// Directory for rotating file logs; stdout always receives logs too.
    pub folder: Option<PathBuf>,
}

impl LogConfig {
    fn from_env() -> Self {
        Self {
            level: env_opt("LOG_LEVEL"),
            folder: env_opt("LOG_FOLDER").map(PathBuf::from),
        }
    }

    /// Map the configured level name onto a tracing level filter string.
    pub fn level_filter(&self) -> &'static str {
        match self.level.as_deref().map(str::to_ascii_uppercase).as_deref() {
            Some("DEBUG") => "debug",
            Some("WARNING") => "warn",
            Some("ERROR") | Some("CRITICAL") => "error",
            _ => "info",
        }
    }
}

// ── Job store backends ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub sqlite_file: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub s3_prefix: Option<String>,
    pub dynamodb_table: Option<String>,
    pub elasticsearch_index: Option<String>,
    /// Comma-separated URLs in the environment; split here.
    pub elasticsearch_hosts: Vec<String>,
}

impl StoreConfig {
    fn from_env() -> Self {
        Self {
            sqlite_file: env_opt("SQLITE_FILE").map(PathBuf::from),
            s3_bucket: env_opt("S3_BUCKET"),
            s3_prefix: env_opt("S3_PREFIX"),
            dynamodb_table: env_opt("DYNAMODB_TABLE"),
            elasticsearch_index: env_opt("ELASTICSEARCH_INDEX"),
            elasticsearch_hosts: env_opt("ELASTICSEARCH_HOSTS")
                .map(|hosts| {
                    hosts
                        .split(',')
                        .map(|h| h.trim().to_string())
                        .filter(|h| !h.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// How many distinct backends this configuration selects.
    pub fn configured_backends(&self) -> usize {
        [
            self.sqlite_file.is_some(),
            self.s3_bucket.is_some(),
            self.dynamodb_table.is_some(),
            self.elasticsearch_index.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count()
    }

    fn describe(&self) -> String {
        if let Some(ref file) = self.sqlite_file {
            format!("sqlite ({})", file.display())
        } else if let Some(ref bucket) = self.s3_bucket {
            format!("s3 (s3://{}/{})", bucket, self.s3_prefix.as_deref().unwrap_or(""))
        } else if let Some(ref table) = self.dynamodb_table {
            format!("dynamodb ({})", table)
        } else if let Some(ref index) = self.elasticsearch_index {
            format!("elasticsearch ({})", index)
        } else {
            "in-memory".to_string()
        }
    }
}

// ── AWS ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    pub fn from_env() -> Self {
        let plain = |key: &str| env::var(key).ok().filter(|s| !s.is_empty());
        Self {
            region: plain("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: plain("AWS_ACCESS_KEY_ID"),
            secret_access_key: plain("AWS_SECRET_ACCESS_KEY"),
            session_token: plain("AWS_SESSION_TOKEN"),
            endpoint_url: plain("AWS_ENDPOINT_URL"),
        }
    }
}

// ── YAML overlay ─────────────────────────────────────────────────────

/// Extended backend parameters from `ECSS_CONFIG_FILE`.
///
/// The top-level key names the backend; values override the env-derived
/// settings for that backend only.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub sqlite: Option<SqliteOverlay>,
    #[serde(default)]
    pub s3: Option<S3Overlay>,
    #[serde(default)]
    pub dynamodb: Option<DynamoDbOverlay>,
    #[serde(default)]
    pub elasticsearch: Option<ElasticsearchOverlay>,
}

#[derive(Debug, Deserialize)]
pub struct SqliteOverlay {
    pub file: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct S3Overlay {
    pub bucket: String,
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DynamoDbOverlay {
    pub table: String,
}

#[derive(Debug, Deserialize)]
pub struct ElasticsearchOverlay {
    pub index: String,
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl ConfigFile {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::UnreadableFile {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let raw = substitute_placeholders(&raw);
        serde_yaml::from_str(&raw).map_err(|e| ConfigError::InvalidFile {
            path: path.clone(),
            reason: e.to_string(),
        })
    }

    /// Overlay file-provided parameters onto the env-derived store config.
    /// The file wins for every backend section it names.
    pub fn merge_into(self, mut store: StoreConfig) -> StoreConfig {
        if let Some(sqlite) = self.sqlite {
            store.sqlite_file = Some(sqlite.file);
        }
        if let Some(s3) = self.s3 {
            store.s3_bucket = Some(s3.bucket);
            if s3.prefix.is_some() {
                store.s3_prefix = s3.prefix;
            }
        }
        if let Some(dynamodb) = self.dynamodb {
            store.dynamodb_table = Some(dynamodb.table);
        }
        if let Some(es) = self.elasticsearch {
            store.elasticsearch_index = Some(es.index);
            if !es.hosts.is_empty() {
                store.elasticsearch_hosts = es.hosts;
            }
        }
        store
    }
}

// ── Tests ────────────────────────────────────────────────────────────
