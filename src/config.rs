//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Upstream assist service configuration.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the assist service.
    pub base_url: String,
    /// Path of the assist endpoint, joined onto `base_url`.
    pub path: String,
    /// Per-attempt timeout. `None` means attempts are unbounded.
    pub attempt_timeout: Option<Duration>,
    /// Fixed pause between fallback attempts.
    pub backoff: Duration,
    /// Optional bearer key sent to the assist service.
    pub api_key: Option<SecretString>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".to_string(),
            path: "/assist".to_string(),
            attempt_timeout: Some(Duration::from_secs(120)),
            backoff: Duration::from_millis(250),
            api_key: None,
        }
    }
}

impl UpstreamConfig {
    /// Full endpoint URL.
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

/// Orphan reaper configuration.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Age after which a queued job whose client is gone is removed.
    pub orphan_ttl: Duration,
    /// How often the sweep runs.
    pub sweep_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            orphan_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Deadline for the upstream phase of a single job (`None` = no deadline).
    pub job_timeout: Option<Duration>,
}

/// Where the job queue journals its state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBacking {
    /// Jobs live in process memory only.
    Memory,
    /// Jobs are journaled to a libSQL file.
    LibSql(PathBuf),
}

/// Top-level relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub queue: QueueBacking,
    pub upstream: UpstreamConfig,
    pub reaper: ReaperConfig,
    pub worker: WorkerConfig,
    /// Bearer token -> user id.
    pub api_tokens: HashMap<String, String>,
    pub cors_origin: String,
    /// When set, logs are also written to a daily rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let db_path = PathBuf::from("./data/chat-relay.db");
        Self {
            port: 3001,
            queue: QueueBacking::LibSql(db_path.clone()),
            db_path,
            upstream: UpstreamConfig::default(),
            reaper: ReaperConfig::default(),
            worker: WorkerConfig {
                job_timeout: Some(Duration::from_secs(600)),
            },
            api_tokens: HashMap::new(),
            cors_origin: "http://localhost:5173".to_string(),
            log_dir: None,
        }
    }
}

impl RelayConfig {
    /// Build config from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "RELAY_PORT", defaults.port)?;
        let db_path = lookup("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let queue = match lookup("RELAY_QUEUE_DB_PATH") {
            Some(v) if v.eq_ignore_ascii_case("memory") => QueueBacking::Memory,
            Some(v) => QueueBacking::LibSql(PathBuf::from(v)),
            None => QueueBacking::LibSql(db_path.clone()),
        };

        let upstream = UpstreamConfig {
            base_url: lookup("RELAY_UPSTREAM_URL").unwrap_or(defaults.upstream.base_url),
            path: lookup("RELAY_UPSTREAM_PATH").unwrap_or(defaults.upstream.path),
            attempt_timeout: optional_secs(
                parse_or(&lookup, "RELAY_UPSTREAM_TIMEOUT_SECS", 120u64)?,
            ),
            backoff: Duration::from_millis(parse_or(
                &lookup,
                "RELAY_UPSTREAM_BACKOFF_MS",
                250u64,
            )?),
            api_key: lookup("RELAY_UPSTREAM_API_KEY")
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
        };

        let reaper = ReaperConfig {
            orphan_ttl: Duration::from_secs(parse_or(&lookup, "RELAY_ORPHAN_TTL_SECS", 120u64)?),
            sweep_interval: Duration::from_secs(parse_or(
                &lookup,
                "RELAY_SWEEP_INTERVAL_SECS",
                30u64,
            )?),
        };
        if reaper.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_SWEEP_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let worker = WorkerConfig {
            job_timeout: optional_secs(parse_or(&lookup, "RELAY_JOB_TIMEOUT_SECS", 600u64)?),
        };

        let api_tokens = parse_tokens(&lookup("RELAY_API_TOKENS").unwrap_or_default())?;

        Ok(Self {
            port,
            db_path,
            queue,
            upstream,
            reaper,
            worker,
            api_tokens,
            cors_origin: lookup("RELAY_CORS_ORIGIN").unwrap_or(defaults.cors_origin),
            log_dir: lookup("RELAY_LOG_DIR")
                .filter(|d| !d.is_empty())
                .map(PathBuf::from),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

/// 0 disables the bound.
fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Parse `token:user,token:user`.
fn parse_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut tokens = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (token, user) = pair
            .split_once(':')
            .map(|(t, u)| (t.trim(), u.trim()))
            .filter(|(t, u)| !t.is_empty() && !u.is_empty())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "RELAY_API_TOKENS".to_string(),
                message: "expected token:user pairs".to_string(),
            })?;
        tokens.insert(token.to_string(), user.to_string());
    }
    Ok(tokens)
}
