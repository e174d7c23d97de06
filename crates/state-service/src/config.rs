//! State service configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default per-attempt store timeout in milliseconds.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Default number of attempts for a transient store failure.
pub const DEFAULT_STORE_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for store retry backoff in milliseconds.
pub const DEFAULT_STORE_RETRY_BASE_DELAY_MS: u64 = 100;

/// Default cap for store retry backoff in milliseconds.
pub const DEFAULT_STORE_RETRY_MAX_DELAY_MS: u64 = 2_000;

/// Default sliding session lifetime (1 hour).
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 3_600;

/// Default hard ceiling on session lifetime (24 hours).
pub const DEFAULT_SESSION_ABSOLUTE_MAX_SECONDS: u64 = 86_400;

/// Default idle time before a validated session is refreshed (5 minutes).
pub const DEFAULT_SESSION_REFRESH_THRESHOLD_SECONDS: u64 = 300;

/// Default interval between session sweeps (10 minutes).
pub const DEFAULT_SESSION_SWEEP_INTERVAL_SECONDS: u64 = 600;

/// Default cache entry TTL (5 minutes).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 300;

/// Default requests allowed per rate-limit window.
pub const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 100;

/// Default rate-limit window length.
pub const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 60;

/// Default task queue name.
pub const DEFAULT_TASK_QUEUE_NAME: &str = "tasks";

/// Default Prometheus exporter bind address.
pub const DEFAULT_METRICS_BIND_ADDRESS: &str = "0.0.0.0:9090";

/// Default session cookie name.
pub const DEFAULT_SESSION_COOKIE_NAME: &str = "session_id";

/// What a component does when the backing store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Treat the operation as permitted.
    FailOpen,
    /// Treat the operation as denied.
    FailClosed,
}

impl FailurePolicy {
    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        }
    }
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown failure policy '{other}' (expected fail_open or fail_closed)"
            ))),
        }
    }
}

/// `SameSite` attribute for the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl FromStr for SameSite {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(SameSite::Strict),
            "lax" => Ok(SameSite::Lax),
            "none" => Ok(SameSite::None),
            other => Err(ConfigError::InvalidValue(format!(
                "unknown SameSite value '{other}'"
            ))),
        }
    }
}

/// Session cookie attributes handed to the request layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieSettings {
    pub name: String,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,
}

/// Store adapter timeout and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    /// Upper bound on a single backend attempt.
    pub op_timeout: Duration,
    /// Total attempts for transient failures (at least 1).
    pub max_attempts: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Backoff cap.
    pub retry_max_delay: Duration,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
            max_attempts: DEFAULT_STORE_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_STORE_RETRY_BASE_DELAY_MS),
            retry_max_delay: Duration::from_millis(DEFAULT_STORE_RETRY_MAX_DELAY_MS),
        }
    }
}

/// Session manager settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Sliding lifetime applied on create and every refresh.
    pub ttl: Duration,
    /// Hard ceiling measured from creation. `None` disables it.
    pub absolute_max: Option<Duration>,
    /// Idle time after which validation triggers a refresh.
    pub refresh_threshold: Duration,
    /// Interval of the background sweep.
    pub sweep_interval: Duration,
    /// Outcome when a refresh write fails during validation.
    pub failure_policy: FailurePolicy,
    pub cookie: CookieSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECONDS),
            absolute_max: Some(Duration::from_secs(DEFAULT_SESSION_ABSOLUTE_MAX_SECONDS)),
            refresh_threshold: Duration::from_secs(DEFAULT_SESSION_REFRESH_THRESHOLD_SECONDS),
            sweep_interval: Duration::from_secs(DEFAULT_SESSION_SWEEP_INTERVAL_SECONDS),
            failure_policy: FailurePolicy::FailClosed,
            cookie: CookieSettings {
                name: DEFAULT_SESSION_COOKIE_NAME.to_string(),
                secure: true,
                http_only: true,
                same_site: SameSite::Lax,
            },
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_RATE_LIMIT_REQUESTS,
            window: Duration::from_secs(DEFAULT_RATE_LIMIT_WINDOW_SECONDS),
            failure_policy: FailurePolicy::FailOpen,
        }
    }
}

/// State service configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL.
    /// Protected by `SecretString` since it may carry a password.
    pub redis_url: SecretString,

    pub store: StorePolicy,

    pub session: SessionSettings,

    pub rate_limit: RateLimitSettings,

    /// Default cache entry TTL.
    pub cache_ttl: Duration,

    /// Name of the task queue (key namespace in the store).
    pub task_queue_name: String,

    /// Prometheus exporter bind address.
    pub metrics_bind_address: String,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("store", &self.store)
            .field("session", &self.session)
            .field("rate_limit", &self.rate_limit)
            .field("cache_ttl", &self.cache_ttl)
            .field("task_queue_name", &self.task_queue_name)
            .field("metrics_bind_address", &self.metrics_bind_address)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

/// Parse an optional variable, falling back to `default` when unset.
fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{name}={raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let max_attempts: u32 = parse_var(
            vars,
            "STATE_STORE_MAX_ATTEMPTS",
            DEFAULT_STORE_MAX_ATTEMPTS,
        )?;
        if max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "STATE_STORE_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let store = StorePolicy {
            op_timeout: Duration::from_millis(parse_var(
                vars,
                "STATE_STORE_TIMEOUT_MS",
                DEFAULT_STORE_TIMEOUT_MS,
            )?),
            max_attempts,
            retry_base_delay: Duration::from_millis(parse_var(
                vars,
                "STATE_STORE_RETRY_BASE_DELAY_MS",
                DEFAULT_STORE_RETRY_BASE_DELAY_MS,
            )?),
            retry_max_delay: Duration::from_millis(parse_var(
                vars,
                "STATE_STORE_RETRY_MAX_DELAY_MS",
                DEFAULT_STORE_RETRY_MAX_DELAY_MS,
            )?),
        };

        let session_ttl = Duration::from_secs(parse_var(
            vars,
            "STATE_SESSION_TTL_SECONDS",
            DEFAULT_SESSION_TTL_SECONDS,
        )?);
        let refresh_threshold = Duration::from_secs(parse_var(
            vars,
            "STATE_SESSION_REFRESH_THRESHOLD_SECONDS",
            DEFAULT_SESSION_REFRESH_THRESHOLD_SECONDS,
        )?);
        if refresh_threshold >= session_ttl {
            return Err(ConfigError::InvalidValue(format!(
                "STATE_SESSION_REFRESH_THRESHOLD_SECONDS ({}) must be smaller than STATE_SESSION_TTL_SECONDS ({})",
                refresh_threshold.as_secs(),
                session_ttl.as_secs()
            )));
        }

        // 0 disables the hard ceiling
        let absolute_max_seconds: u64 = parse_var(
            vars,
            "STATE_SESSION_ABSOLUTE_MAX_SECONDS",
            DEFAULT_SESSION_ABSOLUTE_MAX_SECONDS,
        )?;
        let absolute_max = (absolute_max_seconds > 0).then(|| Duration::from_secs(absolute_max_seconds));

        let sweep_interval_seconds: u64 = parse_var(
            vars,
            "STATE_SESSION_SWEEP_INTERVAL_SECONDS",
            DEFAULT_SESSION_SWEEP_INTERVAL_SECONDS,
        )?;
        if sweep_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "STATE_SESSION_SWEEP_INTERVAL_SECONDS must be positive".to_string(),
            ));
        }

        let session = SessionSettings {
            ttl: session_ttl,
            absolute_max,
            refresh_threshold,
            sweep_interval: Duration::from_secs(sweep_interval_seconds),
            failure_policy: parse_var(
                vars,
                "STATE_SESSION_FAILURE_POLICY",
                FailurePolicy::FailClosed,
            )?,
            cookie: CookieSettings {
                name: vars
                    .get("STATE_SESSION_COOKIE_NAME")
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_SESSION_COOKIE_NAME.to_string()),
                secure: parse_var(vars, "STATE_SESSION_COOKIE_SECURE", true)?,
                http_only: parse_var(vars, "STATE_SESSION_COOKIE_HTTP_ONLY", true)?,
                same_site: parse_var(vars, "STATE_SESSION_COOKIE_SAME_SITE", SameSite::Lax)?,
            },
        };

        let window_seconds: u64 = parse_var(
            vars,
            "STATE_RATE_LIMIT_WINDOW_SECONDS",
            DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
        )?;
        if window_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "STATE_RATE_LIMIT_WINDOW_SECONDS must be positive".to_string(),
            ));
        }

        let rate_limit = RateLimitSettings {
            max_requests: parse_var(
                vars,
                "STATE_RATE_LIMIT_REQUESTS",
                DEFAULT_RATE_LIMIT_REQUESTS,
            )?,
            window: Duration::from_secs(window_seconds),
            failure_policy: parse_var(
                vars,
                "STATE_RATE_LIMIT_FAILURE_POLICY",
                FailurePolicy::FailOpen,
            )?,
        };

        let cache_ttl = Duration::from_secs(parse_var(
            vars,
            "STATE_CACHE_TTL_SECONDS",
            DEFAULT_CACHE_TTL_SECONDS,
        )?);

        let task_queue_name = vars
            .get("STATE_TASK_QUEUE_NAME")
            .cloned()
            .unwrap_or_else(|| DEFAULT_TASK_QUEUE_NAME.to_string());
        if task_queue_name.is_empty() {
            return Err(ConfigError::InvalidValue(
                "STATE_TASK_QUEUE_NAME must not be empty".to_string(),
            ));
        }

        let metrics_bind_address = vars
            .get("STATE_METRICS_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_METRICS_BIND_ADDRESS.to_string());

        Ok(Config {
            redis_url,
            store,
            session,
            rate_limit,
            cache_ttl,
            task_queue_name,
            metrics_bind_address,
        })
    }
}
