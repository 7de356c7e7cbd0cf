//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Default number of attempts for every store primitive.
pub const DEFAULT_MAX_RETRIES: u32 = 15;

/// Default script fetched by the POSIX retrieval command.
pub const DEFAULT_FETCH_SCRIPT_UNIX: &str =
    "https://raw.githubusercontent.com/FragmentScreen/fandanGO-cryoem-cnb/main/cryoemcnb/utils/irods_fetch_unix.sh";

/// Default script fetched by the Windows retrieval command.
pub const DEFAULT_FETCH_SCRIPT_WINDOWS: &str =
    "https://raw.githubusercontent.com/FragmentScreen/fandanGO-cryoem-cnb/refs/heads/main/cryoemcnb/utils/irods_fetch_win.ps1";

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the coordinator (e.g. `https://hub.example.org`).
    pub coordinator_url: String,
    /// Account used to log into the coordinator.
    pub coordinator_user: String,
    pub coordinator_password: SecretString,
    /// Identity the coordinator assigns tasks to.
    pub worker_name: String,
    /// Delay between two polls for pending tasks.
    pub poll_interval: Duration,
    /// Delay between two invocations of a repeating handler.
    pub handler_interval: Duration,
    /// Iteration budget per handler run (0 = unlimited).
    pub max_iterations: u32,
    /// How long after the session start `monitor` keeps scanning.
    pub monitor_horizon: chrono::Duration,
    /// Named config section holding the store credentials.
    pub store_section: String,
    /// Named config section describing the on-the-fly pipeline.
    pub pipeline_section: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator_url: "http://localhost:5000".to_string(),
            coordinator_user: String::new(),
            coordinator_password: SecretString::from(String::new()),
            worker_name: "localhost".to_string(),
            poll_interval: Duration::from_secs(10),
            handler_interval: Duration::from_secs(60),
            max_iterations: 0,
            monitor_horizon: chrono::Duration::days(3),
            store_section: "irods".to_string(),
            pipeline_section: "scipion".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Build config from environment variables.
    ///
    /// `COORDINATOR_URL` is required; everything else has a default.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let coordinator_url = std::env::var("COORDINATOR_URL")
            .map_err(|_| ConfigError::MissingEnvVar("COORDINATOR_URL".to_string()))?
            .trim_end_matches('/')
            .to_string();

        let coordinator_user = std::env::var("COORDINATOR_USER").unwrap_or_default();
        let coordinator_password =
            SecretString::from(std::env::var("COORDINATOR_PASSWORD").unwrap_or_default());

        let worker_name = match std::env::var("WORKER_NAME") {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or(defaults.worker_name),
        };

        let poll_interval =
            Duration::from_secs(env_parse("WORKER_POLL_INTERVAL_SECS", 10u64)?.max(1));
        let handler_interval =
            Duration::from_secs(env_parse("WORKER_HANDLER_INTERVAL_SECS", 60u64)?);
        let max_iterations = env_parse("WORKER_MAX_ITERATIONS", 0u32)?;
        let monitor_horizon = horizon_days(env_parse("WORKER_MONITOR_HORIZON_DAYS", 3i64)?)?;

        let store_section =
            std::env::var("WORKER_STORE_SECTION").unwrap_or(defaults.store_section);
        let pipeline_section =
            std::env::var("WORKER_PIPELINE_SECTION").unwrap_or(defaults.pipeline_section);

        Ok(Self {
            coordinator_url,
            coordinator_user,
            coordinator_password,
            worker_name,
            poll_interval,
            handler_interval,
            max_iterations,
            monitor_horizon,
            store_section,
            pipeline_section,
        })
    }
}

/// Monitoring horizon from a day count; must be positive and representable.
fn horizon_days(days: i64) -> Result<chrono::TimeDelta, ConfigError> {
    let invalid = |message: &str| ConfigError::InvalidValue {
        key: "WORKER_MONITOR_HORIZON_DAYS".to_string(),
        message: format!("{days}: {message}"),
    };
    if days <= 0 {
        return Err(invalid("must be at least one day"));
    }
    chrono::TimeDelta::try_days(days).ok_or_else(|| invalid("out of range"))
}

/// Parse an optional numeric environment variable.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

/// Credentials and policy for the remote collection store.
///
/// Deserialized from the coordinator's named config section. Keys may carry
/// an `irods_` prefix (`irods_host`, `irods_zone`, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(alias = "irods_host")]
    pub host: String,
    #[serde(alias = "irods_port", deserialize_with = "de_port", default = "default_port")]
    pub port: u16,
    #[serde(alias = "irods_user")]
    pub user: String,
    #[serde(alias = "irods_pass", alias = "irods_password", deserialize_with = "de_secret")]
    pub password: SecretString,
    #[serde(alias = "irods_zone")]
    pub zone: String,
    /// Prefix under which every session collection is created.
    #[serde(alias = "irods_parent_collection")]
    pub parent_collection: String,
    /// Base URL of the store's HTTP gateway.
    #[serde(default, alias = "irods_http_api_url")]
    pub http_api_url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause before reconnecting after a transient failure.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub ticket_lifetime_days: Option<u32>,
    #[serde(default)]
    pub ticket_uses: Option<u32>,
    #[serde(default = "default_fetch_unix")]
    pub fetch_script_unix: String,
    #[serde(default = "default_fetch_windows")]
    pub fetch_script_windows: String,
}

impl StoreConfig {
    /// Build from a named config mapping fetched from the coordinator.
    pub fn from_section(
        section: &str,
        values: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ConfigError> {
        serde_json::from_value(serde_json::Value::Object(values)).map_err(|e| {
            ConfigError::ParseError {
                section: section.to_string(),
                reason: e.to_string(),
            }
        })
    }

    /// Base URL of the HTTP gateway, without trailing slash.
    pub fn api_url(&self) -> String {
        match &self.http_api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:9000/irods-http-api/0.3.0", self.host),
        }
    }

    /// Destination collection for `name` under the parent collection.
    pub fn collection_path(&self, name: &str) -> String {
        let parent = self.parent_collection.trim_end_matches('/');
        format!("{}/{}", parent, name.trim_start_matches('/'))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_port(),
            user: String::new(),
            password: SecretString::from(String::new()),
            zone: String::new(),
            parent_collection: String::new(),
            http_api_url: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: default_retry_delay_ms(),
            ticket_lifetime_days: None,
            ticket_uses: None,
            fetch_script_unix: default_fetch_unix(),
            fetch_script_windows: default_fetch_windows(),
        }
    }
}

fn default_port() -> u16 {
    1247
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_fetch_unix() -> String {
    DEFAULT_FETCH_SCRIPT_UNIX.to_string()
}

fn default_fetch_windows() -> String {
    DEFAULT_FETCH_SCRIPT_WINDOWS.to_string()
}

fn de_secret<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

fn de_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|v| u16::try_from(v).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid port {n}"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| D::Error::custom(format!("invalid port {s:?}: {e}"))),
        other => Err(D::Error::custom(format!("invalid port {other}"))),
    }
}
