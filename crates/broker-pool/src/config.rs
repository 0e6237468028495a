//! Pool configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// Connections are never recycled for age more often than this.
pub const MIN_CONNECTION_AGE: Duration = Duration::from_secs(30);

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Verbosity of the diagnostic log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DebugLevel {
    /// No messages.
    #[default]
    Silent = 0,
    /// Errors only.
    Errors = 1,
    /// Errors and warnings.
    Warnings = 2,
    /// Everything, including per-checkout tracing.
    Verbose = 3,
}

impl TryFrom<u8> for DebugLevel {
    type Error = String;

    fn try_from(level: u8) -> std::result::Result<Self, Self::Error> {
        match level {
            0 => Ok(Self::Silent),
            1 => Ok(Self::Errors),
            2 => Ok(Self::Warnings),
            3 => Ok(Self::Verbose),
            other => Err(format!("debug level must be 0..=3, got {other}")),
        }
    }
}

impl From<DebugLevel> for u8 {
    fn from(level: DebugLevel) -> Self {
        level as u8
    }
}

/// Login credentials passed to the driver.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl Credentials {
    /// Create credentials from a login and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Configuration for the connection pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Id of the registered driver used to open connections.
    pub driver_id: String,

    /// Connection target understood by the driver (URL, DSN, path).
    pub server_address: String,

    /// Login credentials.
    pub credentials: Credentials,

    /// Connections opened at startup.
    pub min_connections: u32,

    /// Hard ceiling on simultaneous connections.
    pub max_connections: u32,

    /// Diagnostic log file. A temp file is used when unset or unwritable.
    pub log_destination: Option<PathBuf>,

    /// Append to an existing log file instead of truncating it.
    pub log_append: bool,

    /// Connections older than this are replaced by the housekeeper.
    #[serde(with = "duration_secs")]
    pub max_connection_age: Duration,

    /// How long a checkout may be held before it is treated as leaked.
    /// Zero disables leak detection.
    #[serde(with = "duration_secs")]
    pub checkout_timeout: Duration,

    /// Verbosity of the diagnostic log.
    pub debug_level: DebugLevel,

    /// Reject writes issued through [`Pool::execute`](crate::Pool::execute).
    pub read_only: bool,

    /// Time between housekeeping cycles.
    #[serde(with = "duration_secs")]
    pub housekeeping_interval: Duration,

    /// Back-off between outer checkout attempts.
    #[serde(with = "duration_secs")]
    pub checkout_retry_interval: Duration,

    /// Outer checkout attempts before giving up.
    pub checkout_attempts: u32,

    /// Attempts at opening the initial batch of connections.
    pub startup_attempts: u32,

    /// Interval at which shutdown polls for returned connections.
    #[serde(with = "duration_secs")]
    pub shutdown_poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            driver_id: String::new(),
            server_address: String::new(),
            credentials: Credentials::default(),
            min_connections: 1,
            max_connections: 10,
            log_destination: None,
            log_append: false,
            max_connection_age: Duration::from_secs(43_200),
            checkout_timeout: Duration::from_secs(60),
            debug_level: DebugLevel::Silent,
            read_only: false,
            housekeeping_interval: Duration::from_secs(20),
            checkout_retry_interval: Duration::from_secs(2),
            checkout_attempts: 10,
            startup_attempts: 2,
            shutdown_poll_interval: Duration::from_millis(500),
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read-only configuration for a MySQL database on its default port.
    ///
    /// Starts with one connection and grows up to a hundred. Call
    /// [`read_only(false)`](Self::read_only) to allow writes.
    #[must_use]
    pub fn for_database(host: &str, database: &str) -> Self {
        Self {
            driver_id: "mysql".to_string(),
            server_address: format!("mysql://{host}:3306/{database}"),
            max_connections: 100,
            read_only: true,
            ..Self::default()
        }
    }

    /// Parse a `key=value;` connection string into configuration.
    ///
    /// ```text
    /// Driver=mysql;Server=mysql://db:3306/hazard;User=ro;Password=secret;Max Connections=20;
    /// ```
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| PoolError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "driver" => config.driver_id = value.to_string(),
                "server" | "url" | "data source" => config.server_address = value.to_string(),
                "user" | "user id" | "uid" => config.credentials.username = value.to_string(),
                "password" | "pwd" => config.credentials.password = value.to_string(),
                "min connections" | "min" => config.min_connections = parse_num(&key, value)?,
                "max connections" | "max" => config.max_connections = parse_num(&key, value)?,
                "log file" | "log" => config.log_destination = Some(PathBuf::from(value)),
                "log append" => config.log_append = parse_bool(value),
                "max age days" => {
                    let days: f64 = value
                        .parse()
                        .map_err(|_| PoolError::Config(format!("invalid {key}: {value}")))?;
                    config = config.max_conn_age_days(days);
                }
                "checkout timeout" => {
                    config.checkout_timeout = Duration::from_secs(parse_num(&key, value)?);
                }
                "debug level" => {
                    let level: u8 = parse_num(&key, value)?;
                    config.debug_level = DebugLevel::try_from(level).map_err(PoolError::Config)?;
                }
                "read only" | "readonly" => config.read_only = parse_bool(value),
                _ => {
                    tracing::debug!(
                        key = key,
                        value = value,
                        "ignoring unknown connection string option"
                    );
                }
            }
        }

        Ok(config)
    }

    /// Set the driver id.
    #[must_use]
    pub fn driver(mut self, driver_id: impl Into<String>) -> Self {
        self.driver_id = driver_id.into();
        self
    }

    /// Set the server address.
    #[must_use]
    pub fn server(mut self, address: impl Into<String>) -> Self {
        self.server_address = address.into();
        self
    }

    /// Set the credentials.
    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the diagnostic log file.
    #[must_use]
    pub fn log_destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_destination = Some(path.into());
        self
    }

    /// Append to the log file instead of truncating it.
    #[must_use]
    pub fn log_append(mut self, append: bool) -> Self {
        self.log_append = append;
        self
    }

    /// Set the maximum connection age in days.
    ///
    /// Values below thirty seconds are raised to thirty seconds.
    #[must_use]
    pub fn max_conn_age_days(mut self, days: f64) -> Self {
        let secs = if days.is_finite() && days > 0.0 {
            days * SECONDS_PER_DAY
        } else {
            0.0
        };
        self.max_connection_age = Duration::try_from_secs_f64(secs)
            .unwrap_or(Duration::MAX)
            .max(MIN_CONNECTION_AGE);
        self
    }

    /// Set the checkout timeout in seconds. Zero disables leak detection.
    #[must_use]
    pub fn checkout_timeout_seconds(mut self, secs: u64) -> Self {
        self.checkout_timeout = Duration::from_secs(secs);
        self
    }

    /// Set the debug level.
    #[must_use]
    pub fn debug_level(mut self, level: DebugLevel) -> Self {
        self.debug_level = level;
        self
    }

    /// Mark the pool read-only.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Set the housekeeping interval.
    #[must_use]
    pub fn housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// Set the back-off between checkout attempts.
    #[must_use]
    pub fn checkout_retry_interval(mut self, interval: Duration) -> Self {
        self.checkout_retry_interval = interval;
        self
    }

    /// Set the number of outer checkout attempts.
    #[must_use]
    pub fn checkout_attempts(mut self, attempts: u32) -> Self {
        self.checkout_attempts = attempts;
        self
    }

    /// Set the number of startup attempts.
    #[must_use]
    pub fn startup_attempts(mut self, attempts: u32) -> Self {
        self.startup_attempts = attempts;
        self
    }

    /// Check the configuration for values the pool cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.driver_id.is_empty() {
            return Err(PoolError::Config("driver_id must be set".into()));
        }
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than zero".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::Config(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.checkout_attempts == 0 || self.startup_attempts == 0 {
            return Err(PoolError::Config(
                "checkout_attempts and startup_attempts must be at least 1".into(),
            ));
        }
        if self.housekeeping_interval.is_zero() || self.shutdown_poll_interval.is_zero() {
            return Err(PoolError::Config(
                "housekeeping and shutdown poll intervals must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Apply internal floors to values that came in through serde or direct
    /// field assignment.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_connection_age = self.max_connection_age.max(MIN_CONNECTION_AGE);
        self
    }
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| PoolError::Config(format!("invalid {key}: {value}")))
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes") || value == "1"
}

/// Durations as fractional seconds.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
