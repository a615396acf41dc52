//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Collection schedule
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Exporter listener settings
    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Named MySQL connections
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mysql_connections: BTreeMap<String, MysqlConfig>,

    /// Named Redis connections
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub redis_connections: BTreeMap<String, RedisConfig>,

    /// Named HTTP endpoints
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub http_connections: BTreeMap<String, HttpConfig>,

    /// IoTDB session (a single instance)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iotdb: Option<IotdbConfig>,

    /// Legacy unnamed MySQL block, merged into `mysql_connections` as
    /// "default" when that name is free.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<MysqlConfig>,

    /// Legacy unnamed Redis block, merged like `mysql`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,

    /// Metric definitions, collected in order
    #[serde(default)]
    pub metrics: Vec<MetricSpec>,
}

impl Config {
    /// Fold the legacy unnamed connection blocks into the named maps.
    ///
    /// An explicit `mysql_connections.default` or `redis_connections.default`
    /// entry takes precedence over the legacy block.
    pub fn normalize(&mut self) {
        if let Some(legacy) = self.mysql.take() {
            self.mysql_connections
                .entry(DEFAULT_CONNECTION.to_string())
                .or_insert(legacy);
        }
        if let Some(legacy) = self.redis.take() {
            self.redis_connections
                .entry(DEFAULT_CONNECTION.to_string())
                .or_insert(legacy);
        }
    }
}

/// Connection name used when a metric does not name one.
pub const DEFAULT_CONNECTION: &str = "default";

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub log_format: LogFormat,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::Json,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// Collection schedule.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ScheduleConfig {
    /// Interval between collection rounds
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

/// Exporter listener settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PrometheusConfig {
    /// Address to bind
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port to bind
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
        }
    }
}

/// MySQL connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MysqlConfig {
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub password: String,

    pub database: String,

    /// Extra DSN parameters, appended verbatim to the connection URL
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

/// Redis connection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RedisConfig {
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,
}

/// HTTP endpoint settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct HttpConfig {
    /// Base URL requests are joined against
    pub base_url: String,

    /// Headers sent with every request; entries with empty values are skipped
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Per-request timeout
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Disable TLS certificate verification
    #[serde(default)]
    pub skip_verify: bool,

    /// Attempts per query, at least 1
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,
}

/// IoTDB session settings (REST API).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IotdbConfig {
    /// Base URL of the REST service, e.g. "http://iotdb:18080"
    pub base_url: String,

    #[serde(default = "default_iotdb_username")]
    pub username: String,

    #[serde(default = "default_iotdb_password")]
    pub password: String,

    #[serde(default = "default_iotdb_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// One metric to collect.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct MetricSpec {
    /// Metric name as exposed to Prometheus
    pub name: String,

    /// Help text; the first help seen for a name wins process-wide
    #[serde(default)]
    pub help: String,

    /// Instrument kind
    #[serde(default)]
    pub kind: MetricKind,

    /// Which backend executes the query
    pub source: SourceKind,

    /// Named connection; empty or absent means "default"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,

    /// Backend-specific query; may be empty only for `source: http`
    #[serde(default)]
    pub query: String,

    /// Column selector (iotdb) or JSON path (http)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_field: Option<String>,

    /// Constant labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Histogram buckets, ascending; required iff kind is histogram
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<f64>>,

    /// Summary objectives, quantile -> allowed error; required iff kind is
    /// summary. Keys are strings so the same model round-trips through JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objectives: Option<BTreeMap<String, f64>>,
}

impl MetricSpec {
    /// The connection name after defaulting.
    pub fn connection_name(&self) -> &str {
        match self.connection.as_deref() {
            None | Some("") => DEFAULT_CONNECTION,
            Some(name) => name,
        }
    }
}

/// Prometheus instrument kind.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    Histogram,
    Summary,
}

/// Backend kind a metric is collected from.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[serde(alias = "relational")]
    Mysql,
    #[serde(alias = "timeseries")]
    Iotdb,
    #[serde(alias = "keyvalue")]
    Redis,
    Http,
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SourceKind::Mysql => "mysql",
            SourceKind::Iotdb => "iotdb",
            SourceKind::Redis => "redis",
            SourceKind::Http => "http",
        };
        f.write_str(s)
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_interval() -> Duration {
    Duration::from_secs(3600)
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_redis_port() -> u16 {
    6379
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_iotdb_username() -> String {
    "root".to_string()
}

fn default_iotdb_password() -> String {
    "root".to_string()
}

fn default_iotdb_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
