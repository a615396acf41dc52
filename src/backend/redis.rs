//! Redis backend client.
//!
//! Queries are plain command strings ("GET mykey"). Only a closed list of
//! read-only commands is accepted so a config edit can never mutate the
//! store.

use crate::backend::{PROBE_TIMEOUT, QueryError};
use crate::config::RedisConfig;
use redis::Value;
use redis::aio::ConnectionManager;
use tokio::time::timeout;

/// Read-only commands a metric query may use.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "GET", "HGET", "LLEN", "SCARD", "ZCARD", "PFCOUNT", "STRLEN", "HLEN", "ZCOUNT", "EXISTS",
    "ZSCORE", "DBSIZE",
];

/// Redis client for one named connection.
#[derive(Clone)]
pub struct RedisClient {
    cfg: RedisConfig,
    manager: ConnectionManager,
}

impl RedisClient {
    /// Open a managed connection and probe it.
    pub async fn open(cfg: RedisConfig) -> Result<Self, QueryError> {
        let client = redis::Client::open(redis_url(&cfg).as_str())?;
        let manager = timeout(PROBE_TIMEOUT, ConnectionManager::new(client))
            .await
            .map_err(|_| QueryError::ProbeTimeout)??;
        Ok(Self { cfg, manager })
    }

    /// The configuration this client was opened with, for structural diffing.
    pub fn config(&self) -> &RedisConfig {
        &self.cfg
    }

    /// Execute one allow-listed command and return its value as a float.
    pub async fn query_scalar(&self, query: &str) -> Result<f64, QueryError> {
        let (command, args) = parse_command(query)?;

        let mut cmd = redis::cmd(&command);
        for arg in args {
            cmd.arg(arg);
        }

        let mut conn = self.manager.clone();
        let value: Value = cmd.query_async(&mut conn).await?;
        value_to_f64(value)
    }

    /// Validate the connection without side effects.
    pub async fn health_check(&self) -> Result<(), QueryError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    /// Release the connection. The manager closes on drop, so this exists
    /// for lifecycle symmetry with the pooled clients and is idempotent.
    pub async fn close(&self) {}
}

/// Tokenize a command string and enforce the allow-list.
///
/// Returns the canonical upper-cased command plus its arguments.
fn parse_command(query: &str) -> Result<(String, Vec<&str>), QueryError> {
    let mut tokens = query.split_whitespace();
    let first = tokens
        .next()
        .ok_or_else(|| QueryError::InvalidQuery("empty redis query".to_string()))?;

    let command = first.to_ascii_uppercase();
    if !ALLOWED_COMMANDS.contains(&command.as_str()) {
        return Err(QueryError::UnsupportedCommand(command));
    }
    Ok((command, tokens.collect()))
}

/// Convert a reply value to a float.
///
/// Integer replies convert directly, bulk strings parse as floats, nil is
/// an error (missing key / member).
fn value_to_f64(value: Value) -> Result<f64, QueryError> {
    match value {
        Value::Nil => Err(QueryError::NullResult),
        Value::Int(i) => Ok(i as f64),
        Value::Double(d) => Ok(d),
        Value::Boolean(b) => Ok(if b { 1.0 } else { 0.0 }),
        Value::BulkString(bytes) => {
            let s = String::from_utf8_lossy(&bytes).into_owned();
            s.trim().parse::<f64>().map_err(|_| QueryError::NonNumeric(s))
        }
        Value::SimpleString(s) => {
            s.trim().parse::<f64>().map_err(|_| QueryError::NonNumeric(s))
        }
        other => Err(QueryError::NonNumeric(format!("{:?}", other))),
    }
}

/// Build the connection URL from config fields.
fn redis_url(cfg: &RedisConfig) -> String {
    let auth = match (&cfg.username, &cfg.password) {
        (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
        (None, Some(pass)) => format!(":{}@", pass),
        (Some(user), None) => format!("{}@", user),
        (None, None) => String::new(),
    };
    format!("redis://{}{}:{}/{}", auth, cfg.host, cfg.port, cfg.db)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list_accepts_reads() {
        let (command, args) = parse_command("GET mykey").unwrap();
        assert_eq!(command, "GET");
        assert_eq!(args, vec!["mykey"]);

        let (command, _) = parse_command("get mykey").unwrap();
        assert_eq!(command, "GET");

        let (command, args) = parse_command("ZCOUNT board 0 100").unwrap();
        assert_eq!(command, "ZCOUNT");
        assert_eq!(args, vec!["board", "0", "100"]);

        let (_, args) = parse_command("DBSIZE").unwrap();
        assert!(args.is_empty());
    }

    #[test]
    fn test_allow_list_rejects_writes() {
        let err = parse_command("DEL foo").unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedCommand(c) if c == "DEL"));

        let err = parse_command("FLUSHALL").unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedCommand(_)));

        let err = parse_command("set foo 1").unwrap_err();
        assert!(matches!(err, QueryError::UnsupportedCommand(c) if c == "SET"));
    }

    #[test]
    fn test_empty_query_rejected() {
        assert!(matches!(
            parse_command("   "),
            Err(QueryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_value_conversion() {
        assert_eq!(value_to_f64(Value::Int(42)).unwrap(), 42.0);
        assert_eq!(value_to_f64(Value::Double(1.5)).unwrap(), 1.5);
        assert_eq!(value_to_f64(Value::Boolean(true)).unwrap(), 1.0);
        assert_eq!(
            value_to_f64(Value::BulkString(b"3.25".to_vec())).unwrap(),
            3.25
        );
    }

    #[test]
    fn test_nil_is_error() {
        assert!(matches!(value_to_f64(Value::Nil), Err(QueryError::NullResult)));
    }

    #[test]
    fn test_non_numeric_bulk_string() {
        let err = value_to_f64(Value::BulkString(b"hello".to_vec())).unwrap_err();
        assert!(matches!(err, QueryError::NonNumeric(s) if s == "hello"));
    }

    #[test]
    fn test_redis_url() {
        let cfg: RedisConfig = serde_yaml::from_str("host: cache.internal").unwrap();
        assert_eq!(redis_url(&cfg), "redis://cache.internal:6379/0");

        let cfg: RedisConfig = serde_yaml::from_str(
            r#"
host: cache.internal
port: 6380
password: pw
db: 2
"#,
        )
        .unwrap();
        assert_eq!(redis_url(&cfg), "redis://:pw@cache.internal:6380/2");
    }
}
