//! Backend clients and their registry.
//!
//! Each backend kind exposes the same surface: open with a bounded probe,
//! execute one query returning one finite number, health-check, close.

mod http;
mod iotdb;
mod mysql;
mod redis;
mod registry;

pub use http::HttpClient;
pub use iotdb::IotdbClient;
pub use mysql::MysqlClient;
pub use redis::RedisClient;
pub use registry::{ClientRegistry, NeededClients, needed_clients};

use crate::config::{MetricSpec, SourceKind};
use crate::util::ShutdownSignal;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the connection probe performed by `open`.
pub(crate) const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from backend queries.
///
/// The taxonomy is kept structured so callers can distinguish a transport
/// failure from a shape problem in the result.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no open client for {kind} connection '{connection}'")]
    NotConnected { kind: SourceKind, connection: String },

    #[error("unsupported command '{0}'")]
    UnsupportedCommand(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("query returned no rows")]
    EmptyResult,

    #[error("query returned NULL")]
    NullResult,

    #[error("non-numeric result: {0}")]
    NonNumeric(String),

    #[error("result field '{0}' not found")]
    MissingField(String),

    #[error("http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("query cancelled by shutdown")]
    Cancelled,

    #[error("connection probe timed out")]
    ProbeTimeout,

    #[error("mysql error: {0}")]
    Mysql(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid JSON response: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}

/// A cheap-to-clone handle on one opened backend client.
///
/// Cloning shares the underlying pool, so a collection round can carry
/// handles out of the registry lock and query without holding it.
#[derive(Clone)]
pub enum BackendHandle {
    Mysql(MysqlClient),
    Redis(RedisClient),
    Http(HttpClient),
    Iotdb(IotdbClient),
}

impl BackendHandle {
    /// Execute the query described by `spec` and return one scalar.
    pub async fn query_scalar(
        &self,
        spec: &MetricSpec,
        shutdown: &ShutdownSignal,
    ) -> Result<f64, QueryError> {
        match self {
            BackendHandle::Mysql(c) => c.query_scalar(&spec.query).await,
            BackendHandle::Redis(c) => c.query_scalar(&spec.query).await,
            BackendHandle::Http(c) => {
                c.query_scalar(&spec.query, spec.result_field.as_deref(), shutdown)
                    .await
            }
            BackendHandle::Iotdb(c) => {
                c.query_scalar(&spec.query, spec.result_field.as_deref()).await
            }
        }
    }
}

/// Truncate an error payload so response bodies never flood the logs.
pub(crate) fn truncate_body(body: &str, limit: usize) -> String {
    if body.len() <= limit {
        body.to_string()
    } else {
        let cut = body
            .char_indices()
            .take_while(|(i, _)| *i < limit)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}...", &body[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_short() {
        assert_eq!(truncate_body("ok", 200), "ok");
    }

    #[test]
    fn test_truncate_body_long() {
        let long = "x".repeat(300);
        let truncated = truncate_body(&long, 200);
        assert!(truncated.len() <= 204);
        assert!(truncated.ends_with("..."));
    }

    #[test]
    fn test_truncate_body_multibyte_boundary() {
        let s = "é".repeat(120);
        let truncated = truncate_body(&s, 200);
        assert!(truncated.ends_with("..."));
        // Must not split a UTF-8 sequence
        assert!(truncated.is_char_boundary(truncated.len() - 3));
    }
}
