//! HTTP/JSON backend client.
//!
//! A query is `METHOD [ /path ]` on the first line with an optional body on
//! the following lines. The response must be JSON; one scalar is extracted
//! via a dotted path with `[n]` subscripts.

use crate::backend::{QueryError, truncate_body};
use crate::config::HttpConfig;
use crate::util::ShutdownSignal;
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, warn};

/// HTTP client for one named endpoint.
#[derive(Clone)]
pub struct HttpClient {
    cfg: HttpConfig,
    client: reqwest::Client,
}

impl HttpClient {
    /// Build the client.
    ///
    /// No probe request is sent: any request against an arbitrary endpoint
    /// is potentially effectful, so open only validates the configuration.
    pub fn open(cfg: HttpConfig) -> Result<Self, QueryError> {
        if cfg.base_url.trim().is_empty() {
            return Err(QueryError::InvalidQuery(
                "http connection has an empty base_url".to_string(),
            ));
        }

        let mut builder = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .min_tls_version(reqwest::tls::Version::TLS_1_2);
        if cfg.skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        Ok(Self { cfg, client })
    }

    /// The configuration this client was built with, for structural diffing.
    pub fn config(&self) -> &HttpConfig {
        &self.cfg
    }

    /// Execute the query with retries and extract one scalar from the JSON
    /// response.
    pub async fn query_scalar(
        &self,
        query: &str,
        result_field: Option<&str>,
        shutdown: &ShutdownSignal,
    ) -> Result<f64, QueryError> {
        let parsed = parse_http_query(query)?;
        let url = join_url(&self.cfg.base_url, &parsed.path);

        let attempts = self.cfg.max_attempts.max(1);
        let mut shutdown_rx = shutdown.subscribe();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute(&parsed, &url, result_field).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts => {
                    warn!(
                        url = %url,
                        attempt,
                        error = %e,
                        "http query failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.cfg.backoff) => {}
                        _ = shutdown_rx.recv() => return Err(QueryError::Cancelled),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate the endpoint: a GET of the base URL must answer 2xx.
    pub async fn health_check(&self) -> Result<(), QueryError> {
        let resp = self.client.get(&self.cfg.base_url).send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(QueryError::Status {
                status: status.as_u16(),
                body: truncate_body(&resp.text().await.unwrap_or_default(), 200),
            })
        }
    }

    /// Release the client. Connections close on drop; idempotent.
    pub async fn close(&self) {}

    async fn execute(
        &self,
        parsed: &HttpQuery,
        url: &str,
        result_field: Option<&str>,
    ) -> Result<f64, QueryError> {
        let mut req = self.client.request(parsed.method.clone(), url);
        for (name, value) in &self.cfg.headers {
            if value.is_empty() {
                continue;
            }
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &parsed.body {
            req = req.body(body.clone());
        }

        let resp = req.send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: truncate_body(&body, 200),
            });
        }

        debug!(url = %url, status = status.as_u16(), "http query succeeded");

        let value: Value = serde_json::from_str(&body)?;
        extract_scalar(&value, result_field.unwrap_or(""))
    }
}

/// A parsed HTTP metric query.
#[derive(Debug, PartialEq, Eq)]
struct HttpQuery {
    method: Method,
    path: String,
    body: Option<String>,
}

/// Parse `METHOD [ /path ]\n[body]`. An empty query means GET the base URL.
fn parse_http_query(query: &str) -> Result<HttpQuery, QueryError> {
    let (first_line, rest) = match query.split_once('\n') {
        Some((line, rest)) => (line, Some(rest)),
        None => (query, None),
    };

    let mut tokens = first_line.split_whitespace();
    let method = match tokens.next() {
        None => Method::GET,
        Some(m) => parse_method(m)?,
    };

    let path = match tokens.next() {
        None => String::new(),
        Some(p) if p.starts_with('/') => p.to_string(),
        Some(p) => format!("/{}", p),
    };

    if tokens.next().is_some() {
        return Err(QueryError::InvalidQuery(format!(
            "expected 'METHOD [path]' on the first line, got '{}'",
            first_line.trim()
        )));
    }

    let body = rest
        .map(str::to_string)
        .filter(|b| !b.trim().is_empty());

    Ok(HttpQuery { method, path, body })
}

fn parse_method(token: &str) -> Result<Method, QueryError> {
    match token.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(QueryError::UnsupportedCommand(other.to_string())),
    }
}

/// Join a request path onto the base URL, stripping the base's trailing
/// slash so `http://host/` + `/v1/x` never doubles up.
fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}{}", base, path)
    }
}

/// One step of a parsed result-field path.
#[derive(Debug, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Parse a dotted path with `[n]` subscripts: `data.items[2].value`.
fn parse_path(path: &str) -> Result<Vec<Segment>, QueryError> {
    let mut segments = Vec::new();

    for part in path.split('.') {
        let (name, mut subscripts) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };

        if !name.is_empty() {
            segments.push(Segment::Key(name.to_string()));
        } else if subscripts.is_empty() {
            return Err(QueryError::InvalidQuery(format!(
                "empty segment in result_field '{}'",
                path
            )));
        }

        while !subscripts.is_empty() {
            let close = subscripts.find(']').ok_or_else(|| {
                QueryError::InvalidQuery(format!("unterminated subscript in '{}'", path))
            })?;
            let index: usize = subscripts[1..close].parse().map_err(|_| {
                QueryError::InvalidQuery(format!(
                    "invalid subscript '{}' in '{}'",
                    &subscripts[1..close],
                    path
                ))
            })?;
            segments.push(Segment::Index(index));
            subscripts = &subscripts[close + 1..];
            if !subscripts.is_empty() && !subscripts.starts_with('[') {
                return Err(QueryError::InvalidQuery(format!(
                    "unexpected text after subscript in '{}'",
                    path
                )));
            }
        }
    }

    Ok(segments)
}

/// Walk `path` into `root` and coerce the target into a float.
///
/// The reserved name `length` applied to an array yields its cardinality.
fn extract_scalar(root: &Value, path: &str) -> Result<f64, QueryError> {
    let path = path.trim();
    if path.is_empty() {
        return coerce_scalar(root, path);
    }

    let segments = parse_path(path)?;
    let mut current = root;

    for (i, segment) in segments.iter().enumerate() {
        match segment {
            Segment::Key(name) => {
                if name == "length" {
                    if let Value::Array(items) = current {
                        if i + 1 != segments.len() {
                            return Err(QueryError::InvalidQuery(format!(
                                "'length' must be the last segment in '{}'",
                                path
                            )));
                        }
                        return Ok(items.len() as f64);
                    }
                }
                current = current
                    .get(name)
                    .ok_or_else(|| QueryError::MissingField(path.to_string()))?;
            }
            Segment::Index(index) => {
                current = current
                    .get(*index)
                    .ok_or_else(|| QueryError::MissingField(path.to_string()))?;
            }
        }
    }

    coerce_scalar(current, path)
}

/// Coerce a JSON value into a finite float.
fn coerce_scalar(value: &Value, path: &str) -> Result<f64, QueryError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|f| f.is_finite())
            .ok_or_else(|| QueryError::NonNumeric(n.to_string())),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| QueryError::NonNumeric(s.clone())),
        Value::Bool(true) => Ok(1.0),
        Value::Bool(false) => Ok(0.0),
        Value::Null => Err(QueryError::NullResult),
        Value::Array(_) | Value::Object(_) => Err(QueryError::NonNumeric(format!(
            "'{}' selects a composite value",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_empty_query_is_get() {
        let q = parse_http_query("").unwrap();
        assert_eq!(q.method, Method::GET);
        assert_eq!(q.path, "");
        assert!(q.body.is_none());
    }

    #[test]
    fn test_parse_method_and_path() {
        let q = parse_http_query("POST /v1/stats").unwrap();
        assert_eq!(q.method, Method::POST);
        assert_eq!(q.path, "/v1/stats");
    }

    #[test]
    fn test_parse_adds_leading_slash() {
        let q = parse_http_query("GET v1/stats").unwrap();
        assert_eq!(q.path, "/v1/stats");
    }

    #[test]
    fn test_parse_body() {
        let q = parse_http_query("POST /query\n{\"range\": \"1h\"}").unwrap();
        assert_eq!(q.body.as_deref(), Some("{\"range\": \"1h\"}"));
    }

    #[test]
    fn test_parse_rejects_unknown_method() {
        assert!(matches!(
            parse_http_query("TRACE /"),
            Err(QueryError::UnsupportedCommand(m)) if m == "TRACE"
        ));
    }

    #[test]
    fn test_parse_rejects_extra_tokens() {
        assert!(matches!(
            parse_http_query("GET /a /b"),
            Err(QueryError::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://api/", "/v1"), "http://api/v1");
        assert_eq!(join_url("http://api", "/v1"), "http://api/v1");
        assert_eq!(join_url("http://api/", ""), "http://api");
    }

    #[test]
    fn test_extract_dotted_path() {
        let v = json!({"data": {"count": 7}});
        assert_eq!(extract_scalar(&v, "data.count").unwrap(), 7.0);
    }

    #[test]
    fn test_extract_subscript_path() {
        let v = json!({"items": [{"value": 1}, {"value": 2}, {"value": 9}]});
        assert_eq!(extract_scalar(&v, "items[2].value").unwrap(), 9.0);
    }

    #[test]
    fn test_extract_length() {
        let v = json!({"items": [1, 2, 3, 4]});
        assert_eq!(extract_scalar(&v, "items.length").unwrap(), 4.0);
    }

    #[test]
    fn test_extract_length_key_on_object() {
        // "length" is only reserved for arrays; objects resolve it as a key
        let v = json!({"dim": {"length": 12}});
        assert_eq!(extract_scalar(&v, "dim.length").unwrap(), 12.0);
    }

    #[test]
    fn test_extract_empty_path_uses_root() {
        let v = json!(3.5);
        assert_eq!(extract_scalar(&v, "").unwrap(), 3.5);
    }

    #[test]
    fn test_extract_missing_field() {
        let v = json!({"a": 1});
        assert!(matches!(
            extract_scalar(&v, "b"),
            Err(QueryError::MissingField(_))
        ));
    }

    #[test]
    fn test_extract_out_of_bounds_index() {
        let v = json!({"a": [1]});
        assert!(matches!(
            extract_scalar(&v, "a[5]"),
            Err(QueryError::MissingField(_))
        ));
    }

    #[test]
    fn test_coerce_numeric_string_and_bool() {
        assert_eq!(extract_scalar(&json!("42.5"), "").unwrap(), 42.5);
        assert_eq!(extract_scalar(&json!(true), "").unwrap(), 1.0);
        assert_eq!(extract_scalar(&json!(false), "").unwrap(), 0.0);
    }

    #[test]
    fn test_coerce_null_fails() {
        assert!(matches!(
            extract_scalar(&json!(null), ""),
            Err(QueryError::NullResult)
        ));
    }

    #[test]
    fn test_coerce_composite_fails() {
        assert!(matches!(
            extract_scalar(&json!({"a": 1}), ""),
            Err(QueryError::NonNumeric(_))
        ));
    }

    #[test]
    fn test_parse_path_rejects_garbage() {
        assert!(parse_path("a[").is_err());
        assert!(parse_path("a[x]").is_err());
        assert!(parse_path("a..b").is_err());
        assert!(parse_path("a[0]b").is_err());
    }

    #[test]
    fn test_open_rejects_empty_base_url() {
        let cfg: HttpConfig = serde_yaml::from_str("base_url: \"\"").unwrap();
        assert!(HttpClient::open(cfg).is_err());
    }
}
