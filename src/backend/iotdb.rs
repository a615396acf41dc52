//! IoTDB backend client.
//!
//! Talks to the IoTDB REST service (v2). Query results arrive column-major:
//! `values[i]` is the full column for `expressions[i]` (raw queries) or
//! `column_names[i]` (aggregations).

use crate::backend::{PROBE_TIMEOUT, QueryError, truncate_body};
use crate::config::IotdbConfig;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;
use tracing::warn;

/// Client for the single configured IoTDB instance.
#[derive(Clone)]
pub struct IotdbClient {
    cfg: IotdbConfig,
    client: reqwest::Client,
}

impl IotdbClient {
    /// Build the client and probe the REST service.
    pub async fn open(cfg: IotdbConfig) -> Result<Self, QueryError> {
        let client = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        let this = Self { cfg, client };

        timeout(PROBE_TIMEOUT, this.health_check())
            .await
            .map_err(|_| QueryError::ProbeTimeout)??;

        Ok(this)
    }

    /// The configuration this client was opened with, for structural diffing.
    pub fn config(&self) -> &IotdbConfig {
        &self.cfg
    }

    /// Execute one statement and sum the selected column across all rows.
    pub async fn query_scalar(
        &self,
        query: &str,
        result_field: Option<&str>,
    ) -> Result<f64, QueryError> {
        let url = format!("{}/rest/v2/query", self.base());
        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.cfg.username, Some(&self.cfg.password))
            .json(&serde_json::json!({ "sql": query }))
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(QueryError::Status {
                status: status.as_u16(),
                body: truncate_body(&body, 200),
            });
        }

        let payload: QueryResponse = serde_json::from_str(&body)?;
        let values = payload.values.ok_or_else(|| {
            QueryError::Backend(match payload.message {
                Some(message) => format!("iotdb: {}", message),
                None => "iotdb query returned no result set".to_string(),
            })
        })?;

        let columns = payload
            .expressions
            .filter(|c| !c.is_empty())
            .or(payload.column_names)
            .unwrap_or_default();

        let index = select_column(&columns, result_field)?;
        let column = values
            .get(index)
            .ok_or_else(|| QueryError::MissingField(columns.get(index).cloned().unwrap_or_default()))?;

        sum_column(column)
    }

    /// Validate the REST service is reachable.
    pub async fn health_check(&self) -> Result<(), QueryError> {
        let url = format!("{}/ping", self.base());
        let resp = self.client.get(&url).send().await?;
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

    fn base(&self) -> &str {
        self.cfg.base_url.trim_end_matches('/')
    }
}

/// Result shape of `POST /rest/v2/query`.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    expressions: Option<Vec<String>>,
    #[serde(default)]
    column_names: Option<Vec<String>>,
    #[serde(default)]
    values: Option<Vec<Vec<Value>>>,
    #[serde(default)]
    message: Option<String>,
}

/// Pick the column to aggregate.
///
/// An explicit field matches exactly first (case-insensitive), then by
/// case-insensitive substring with a warning. No field means first column.
fn select_column(columns: &[String], result_field: Option<&str>) -> Result<usize, QueryError> {
    let Some(field) = result_field.map(str::trim).filter(|f| !f.is_empty()) else {
        return Ok(0);
    };

    if let Some(i) = columns.iter().position(|c| c.eq_ignore_ascii_case(field)) {
        return Ok(i);
    }

    let needle = field.to_ascii_lowercase();
    if let Some(i) = columns
        .iter()
        .position(|c| c.to_ascii_lowercase().contains(&needle))
    {
        warn!(
            field,
            column = %columns[i],
            "result_field matched a column by substring, not exactly"
        );
        return Ok(i);
    }

    Err(QueryError::MissingField(field.to_string()))
}

/// Sum a column. Nulls contribute 0; non-numeric values fail the query.
fn sum_column(column: &[Value]) -> Result<f64, QueryError> {
    let mut total = 0.0;
    for value in column {
        match value {
            Value::Null => {}
            Value::Number(n) => {
                total += n
                    .as_f64()
                    .filter(|f| f.is_finite())
                    .ok_or_else(|| QueryError::NonNumeric(n.to_string()))?;
            }
            other => return Err(QueryError::NonNumeric(other.to_string())),
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_column_defaults_to_first() {
        let cols = columns(&["root.sg.d.temperature", "root.sg.d.humidity"]);
        assert_eq!(select_column(&cols, None).unwrap(), 0);
        assert_eq!(select_column(&cols, Some("")).unwrap(), 0);
    }

    #[test]
    fn test_select_column_exact_case_insensitive() {
        let cols = columns(&["root.sg.d.Temperature", "root.sg.d.humidity"]);
        assert_eq!(
            select_column(&cols, Some("ROOT.SG.D.TEMPERATURE")).unwrap(),
            0
        );
    }

    #[test]
    fn test_select_column_substring_fallback() {
        let cols = columns(&["root.sg.d.temperature", "root.sg.d.humidity"]);
        assert_eq!(select_column(&cols, Some("humidity")).unwrap(), 1);
    }

    #[test]
    fn test_select_column_missing() {
        let cols = columns(&["root.sg.d.temperature"]);
        assert!(matches!(
            select_column(&cols, Some("pressure")),
            Err(QueryError::MissingField(f)) if f == "pressure"
        ));
    }

    #[test]
    fn test_sum_column_with_nulls() {
        let column = vec![json!(1.5), json!(null), json!(2), json!(null)];
        assert_eq!(sum_column(&column).unwrap(), 3.5);
    }

    #[test]
    fn test_sum_empty_column_is_zero() {
        assert_eq!(sum_column(&[]).unwrap(), 0.0);
    }

    #[test]
    fn test_sum_rejects_text_values() {
        let column = vec![json!(1), json!("broken")];
        assert!(matches!(
            sum_column(&column),
            Err(QueryError::NonNumeric(_))
        ));
    }

    #[test]
    fn test_response_shape_parses() {
        let body = r#"{
            "expressions": ["root.sg.d.s1"],
            "column_names": null,
            "timestamps": [1, 2],
            "values": [[10, 20]]
        }"#;
        let payload: QueryResponse = serde_json::from_str(body).unwrap();
        assert_eq!(payload.expressions.unwrap(), vec!["root.sg.d.s1"]);
        assert_eq!(payload.values.unwrap()[0].len(), 2);
    }

    #[test]
    fn test_error_response_surfaces_message() {
        let body = r#"{"code": 301, "message": "sql parse error"}"#;
        let payload: QueryResponse = serde_json::from_str(body).unwrap();
        assert!(payload.values.is_none());
        assert_eq!(payload.message.unwrap(), "sql parse error");
    }
}
