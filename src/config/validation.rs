//! Configuration validation.

use crate::config::{Config, MetricKind, MetricSpec, SourceKind};

/// Validate the configuration.
///
/// Checks for:
/// - At least one metric
/// - Valid metric and label names
/// - Histogram/summary shape requirements
/// - Connection references that resolve (after defaulting to "default")
/// - Sane HTTP retry settings
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.metrics.is_empty() {
        errors.push("at least one metric must be defined".to_string());
    }

    if config.schedule.interval.is_zero() {
        errors.push("schedule.interval must be greater than zero".to_string());
    }

    for spec in &config.metrics {
        validate_metric(spec, config, &mut errors);
    }

    for (name, http) in &config.http_connections {
        if http.max_attempts == 0 {
            errors.push(format!(
                "http connection '{}' has max_attempts 0 (must be >= 1)",
                name
            ));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

fn validate_metric(spec: &MetricSpec, config: &Config, errors: &mut Vec<String>) {
    if !is_valid_metric_name(&spec.name) {
        errors.push(format!(
            "invalid metric name '{}' (must match [a-zA-Z_:][a-zA-Z0-9_:]*)",
            spec.name
        ));
    }

    for label in spec.labels.keys() {
        if !is_valid_label_name(label) {
            errors.push(format!(
                "metric '{}' has invalid label name '{}'",
                spec.name, label
            ));
        }
    }

    match spec.kind {
        MetricKind::Histogram => match &spec.buckets {
            None => errors.push(format!(
                "histogram metric '{}' requires buckets",
                spec.name
            )),
            Some(buckets) => {
                if buckets.is_empty() {
                    errors.push(format!("histogram metric '{}' has empty buckets", spec.name));
                } else if buckets.windows(2).any(|w| w[0] >= w[1]) {
                    errors.push(format!(
                        "histogram metric '{}' buckets must be strictly ascending",
                        spec.name
                    ));
                }
            }
        },
        MetricKind::Summary => match &spec.objectives {
            None => errors.push(format!(
                "summary metric '{}' requires objectives",
                spec.name
            )),
            Some(objectives) => {
                if objectives.is_empty() {
                    errors.push(format!("summary metric '{}' has empty objectives", spec.name));
                }
                for (quantile, epsilon) in objectives {
                    match quantile.parse::<f64>() {
                        Ok(q) if q > 0.0 && q < 1.0 => {}
                        _ => errors.push(format!(
                            "summary metric '{}' has invalid quantile '{}' (must be in (0,1))",
                            spec.name, quantile
                        )),
                    }
                    if !(*epsilon > 0.0 && *epsilon < 1.0) {
                        errors.push(format!(
                            "summary metric '{}' has invalid error {} for quantile {} (must be in (0,1))",
                            spec.name, epsilon, quantile
                        ));
                    }
                }
            }
        },
        MetricKind::Gauge | MetricKind::Counter => {
            if spec.buckets.is_some() {
                errors.push(format!(
                    "metric '{}' sets buckets but is not a histogram",
                    spec.name
                ));
            }
            if spec.objectives.is_some() {
                errors.push(format!(
                    "metric '{}' sets objectives but is not a summary",
                    spec.name
                ));
            }
        }
    }

    if spec.query.trim().is_empty() && spec.source != SourceKind::Http {
        errors.push(format!(
            "metric '{}' requires a query for source '{}'",
            spec.name, spec.source
        ));
    }

    // Connection references are checked after defaulting: an absent or empty
    // connection means "default".
    let connection = spec.connection_name();
    let resolved = match spec.source {
        SourceKind::Mysql => config.mysql_connections.contains_key(connection),
        SourceKind::Redis => config.redis_connections.contains_key(connection),
        SourceKind::Http => config.http_connections.contains_key(connection),
        SourceKind::Iotdb => config.iotdb.is_some(),
    };
    if !resolved {
        if spec.source == SourceKind::Iotdb {
            errors.push(format!(
                "metric '{}' uses source iotdb but no iotdb section is configured",
                spec.name
            ));
        } else {
            errors.push(format!(
                "metric '{}' references non-existent {} connection '{}'",
                spec.name, spec.source, connection
            ));
        }
    }
}

/// Check a metric name against `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Check a label name against `[a-zA-Z_][a-zA-Z0-9_]*`, excluding the
/// reserved `__` prefix.
pub fn is_valid_label_name(name: &str) -> bool {
    if name.starts_with("__") {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
