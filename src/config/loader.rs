//! Configuration file loading and persistence.

use crate::config::{Config, validate_config};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Load configuration from a YAML file.
///
/// Reads the file, expands `${VAR}` references from the environment, parses
/// the YAML, folds legacy connection blocks, and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    let contents = std::fs::read_to_string(path)?;
    let contents = expand_env(&contents);

    let mut config: Config = serde_yaml::from_str(&contents)?;
    config.normalize();

    validate_config(&config).map_err(ConfigError::ValidationError)?;

    Ok(config)
}

/// Persist a configuration as YAML.
///
/// Writes to a sibling temp file first so a crash mid-write never leaves a
/// truncated config behind.
pub fn save_config<P: AsRef<Path>>(path: P, config: &Config) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(config)?;

    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml.as_bytes())?;
    std::fs::rename(&tmp, path)?;

    Ok(())
}

/// Replace literal `${VAR}` occurrences with the environment value.
///
/// Unset variables expand to the empty string with a warning, matching what
/// operators expect from shell-style expansion in config files.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        warn!(variable = name, "environment variable not set, expanding empty");
                    }
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference, keep the literal text
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_minimal_config() {
        let yaml = r#"
mysql_connections:
  default:
    host: "127.0.0.1"
    username: exporter
    database: app

metrics:
  - name: app_users_total
    help: Number of users
    source: mysql
    query: SELECT COUNT(*) FROM users
"#;

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.metrics.len(), 1);
        assert_eq!(config.metrics[0].name, "app_users_total");
        assert!(config.mysql_connections.contains_key("default"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_config("/nonexistent/path/config.yaml");
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), ConfigError::ReadError(_)));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not: valid: yaml: {{{}}}").unwrap();

        let result = load_config(file.path());
        assert!(result.is_err());
    }

    #[test]
    fn test_load_rejects_empty_metric_list() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"metrics: []").unwrap();

        let result = load_config(file.path());
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_expand_env() {
        // SAFETY: test-local variable, no concurrent reader depends on it.
        unsafe { std::env::set_var("Q2M_TEST_PASSWORD", "hunter2") };

        let expanded = expand_env("password: ${Q2M_TEST_PASSWORD}");
        assert_eq!(expanded, "password: hunter2");

        let expanded = expand_env("a ${Q2M_TEST_PASSWORD} b ${Q2M_TEST_PASSWORD}");
        assert_eq!(expanded, "a hunter2 b hunter2");
    }

    #[test]
    fn test_expand_env_unset_is_empty() {
        let expanded = expand_env("password: ${Q2M_DEFINITELY_UNSET_VAR}");
        assert_eq!(expanded, "password: ");
    }

    #[test]
    fn test_expand_env_unterminated_kept_literal() {
        let expanded = expand_env("oops ${UNTERMINATED");
        assert_eq!(expanded, "oops ${UNTERMINATED");
    }

    #[test]
    fn test_save_round_trip() {
        let yaml = r#"
http_connections:
  default:
    base_url: "http://api.internal"

metrics:
  - name: api_items
    help: Items reported by the API
    source: http
    result_field: data.count
"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();

        let out = NamedTempFile::new().unwrap();
        save_config(out.path(), &config).unwrap();

        let reloaded = load_config(out.path()).unwrap();
        assert_eq!(config, reloaded);
    }
}
