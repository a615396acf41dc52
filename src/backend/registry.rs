//! Client registry: one opened client per (backend kind, connection name).
//!
//! The registry owns client lifecycles. `ensure` reconciles the open set
//! against a configuration: missing clients are opened, clients whose
//! stored config differs structurally are closed and reopened so stale
//! credentials or addresses cannot persist, and unused clients are closed.
//! Open failures are non-fatal; the slot stays empty and dependent metrics
//! fail at collection time.

use crate::backend::{BackendHandle, HttpClient, IotdbClient, MysqlClient, RedisClient};
use crate::config::{Config, MetricSpec, SourceKind};
use std::collections::{BTreeSet, HashMap};
use tracing::{info, warn};

/// The set of clients a configuration requires.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct NeededClients {
    pub mysql: BTreeSet<String>,
    pub redis: BTreeSet<String>,
    pub http: BTreeSet<String>,
    pub iotdb: bool,
}

/// Derive the required clients from the metric list.
pub fn needed_clients(config: &Config) -> NeededClients {
    let mut needed = NeededClients::default();
    for spec in &config.metrics {
        let name = spec.connection_name().to_string();
        match spec.source {
            SourceKind::Mysql => {
                needed.mysql.insert(name);
            }
            SourceKind::Redis => {
                needed.redis.insert(name);
            }
            SourceKind::Http => {
                needed.http.insert(name);
            }
            SourceKind::Iotdb => needed.iotdb = true,
        }
    }
    needed
}

/// Holds every opened backend client, keyed by connection name.
#[derive(Default)]
pub struct ClientRegistry {
    mysql: HashMap<String, MysqlClient>,
    redis: HashMap<String, RedisClient>,
    http: HashMap<String, HttpClient>,
    iotdb: Option<IotdbClient>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the open clients against `config`.
    pub async fn ensure(&mut self, config: &Config) {
        let needed = needed_clients(config);

        self.ensure_mysql(config, &needed.mysql).await;
        self.ensure_redis(config, &needed.redis).await;
        self.ensure_http(config, &needed.http).await;
        self.ensure_iotdb(config, needed.iotdb).await;
    }

    /// Resolve the client a metric collects through, if it is open.
    pub fn handle_for(&self, spec: &MetricSpec) -> Option<BackendHandle> {
        let name = spec.connection_name();
        match spec.source {
            SourceKind::Mysql => self.mysql.get(name).cloned().map(BackendHandle::Mysql),
            SourceKind::Redis => self.redis.get(name).cloned().map(BackendHandle::Redis),
            SourceKind::Http => self.http.get(name).cloned().map(BackendHandle::Http),
            SourceKind::Iotdb => self.iotdb.clone().map(BackendHandle::Iotdb),
        }
    }

    /// Close every client. Used at shutdown.
    pub async fn close_all(&mut self) {
        for (name, client) in self.mysql.drain() {
            client.close().await;
            info!(connection = %name, "closed mysql connection");
        }
        for (name, client) in self.redis.drain() {
            client.close().await;
            info!(connection = %name, "closed redis connection");
        }
        for (name, client) in self.http.drain() {
            client.close().await;
            info!(connection = %name, "closed http client");
        }
        if let Some(client) = self.iotdb.take() {
            client.close().await;
            info!("closed iotdb session");
        }
    }

    async fn ensure_mysql(&mut self, config: &Config, needed: &BTreeSet<String>) {
        let stale: Vec<String> = self
            .mysql
            .keys()
            .filter(|name| !needed.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(client) = self.mysql.remove(&name) {
                client.close().await;
                info!(connection = %name, "closed unused mysql connection");
            }
        }

        for name in needed {
            let Some(cfg) = config.mysql_connections.get(name) else {
                continue;
            };
            if let Some(existing) = self.mysql.get(name) {
                if existing.config() == cfg {
                    continue;
                }
                info!(connection = %name, "mysql connection config changed, reopening");
                if let Some(old) = self.mysql.remove(name) {
                    old.close().await;
                }
            }
            match MysqlClient::open(cfg.clone()).await {
                Ok(client) => {
                    info!(connection = %name, host = %cfg.host, "opened mysql connection");
                    self.mysql.insert(name.clone(), client);
                }
                Err(e) => {
                    warn!(connection = %name, error = %e,
                          "failed to open mysql connection, dependent metrics will fail");
                }
            }
        }
    }

    async fn ensure_redis(&mut self, config: &Config, needed: &BTreeSet<String>) {
        let stale: Vec<String> = self
            .redis
            .keys()
            .filter(|name| !needed.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(client) = self.redis.remove(&name) {
                client.close().await;
                info!(connection = %name, "closed unused redis connection");
            }
        }

        for name in needed {
            let Some(cfg) = config.redis_connections.get(name) else {
                continue;
            };
            if let Some(existing) = self.redis.get(name) {
                if existing.config() == cfg {
                    continue;
                }
                info!(connection = %name, "redis connection config changed, reopening");
                if let Some(old) = self.redis.remove(name) {
                    old.close().await;
                }
            }
            match RedisClient::open(cfg.clone()).await {
                Ok(client) => {
                    info!(connection = %name, host = %cfg.host, "opened redis connection");
                    self.redis.insert(name.clone(), client);
                }
                Err(e) => {
                    warn!(connection = %name, error = %e,
                          "failed to open redis connection, dependent metrics will fail");
                }
            }
        }
    }

    async fn ensure_http(&mut self, config: &Config, needed: &BTreeSet<String>) {
        let stale: Vec<String> = self
            .http
            .keys()
            .filter(|name| !needed.contains(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(client) = self.http.remove(&name) {
                client.close().await;
                info!(connection = %name, "closed unused http client");
            }
        }

        for name in needed {
            let Some(cfg) = config.http_connections.get(name) else {
                continue;
            };
            if let Some(existing) = self.http.get(name) {
                if existing.config() == cfg {
                    continue;
                }
                info!(connection = %name, "http endpoint config changed, rebuilding client");
                self.http.remove(name);
            }
            match HttpClient::open(cfg.clone()) {
                Ok(client) => {
                    info!(connection = %name, base_url = %cfg.base_url, "built http client");
                    self.http.insert(name.clone(), client);
                }
                Err(e) => {
                    warn!(connection = %name, error = %e,
                          "failed to build http client, dependent metrics will fail");
                }
            }
        }
    }

    async fn ensure_iotdb(&mut self, config: &Config, needed: bool) {
        let cfg = match (needed, &config.iotdb) {
            (true, Some(cfg)) => cfg,
            _ => {
                if let Some(client) = self.iotdb.take() {
                    client.close().await;
                    info!("closed unused iotdb session");
                }
                return;
            }
        };

        if let Some(existing) = &self.iotdb {
            if existing.config() == cfg {
                return;
            }
            info!("iotdb config changed, reopening session");
            if let Some(old) = self.iotdb.take() {
                old.close().await;
            }
        }
        match IotdbClient::open(cfg.clone()).await {
            Ok(client) => {
                info!(base_url = %cfg.base_url, "opened iotdb session");
                self.iotdb = Some(client);
            }
            Err(e) => {
                warn!(error = %e, "failed to open iotdb session, dependent metrics will fail");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_metrics(yaml: &str) -> Config {
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.normalize();
        config
    }

    #[test]
    fn test_needed_clients_defaults_connection() {
        let config = config_with_metrics(
            r#"
metrics:
  - name: a
    source: mysql
    query: SELECT 1
  - name: b
    source: mysql
    connection: replica
    query: SELECT 1
  - name: c
    source: redis
    query: DBSIZE
  - name: d
    source: http
  - name: e
    source: iotdb
    query: SELECT count(s) FROM root.sg
"#,
        );
        let needed = needed_clients(&config);
        assert_eq!(
            needed.mysql,
            ["default", "replica"].iter().map(|s| s.to_string()).collect()
        );
        assert_eq!(needed.redis.len(), 1);
        assert!(needed.redis.contains("default"));
        assert!(needed.http.contains("default"));
        assert!(needed.iotdb);
    }

    #[test]
    fn test_needed_clients_empty_metrics() {
        let needed = needed_clients(&Config::default());
        assert_eq!(needed, NeededClients::default());
    }

    #[tokio::test]
    async fn test_ensure_builds_http_and_drops_unused() {
        let config = config_with_metrics(
            r#"
http_connections:
  default:
    base_url: "http://127.0.0.1:1"
metrics:
  - name: a
    source: http
"#,
        );

        let mut registry = ClientRegistry::new();
        registry.ensure(&config).await;
        assert!(registry.handle_for(&config.metrics[0]).is_some());

        // A config without http metrics drops the client
        let without = config_with_metrics(
            r#"
mysql_connections:
  default:
    host: "127.0.0.1"
    username: u
    database: d
metrics:
  - name: a
    source: mysql
    query: SELECT 1
"#,
        );
        registry.ensure(&without).await;
        assert!(registry.handle_for(&config.metrics[0]).is_none());
    }

    #[tokio::test]
    async fn test_ensure_rebuilds_on_config_change() {
        let before = config_with_metrics(
            r#"
http_connections:
  default:
    base_url: "http://127.0.0.1:1"
metrics:
  - name: a
    source: http
"#,
        );
        let mut registry = ClientRegistry::new();
        registry.ensure(&before).await;

        let after = config_with_metrics(
            r#"
http_connections:
  default:
    base_url: "http://127.0.0.1:1"
    headers:
      Authorization: "Bearer token"
metrics:
  - name: a
    source: http
"#,
        );
        registry.ensure(&after).await;

        let handle = registry.handle_for(&after.metrics[0]);
        let Some(BackendHandle::Http(client)) = handle else {
            panic!("expected http handle");
        };
        assert_eq!(client.config().headers.len(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_slot_empty() {
        // Nothing listens on port 1, so the probe fails and the slot stays
        // empty while ensure itself succeeds.
        let config = config_with_metrics(
            r#"
redis_connections:
  default:
    host: "127.0.0.1"
    port: 1
metrics:
  - name: a
    source: redis
    query: DBSIZE
"#,
        );
        let mut registry = ClientRegistry::new();
        registry.ensure(&config).await;
        assert!(registry.handle_for(&config.metrics[0]).is_none());
    }
}
