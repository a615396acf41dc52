//! Control-plane API.
//!
//! Every mutation follows the same path: take the mutation lock, clone the
//! current configuration, edit it, validate, persist to disk, then apply
//! through `CollectorService::reload`. There is no way to mutate the
//! running state that bypasses the reconciler.

use crate::config::{
    Config, HttpConfig, IotdbConfig, MetricSpec, MysqlConfig, RedisConfig, save_config,
    validate_config,
};
use crate::server::listener::AppState;
use crate::util::RequestId;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

/// Wire shape of every control-plane reply.
#[derive(Debug, Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    removed: Option<Vec<String>>,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            error: None,
            message: message.into(),
            metrics: None,
            removed: None,
        }
    }

    fn err(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            message: message.into(),
            metrics: None,
            removed: None,
        }
    }
}

/// Dispatch a `/api/...` request.
pub async fn handle(
    req: Request<hyper::body::Incoming>,
    state: &AppState,
    request_id: &RequestId,
) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().trim_start_matches("/api/").to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let (status, response) = match (method.as_str(), segments.as_slice()) {
        ("GET", ["config"]) => return config_json(state),

        ("PUT", ["config"]) => match read_body::<Config>(req).await {
            Ok(config) => apply(state, config, request_id).await,
            Err(resp) => resp,
        },

        ("POST", ["metrics"]) => match read_body::<MetricSpec>(req).await {
            Ok(spec) => add_metric(state, spec, request_id).await,
            Err(resp) => resp,
        },

        ("PUT", ["metrics", name]) => {
            let name = name.to_string();
            match read_body::<MetricSpec>(req).await {
                Ok(spec) => update_metric(state, &name, spec, request_id).await,
                Err(resp) => resp,
            }
        }

        ("DELETE", ["metrics", name]) => {
            let name = name.to_string();
            delete_metric(state, &name, request_id).await
        }

        ("PUT", ["connections", kind, name]) => {
            let (kind, name) = (kind.to_string(), name.to_string());
            put_connection(state, &kind, &name, req, request_id).await
        }

        ("DELETE", ["connections", kind, name]) => {
            let (kind, name) = (kind.to_string(), name.to_string());
            delete_connection(state, &kind, &name, request_id).await
        }

        _ => (
            StatusCode::NOT_FOUND,
            ApiResponse::err("unknown endpoint", format!("no handler for /api/{}", path)),
        ),
    };

    json_response(status, &response)
}

/// GET /api/config — the currently applied configuration.
fn config_json(state: &AppState) -> Response<Full<Bytes>> {
    let config = state.service.current_config();
    match serde_json::to_vec_pretty(&*config) {
        Ok(body) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .unwrap(),
        Err(e) => {
            error!(error = %e, "failed to serialize configuration");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ApiResponse::err("failed to serialize configuration", e.to_string()),
            )
        }
    }
}

async fn add_metric(
    state: &AppState,
    spec: MetricSpec,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    let _guard = state.mutation_lock.lock().await;
    let mut config = (*state.service.current_config()).clone();

    if config.metrics.iter().any(|m| m.name == spec.name) {
        return (
            StatusCode::CONFLICT,
            ApiResponse::err(
                "metric already exists",
                format!("metric '{}' is already defined, use PUT to update it", spec.name),
            ),
        );
    }

    config.metrics.push(spec);
    apply_locked(state, config, request_id).await
}

async fn update_metric(
    state: &AppState,
    name: &str,
    spec: MetricSpec,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    if spec.name != name {
        return (
            StatusCode::BAD_REQUEST,
            ApiResponse::err(
                "name mismatch",
                format!("body names metric '{}' but the path names '{}'", spec.name, name),
            ),
        );
    }

    let _guard = state.mutation_lock.lock().await;
    let mut config = (*state.service.current_config()).clone();

    match config.metrics.iter().position(|m| m.name == name) {
        Some(index) => config.metrics[index] = spec,
        None => {
            return (
                StatusCode::NOT_FOUND,
                ApiResponse::err("unknown metric", format!("no metric named '{}'", name)),
            );
        }
    }

    apply_locked(state, config, request_id).await
}

async fn delete_metric(
    state: &AppState,
    name: &str,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    let _guard = state.mutation_lock.lock().await;
    let mut config = (*state.service.current_config()).clone();

    let before = config.metrics.len();
    config.metrics.retain(|m| m.name != name);
    if config.metrics.len() == before {
        return (
            StatusCode::NOT_FOUND,
            ApiResponse::err("unknown metric", format!("no metric named '{}'", name)),
        );
    }

    apply_locked(state, config, request_id).await
}

async fn put_connection(
    state: &AppState,
    kind: &str,
    name: &str,
    req: Request<hyper::body::Incoming>,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    // Parse the body before taking the lock; a malformed body should not
    // serialize behind a slow apply.
    let config_edit: Box<dyn FnOnce(&mut Config) + Send> = match kind {
        "mysql" => match read_body::<MysqlConfig>(req).await {
            Ok(c) => {
                let name = name.to_string();
                Box::new(move |cfg| {
                    cfg.mysql_connections.insert(name, c);
                })
            }
            Err(resp) => return resp,
        },
        "redis" => match read_body::<RedisConfig>(req).await {
            Ok(c) => {
                let name = name.to_string();
                Box::new(move |cfg| {
                    cfg.redis_connections.insert(name, c);
                })
            }
            Err(resp) => return resp,
        },
        "http" => match read_body::<HttpConfig>(req).await {
            Ok(c) => {
                let name = name.to_string();
                Box::new(move |cfg| {
                    cfg.http_connections.insert(name, c);
                })
            }
            Err(resp) => return resp,
        },
        "iotdb" => match read_body::<IotdbConfig>(req).await {
            Ok(c) => Box::new(move |cfg| cfg.iotdb = Some(c)),
            Err(resp) => return resp,
        },
        other => {
            return (
                StatusCode::NOT_FOUND,
                ApiResponse::err(
                    "unknown backend kind",
                    format!("'{}' is not one of mysql, redis, http, iotdb", other),
                ),
            );
        }
    };

    let _guard = state.mutation_lock.lock().await;
    let mut config = (*state.service.current_config()).clone();
    config_edit(&mut config);
    apply_locked(state, config, request_id).await
}

async fn delete_connection(
    state: &AppState,
    kind: &str,
    name: &str,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    let _guard = state.mutation_lock.lock().await;
    let mut config = (*state.service.current_config()).clone();

    let existed = match kind {
        "mysql" => config.mysql_connections.remove(name).is_some(),
        "redis" => config.redis_connections.remove(name).is_some(),
        "http" => config.http_connections.remove(name).is_some(),
        "iotdb" => config.iotdb.take().is_some(),
        other => {
            return (
                StatusCode::NOT_FOUND,
                ApiResponse::err(
                    "unknown backend kind",
                    format!("'{}' is not one of mysql, redis, http, iotdb", other),
                ),
            );
        }
    };

    if !existed {
        return (
            StatusCode::NOT_FOUND,
            ApiResponse::err(
                "unknown connection",
                format!("no {} connection named '{}'", kind, name),
            ),
        );
    }

    // Validation rejects the delete if any metric still references the
    // connection, so a dangling reference can never be persisted.
    apply_locked(state, config, request_id).await
}

/// PUT /api/config — full replacement.
async fn apply(
    state: &AppState,
    mut config: Config,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    config.normalize();
    let _guard = state.mutation_lock.lock().await;
    apply_locked(state, config, request_id).await
}

/// Validate, persist, and reload. Caller holds the mutation lock.
async fn apply_locked(
    state: &AppState,
    config: Config,
    request_id: &RequestId,
) -> (StatusCode, ApiResponse) {
    if let Err(e) = validate_config(&config) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            ApiResponse::err("configuration invalid", e),
        );
    }

    if let Err(e) = save_config(&state.config_path, &config) {
        error!(request = %request_id, error = %e, "failed to persist configuration");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            ApiResponse::err("failed to persist configuration", e.to_string()),
        );
    }

    match state.service.reload(config).await {
        Ok(summary) => {
            info!(request = %request_id, message = %summary.message, "configuration applied");
            let mut response = ApiResponse::ok(summary.message);
            response.metrics = Some(summary.added);
            response.removed = Some(summary.removed);
            (StatusCode::OK, response)
        }
        Err(e) => {
            // The file now holds a config the process refused; flag it so
            // operators know disk and memory diverge until the next apply.
            warn!(request = %request_id, error = %e,
                  "saved configuration failed to apply, previous state still active");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::err("reload failed, previous configuration still active", e.to_string()),
            )
        }
    }
}

/// Read and parse a JSON request body.
async fn read_body<T: DeserializeOwned>(
    req: Request<hyper::body::Incoming>,
) -> Result<T, (StatusCode, ApiResponse)> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err((
                StatusCode::BAD_REQUEST,
                ApiResponse::err("failed to read request body", e.to_string()),
            ));
        }
    };

    serde_json::from_slice(&bytes).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            ApiResponse::err("invalid request body", e.to_string()),
        )
    })
}

fn json_response(status: StatusCode, response: &ApiResponse) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(response).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
