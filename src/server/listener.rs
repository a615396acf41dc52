//! HTTP listener serving the scrape endpoint and the control-plane API.

use crate::collector::CollectorService;
use crate::server::{api, scrape};
use crate::util::RequestId;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info};

/// Shared state behind every request handler.
pub struct AppState {
    pub service: Arc<CollectorService>,
    pub config_path: PathBuf,
    /// Serializes control-plane read-modify-write cycles so two concurrent
    /// mutations cannot silently drop each other's edit.
    pub mutation_lock: Mutex<()>,
}

/// The exporter's single HTTP server.
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Bind the listener. A bind failure is fatal to startup, so it is
    /// surfaced here rather than inside `run`.
    pub async fn bind(
        address: SocketAddr,
        service: Arc<CollectorService>,
        config_path: PathBuf,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(address = %address, "http server listening");
        Ok(Self {
            listener,
            state: Arc::new(AppState {
                service,
                config_path,
                mutation_lock: Mutex::new(()),
            }),
        })
    }

    /// The bound local address, useful when binding port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept and serve connections until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(req, &state).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(peer = %peer, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("http server shutting down");
                    break;
                }
            }
        }
    }
}

/// Route one request.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: &AppState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    if path.starts_with("/api/") {
        let request_id = RequestId::new();
        debug!(request = %request_id, method = %method, path = %path, "control request");
        return Ok(api::handle(req, state, &request_id).await);
    }

    debug!(method = %method, path = %path, "http request");

    match (method.as_str(), path.as_str()) {
        ("GET", "/metrics") => match scrape::render(state.service.registry()) {
            Ok((content_type, body)) => Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", content_type)
                .body(Full::new(Bytes::from(body)))
                .unwrap()),
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from("Failed to encode metrics\n")))
                    .unwrap())
            }
        },

        ("GET", "/health" | "/healthz") => Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("OK\n")))
            .unwrap()),

        ("GET", "/") => {
            let body = "query2metrics\n\nEndpoints:\n  \
                        /metrics - Prometheus metrics\n  \
                        /healthz - Health check\n  \
                        /api/config - Configuration API\n";
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(Full::new(Bytes::from(body)))
                .unwrap())
        }

        ("GET", _) => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not found\n")))
            .unwrap()),

        _ => Ok(Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(Full::new(Bytes::from("Method not allowed\n")))
            .unwrap()),
    }
}
