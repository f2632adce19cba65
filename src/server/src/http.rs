//! HTTP/JSON API.
//!
//! Record endpoints live under `/people`; cluster control endpoints expose
//! replication status, full resync and failure injection. Every response
//! carries permissive CORS headers.

use std::convert::Infallible;
use std::sync::Arc;

use cluster::{HealthError, ReplicationError};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use storage::{RecordId, RecordInput, StoreError};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use crate::error::NodeError;
use crate::metrics::Metrics;
use crate::node::Node;

/// Request bodies above this size are rejected
const MAX_BODY_SIZE: usize = 1024 * 1024;

type HttpResponse = Response<Full<Bytes>>;

#[derive(Debug, Default, Deserialize)]
struct NodeTarget {
    node: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ReplicationRequest {
    #[serde(default)]
    nodes: Vec<String>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    kind: &'a str,
}

#[derive(Serialize)]
struct FailoverBody {
    node: String,
    primary: String,
    alive: bool,
}

#[derive(Debug)]
enum ApiError {
    Node(NodeError),
    BadRequest(String),
    NotFound(String),
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        ApiError::Node(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Node(e) => match e {
                NodeError::Store(StoreError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
                NodeError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
                NodeError::Store(
                    StoreError::NoHistory(_) | StoreError::NoFuture(_) | StoreError::Diverged { .. },
                ) => StatusCode::CONFLICT,
                NodeError::Store(StoreError::Storage(_)) => StatusCode::INTERNAL_SERVER_ERROR,
                NodeError::PrimaryUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                NodeError::NotPrimary { .. } => StatusCode::FORBIDDEN,
                NodeError::Health(HealthError::UnknownNode(_)) => StatusCode::NOT_FOUND,
                NodeError::Health(HealthError::NodeDown(_)) => StatusCode::SERVICE_UNAVAILABLE,
                NodeError::Replication(ReplicationError::NotPrimary { .. }) => StatusCode::FORBIDDEN,
                NodeError::Replication(_) => StatusCode::BAD_GATEWAY,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Node(e) => e.kind(),
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(msg) | ApiError::NotFound(msg) => msg.clone(),
            ApiError::Node(e) => e.to_string(),
        }
    }
}

/// Request handler shared by every connection
pub struct Api {
    node: Node,
    metrics: Arc<Metrics>,
    shutdown: broadcast::Sender<()>,
}

impl Api {
    pub fn new(node: Node, metrics: Arc<Metrics>, shutdown: broadcast::Sender<()>) -> Arc<Self> {
        Arc::new(Api {
            node,
            metrics,
            shutdown,
        })
    }

    pub async fn handle<B>(&self, req: Request<B>) -> HttpResponse
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Metrics::incr(&self.metrics.total_requests);

        if req.method() == Method::OPTIONS {
            return respond(StatusCode::NO_CONTENT, "text/plain", Bytes::new());
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("{} {}", method, path);

        match self.route(req, &method, &path).await {
            Ok(response) => response,
            Err(err) => self.failure(&method, &path, err),
        }
    }

    async fn route<B>(&self, req: Request<B>, method: &Method, path: &str) -> Result<HttpResponse, ApiError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let node = &self.node;
        let metrics = &self.metrics;

        match (method, segments.as_slice()) {
            (&Method::GET, ["people"]) => {
                Metrics::incr(&metrics.total_reads);
                Ok(json(StatusCode::OK, &node.list().await))
            }
            (&Method::POST, ["people"]) => {
                let input: RecordInput = read_json(req.into_body()).await?;
                let record = node.create(&input).await?;
                Metrics::incr(&metrics.total_creates);
                Ok(json(StatusCode::CREATED, &record))
            }
            (&Method::GET, ["people", id]) => {
                Metrics::incr(&metrics.total_reads);
                Ok(json(StatusCode::OK, &node.get(record_id(id)?).await?))
            }
            (&Method::PUT, ["people", id]) => {
                let id = record_id(id)?;
                let input: RecordInput = read_json(req.into_body()).await?;
                let record = node.update(id, &input).await?;
                Metrics::incr(&metrics.total_updates);
                Ok(json(StatusCode::OK, &record))
            }
            (&Method::DELETE, ["people", id]) => {
                node.delete(record_id(id)?).await?;
                Metrics::incr(&metrics.total_deletes);
                Ok(respond(StatusCode::NO_CONTENT, "text/plain", Bytes::new()))
            }
            (&Method::POST, ["people", id, "restore"]) => {
                let record = node.restore(record_id(id)?).await?;
                Metrics::incr(&metrics.total_restores);
                Ok(json(StatusCode::OK, &record))
            }
            (&Method::POST, ["people", id, "undo"]) => {
                let result = node.undo(record_id(id)?).await?;
                Metrics::incr(&metrics.total_undos);
                Ok(json(StatusCode::OK, &result))
            }
            (&Method::POST, ["people", id, "redo"]) => {
                let result = node.redo(record_id(id)?).await?;
                Metrics::incr(&metrics.total_redos);
                Ok(json(StatusCode::OK, &result))
            }
            (&Method::GET, ["people", id, "history"]) => {
                Metrics::incr(&metrics.total_reads);
                Ok(json(StatusCode::OK, &node.history(record_id(id)?).await?))
            }
            (&Method::GET, ["replication-status"]) => Ok(json(StatusCode::OK, &node.replication_status())),
            (&Method::POST, ["run-replication"]) => {
                let request: ReplicationRequest = read_optional_json(req.into_body()).await?;
                let results = node.run_replication(&request.nodes).await?;
                Metrics::incr(&metrics.total_full_syncs);
                Ok(json(StatusCode::OK, &results))
            }
            (&Method::POST, ["failover", "disconnect"]) | (&Method::POST, ["simulate-failure"]) => {
                let target: NodeTarget = read_optional_json(req.into_body()).await?;
                let disconnected = node.disconnect(target.node.as_deref()).await?;
                Ok(json(StatusCode::OK, &self.failover_body(disconnected, false)))
            }
            (&Method::POST, ["failover", "reconnect"]) => {
                let target: NodeTarget = read_optional_json(req.into_body()).await?;
                let reconnected = node.reconnect(target.node.as_deref()).await?;
                Ok(json(StatusCode::OK, &self.failover_body(reconnected, true)))
            }
            (&Method::POST, ["restore-primary"]) => {
                let target: NodeTarget = read_optional_json(req.into_body()).await?;
                let primary = node.restore_primary(target.node.as_deref()).await?;
                Ok(json(StatusCode::OK, &self.failover_body(primary, true)))
            }
            (&Method::GET, ["whoami"]) => Ok(json(StatusCode::OK, &node.whoami().await)),
            (&Method::GET, ["health"]) => {
                let whoami = node.whoami().await;
                Ok(json(
                    StatusCode::OK,
                    &serde_json::json!({
                        "status": "healthy",
                        "node": whoami.node_id,
                        "alive": whoami.alive,
                    }),
                ))
            }
            (&Method::GET, ["metrics"]) => Ok(respond(
                StatusCode::OK,
                "text/plain; version=0.0.4; charset=utf-8",
                Bytes::from(metrics.to_prometheus(node).await),
            )),
            _ => Err(ApiError::NotFound(format!("no route for {} {}", method, path))),
        }
    }

    fn failover_body(&self, node: String, alive: bool) -> FailoverBody {
        FailoverBody {
            node,
            primary: self.node.primary(),
            alive,
        }
    }

    fn failure(&self, method: &Method, path: &str, err: ApiError) -> HttpResponse {
        if let ApiError::Node(e) = &err {
            if matches!(e, NodeError::NotPrimary { .. } | NodeError::PrimaryUnavailable(_)) {
                Metrics::incr(&self.metrics.total_rejected_writes);
            }
            if e.is_fatal() {
                error!("Storage failure on {} {}: {}; shutting down", method, path, e);
                let _ = self.shutdown.send(());
            }
        }

        let status = err.status();
        if status.is_server_error() {
            error!("{} {} -> {}: {}", method, path, status, err.message());
        } else {
            debug!("{} {} -> {}: {}", method, path, status, err.message());
        }
        json(
            status,
            &ErrorBody {
                error: err.message(),
                kind: err.kind(),
            },
        )
    }
}

/// HTTP listener serving the API until shutdown is signalled
pub struct HttpServer {
    api: Arc<Api>,
}

impl HttpServer {
    pub fn new(api: Arc<Api>) -> Self {
        HttpServer { api }
    }

    pub async fn serve(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            info!("HTTP API listening on http://{}", addr);
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept HTTP connection: {}", e);
                            continue;
                        }
                    };

                    let io = TokioIo::new(stream);
                    let api = self.api.clone();

                    tokio::spawn(async move {
                        let service = service_fn(move |req| {
                            let api = api.clone();
                            async move { Ok::<_, Infallible>(api.handle(req).await) }
                        });

                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("HTTP connection error from {}: {}", remote_addr, e);
                        }
                    });
                }
                _ = shutdown.recv() => {
                    info!("HTTP API shutting down");
                    break;
                }
            }
        }
    }
}

fn record_id(segment: &str) -> Result<RecordId, ApiError> {
    segment
        .parse()
        .map_err(|_| ApiError::NotFound(format!("record {} not found", segment)))
}

async fn read_body<B>(body: B) -> Result<Bytes, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    Limited::new(body, MAX_BODY_SIZE)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ApiError::BadRequest(format!("could not read body: {}", e)))
}

async fn read_json<B, T>(body: B) -> Result<T, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: DeserializeOwned,
{
    let bytes = read_body(body).await?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

/// Like `read_json`, but an empty body yields the default value
async fn read_optional_json<B, T>(body: B) -> Result<T, ApiError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    T: DeserializeOwned + Default,
{
    let bytes = read_body(body).await?;
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => respond(status, "application/json", Bytes::from(body)),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "application/json",
                Bytes::from_static(br#"{"error":"serialization failed","kind":"internal"}"#),
            )
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> HttpResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    response
}
