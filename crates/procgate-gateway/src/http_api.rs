//! axum embedding of the engine
//!
//! `/<location>/<procedure>` requests are translated into a CGI-style
//! environment and run through a [`StreamingTransport`]: the request body is
//! pulled from the client as the engine reads it, and the response is sent
//! as soon as the engine commits its head, body pieces following as they are
//! written. `/health`, `/status` and `/metrics` serve the health check,
//! pool occupancy and the Prometheus exposition.

use crate::driver::BackendDriver;
use crate::engine::Engine;
use crate::metrics;
use crate::pool::SlotState;
use crate::transport::{Environment, HeaderMode, Transport};
use async_trait::async_trait;
use axum::{
    body::{Body, BodyDataStream, Bytes},
    extract::{DefaultBodyLimit, Json, Path, Request, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    RequestExt, Router,
};
use futures::StreamExt;
use http_body_util::LengthLimitError;
use procgate_common::{GatewayError, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Response pieces buffered between the engine and the client
const RESPONSE_CHANNEL_CAPACITY: usize = 8;

/// Router for `engine`
///
/// Request bodies are capped at the largest upload limit of any location;
/// the engine enforces each location's own limit while reading.
pub fn router<D: BackendDriver>(engine: Arc<Engine<D>>) -> Router {
    let body_limit = usize::try_from(engine.max_upload_bytes()).unwrap_or(usize::MAX);
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status::<D>))
        .route("/:location", any(gateway::<D>))
        .route("/:location/*rest", any(gateway::<D>))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(engine)
}

/// Serve `engine` on `addr` until Ctrl-C, purging idle sessions on each
/// location's schedule
pub async fn serve<D: BackendDriver>(addr: SocketAddr, engine: Arc<Engine<D>>) -> anyhow::Result<()> {
    let purgers = Arc::clone(&engine).spawn_purgers();
    let app = router(Arc::clone(&engine));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP gateway listening on {}", addr);
    for name in engine.location_names() {
        info!("  /{}/<procedure>", name);
    }
    info!("  /metrics - Prometheus metrics");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down gateway");
        })
        .await?;

    for purger in purgers {
        purger.abort();
    }
    engine.shutdown().await;
    Ok(())
}

async fn gateway<D: BackendDriver>(
    State(engine): State<Arc<Engine<D>>>,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Response {
    let location = params.get("location").cloned().unwrap_or_default();
    let rest = params.get("rest").map(String::as_str).unwrap_or("");
    let (parts, body) = request.with_limited_body().into_parts();
    let environment = request_environment(&parts.method, &parts.uri, &parts.headers, &location, rest);

    let (mut transport, pending) = StreamingTransport::new(environment, body.into_data_stream());
    transport.set_body_limit(engine.max_upload_bytes());
    tokio::spawn(async move {
        if let Err(e) = engine.handle(&location, &mut transport).await {
            error!(location = %location, "Transport failed: {}", e);
            if !transport.is_committed() {
                transport.reset(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        transport.finish();
    });

    pending.into_response().await
}

/// CGI variables for one request
pub fn request_environment(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    location: &str,
    rest: &str,
) -> Environment {
    let mut env = Environment::new();
    env.set("REQUEST_METHOD", method.as_str());
    env.set("SCRIPT_NAME", format!("/{}", location));
    env.set("PATH_INFO", format!("/{}", rest.trim_start_matches('/')));
    env.set("QUERY_STRING", uri.query().unwrap_or(""));
    env.set("REQUEST_URI", uri.to_string());

    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            warn!(header = %name, "Skipping non-ASCII request header");
            continue;
        };
        let key = match name.as_str() {
            "content-type" => "CONTENT_TYPE".to_string(),
            "content-length" => "CONTENT_LENGTH".to_string(),
            other => format!("HTTP_{}", other.to_ascii_uppercase().replace('-', "_")),
        };
        match env.get(&key) {
            // Repeated headers are joined the way a CGI server does
            Some(existing) => {
                let sep = if key == "HTTP_COOKIE" { "; " } else { ", " };
                let joined = format!("{}{}{}", existing, sep, value);
                env.set(key, joined);
            }
            None => env.set(key, value),
        }
    }
    env
}

// ═══════════════════════════════════════════════════════════════════════════
// STREAMING TRANSPORT
// ═══════════════════════════════════════════════════════════════════════════

type Chunk = std::result::Result<Bytes, std::io::Error>;

/// Status and headers, fixed once the engine commits
#[derive(Debug)]
struct Head {
    status: StatusCode,
    headers: Vec<(String, String)>,
}

/// Transport over a live HTTP exchange
///
/// Status and headers are held until the first body write or flush; then
/// the head goes to the waiting handler and every body write is passed to
/// the client through a bounded channel, so a slow client slows the engine
/// instead of growing a buffer.
pub struct StreamingTransport {
    environment: Environment,
    content_length: Option<u64>,
    body: BodyDataStream,
    /// Unread remainder of the last request chunk
    leftover: Option<Bytes>,
    received: u64,
    /// Limit the front end applies to the request body
    body_limit: Option<u64>,
    status: StatusCode,
    headers: Vec<(String, String)>,
    head: Option<oneshot::Sender<Head>>,
    chunks: mpsc::Sender<Chunk>,
}

/// Response side of a [`StreamingTransport`], awaited by the handler
pub struct PendingResponse {
    head: oneshot::Receiver<Head>,
    chunks: mpsc::Receiver<Chunk>,
}

impl StreamingTransport {
    pub fn new(environment: Environment, body: BodyDataStream) -> (Self, PendingResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let content_length = environment.get("CONTENT_LENGTH").and_then(|v| v.trim().parse().ok());
        let transport = Self {
            environment,
            content_length,
            body,
            leftover: None,
            received: 0,
            body_limit: None,
            status: StatusCode::OK,
            headers: Vec::new(),
            head: Some(head_tx),
            chunks: chunk_tx,
        };
        let pending = PendingResponse {
            head: head_rx,
            chunks: chunk_rx,
        };
        (transport, pending)
    }

    pub fn set_body_limit(&mut self, limit: u64) {
        self.body_limit = Some(limit);
    }

    /// Drop whatever head was prepared and answer `status` instead
    pub fn reset(&mut self, status: StatusCode) {
        self.status = status;
        self.headers.clear();
    }

    /// Hand over a head the engine never committed and end the body
    pub fn finish(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if let Some(tx) = self.head.take() {
            let head = Head {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
            };
            if tx.send(head).is_err() {
                debug!("Client went away before the response head");
            }
        }
    }

    fn body_error(&self, e: axum::Error) -> GatewayError {
        let inner = e.into_inner();
        if inner.is::<LengthLimitError>() {
            GatewayError::PayloadTooLarge {
                size: self.content_length.unwrap_or(self.received + 1),
                limit: self.body_limit.unwrap_or(self.received),
            }
        } else {
            GatewayError::Transport(format!("request body read failed: {}", inner))
        }
    }
}

#[async_trait]
impl Transport for StreamingTransport {
    fn environment(&self) -> &Environment {
        &self.environment
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    async fn read_body(&mut self, max_bytes: usize) -> Result<Option<Bytes>> {
        let mut chunk = match self.leftover.take() {
            Some(chunk) => chunk,
            None => loop {
                match self.body.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => break chunk,
                    Some(Err(e)) => return Err(self.body_error(e)),
                    None => return Ok(None),
                }
            },
        };
        if chunk.len() > max_bytes.max(1) {
            self.leftover = Some(chunk.split_off(max_bytes.max(1)));
        }
        self.received += chunk.len() as u64;
        Ok(Some(chunk))
    }

    async fn write_status(&mut self, status: StatusCode, _reason: Option<&str>) -> Result<()> {
        if self.head.is_none() {
            return Err(GatewayError::Internal("status written after headers were sent".into()));
        }
        self.status = status;
        Ok(())
    }

    async fn write_header(&mut self, name: &str, value: &str, mode: HeaderMode) -> Result<()> {
        if self.head.is_none() {
            return Err(GatewayError::Internal(format!(
                "header '{}' written after headers were sent",
                name
            )));
        }
        if mode == HeaderMode::Replace {
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        }
        self.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn write_body(&mut self, bytes: &[u8]) -> Result<()> {
        self.commit();
        if bytes.is_empty() {
            return Ok(());
        }
        self.chunks
            .send(Ok(Bytes::copy_from_slice(bytes)))
            .await
            .map_err(|_| GatewayError::Transport("client disconnected".into()))
    }

    async fn flush(&mut self) -> Result<()> {
        self.commit();
        Ok(())
    }

    fn is_committed(&self) -> bool {
        self.head.is_none()
    }
}

impl PendingResponse {
    /// Wait for the head, then stream the body as it is written
    pub async fn into_response(self) -> Response {
        let Ok(head) = self.head.await else {
            error!("Request ended without a response");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        };
        let mut response = Response::builder().status(head.status);
        for (name, value) in &head.headers {
            response = response.header(name.as_str(), value.as_str());
        }
        match response.body(Body::from_stream(ReceiverStream::new(self.chunks))) {
            Ok(response) => response,
            Err(e) => {
                error!("Procedure produced an invalid response header: {}", e);
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVICE ENDPOINTS
// ═══════════════════════════════════════════════════════════════════════════

/// Pool occupancy of one location
#[derive(Debug, Serialize)]
pub struct LocationStatus {
    pub location: String,
    pub capacity: usize,
    pub in_use: u32,
    pub available: u32,
    pub unused: u32,
    pub offline: u32,
}

/// Pool occupancy of every location
pub async fn status<D: BackendDriver>(State(engine): State<Arc<Engine<D>>>) -> Json<Vec<LocationStatus>> {
    let mut locations: Vec<LocationStatus> = engine
        .location_names()
        .filter_map(|name| engine.location(name))
        .map(|ctx| {
            let stats = ctx.pool.snapshot();
            LocationStatus {
                location: ctx.name().to_string(),
                capacity: stats.capacity,
                in_use: stats.counts.held(),
                available: stats.counts.get(SlotState::Available),
                unused: stats.counts.get(SlotState::Unused),
                offline: stats.counts.get(SlotState::Offline),
            }
        })
        .collect();
    locations.sort_by(|a, b| a.location.cmp(&b.location));
    Json(locations)
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "OK"
}

/// Prometheus metrics endpoint
pub async fn prometheus_metrics() -> impl IntoResponse {
    let body = metrics::encode_metrics();
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn streaming(body: Body) -> (StreamingTransport, PendingResponse) {
        StreamingTransport::new(Environment::new(), body.into_data_stream())
    }

    #[test]
    fn test_request_environment() {
        let uri: Uri = "/shop/cart.show?id=7".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.append("cookie", HeaderValue::from_static("a=1"));
        headers.append("cookie", HeaderValue::from_static("b=2"));

        let env = request_environment(&Method::POST, &uri, &headers, "shop", "cart.show");
        assert_eq!(env.method(), "POST");
        assert_eq!(env.path_info(), "/cart.show");
        assert_eq!(env.get("SCRIPT_NAME"), Some("/shop"));
        assert_eq!(env.query_string(), "id=7");
        assert_eq!(env.content_type(), Some("text/plain"));
        assert_eq!(env.get("HTTP_X_FORWARDED_FOR"), Some("10.0.0.1"));
        assert_eq!(env.cookie("b"), Some("2"));
    }

    #[test]
    fn test_empty_rest_is_root_path() {
        let uri: Uri = "/shop".parse().unwrap();
        let env = request_environment(&Method::GET, &uri, &HeaderMap::new(), "shop", "");
        assert_eq!(env.path_info(), "/");
        assert_eq!(env.query_string(), "");
    }

    #[tokio::test]
    async fn test_head_is_sent_on_first_body_write() {
        let (mut transport, mut pending) = streaming(Body::empty());
        transport.write_status(StatusCode::CREATED, None).await.unwrap();
        transport
            .write_header("Content-Type", "text/plain", HeaderMode::Replace)
            .await
            .unwrap();
        assert!(pending.head.try_recv().is_err());

        transport.write_body(b"first").await.unwrap();
        let head = pending.head.try_recv().unwrap();
        assert_eq!(head.status, StatusCode::CREATED);
        assert_eq!(head.headers, vec![("Content-Type".to_string(), "text/plain".to_string())]);
        assert!(transport.is_committed());
        assert!(transport.write_header("X-Late", "1", HeaderMode::Append).await.is_err());

        // Each write reaches the client before the exchange is over
        assert_eq!(pending.chunks.recv().await.unwrap().unwrap(), Bytes::from("first"));
        transport.write_body(b"second").await.unwrap();
        assert_eq!(pending.chunks.recv().await.unwrap().unwrap(), Bytes::from("second"));

        transport.finish();
        assert!(pending.chunks.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_finish_sends_uncommitted_head() {
        let (mut transport, pending) = streaming(Body::empty());
        transport
            .write_header("Content-Type", "text/html", HeaderMode::Replace)
            .await
            .unwrap();
        transport.reset(StatusCode::INTERNAL_SERVER_ERROR);
        transport.finish();

        let response = pending.into_response().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get("content-type").is_none());
    }

    #[tokio::test]
    async fn test_write_fails_once_client_is_gone() {
        let (mut transport, pending) = streaming(Body::empty());
        drop(pending);
        let err = transport.write_body(b"abc").await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_read_body_respects_max_bytes() {
        let (mut transport, _pending) = streaming(Body::from("abcdefgh"));
        assert_eq!(transport.read_body(3).await.unwrap().unwrap(), Bytes::from("abc"));
        assert_eq!(transport.read_body(10).await.unwrap().unwrap(), Bytes::from("defgh"));
        assert!(transport.read_body(10).await.unwrap().is_none());
    }
}
