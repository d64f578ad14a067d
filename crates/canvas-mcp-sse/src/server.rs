use std::{any::Any, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{NestedPath, Query, Request, State},
    http::{
        HeaderName, Method, StatusCode, Uri,
        header::{self, ACCEPT, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware::{self, Next},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, KeepAliveStream, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Instrument, Level};

use crate::{
    canvas::HealthProbe,
    model::ClientJsonRpcMessage,
    service::{Credentials, ServerFactory},
    session::{OpenedSession, SessionRegistry},
};

pub const DEFAULT_AUTO_PING_INTERVAL: Duration = Duration::from_secs(15);
pub const SERVER_DISPLAY_NAME: &str = "Canvas MCP Server";
pub const DOCUMENTATION_URL: &str = "https://github.com/DMontgomery40/mcp-canvas-lms";

const HEALTH_PATH: &str = "/health";
const ROOT_PATH: &str = "/";
const HEADER_X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    pub sse_keep_alive: Option<Duration>,
    /// Shared secret required as `Authorization: Bearer <key>` on the SSE and
    /// message endpoints. `None` leaves them open.
    pub api_key: Option<String>,
    pub credentials: Credentials,
}

impl SseServerConfig {
    pub fn new(bind: SocketAddr, credentials: Credentials) -> Self {
        Self {
            bind,
            sse_path: "/sse".to_string(),
            post_path: "/messages".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: None,
            api_key: None,
            credentials,
        }
    }
}

#[derive(Clone)]
struct App {
    registry: Arc<SessionRegistry>,
    probe: Arc<dyn HealthProbe>,
    credentials: Credentials,
    api_key: Option<Arc<str>>,
    sse_path: Arc<str>,
    post_path: Arc<str>,
    sse_ping_interval: Duration,
    ct: CancellationToken,
}

impl App {
    fn available_endpoints(&self) -> [&str; 4] {
        [ROOT_PATH, HEALTH_PATH, &*self.sse_path, &*self.post_path]
    }
}

fn json_error(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

async fn require_api_key(State(app): State<App>, request: Request, next: Next) -> Response {
    if let Some(expected) = app.api_key.as_deref() {
        let provided = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if provided != Some(expected) {
            tracing::warn!(path = %request.uri().path(), "authentication failed");
            return json_error(StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }));
        }
    }
    next.run(request).await
}

async fn health_handler(State(app): State<App>) -> Response {
    match app.probe.health_check().await {
        Ok(canvas) => Json(json!({
            "status": "ok",
            "canvas": canvas,
            "timestamp": timestamp(),
            "connections": app.registry.len(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "health check failed");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({
                    "status": "error",
                    "timestamp": timestamp(),
                    "error": e.to_string(),
                }),
            )
        }
    }
}

async fn root_handler(State(app): State<App>) -> Json<Value> {
    Json(json!({
        "name": SERVER_DISPLAY_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "transport": "SSE",
        "endpoints": {
            "health": HEALTH_PATH,
            "sse": &*app.sse_path,
            "messages": &*app.post_path,
        },
        "documentation": DOCUMENTATION_URL,
    }))
}

async fn sse_handler(
    State(app): State<App>,
    nested_path: Option<Extension<NestedPath>>,
) -> Result<impl IntoResponse, Response> {
    tracing::info!("new sse connection request");
    let setup_failed = |details: String| {
        json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({
                "error": "Failed to establish SSE connection",
                "details": details,
            }),
        )
    };
    if app.ct.is_cancelled() {
        return Err(setup_failed("server is shutting down".to_string()));
    }
    let OpenedSession { id, outbound } = app
        .registry
        .create_session(app.credentials.clone())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "error establishing sse connection");
            setup_failed(e.to_string())
        })?;

    let nested_path = nested_path.as_deref().map(NestedPath::as_str).unwrap_or("");
    let endpoint = format!("{nested_path}{}?sessionId={id}", app.post_path);
    let stream = futures::stream::once(futures::future::ok(
        Event::default().event("endpoint").data(endpoint),
    ))
    .chain(outbound.map(|message| match serde_json::to_string(&message) {
        Ok(data) => Ok(Event::default().event("message").data(data)),
        Err(e) => Err(io::Error::new(io::ErrorKind::InvalidData, e)),
    }));

    Ok((
        [
            (header::CONNECTION, "keep-alive"),
            (HEADER_X_ACCEL_BUFFERING, "no"),
        ],
        event_stream(stream, app.sse_ping_interval),
    ))
}

fn event_stream<S>(stream: S, ping_interval: Duration) -> Sse<KeepAliveStream<S>>
where
    S: Stream<Item = Result<Event, io::Error>> + Send + 'static,
{
    Sse::new(stream).keep_alive(KeepAlive::new().interval(ping_interval))
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEventQuery {
    pub session_id: Option<String>,
}

/// Acknowledges receipt. Whether the message reached a session is only
/// logged; protocol-level failures travel back over the SSE stream.
async fn post_event_handler(
    State(app): State<App>,
    Query(PostEventQuery { session_id }): Query<PostEventQuery>,
    body: Bytes,
) -> Response {
    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::error!(?session_id, error = %e, "error handling message");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "error": "Failed to process message",
                    "details": e.to_string(),
                }),
            );
        }
    };
    tracing::debug!(?session_id, %payload, "received message");
    match serde_json::from_value::<ClientJsonRpcMessage>(payload) {
        Ok(message) => {
            let outcome = app.registry.route_inbound(session_id.as_deref(), message);
            tracing::debug!(?session_id, ?outcome, "message routed");
        }
        Err(e) => {
            tracing::warn!(?session_id, error = %e, "discarding payload that is not a JSON-RPC message");
        }
    }
    Json(json!({ "success": true })).into_response()
}

async fn not_found_handler(State(app): State<App>, uri: Uri) -> Response {
    json_error(
        StatusCode::NOT_FOUND,
        json!({
            "error": "Not Found",
            "path": uri.path(),
            "availableEndpoints": app.available_endpoints(),
        }),
    )
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown error".to_string()
    };
    tracing::error!(%message, "request handler panicked");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({
            "error": "Internal Server Error",
            "message": message,
        }),
    )
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION, CACHE_CONTROL, ACCEPT])
        .allow_credentials(true)
}

pub struct SseServer {
    registry: Arc<SessionRegistry>,
    task: Option<JoinHandle<()>>,
    pub config: SseServerConfig,
}

impl std::fmt::Debug for SseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseServer")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SseServer {
    pub async fn serve_with_config(
        mut config: SseServerConfig,
        factory: impl ServerFactory,
        probe: Arc<dyn HealthProbe>,
    ) -> io::Result<Self> {
        let listener = tokio::net::TcpListener::bind(config.bind).await?;
        // Update config with actual bound address (important when port is 0)
        config.bind = listener.local_addr()?;
        let (mut sse_server, router) = Self::new(config, factory, probe);
        let ct = sse_server.config.ct.child_token();
        let bind = sse_server.config.bind;
        let registry = sse_server.registry.clone();
        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            ct.cancelled().await;
            tracing::info!("sse server cancelled");
            // open event streams only end once their sessions are closed
            registry.close_all().await;
        });
        sse_server.task = Some(tokio::spawn(
            async move {
                if let Err(e) = server.await {
                    tracing::error!(error = %e, "sse server shutdown with error");
                }
            }
            .instrument(tracing::info_span!("sse-server", bind_address = %bind)),
        ));
        Ok(sse_server)
    }

    pub fn new(
        config: SseServerConfig,
        factory: impl ServerFactory,
        probe: Arc<dyn HealthProbe>,
    ) -> (SseServer, Router) {
        let registry = Arc::new(SessionRegistry::new(factory));
        let app = App {
            registry: registry.clone(),
            probe,
            credentials: config.credentials.clone(),
            api_key: config.api_key.as_deref().map(Arc::from),
            sse_path: config.sse_path.as_str().into(),
            post_path: config.post_path.as_str().into(),
            sse_ping_interval: config.sse_keep_alive.unwrap_or(DEFAULT_AUTO_PING_INTERVAL),
            ct: config.ct.clone(),
        };

        let protected = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_event_handler))
            .route_layer(middleware::from_fn_with_state(app.clone(), require_api_key));
        let router = Router::new()
            .route(HEALTH_PATH, get(health_handler))
            .route(ROOT_PATH, get(root_handler))
            .merge(protected)
            .fallback(not_found_handler)
            .with_state(app)
            .layer(CatchPanicLayer::custom(panic_response))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_request(DefaultOnRequest::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
            )
            .layer(cors_layer());

        let server = SseServer {
            registry,
            task: None,
            config,
        };
        (server, router)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }

    /// Wait for the serving task started by [`SseServer::serve_with_config`]
    /// to finish. Returns immediately for a server built with [`SseServer::new`].
    pub async fn waiting(mut self) -> Result<(), tokio::task::JoinError> {
        match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        }
    }
}
