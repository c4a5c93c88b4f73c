/// MCP HTTP Server
///
/// Actix Web transport for the MCP engine:
/// - `POST /mcp` (and `POST /`): synchronous JSON-RPC, mints a session on
///   `initialize`, validates and refreshes it on later calls
/// - `GET /mcp` (and `GET /sse`): opens a server-sent event stream bound to a
///   fresh session
/// - `DELETE /mcp`: terminates a session
/// - `GET /health`, `GET /metrics`: liveness and counters
///
/// Handlers only transcode HTTP into dispatcher/session-manager calls;
/// requests rejected here (origin, session, Accept) never reach the
/// dispatcher and are answered with a plain HTTP status.

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer, Result,
    http::header,
    middleware::{Compress, DefaultHeaders, Logger},
    web,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::core::config::ServerConfig;
use crate::core::dispatcher::{Dispatcher, PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
use crate::core::envelope::{ParseError, Request, Response};
use crate::core::error::TransportError;
use crate::core::origin::OriginPolicy;
use crate::core::registry::OperationRegistry;
use crate::core::session::{EventSink, SessionManager, SinkOptions};
use crate::{prompts, resources, tools};

/// Header carrying the session id in both directions.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";
/// Header carrying the negotiated protocol version.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Application state shared across all worker threads in HTTP mode.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: SessionManager,
    pub origin_policy: Arc<OriginPolicy>,
    pub sse: SinkOptions,
    /// Total MCP requests accepted, for the metrics endpoint
    pub request_count: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        sessions: SessionManager,
        origin_policy: OriginPolicy,
        sse: SinkOptions,
    ) -> Self {
        Self {
            dispatcher,
            sessions,
            origin_policy: Arc::new(origin_policy),
            sse,
            request_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Tell every open stream the server is going away, then close all
    /// sessions and sinks.
    pub async fn shutdown(&self) -> usize {
        let notified = self
            .sessions
            .broadcast_event("shutdown", json!({ "reason": "server shutting down" }))
            .await;
        let closed = self.sessions.close_all();
        info!(notified, closed, "sessions closed for shutdown");
        closed
    }
}

fn header_str<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

fn check_origin(state: &AppState, req: &HttpRequest) -> Result<(), TransportError> {
    let origin = header_str(req, "origin");
    if state.origin_policy.is_allowed(origin) {
        return Ok(());
    }
    let origin = origin.unwrap_or("<none>").to_string();
    warn!(origin = %origin, path = %req.path(), "rejecting request from origin");
    Err(TransportError::OriginRejected(origin))
}

/// Protocol version for the response header. A client-sent version must be
/// one we speak.
fn negotiate_protocol_version(req: &HttpRequest) -> Result<&'static str, TransportError> {
    match header_str(req, PROTOCOL_VERSION_HEADER) {
        None => Ok(PROTOCOL_VERSION),
        Some(requested) => SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|v| **v == requested)
            .copied()
            .ok_or_else(|| TransportError::UnsupportedProtocolVersion(requested.to_string())),
    }
}

/// Version an `initialize` result settled on, if it is one we speak.
fn negotiated_version(response: &Response) -> Option<&'static str> {
    let chosen = response.result.as_ref()?.get("protocolVersion")?.as_str()?;
    SUPPORTED_PROTOCOL_VERSIONS
        .iter()
        .find(|v| **v == chosen)
        .copied()
}

/// Health check endpoint handler.
///
/// Used by load balancers and monitoring systems to verify server availability.
async fn health(state: web::Data<AppState>) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ok",
        "service": state.dispatcher.info().name
    })))
}

/// Metrics endpoint handler: requests processed since start and live sessions.
async fn metrics_handler(state: web::Data<AppState>) -> Result<HttpResponse> {
    let count = state.request_count.load(Ordering::Relaxed);
    Ok(HttpResponse::Ok().json(json!({
        "requests_total": count,
        "sessions_active": state.sessions.session_count(),
        "status": "ok"
    })))
}

/// MCP JSON-RPC over HTTP POST.
///
/// Order matters: origin first (before any parsing or session access), then
/// protocol version, envelope decoding, session resolution and dispatch.
async fn mcp_post(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, TransportError> {
    check_origin(&state, &req)?;
    let protocol_version = negotiate_protocol_version(&req)?;
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let decoded = std::str::from_utf8(&body)
        .map_err(|e| ParseError {
            id: None,
            message: e.to_string(),
        })
        .and_then(Request::decode);
    let request = match decoded {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "HTTP: undecodable request body");
            return Ok(HttpResponse::BadRequest()
                .insert_header((PROTOCOL_VERSION_HEADER, protocol_version))
                .json(e.into_response()));
        }
    };

    let minted_session = match header_str(&req, SESSION_ID_HEADER) {
        Some(session_id) => {
            if !state.sessions.touch(session_id) {
                return Err(TransportError::SessionNotFound(session_id.to_string()));
            }
            None
        }
        // An initialize sent as a notification could never learn its id.
        None if request.method == "initialize" && !request.is_notification() => {
            Some(state.sessions.create_session())
        }
        None => None,
    };

    debug!(method = %request.method, "HTTP POST");
    let notification = request.is_notification();
    let initialize = request.method == "initialize";
    let response = state.dispatcher.handle(request).await;
    let protocol_version = if initialize {
        negotiated_version(&response).unwrap_or(protocol_version)
    } else {
        protocol_version
    };

    if notification {
        return Ok(HttpResponse::Accepted()
            .insert_header((PROTOCOL_VERSION_HEADER, protocol_version))
            .finish());
    }

    let mut builder = HttpResponse::Ok();
    builder.insert_header((PROTOCOL_VERSION_HEADER, protocol_version));
    if let Some(session_id) = minted_session {
        builder.insert_header((SESSION_ID_HEADER, session_id));
    }
    Ok(builder.json(response))
}

/// Server-Sent Events stream bound to a new session.
///
/// Emits a `connected` event carrying the session id right away, then relays
/// every event pushed to the session until the client disconnects or the
/// session is closed server-side.
async fn mcp_sse(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, TransportError> {
    let wants_stream =
        header_str(&req, "accept").is_some_and(|accept| accept.contains("text/event-stream"));
    if !wants_stream {
        return Err(TransportError::NotAcceptable);
    }
    check_origin(&state, &req)?;
    let protocol_version = negotiate_protocol_version(&req)?;

    let session_id = state.sessions.create_session();
    let (sink, stream) = EventSink::channel(state.sse);
    state.sessions.attach_stream(&session_id, Arc::clone(&sink));
    sink.send_event("connected", json!({ "sessionId": session_id }), None)
        .await;
    info!(session_id = %session_id, "SSE stream opened");

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        // Disable caching so clients always get live data
        .insert_header(header::CacheControl(vec![
            header::CacheDirective::NoCache,
            header::CacheDirective::NoStore,
            header::CacheDirective::MustRevalidate,
        ]))
        // Disable nginx buffering and keep the compressor off the stream
        .insert_header(("x-accel-buffering", "no"))
        .insert_header((header::CONTENT_ENCODING, "identity"))
        .insert_header((SESSION_ID_HEADER, session_id))
        .insert_header((PROTOCOL_VERSION_HEADER, protocol_version))
        .streaming(stream.into_body()))
}

/// Explicit session termination.
async fn mcp_delete(
    state: web::Data<AppState>,
    req: HttpRequest,
) -> Result<HttpResponse, TransportError> {
    check_origin(&state, &req)?;
    let session_id = header_str(&req, SESSION_ID_HEADER).ok_or(TransportError::MissingSessionId)?;
    if state.sessions.remove(session_id) {
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(TransportError::SessionNotFound(session_id.to_string()))
    }
}

/// Register every route on an app or test service.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/sse", web::get().to(mcp_sse))
        .service(
            web::resource("/mcp")
                .route(web::post().to(mcp_post))
                .route(web::get().to(mcp_sse))
                .route(web::delete().to(mcp_delete)),
        )
        .route("/", web::post().to(mcp_post))
        .route("/", web::get().to(health));
}

/// Build the operation registry and register all default operations.
///
/// Add new registrations in the `tools`, `resources` and `prompts` modules.
pub fn initialize_operations(resource_scheme: &str) -> Arc<OperationRegistry> {
    let registry = OperationRegistry::with_scheme(resource_scheme);
    tools::register(&registry);
    resources::register(&registry);
    prompts::register(&registry);
    Arc::new(registry)
}

/// Run the MCP server in HTTP mode.
///
/// The server is configured with:
/// - Worker threads: from config (CPU count capped at 16 by default)
/// - Max connections: 10,000 concurrent connections
/// - Connection rate limit: 1,000 connections per second
/// - Keep-alive: 30 seconds
/// - Request timeout: 30 seconds
/// - Shutdown timeout: 10 seconds
///
/// Bind failures and server I/O errors are returned to the caller.
pub async fn run_server_http(state: AppState, config: &ServerConfig) -> std::io::Result<()> {
    let bind_addr = config.bind_addr();
    let max_body = config.max_body_bytes;

    info!(
        name = %config.name,
        version = %config.version,
        bind = %bind_addr,
        workers = config.workers,
        "MCP server starting (HTTP mode)"
    );

    let app_state = web::Data::new(state);

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .app_data(web::PayloadConfig::new(max_body))
            // Enable compression for JSON responses (gzip/brotli)
            .wrap(Compress::default())
            // Add security headers to all responses
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY")),
            )
            // Format: %r = request line, %s = status, %Dms = duration in milliseconds
            .wrap(Logger::new("%r %s %Dms"))
            .configure(configure_routes)
    })
    .workers(config.workers)
    // Connection limits for high-traffic scenarios
    .max_connections(10000)
    .max_connection_rate(1000)
    .keep_alive(Duration::from_secs(30))
    .client_request_timeout(Duration::from_secs(30))
    .client_disconnect_timeout(Duration::from_secs(2))
    .shutdown_timeout(10)
    .bind(&bind_addr)?
    .run()
    .await
}
