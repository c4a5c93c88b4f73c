/// MCP Server Entry Point
///
/// Loads configuration from environment variables, registers the built-in
/// operations and starts the selected transports (STDIO, HTTP or both).
///
/// Environment Variables:
/// - SERVER_NAME: Name of the server (default: "mcp-engine")
/// - SERVER_VERSION: Version string (default: crate version)
/// - MCP_TRANSPORT_MODE: "stdio", "http", or "both" (default: "both")
/// - HOST: Bind address for HTTP mode (default: "0.0.0.0")
/// - PORT: Port number for HTTP mode (default: 3000)
/// - WORKER_THREADS: HTTP worker count (default: CPU count, max 16)
/// - MCP_SESSION_TIMEOUT_SECS / MCP_SWEEP_INTERVAL_SECS: session expiry (1800 / 60)
/// - MCP_VALIDATE_ORIGINS / MCP_ALLOW_LOCALHOST / MCP_ALLOWED_ORIGINS: origin policy
/// - MCP_SSE_BUFFER / MCP_SSE_SEND_TIMEOUT_SECS / MCP_SSE_KEEPALIVE_SECS: SSE streams
/// - MCP_LOG_FORMAT: "text" or "json"; RUST_LOG controls the level (default: info)
///
/// Logs always go to stderr: stdout belongs to the STDIO transport.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use mcp_engine::core::config::{ServerConfig, TransportMode};
use mcp_engine::core::dispatcher::{Dispatcher, ServerInfo};
use mcp_engine::core::server::{self, AppState};
use mcp_engine::core::session::SessionManager;
use mcp_engine::core::stdio;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = ServerConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    init_tracing(config.json_logs);

    let registry = server::initialize_operations(&config.resource_scheme);
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        ServerInfo {
            name: config.name.clone(),
            version: config.version.clone(),
        },
    ));
    info!(
        tools = dispatcher.registry().tools().len(),
        resources = dispatcher.registry().resources().len(),
        prompts = dispatcher.registry().prompts().len(),
        transport = ?config.transport,
        "operations registered"
    );

    let result = match config.transport {
        // Used for MCP Inspector and local development
        TransportMode::Stdio => stdio::run_server_stdio(dispatcher, config.max_body_bytes).await,
        TransportMode::Http => run_http(dispatcher, &config).await,
        TransportMode::Both => {
            // STDIO in the background, HTTP in the foreground
            let stdio_dispatcher = Arc::clone(&dispatcher);
            let max_line_bytes = config.max_body_bytes;
            let stdio_handle = tokio::spawn(async move {
                if let Err(e) = stdio::run_server_stdio(stdio_dispatcher, max_line_bytes).await {
                    error!(error = %e, "STDIO server error");
                }
            });

            let http_result = run_http(dispatcher, &config).await;

            // If HTTP server exits, abort STDIO task
            stdio_handle.abort();
            http_result
        }
    };

    if let Err(e) = &result {
        error!(error = %e, "MCP server failed");
    }
    result
}

/// Run the HTTP transport with its session sweeper, closing every session
/// once the server stops.
async fn run_http(dispatcher: Arc<Dispatcher>, config: &ServerConfig) -> std::io::Result<()> {
    let sessions = SessionManager::new(config.session_timeout);
    let sweeper = sessions.spawn_sweeper(config.sweep_interval);
    let state = AppState::new(
        dispatcher,
        sessions,
        config.origin_policy.clone(),
        config.sse,
    );

    let result = server::run_server_http(state.clone(), config).await;

    sweeper.abort();
    state.shutdown().await;
    info!("MCP server stopped");
    result
}
