mod api;
mod capabilities;
mod codec;
mod config;
mod realtime;
mod registry;
mod relay;
mod session;
mod socket;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use config::Config;
use realtime::RealtimeDialer;
use registry::CapabilityRegistry;
use relay::{Relay, RelayHandle, RelaySettings};
use session::config::SessionConfig;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Entry point into the session relay for socket handlers.
    pub relay: RelayHandle,
    pub registry: Arc<CapabilityRegistry>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("call-relay {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    eprintln!("Failed to create tokio runtime: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(server()) {
                eprintln!("{e}");
                std::process::exit(1);
            }
        }
    }
}

fn print_usage() {
    println!("call-relay {VERSION}");
    println!("Relay between a Twilio call and an OpenAI realtime model");
    println!();
    println!("Usage: call-relay [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the relay server.");
}

async fn server() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_relay=info,tower_http=info".into()),
        )
        .init();

    let config = Config::load().map_err(|e| format!("Failed to load config: {e}"))?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        public_url = %config.server.public_url,
        "Starting call-relay"
    );
    if config.server.public_url.is_empty() {
        tracing::warn!("PUBLIC_URL is not set, /twiml will not point Twilio anywhere useful");
    }

    let registry = Arc::new(
        capabilities::builtin().map_err(|e| format!("Failed to register capabilities: {e}"))?,
    );
    if registry.is_empty() {
        tracing::warn!("No capabilities registered, function calls will fail");
    } else {
        tracing::info!(count = registry.len(), "Capabilities registered");
    }

    let tools = if config.model.advertise_tools {
        registry.tool_definitions()
    } else {
        Vec::new()
    };
    let settings = RelaySettings {
        api_key: config.openai.api_key.clone(),
        session_defaults: SessionConfig::defaults(&config.model, tools),
    };
    let dialer = Arc::new(RealtimeDialer::new(&config.openai));
    let (relay, events) = Relay::new(settings, Arc::clone(&registry), dialer);
    let handle = relay.handle();
    tokio::spawn(relay.run(events));

    let state = AppState {
        config: config.clone(),
        relay: handle,
        registry,
    };

    let app = Router::new()
        // Twilio webhook and media stream
        .route(
            "/twiml",
            get(twilio::webhook::handle_twiml).post(twilio::webhook::handle_twiml),
        )
        .route("/call", get(twilio::media::handle_call_upgrade))
        // Operator UI
        .route("/logs", get(api::logs::handle_logs_upgrade))
        .route("/tools", get(api::tools::handle_tools))
        .route("/public-url", get(api::tools::handle_public_url))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| format!("Invalid server address: {e}"))?;

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind {addr}: {e}"))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| format!("Server error: {e}"))?;
    Ok(())
}

async fn health() -> &'static str {
    "ok"
}
