use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::middleware::from_fn_with_state;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use clap::Parser;
use serde_json::{json, Value};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::FloodgateConfig;
use floodgate::gate::{
    admit_request, AuthenticatedUser, ConnectionGate, GateEvent, HttpGate, MessageGate,
};
use floodgate::ratelimit::{Policy, RateLimiter, Subject};
use floodgate::store::{RedisStore, Store};

/// Redis-backed request admission service.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address, overrides the configuration
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Redis URL, overrides the configuration
    #[arg(long)]
    redis_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[derive(Clone)]
struct AppState {
    health: Arc<RateLimiter>,
    chat: MessageGate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = FloodgateConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(url) = args.redis_url {
        config.store.url = url;
    }
    config.validate()?;
    info!(
        listen = %config.server.listen,
        timeout_ms = config.store.timeout_ms,
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = Arc::new(
        RedisStore::connect(&config.store.url)
            .await
            .context("Failed to connect to Redis")?,
    );

    let limits = config.namespaced_limits();
    let build = |policy: &Policy| -> anyhow::Result<Arc<RateLimiter>> {
        let limiter = RateLimiter::new(store.clone(), policy.clone())?
            .with_timeout(config.store.timeout());
        Ok(Arc::new(limiter))
    };

    let signin = build(&limits.signin)?;
    let signup = build(&limits.signup)?;
    let api = build(&limits.api)?;
    let chat = build(&limits.chat)?;
    let upload = build(&limits.upload)?;
    info!("Rate limiters initialized");

    let state = AppState {
        health: api.clone(),
        chat: MessageGate::for_limiter(chat),
    };

    let auth = Router::new()
        .route(
            "/signup",
            post(signup_handler)
                .layer(from_fn_with_state(HttpGate::for_limiter(signup), admit_request)),
        )
        .route(
            "/login",
            post(login_handler)
                .layer(from_fn_with_state(HttpGate::for_limiter(signin), admit_request)),
        )
        .route("/logout", post(logout_handler))
        .route(
            "/uploadProfilePic",
            put(upload_handler)
                .layer(from_fn_with_state(HttpGate::for_limiter(upload), admit_request)),
        );

    let message = Router::new()
        .route("/send", get(send_handler))
        .route_layer(from_fn_with_state(HttpGate::for_limiter(api), admit_request));

    let app = Router::new()
        .nest("/api/auth", auth)
        .nest("/api/message", message)
        .route("/ws/chat", get(chat_socket))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    info!("Listening on {}", config.server.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Floodgate stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn signup_handler() -> impl IntoResponse {
    (StatusCode::CREATED, Json(json!({ "message": "Signup accepted." })))
}

async fn login_handler() -> Json<Value> {
    Json(json!({ "message": "Login accepted." }))
}

async fn logout_handler() -> Json<Value> {
    Json(json!({ "message": "Logged out successfully." }))
}

async fn upload_handler() -> Json<Value> {
    Json(json!({ "message": "Profile picture uploaded successfully." }))
}

async fn send_handler() -> Json<Value> {
    Json(json!({ "message": "Message send endpoint - not yet implemented" }))
}

async fn health(State(state): State<AppState>) -> Response {
    match state.health.ping().await {
        Ok(()) => Json(json!({ "status": "ok", "store": "up" })).into_response(),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "store": "down" })),
            )
                .into_response()
        }
    }
}

async fn chat_socket(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    user: Option<Extension<AuthenticatedUser>>,
    State(state): State<AppState>,
) -> Response {
    let connection_id = format!("{:016x}", rand::random::<u64>());
    let user = user.map(|Extension(AuthenticatedUser(id))| id);
    let subject = Subject::resolve(user.as_deref(), None, Some(connection_id.as_str()))
        .unwrap_or_else(|| Subject::Connection(connection_id.clone()));

    debug!(peer = %addr, subject = %subject, "Chat connection upgrading");

    let (tx, rx) = mpsc::unbounded_channel();
    let gate = state.chat.attach(subject, tx);
    ws.on_upgrade(move |socket| run_chat(socket, gate, rx))
}

/// Echo chat messages back while the connection stays within its quota.
async fn run_chat(
    mut socket: WebSocket,
    gate: ConnectionGate,
    mut events: mpsc::UnboundedReceiver<GateEvent>,
) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };

        let allowed = gate.allow().await;
        while let Ok(event) = events.try_recv() {
            match serde_json::to_string(&event) {
                Ok(payload) => {
                    if socket.send(Message::Text(payload.into())).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode gate event"),
            }
        }

        if allowed && socket.send(Message::Text(text)).await.is_err() {
            return;
        }
    }

    debug!(subject = %gate.subject(), "Chat connection closed");
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
