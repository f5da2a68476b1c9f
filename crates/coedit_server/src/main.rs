use axum::{
    Router,
    http::{Method, header},
    routing::get,
};
use coedit_server::{
    cache::DocumentCache,
    config::Config,
    db::{AuthRepo, DocumentRepo, init_database},
    ephemeral::{BlockLockManager, IdempotencyGuard, PresenceStore},
    handlers::{api::ApiState, api_routes, ws::WsState, ws_handler},
    sequencer::OperationSequencer,
    sync::RoomRegistry,
};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// TTL of the cached document read-view; commits invalidate it earlier
const DOCUMENT_CACHE_TTL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coedit_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("Starting Coedit Server v{}", env!("CARGO_PKG_VERSION"));
    info!("Database path: {:?}", config.database_path);
    info!("CORS origins: {:?}", config.cors_origins);

    // Initialize database
    let conn = match Connection::open(&config.database_path) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = init_database(&conn) {
        error!("Failed to initialize database: {}", e);
        std::process::exit(1);
    }

    // Construct shared resources once; everything downstream borrows them
    let conn = Arc::new(Mutex::new(conn));
    let auth = Arc::new(AuthRepo::new(conn.clone()));
    let documents = Arc::new(DocumentRepo::new(conn));
    let cache = Arc::new(DocumentCache::new(DOCUMENT_CACHE_TTL));
    let sequencer = Arc::new(OperationSequencer::new(
        documents.clone(),
        cache,
        config.sync_window,
    ));
    let presence = Arc::new(PresenceStore::new(config.presence_ttl));
    let locks = Arc::new(BlockLockManager::new(config.lock_lease));
    let idempotency = Arc::new(IdempotencyGuard::new(config.idempotency_ttl));
    let rooms = Arc::new(RoomRegistry::new());

    let ws_state = WsState {
        auth: auth.clone(),
        sequencer: sequencer.clone(),
        presence: presence.clone(),
        locks: locks.clone(),
        idempotency: idempotency.clone(),
        rooms: rooms.clone(),
        idle_timeout: config.session_idle_timeout,
    };

    let api_state = ApiState {
        rooms: rooms.clone(),
    };

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(Any); // In production, use specific origins from config

    // Build the router
    let app = Router::new()
        // Health check
        .route("/", get(|| async { "Coedit Server" }))
        .route("/health", get(|| async { "OK" }))
        // WebSocket collaboration endpoint
        .route("/ws", get(ws_handler).with_state(ws_state))
        // API routes
        .nest("/api", api_routes(api_state))
        // Add layers
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Create listener
    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("Server listening on http://{}", addr);

    // Ephemeral-state sweep: expiry is lazy for correctness, this keeps it
    // prompt and memory bounded
    {
        let presence = presence.clone();
        let locks = locks.clone();
        let idempotency = idempotency.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                presence.sweep();
                locks.sweep();
                idempotency.sweep();
            }
        });
    }

    // Presence snapshots to durable storage, off the critical path
    {
        let presence = presence.clone();
        let documents = documents.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                for snapshot in presence.snapshot() {
                    if let Err(e) = documents.upsert_presence_snapshot(
                        &snapshot.document_id,
                        &snapshot.user_id,
                        &snapshot.state.to_string(),
                    ) {
                        error!("Failed to snapshot presence: {}", e);
                        break;
                    }
                }
            }
        });
    }

    // Hourly maintenance: expired auth sessions and operation-log compaction
    {
        let auth = auth.clone();
        let documents = documents.clone();
        let sequencer = sequencer.clone();
        let config = config.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            loop {
                interval.tick().await;
                match auth.cleanup_expired_sessions() {
                    Ok(removed) => info!("Cleaned up {} expired auth sessions", removed),
                    Err(e) => error!("Session cleanup failed: {}", e),
                }
                let ids = match documents.list_document_ids() {
                    Ok(ids) => ids,
                    Err(e) => {
                        error!("Compaction pass failed to list documents: {}", e);
                        continue;
                    }
                };
                for id in ids {
                    if let Err(e) = sequencer.compact(
                        &id,
                        config.compaction_threshold,
                        config.compaction_retain,
                    ) {
                        error!("Compaction failed for document {}: {}", id, e);
                    }
                }
            }
        });
    }

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("Server shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
