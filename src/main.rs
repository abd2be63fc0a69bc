//! # Speech Relay - Main Application Entry Point
//!
//! A real-time speech translation relay. Clients stream audio over a
//! WebSocket; every audio frame is recognized, translated and synthesized by
//! a pluggable speech provider and the results are streamed back.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: the whole server runs on the actix/tokio runtime
//! - **Actors**: each WebSocket connection is an actix actor
//! - **Arc**: the registries, pools and counters are shared by every worker
//! - **CancellationToken**: one token stops the background sweeps at shutdown
//!
//! ## Application Architecture:
//! - **config**: application configuration (TOML file + environment variables)
//! - **error**: HTTP errors and the session error taxonomy
//! - **protocol**: wire messages, the codec and chunk reassembly
//! - **pool**: the bounded resource pool provider handles are borrowed from
//! - **providers**: the speech provider contract and its Azure/OpenAI adapters
//! - **pipeline**: recognize → translate → synthesize orchestration
//! - **session**: session registry, connection state machine and sweeps
//! - **websocket**: the actix actor that owns one socket
//! - **handlers** / **health**: REST endpoints

mod config;
mod error;
mod handlers;
mod health;
mod pipeline;
mod pool;
mod protocol;
mod providers;
mod session;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use providers::ProviderRegistry;
use session::SessionSweeper;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Builds the provider pools**, the session registry and the orchestrator
/// 4. **Starts the heartbeat and idle-reaper sweeps**
/// 5. **Serves HTTP and WebSocket traffic** until SIGINT/SIGTERM
/// 6. **Shuts down**: stops the sweeps, closes the pools, drains the server
#[actix_web::main]
async fn main() -> Result<()> {
    // it's fine if there's no .env file
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let providers = ProviderRegistry::from_config(&config)?;
    let app_state = AppState::new(config.clone(), providers);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    let sweeper = Arc::new(SessionSweeper::new(
        Arc::clone(&app_state.sessions),
        config.session.clone(),
    ));
    let sweeps = sweeper.spawn(app_state.shutdown.clone());

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route("/ws/translation", web::get().to(websocket::translation_websocket))
            .service(
                web::scope("/api")
                    .route("/translation", web::get().to(websocket::translation_websocket))
                    .route("/translation/file", web::post().to(handlers::translation_file))
                    .route("/speech-to-text", web::post().to(handlers::speech_to_text))
                    .service(
                        web::scope("/v1")
                            .route("/health", web::get().to(health::health_check))
                            .route("/metrics", web::get().to(health::detailed_metrics))
                            .route("/config", web::get().to(handlers::get_config)),
                    ),
            )
            .route("/health", web::get().to(health::health_check))
    })
    // signals are handled below
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    app_state.shutdown.cancel();
    app_state.providers.close_all();
    if let Err(e) = sweeps.await {
        warn!("Session sweeps ended abnormally: {}", e);
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "info", "speech_relay=trace")
/// - If not set, defaults to "speech_relay=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_relay=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve once SIGINT (Ctrl+C) or SIGTERM arrives.
///
/// A signal handler that cannot be installed is logged and treated as a
/// signal that never fires, so the other one still works.
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
