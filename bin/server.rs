// Ledger Audit - Web Server
// REST API with Axum

use anyhow::{Context, Result};
use ledger_audit::api::{router, AppState};
use ledger_audit::{open_database, telemetry, verify_audit_log, Config};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env().context("Invalid configuration")?;
    telemetry::init_tracing(&config.log_level);

    let conn = open_database(&config.db_path)
        .with_context(|| format!("Failed to open database {:?}", config.db_path))?;
    tracing::info!(db = ?config.db_path, "database opened");

    // Refuse to serve on top of a broken chain
    let entries = verify_audit_log(&conn).context("Audit chain failed verification at startup")?;
    tracing::info!(entries, "audit chain verified at startup");

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(conn, config);

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!(addr = %bind_addr, "🚀 server running");
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
