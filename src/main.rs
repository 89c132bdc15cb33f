use std::process;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use browsergrid::cli::Args;
use browsergrid::server::{create_router, AppState};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    let config = args.to_config();
    let state = AppState::new(config);
    let distributor = state.distributor.clone();

    let addr = format!("{}:{}", args.bind_addr, args.port);
    info!("Starting browsergrid distributor on {}", addr);

    let app = create_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            process::exit(1);
        }
    };

    info!("Distributor listening on {}", addr);
    info!("Endpoints:");
    info!("  POST   /se/grid/distributor/session          - Create session");
    info!("  POST   /se/grid/distributor/node             - Register node");
    info!("  DELETE /se/grid/distributor/node/{{id}}        - Remove node");
    info!("  POST   /se/grid/distributor/node/{{id}}/drain  - Drain node");
    info!("  GET    /se/grid/distributor/status           - Status");

    let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received, cancelling queued requests");
        distributor.shutdown();
    });

    if let Err(e) = serve.await {
        error!("Server error: {}", e);
        process::exit(1);
    }
}
