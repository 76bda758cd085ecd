use std::net::SocketAddr;

use lexica::{
    app, initialize_state, seed, spawn_generator, spawn_limiter_sweeper, telemetry,
};
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    telemetry::setup_tracing();

    let state = initialize_state().await?;

    // execute migrations scripts on start.
    state.db.migrate().await?;
    seed(&state).await?;

    let generator = spawn_generator(&state);
    let sweeper = spawn_limiter_sweeper(&state);

    let address = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = TcpListener::bind(address).await?;
    tracing::info!(%address, "server started");

    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    if let Some(generator) = generator {
        generator.abort();
    }
    sweeper.abort();

    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(err) => {
                tracing::error!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
