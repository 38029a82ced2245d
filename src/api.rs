use std::sync::Arc;

use axum::Router;
use relay_bus::Pipeline;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub(crate) fn start_api_server(cancel: CancellationToken, pipeline: Arc<Pipeline>, port: u16) {
    tokio::spawn(async move {
        let app = Router::new()
            .nest("/api", crate::handler::control::control_router())
            .nest("/ws", crate::handler::ws::ws_router())
            .with_state(pipeline);

        let listener = match TcpListener::bind(("0.0.0.0", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("failed to bind API server on port {}: {}", port, e);
                cancel.cancel();
                return;
            }
        };
        log::info!("API server started on port {}", port);
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel))
            .await
        {
            log::error!("Error starting API server: {}", e);
        }
    });
}

async fn shutdown_signal(cancel: CancellationToken) {
    cancel.cancelled().await;
    log::info!("Shutting down API server...");
}
