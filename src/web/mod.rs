//! Web server module: the pull endpoint for live metrics and cycle state.

mod handlers;

use crate::metrics::LiveSnapshot;

use axum::{routing::get, Router};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub live: Arc<LiveSnapshot>,
}

/// Metrics endpoint server.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(live: Arc<LiveSnapshot>) -> Self {
        Self {
            state: AppState { live },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        Router::new()
            .route("/metrics", get(handlers::handle_metrics))
            .route("/status", get(handlers::handle_status))
            .route("/healthz", get(handlers::handle_healthz))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the listening socket. Failing here is fatal for the daemon.
    pub async fn bind(port: u16) -> io::Result<TcpListener> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        TcpListener::bind(addr).await
    }

    /// Serve on `listener` until `shutdown` is cancelled.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Metrics endpoint listening on {}", addr);
        }

        axum::serve(listener, self.routes())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}
