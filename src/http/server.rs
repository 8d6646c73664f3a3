//! HTTP server and routing.

use std::future::Future;
use std::net::SocketAddr;

use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::handlers;
use super::middleware::{admission_middleware, AdmissionState};
use crate::error::{FloodgateError, Result};

/// Build the service router.
///
/// `/health` is served directly; everything under `/api` passes through the
/// admission middleware first.
pub fn build_router(admission: AdmissionState) -> Router {
    let protected = Router::new()
        .route("/test", any(handlers::echo))
        .fallback(handlers::accepted)
        .layer(axum::middleware::from_fn_with_state(
            admission,
            admission_middleware,
        ));

    Router::new()
        .route("/health", get(handlers::health))
        .nest("/api", protected)
}

/// HTTP server for the admission-controlled API.
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// Routes served on the listener
    router: Router,
}

impl HttpServer {
    /// Bind to `addr` and prepare to serve the admission-controlled router.
    pub async fn bind(addr: SocketAddr, admission: AdmissionState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            router: build_router(admission),
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process is killed.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests complete.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Starting HTTP server");

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Io(e)
        })
    }
}
