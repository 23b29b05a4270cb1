//! HTTP control plane
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Actor handles** for triggering reloads
//! - **MetricsSource** for the readiness probe
//!
//! ## Endpoints
//!
//! - `GET /-/healthy` - Liveness, always `200`
//! - `GET /-/ready` - Readiness via a live `vector(1)` query
//! - `POST /-/reload` - Synchronous configuration reload
//! - `GET /metrics` - Self-monitoring metrics
//!
//! On interrupt the server stops accepting connections and drains in-flight
//! requests for at most [`SHUTDOWN_TIMEOUT`].

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::ApiState;

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router,
    routing::{any, get},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::actors::Actor;

/// Upper bound for draining connections on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds the control plane router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/-/healthy", get(routes::health::healthy))
        .route("/-/ready", get(routes::ready::ready))
        .route("/-/reload", any(routes::reload::reload))
        .route("/metrics", get(routes::metrics::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bound HTTP listener serving the control plane
pub struct ControlPlane {
    listener: TcpListener,
    addr: SocketAddr,
}

impl ControlPlane {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind web listener on {addr}"))?;
        let addr = listener.local_addr()?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves until `token` is cancelled and in-flight requests drained
    pub async fn serve(self, state: ApiState, token: CancellationToken) -> anyhow::Result<()> {
        info!(listen = %self.addr, "starting web server");

        let server = axum::serve(self.listener, router(state))
            .with_graceful_shutdown(token.clone().cancelled_owned())
            .into_future();

        let drain_deadline = async {
            token.cancelled().await;
            tokio::time::sleep(SHUTDOWN_TIMEOUT).await;
        };

        tokio::select! {
            result = server => result.context("web server failed")?,
            () = drain_deadline => warn!("web server did not drain within {SHUTDOWN_TIMEOUT:?}, closing"),
        }

        info!("web server stopped");
        Ok(())
    }

    /// Wraps the server into a supervised actor
    pub fn actor(self, state: ApiState) -> Actor {
        let token = CancellationToken::new();
        let cancel = token.clone();
        Actor::new("http", self.serve(state, token), move |_| cancel.cancel())
    }
}
