//! ReloadListener - serializes configuration reloads
//!
//! Reloads are triggered by SIGHUP or by the control plane. Both sources are
//! drained by one task, so at most one reload runs at a time.
//!
//! ```text
//! SIGHUP ───────────┐
//!                   ├──► ReloadListener ──► ReloadCoordinator::reload()
//! POST /-/reload ───┘         │
//!   (ReloadHandle)            └──► oneshot response
//! ```
//!
//! The shutdown branch is polled first, so no reload starts after an
//! interrupt. A reload already running always completes before the listener
//! returns. Requests still queued at shutdown are dropped, which their callers
//! observe as [`ReloadRequestError::Unavailable`].

use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::messages::ReloadRequest;
use super::supervisor::Actor;
use crate::reload::{ReloadCoordinator, ReloadError, ReloadReport};

/// Capacity of the reload request queue
const REQUEST_QUEUE_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum ReloadRequestError {
    /// The listener is gone or shutting down
    #[error("reload listener unavailable")]
    Unavailable,

    #[error(transparent)]
    Failed(#[from] ReloadError),
}

/// Handle for requesting reloads from the listener
#[derive(Clone, Debug)]
pub struct ReloadHandle {
    sender: mpsc::Sender<ReloadRequest>,
}

impl ReloadHandle {
    /// Requests a reload and waits for its result
    pub async fn reload(&self) -> Result<ReloadReport, ReloadRequestError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ReloadRequest { respond_to: tx })
            .await
            .map_err(|_| ReloadRequestError::Unavailable)?;

        let result = rx.await.map_err(|_| ReloadRequestError::Unavailable)?;
        Ok(result?)
    }
}

/// Actor draining reload triggers one at a time
pub struct ReloadListener {
    coordinator: ReloadCoordinator,
    request_rx: mpsc::Receiver<ReloadRequest>,
}

impl ReloadListener {
    pub fn new(coordinator: ReloadCoordinator) -> (Self, ReloadHandle) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_SIZE);
        (
            Self {
                coordinator,
                request_rx: rx,
            },
            ReloadHandle { sender: tx },
        )
    }

    /// Main loop, returns once `token` is cancelled
    #[instrument(skip_all, name = "reload_listener")]
    pub async fn run<S>(mut self, hangups: S, token: CancellationToken)
    where
        S: Stream<Item = ()> + Unpin + Send,
    {
        debug!("starting reload listener");
        let mut hangups = hangups.fuse();

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("shutdown requested");
                    break;
                }

                Some(()) = hangups.next() => {
                    info!("received SIGHUP, reloading configuration");
                    if let Err(e) = self.coordinator.reload().await {
                        error!("error reloading config: {e}");
                    }
                }

                Some(request) = self.request_rx.recv() => {
                    let result = self.coordinator.reload().await;
                    if let Err(e) = &result {
                        error!("error reloading config: {e}");
                    }
                    // caller may have gone away
                    let _ = request.respond_to.send(result);
                }

                else => {
                    // no trigger source left, wait for shutdown
                    token.cancelled().await;
                    break;
                }
            }
        }

        debug!("reload listener stopped");
    }

    /// Wraps the listener into a supervised actor
    pub fn actor<S>(self, hangups: S) -> Actor
    where
        S: Stream<Item = ()> + Unpin + Send + 'static,
    {
        let token = CancellationToken::new();
        let cancel = token.clone();
        Actor::new(
            "reload",
            async move {
                self.run(hangups, token).await;
                Ok(())
            },
            move |_| cancel.cancel(),
        )
    }
}

/// Actor applying the configuration once at startup
///
/// The load is queued on the listener like any other reload, so it never
/// overlaps a SIGHUP or HTTP reload. Once started it always runs to
/// completion, even when the actor is interrupted meanwhile. A failed initial
/// load is fatal and ends the process. Otherwise the actor idles until
/// interrupted.
pub fn initial_load_actor(handle: ReloadHandle) -> Actor {
    let token = CancellationToken::new();
    let cancel = token.clone();
    Actor::new(
        "initial config load",
        async move {
            match handle.reload().await {
                Ok(_) => info!("initial configuration applied"),
                // listener stopped before serving the load, so shutdown is underway
                Err(ReloadRequestError::Unavailable) => {
                    debug!("reload listener stopped before the initial load")
                }
                Err(ReloadRequestError::Failed(e)) => {
                    return Err(anyhow::Error::new(e).context("error loading initial configuration"));
                }
            }
            token.cancelled().await;
            Ok(())
        },
        move |_| cancel.cancel(),
    )
}
