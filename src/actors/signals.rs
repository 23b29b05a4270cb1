//! OS signal handling
//!
//! SIGTERM and Ctrl-C end the process through the termination actor. SIGHUP is
//! exposed as a stream consumed by the reload listener.

use std::future::Future;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use super::supervisor::Actor;

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Actor returning cleanly once a termination signal arrives
pub fn termination_actor() -> Actor {
    termination_actor_with(shutdown_signal())
}

/// Actor returning cleanly once `signal` resolves or it is interrupted
pub fn termination_actor_with<F>(signal: F) -> Actor
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancel = token.clone();
    Actor::new(
        "termination",
        async move {
            tokio::select! {
                () = signal => warn!("received termination request, exiting gracefully"),
                () = token.cancelled() => {}
            }
            Ok(())
        },
        move |_| cancel.cancel(),
    )
}

/// Stream yielding once per SIGHUP
///
/// When the handler cannot be installed the stream never yields.
pub fn hangup_signals() -> BoxStream<'static, ()> {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::hangup()) {
            Ok(hangup) => stream::unfold(hangup, |mut hangup| async move {
                hangup.recv().await.map(|()| ((), hangup))
            })
            .boxed(),
            Err(e) => {
                error!(error = %e, "failed to install SIGHUP handler, reload via HTTP only");
                stream::pending().boxed()
            }
        }
    }

    #[cfg(not(unix))]
    {
        tracing::info!("SIGHUP is not supported on this platform, reload via HTTP only");
        stream::pending().boxed()
    }
}
