//! ActorSupervisor - runs a fixed set of actors as one failure domain
//!
//! All actors start together. The first actor to return, with any result,
//! triggers the interrupt function of every other actor exactly once. The
//! supervisor then waits until every actor returned and reports the result of
//! the triggering actor; results of interrupted actors are only logged.
//!
//! ```text
//! run() ──► spawn all ──► first join ──► interrupt others ──► drain ──► result
//! ```
//!
//! Returns are observed through a single `JoinSet`, so exactly one actor is
//! ever selected as the trigger.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

type InterruptFn = Box<dyn FnOnce(Option<&anyhow::Error>) + Send>;

/// A supervised unit: a run future plus the function that makes it return
///
/// The interrupt function receives the error of the triggering actor, if
/// any. It must not block; it signals the run future to wind down.
pub struct Actor {
    name: String,
    run: BoxFuture<'static, anyhow::Result<()>>,
    interrupt: InterruptFn,
}

impl Actor {
    pub fn new<R, I>(name: impl Into<String>, run: R, interrupt: I) -> Self
    where
        R: Future<Output = anyhow::Result<()>> + Send + 'static,
        I: FnOnce(Option<&anyhow::Error>) + Send + 'static,
    {
        Self {
            name: name.into(),
            run: run.boxed(),
            interrupt: Box::new(interrupt),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A supervised actor returned with an error or panicked
#[derive(Debug, Error)]
#[error("actor {actor} failed: {source:#}")]
pub struct ActorError {
    pub actor: String,
    pub source: anyhow::Error,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no actors to supervise")]
    NoActors,

    #[error(transparent)]
    Actor(#[from] ActorError),

    #[error("actor task could not be joined: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Runs a fixed, ordered set of actors
#[derive(Debug, Default)]
pub struct ActorSupervisor {
    actors: Vec<Actor>,
}

impl ActorSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, actor: Actor) {
        self.actors.push(actor);
    }

    pub fn with(mut self, actor: Actor) -> Self {
        self.add(actor);
        self
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Runs all actors until the first one returns, then drains the rest
    pub async fn run(self) -> Result<(), SupervisorError> {
        if self.actors.is_empty() {
            return Err(SupervisorError::NoActors);
        }

        let mut names = Vec::with_capacity(self.actors.len());
        let mut interrupts = Vec::with_capacity(self.actors.len());
        let mut tasks = JoinSet::new();

        for (index, actor) in self.actors.into_iter().enumerate() {
            let Actor {
                name,
                run,
                interrupt,
            } = actor;

            let span = info_span!("actor", name = %name);
            debug!(actor = %name, "starting actor");
            tasks.spawn(
                async move {
                    let result = match AssertUnwindSafe(run).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))),
                    };
                    (index, result)
                }
                .instrument(span),
            );

            names.push(name);
            interrupts.push(Some(interrupt));
        }

        // Non-empty set, so the first join always yields a value
        let (trigger, result) = match tasks.join_next().await {
            Some(Ok((index, result))) => (Some(index), result),
            Some(Err(e)) => (None, Err(anyhow::Error::new(e))),
            None => return Err(SupervisorError::NoActors),
        };

        match (&trigger, &result) {
            (Some(index), Ok(())) => info!(actor = %names[*index], "actor returned, stopping all actors"),
            (Some(index), Err(e)) => {
                warn!(actor = %names[*index], "actor failed, stopping all actors: {e:#}")
            }
            (None, _) => warn!("actor task aborted, stopping all actors"),
        }

        for (index, interrupt) in interrupts.iter_mut().enumerate() {
            if Some(index) == trigger {
                continue;
            }
            if let Some(interrupt) = interrupt.take() {
                debug!(actor = %names[index], "interrupting actor");
                interrupt(result.as_ref().err());
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(()))) => debug!(actor = %names[index], "actor stopped"),
                Ok((index, Err(e))) => {
                    debug!(actor = %names[index], "actor stopped with error after interrupt: {e:#}")
                }
                Err(e) => warn!("actor task could not be joined: {e}"),
            }
        }

        match (trigger, result) {
            (_, Ok(())) => Ok(()),
            (Some(index), Err(source)) => Err(ActorError {
                actor: names[index].clone(),
                source,
            }
            .into()),
            (None, Err(source)) => Err(ActorError {
                actor: "unknown".to_string(),
                source,
            }
            .into()),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
