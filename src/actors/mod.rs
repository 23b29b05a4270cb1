//! Actor runtime of the rule evaluator
//!
//! Every long-running subsystem runs as one actor under the
//! [`supervisor::ActorSupervisor`]. Each actor is a run future paired with an
//! interrupt function; the first actor to return interrupts all others.
//!
//! ## Architecture Overview
//!
//! ```text
//!                  ┌───────────────────┐
//!                  │  ActorSupervisor  │
//!                  └─────────┬─────────┘
//!                            │ runs
//!   ┌──────────┬─────────┬───┴─────┬──────────┬──────────┬─────────┐
//!   │          │         │         │          │          │         │
//! signals    rules    notifier  discovery   export     http    reload
//!              │         ▲         │                     │         ▲
//!              │ alerts  │ targets │                     │ POST    │ SIGHUP
//!              └─────────┘◄────────┘                     └────►────┘
//! ```
//!
//! ## Actor Types
//!
//! - **termination**: returns on SIGTERM / Ctrl-C, triggering shutdown
//! - **RuleManager**: evaluates rule groups against the query backend
//! - **NotificationManager**: delivers alerts to discovered alertmanagers
//! - **DiscoveryManager**: resolves alertmanager targets
//! - **ExportStorage**: batches and exports recorded samples
//! - **ControlPlane**: HTTP health, readiness, metrics and reload endpoints
//! - **ReloadListener**: serializes signal and HTTP reload requests
//! - **initial load**: applies the configuration once at startup
//!
//! ## Communication Patterns
//!
//! 1. **Requests**: the reload listener drains an mpsc request channel
//! 2. **State fan-out**: discovery publishes target groups on a watch channel
//! 3. **Request/Response**: oneshot channels carry reload results back

pub mod discovery;
pub mod export;
pub mod messages;
pub mod notifier;
pub mod reload;
pub mod rules;
pub mod signals;
pub mod supervisor;

pub use supervisor::{Actor, ActorError, ActorSupervisor, SupervisorError};

use std::sync::Arc;

use anyhow::Context;

use crate::reload::ReloadTarget;

/// Reload targets in application order: `notify`, `notify_sd`, `rules`
pub fn reload_targets(
    notifier: Arc<notifier::NotificationManager>,
    discovery: Arc<discovery::DiscoveryManager>,
    rules: Arc<rules::RuleManager>,
) -> Vec<ReloadTarget> {
    vec![
        ReloadTarget::new("notify", move |config| {
            let notifier = Arc::clone(&notifier);
            async move { notifier.apply_config(&config) }
        }),
        ReloadTarget::new("notify_sd", move |config| {
            let discovery = Arc::clone(&discovery);
            async move {
                let providers = config
                    .alerting
                    .alertmanager_map()
                    .into_iter()
                    .map(|(name, am)| (name, am.service_discovery.clone()))
                    .collect();
                discovery.apply_config(providers)
            }
        }),
        ReloadTarget::new("rules", move |config| {
            let rules = Arc::clone(&rules);
            async move {
                let files = crate::rules::resolve_files(&config.rule_files)?;
                rules
                    .update(
                        config.evaluation_interval(),
                        &files,
                        config.global.external_labels.clone(),
                    )
                    .await
                    .context("error updating rule groups")
            }
        }),
    ]
}
