//! Message types for actor communication

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::Labels;
use crate::reload::{ReloadError, ReloadReport};

/// A reload requested through the control plane
///
/// The reload listener answers on `respond_to` once the reload finished. A
/// request still queued at shutdown is dropped unanswered.
#[derive(Debug)]
pub struct ReloadRequest {
    pub respond_to: oneshot::Sender<Result<ReloadReport, ReloadError>>,
}

/// A discovered alertmanager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// `host:port`
    pub address: String,

    #[serde(default)]
    pub labels: Labels,
}

/// Discovered targets keyed by alertmanager set (`config-0`, ...)
pub type TargetGroups = BTreeMap<String, Vec<Target>>;
