//! Self-monitoring metrics
//!
//! Metrics are recorded through the `metrics` facade and rendered on `/metrics`
//! by the Prometheus recorder installed at startup.

use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::warn;

pub const CONFIG_RELOAD_SUCCESS: &str = "rule_evaluator_config_last_reload_successful";
pub const CONFIG_RELOAD_SUCCESS_TIMESTAMP: &str =
    "rule_evaluator_config_last_reload_success_timestamp_seconds";
pub const CONFIG_RELOAD_TARGET_DURATION: &str =
    "rule_evaluator_config_reload_target_duration_seconds";

pub const RULE_EVALUATIONS: &str = "rule_evaluator_rule_evaluations_total";
pub const RULE_EVALUATION_FAILURES: &str = "rule_evaluator_rule_evaluation_failures_total";
pub const RULE_GROUP_DURATION: &str = "rule_evaluator_rule_group_duration_seconds";
pub const RULE_GROUPS: &str = "rule_evaluator_rule_groups";

pub const NOTIFICATIONS_SENT: &str = "rule_evaluator_notifications_sent_total";
pub const NOTIFICATIONS_ERRORS: &str = "rule_evaluator_notifications_errors_total";
pub const NOTIFICATIONS_DROPPED: &str = "rule_evaluator_notifications_dropped_total";
pub const NOTIFICATIONS_QUEUE_LENGTH: &str = "rule_evaluator_notifications_queue_length";
pub const ALERTMANAGERS_DISCOVERED: &str = "rule_evaluator_notifications_alertmanagers_discovered";

pub const EXPORT_SAMPLES: &str = "rule_evaluator_export_samples_total";
pub const EXPORT_FAILURES: &str = "rule_evaluator_export_failures_total";

pub const PROCESS_START_TIME: &str = "process_start_time_seconds";
pub const PROCESS_CPU_SECONDS: &str = "process_cpu_seconds_total";
pub const PROCESS_RESIDENT_MEMORY: &str = "process_resident_memory_bytes";
pub const PROCESS_VIRTUAL_MEMORY: &str = "process_virtual_memory_bytes";
pub const PROCESS_OPEN_FDS: &str = "process_open_fds";
pub const PROCESS_MAX_FDS: &str = "process_max_fds";

/// Registers metric descriptions with the active recorder
pub fn describe() {
    describe_gauge!(
        CONFIG_RELOAD_SUCCESS,
        "Whether the last configuration reload attempt was successful."
    );
    describe_gauge!(
        CONFIG_RELOAD_SUCCESS_TIMESTAMP,
        "Timestamp of the last successful configuration reload."
    );
    describe_histogram!(
        CONFIG_RELOAD_TARGET_DURATION,
        "Time taken by each reload target to apply a configuration."
    );
    describe_counter!(RULE_EVALUATIONS, "Total number of rule evaluations.");
    describe_counter!(
        RULE_EVALUATION_FAILURES,
        "Total number of rule evaluations that failed."
    );
    describe_histogram!(RULE_GROUP_DURATION, "Duration of rule group evaluations.");
    describe_gauge!(RULE_GROUPS, "Number of loaded rule groups.");
    describe_counter!(NOTIFICATIONS_SENT, "Total number of alerts sent.");
    describe_counter!(NOTIFICATIONS_ERRORS, "Total number of failed alert deliveries.");
    describe_counter!(
        NOTIFICATIONS_DROPPED,
        "Total number of alerts dropped due to a full queue."
    );
    describe_gauge!(NOTIFICATIONS_QUEUE_LENGTH, "Number of alerts in the queue.");
    describe_gauge!(ALERTMANAGERS_DISCOVERED, "Number of active alertmanagers.");
    describe_counter!(EXPORT_SAMPLES, "Total number of exported samples.");
    describe_counter!(EXPORT_FAILURES, "Total number of failed export batches.");
    describe_gauge!(
        PROCESS_START_TIME,
        "Start time of the process since unix epoch in seconds."
    );
    describe_gauge!(
        PROCESS_CPU_SECONDS,
        "Total user and system CPU time spent in seconds."
    );
    describe_gauge!(PROCESS_RESIDENT_MEMORY, "Resident memory size in bytes.");
    describe_gauge!(PROCESS_VIRTUAL_MEMORY, "Virtual memory size in bytes.");
    describe_gauge!(PROCESS_OPEN_FDS, "Number of open file descriptors.");
    describe_gauge!(PROCESS_MAX_FDS, "Maximum number of open file descriptors.");
}

/// Installs the process-wide Prometheus recorder
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    describe();
    gauge!(PROCESS_START_TIME).set(chrono::Utc::now().timestamp() as f64);

    Ok(handle)
}

/// Samples CPU, memory and file descriptor usage of the running process
///
/// Values are refreshed on every call to [`ProcessCollector::collect`], which
/// the `/metrics` handler does right before rendering.
pub struct ProcessCollector {
    pid: Pid,
    system: Mutex<System>,
}

impl ProcessCollector {
    /// Returns `None` on platforms where the own pid cannot be determined
    pub fn new() -> Option<Self> {
        match sysinfo::get_current_pid() {
            Ok(pid) => Some(Self {
                pid,
                system: Mutex::new(System::new()),
            }),
            Err(e) => {
                warn!("process metrics unavailable: {e}");
                None
            }
        }
    }

    pub fn collect(&self) {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::everything(),
        );

        let Some(process) = system.process(self.pid) else {
            warn!(pid = %self.pid, "own process not found while collecting metrics");
            return;
        };

        gauge!(PROCESS_CPU_SECONDS).set(process.accumulated_cpu_time() as f64 / 1000.0);
        gauge!(PROCESS_RESIDENT_MEMORY).set(process.memory() as f64);
        gauge!(PROCESS_VIRTUAL_MEMORY).set(process.virtual_memory() as f64);
        if let Some(open) = process.open_files() {
            gauge!(PROCESS_OPEN_FDS).set(open as f64);
        }
        if let Some(limit) = process.open_files_limit() {
            gauge!(PROCESS_MAX_FDS).set(limit as f64);
        }
    }
}
