//! Helper functions for integration tests

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use rule_evaluator::actors::export::SampleAppender;
use rule_evaluator::alerts::{AlertSink, NotificationAlert};
use rule_evaluator::reload::ReloadTarget;
use rule_evaluator::Sample;
use tokio::sync::Semaphore;

pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
}

/// Configuration with one static alertmanager and the given rule globs
pub fn config_toml(alertmanager: &str, rule_files: &[String]) -> String {
    let rule_files = rule_files
        .iter()
        .map(|f| format!("{f:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"
rule_files = [{rule_files}]

[global]
evaluation_interval = 1

[global.external_labels]
cluster = "test"

[[alerting.alertmanagers]]
timeout = 2

[[alerting.alertmanagers.static_configs]]
targets = ["{alertmanager}"]
"#
    )
}

/// Reload target that logs `start`/`end` and blocks on `gate` in between
pub fn gated_target(events: Arc<Mutex<Vec<&'static str>>>, gate: Arc<Semaphore>) -> ReloadTarget {
    ReloadTarget::new("gated", move |_config| {
        let events = events.clone();
        let gate = gate.clone();
        async move {
            events.lock().unwrap().push("start");
            gate.acquire().await?.forget();
            events.lock().unwrap().push("end");
            Ok(())
        }
    })
}

/// Hangup stream driven by the test
pub fn hangups() -> (mpsc::UnboundedSender<()>, mpsc::UnboundedReceiver<()>) {
    mpsc::unbounded()
}

/// Polls `condition` until it holds, panics after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collects appended samples and sent alerts
#[derive(Default)]
pub struct Recorder {
    pub samples: Mutex<Vec<Sample>>,
    pub alerts: Mutex<Vec<NotificationAlert>>,
}

#[async_trait]
impl SampleAppender for Recorder {
    async fn append(&self, samples: Vec<Sample>) -> anyhow::Result<()> {
        self.samples.lock().unwrap().extend(samples);
        Ok(())
    }
}

impl AlertSink for Recorder {
    fn send(&self, alerts: Vec<NotificationAlert>) {
        self.alerts.lock().unwrap().extend(alerts);
    }
}
