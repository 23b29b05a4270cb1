//! ExportStorage - batches recorded samples for export
//!
//! Recording rules append their results through an [`ExportHandle`]. The
//! storage actor buffers samples and flushes a batch when either trigger fires:
//! - **Size trigger**: the buffer holds `batch_size` samples
//! - **Time trigger**: `flush_interval` elapsed since the last flush
//!
//! With an export URL configured a batch is `POST`ed as
//! `{"samples": [{"labels": {...}, "timestamp": ms, "value": v}]}`; otherwise
//! it is counted and discarded. Failed exports are logged and counted, never
//! retried and never fatal.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use super::supervisor::Actor;
use crate::{Labels, Sample, telemetry};

/// Capacity of the append queue, in append calls
const APPEND_QUEUE_SIZE: usize = 1024;

const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Export endpoint, `None` discards batches
    pub url: Option<String>,

    pub batch_size: usize,

    pub flush_interval: Duration,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            url: None,
            batch_size: 200,
            flush_interval: Duration::from_secs(5),
        }
    }
}

/// Sink for samples produced by recording rules
#[async_trait]
pub trait SampleAppender: Send + Sync {
    async fn append(&self, samples: Vec<Sample>) -> anyhow::Result<()>;
}

/// Handle for appending samples to the export storage
#[derive(Clone, Debug)]
pub struct ExportHandle {
    sender: mpsc::Sender<Vec<Sample>>,
}

#[async_trait]
impl SampleAppender for ExportHandle {
    async fn append(&self, samples: Vec<Sample>) -> anyhow::Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        self.sender
            .send(samples)
            .await
            .map_err(|_| anyhow::anyhow!("export storage stopped"))
    }
}

#[derive(Serialize)]
struct ExportRequest<'a> {
    samples: Vec<ExportedSample<'a>>,
}

#[derive(Serialize)]
struct ExportedSample<'a> {
    labels: &'a Labels,
    timestamp: i64,
    value: f64,
}

pub struct ExportStorage {
    url: Option<Url>,
    client: reqwest::Client,
    batch_size: usize,
    flush_interval: Duration,
    sample_rx: mpsc::Receiver<Vec<Sample>>,
    buffer: Vec<Sample>,
    flush_count: u64,
}

impl ExportStorage {
    pub fn new(options: ExportOptions) -> anyhow::Result<(Self, ExportHandle)> {
        let url = options
            .url
            .as_deref()
            .map(Url::parse)
            .transpose()
            .context("invalid export URL")?;

        anyhow::ensure!(options.batch_size > 0, "export batch size must be greater than zero");
        anyhow::ensure!(
            !options.flush_interval.is_zero(),
            "export flush interval must be greater than zero"
        );

        let client = reqwest::Client::builder()
            .timeout(EXPORT_TIMEOUT)
            .build()
            .context("failed to build export HTTP client")?;

        let (tx, rx) = mpsc::channel(APPEND_QUEUE_SIZE);
        let storage = Self {
            url,
            client,
            batch_size: options.batch_size,
            flush_interval: options.flush_interval,
            sample_rx: rx,
            buffer: Vec::with_capacity(options.batch_size),
            flush_count: 0,
        };

        Ok((storage, ExportHandle { sender: tx }))
    }

    /// Main loop, flushes the remaining buffer once `token` is cancelled
    #[instrument(skip_all, name = "export_storage")]
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        let mode = if self.url.is_some() { "remote" } else { "discard" };
        info!(mode, "starting export storage");

        let mut ticker = time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => break,

                Some(samples) = self.sample_rx.recv() => {
                    self.buffer.extend(samples);
                    while self.buffer.len() >= self.batch_size {
                        trace!("size-based flush triggered ({} samples)", self.buffer.len());
                        self.flush().await;
                    }
                }

                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        trace!("time-based flush triggered ({} samples)", self.buffer.len());
                        self.flush().await;
                    }
                }
            }
        }

        while let Ok(samples) = self.sample_rx.try_recv() {
            self.buffer.extend(samples);
        }
        while !self.buffer.is_empty() {
            debug!("final flush before shutdown ({} samples)", self.buffer.len());
            self.flush().await;
        }

        info!(flushes = self.flush_count, "export storage stopped");
        Ok(())
    }

    /// Wraps the storage into a supervised actor
    pub fn actor(self) -> Actor {
        let token = CancellationToken::new();
        let cancel = token.clone();
        Actor::new("export", self.run(token), move |_| cancel.cancel())
    }

    /// Exports up to one batch from the front of the buffer
    async fn flush(&mut self) {
        let take = self.buffer.len().min(self.batch_size);
        let batch: Vec<Sample> = self.buffer.drain(..take).collect();
        self.flush_count += 1;

        let Some(url) = &self.url else {
            trace!("discarding batch of {} samples", batch.len());
            counter!(telemetry::EXPORT_SAMPLES).increment(batch.len() as u64);
            return;
        };

        match self.export(url, &batch).await {
            Ok(()) => {
                trace!("exported {} samples", batch.len());
                counter!(telemetry::EXPORT_SAMPLES).increment(batch.len() as u64);
            }
            Err(e) => {
                warn!(samples = batch.len(), "failed to export samples: {e:#}");
                counter!(telemetry::EXPORT_FAILURES).increment(1);
            }
        }
    }

    async fn export(&self, url: &Url, batch: &[Sample]) -> anyhow::Result<()> {
        let body = ExportRequest {
            samples: batch
                .iter()
                .map(|s| ExportedSample {
                    labels: &s.metric,
                    timestamp: s.timestamp,
                    value: s.value,
                })
                .collect(),
        };

        let response = self
            .client
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .context("failed to send export request")?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP error: {}", response.status());
        }
        Ok(())
    }
}
