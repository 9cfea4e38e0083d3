// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress monitor for an in-flight transfer.
//!
//! The monitor does not see the byte stream. It samples the size of the
//! growing temp file on a fixed interval, so the worker never blocks on
//! progress bookkeeping.

use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::download::types::ProgressSample;

/// Instantaneous and running-average transfer speed.
#[derive(Debug, Clone, Default)]
pub struct VelocityTracker {
    last: Option<(u64, u64)>,
    avg: f64,
    count: u64,
}

impl VelocityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `bytes` observed at `at_ms`. Returns bytes/second since the
    /// previous observation; the first observation has no predecessor and
    /// resets the average.
    pub fn observe(&mut self, bytes: u64, at_ms: u64) -> Option<f64> {
        let Some((last_bytes, last_ms)) = self.last else {
            self.last = Some((bytes, at_ms));
            self.avg = 0.0;
            self.count = 0;
            return None;
        };

        let dt = at_ms.saturating_sub(last_ms);
        if dt == 0 {
            return None;
        }

        let velocity = 1000.0 * bytes.saturating_sub(last_bytes) as f64 / dt as f64;
        self.avg = (self.avg * self.count as f64 + velocity) / (self.count + 1) as f64;
        self.count += 1;
        self.last = Some((bytes, at_ms));
        Some(velocity)
    }

    pub fn average(&self) -> f64 {
        self.avg
    }

    pub fn sample_count(&self) -> u64 {
        self.count
    }

    /// Observe and package the result for the pool.
    pub fn sample(&mut self, bytes: u64, at_ms: u64, total: Option<u64>) -> ProgressSample {
        let velocity = self.observe(bytes, at_ms);
        ProgressSample {
            bytes,
            progress: percent(bytes, total),
            velocity,
            avg_velocity: self.avg,
            sample_count: self.count,
        }
    }
}

fn percent(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => bytes as f64 / total as f64 * 100.0,
        _ => 0.0,
    }
}

/// Samples a growing file until told the final size or cancelled.
pub struct ProgressMonitor {
    path: PathBuf,
    total: Option<u64>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ProgressMonitor {
    pub fn new(path: PathBuf, total: Option<u64>, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            path,
            total,
            interval,
            cancel,
        }
    }

    /// Start sampling. Send the final byte count on the returned channel
    /// once the stream is complete; the task then emits one last sample and
    /// returns it.
    pub fn spawn<F>(self, on_sample: F) -> (oneshot::Sender<u64>, JoinHandle<Option<ProgressSample>>)
    where
        F: Fn(ProgressSample) + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn(self.run(done_rx, on_sample));
        (done_tx, handle)
    }

    async fn run<F>(self, mut done_rx: oneshot::Receiver<u64>, on_sample: F) -> Option<ProgressSample>
    where
        F: Fn(ProgressSample) + Send + 'static,
    {
        let started = Instant::now();
        let mut tracker = VelocityTracker::new();
        let mut last = None;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Progress monitor cancelled for {:?}", self.path);
                    return last;
                }
                done = &mut done_rx => {
                    let Ok(bytes) = done else {
                        return last;
                    };
                    let sample = tracker.sample(bytes, elapsed_ms(started), self.total);
                    on_sample(sample);
                    return Some(sample);
                }
                _ = ticker.tick() => {
                    let Ok(meta) = tokio::fs::metadata(&self.path).await else {
                        continue;
                    };
                    let sample = tracker.sample(meta.len(), elapsed_ms(started), self.total);
                    on_sample(sample);
                    last = Some(sample);
                }
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
