// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side transfer of a finished remote job.
//!
//! The worker streams the file into the scratch directory while a
//! [`ProgressMonitor`] samples the temp file. Bookkeeping that follows a
//! successful transfer (moving into synced storage, pool updates, remote
//! cleanup) belongs to the engine.

pub mod monitor;

use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::download::types::ProgressSample;
use crate::error::{EngineError, EngineResult};

pub use monitor::{ProgressMonitor, VelocityTracker};

/// One file to fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub cloud_id: String,
    pub url: String,
    pub file_name: String,
    /// Size advertised by the remote listing, -1 when unknown.
    pub expected_size: i64,
}

/// A completed transfer waiting to be moved into place.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutcome {
    pub temp_path: PathBuf,
    pub bytes: u64,
}

/// Streams remote files to the scratch directory.
#[derive(Debug, Clone)]
pub struct TransferWorker {
    client: reqwest::Client,
    temp_dir: PathBuf,
    sample_interval: Duration,
}

impl TransferWorker {
    pub fn new(config: &TransferConfig, temp_dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| EngineError::Unrecoverable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            temp_dir: temp_dir.into(),
            sample_interval: config.sample_interval(),
        })
    }

    pub fn temp_path(&self, cloud_id: &str) -> PathBuf {
        let safe: String = cloud_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.temp_dir.join(format!("{}.part", safe))
    }

    /// Content length from a HEAD request, if the server reports one.
    pub async fn content_length(&self, url: &str) -> Option<u64> {
        match self.client.head(url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok()),
            Ok(resp) => {
                tracing::debug!("HEAD {} returned {}", url, resp.status());
                None
            }
            Err(e) => {
                tracing::debug!("HEAD {} failed: {}", url, e);
                None
            }
        }
    }

    /// Stream `request.url` into the temp file, reporting progress to
    /// `on_sample`. The temp file is removed on any failure.
    pub async fn download<F>(
        &self,
        request: &TransferRequest,
        cancel: &CancellationToken,
        on_sample: F,
    ) -> EngineResult<TransferOutcome>
    where
        F: Fn(ProgressSample) + Send + 'static,
    {
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        let temp_path = self.temp_path(&request.cloud_id);

        let total = match self.content_length(&request.url).await {
            Some(len) => Some(len),
            None => u64::try_from(request.expected_size).ok().filter(|s| *s > 0),
        };

        tracing::info!(
            cloud_id = %request.cloud_id,
            total = ?total,
            "Starting transfer of {}",
            request.file_name
        );

        let monitor_cancel = cancel.child_token();
        let monitor = ProgressMonitor::new(
            temp_path.clone(),
            total,
            self.sample_interval,
            monitor_cancel.clone(),
        );
        let (done_tx, monitor_handle) = monitor.spawn(on_sample);

        match self.stream_to(&request.url, &temp_path, cancel).await {
            Ok(bytes) => {
                let _ = done_tx.send(bytes);
                if let Err(e) = monitor_handle.await {
                    tracing::warn!("Progress monitor task failed: {}", e);
                }
                Ok(TransferOutcome { temp_path, bytes })
            }
            Err(e) => {
                monitor_cancel.cancel();
                let _ = monitor_handle.await;
                if let Err(rm) = tokio::fs::remove_file(&temp_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to remove {:?}: {}", temp_path, rm);
                    }
                }
                tracing::error!(cloud_id = %request.cloud_id, "Transfer failed: {}", e);
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, path: &Path, cancel: &CancellationToken) -> EngineResult<u64> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::TransientRemote("transfer cancelled".to_string()));
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

/// Move `from` to `to`, copying when a rename cannot cross filesystems.
pub async fn move_file(from: &Path, to: &Path) -> EngineResult<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await?;
    Ok(())
}
