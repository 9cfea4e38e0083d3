// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Polls a submitted job until the remote side has assembled it.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{fetch_listing, value_to_id, OAuthApi, RemoteJob};
use crate::config::RemoteConfig;
use crate::error::{EngineError, EngineResult};

/// How a watch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    /// The job finished assembling remotely.
    Completed(RemoteJob),
    /// The job disappeared from the listing.
    Vanished,
    Cancelled,
}

/// A file inside a finished job.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayableFile {
    pub id: String,
    pub name: String,
    pub size: i64,
}

/// Watches remote jobs and resolves their files.
pub struct JobWatcher {
    api: Arc<dyn OAuthApi>,
    config: RemoteConfig,
}

impl JobWatcher {
    pub fn new(api: Arc<dyn OAuthApi>, config: RemoteConfig) -> Self {
        Self { api, config }
    }

    /// Poll the listing until `cloud_id` completes, vanishes or `cancel`
    /// fires. `stamp` is taken before every fetch and handed to
    /// `on_listing` with the batch.
    pub async fn watch<S, F>(
        &self,
        cloud_id: &str,
        cancel: &CancellationToken,
        stamp: S,
        on_listing: F,
    ) -> EngineResult<WatchOutcome>
    where
        S: Fn() -> u64,
        F: Fn(&[RemoteJob], u64),
    {
        let interval = self.config.poll_interval();

        loop {
            if cancel.is_cancelled() {
                return Ok(WatchOutcome::Cancelled);
            }

            let fetched_at = stamp();
            let jobs = match fetch_listing(
                self.api.as_ref(),
                &self.config.downloading_path_key,
                self.config.poll_retries,
                interval,
                cancel,
            )
            .await
            {
                Ok(jobs) => jobs,
                Err(_) if cancel.is_cancelled() => return Ok(WatchOutcome::Cancelled),
                Err(e) => return Err(e),
            };
            on_listing(&jobs, fetched_at);

            match jobs.iter().find(|j| j.id == cloud_id) {
                None => {
                    tracing::error!(cloud_id, "Remote job vanished while being watched");
                    return Ok(WatchOutcome::Vanished);
                }
                Some(job) if !job.is_assembling() => {
                    tracing::info!(cloud_id, "Remote job finished assembling");
                    return Ok(WatchOutcome::Completed(job.clone()));
                }
                Some(job) => {
                    tracing::debug!(cloud_id, progress = ?job.progress, "Remote job still assembling");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(WatchOutcome::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Largest playable file of a finished job.
    pub async fn select_playable(&self, cloud_id: &str) -> EngineResult<PlayableFile> {
        let listing = self
            .api
            .api_call(&format!("folder/{}", cloud_id), "GET", &BTreeMap::new())
            .await?;
        let files = listing
            .get("files")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        pick_largest_playable(files, &self.config.playable_key)
            .ok_or_else(|| EngineError::NotFound(format!("no playable file in job {}", cloud_id)))
    }

    /// Direct download URL of a file.
    pub async fn resolve_url(&self, file: &PlayableFile) -> EngineResult<String> {
        let mut params = BTreeMap::new();
        params.insert(self.config.fetch_file_param.clone(), file.id.clone());
        let response = self.api.query(&self.config.fetch_file_function, &params).await?;
        response
            .get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::TransientRemote(format!("no url returned for file {}", file.id)))
    }
}

/// The flag arrives as a bool, a number or a string.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map_or(false, |f| f != 0.0),
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "yes"),
        _ => false,
    }
}

pub fn pick_largest_playable(files: &[Value], playable_key: &str) -> Option<PlayableFile> {
    files
        .iter()
        .filter_map(Value::as_object)
        .filter(|f| truthy(f.get(playable_key)))
        .filter_map(|f| {
            Some(PlayableFile {
                id: value_to_id(f.get("id")?)?,
                name: f.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
                size: f
                    .get("size")
                    .and_then(|s| s.as_i64().or_else(|| s.as_f64().map(|x| x as i64)))
                    .unwrap_or(-1),
            })
        })
        .max_by_key(|f| f.size)
}
