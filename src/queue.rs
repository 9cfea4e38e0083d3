// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admission control for remote submissions.
//!
//! When the remote service reports that it is full, submissions wait in the
//! pool's FIFO and are retried by a single drain loop. After
//! `escalation_threshold` consecutive capacity failures the drain clears
//! every job on the remote side and carries on.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{QueueConfig, RemoteConfig};
use crate::download::state::DownloadPool;
use crate::download::types::{PendingSubmission, SubmittedJob};
use crate::error::{EngineError, EngineResult};
use crate::locks::resilient_write;
use crate::remote::{
    delete_job, delete_kind, fetch_listing, is_capacity_text, value_to_id, OAuthApi, RemoteMap,
};

/// Pause between clearing the remote and the retry in an autoclear submit.
const AUTOCLEAR_SETTLE: Duration = Duration::from_secs(1);

/// Result of one submission attempt.
#[derive(Debug, Clone)]
pub enum Attempt {
    Admitted { job: SubmittedJob, response: RemoteMap },
    Full { response: RemoteMap },
}

/// Result of a submission as seen by the caller.
#[derive(Debug, Clone)]
pub enum Admission {
    Admitted { job: SubmittedJob, response: RemoteMap },
    /// Deferred to the pending FIFO.
    Enqueued { response: RemoteMap },
}

impl Admission {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Admission::Enqueued { .. })
    }

    pub fn response(&self) -> &RemoteMap {
        match self {
            Admission::Admitted { response, .. } | Admission::Enqueued { response } => response,
        }
    }
}

/// True when a submission response reports exhausted capacity.
pub fn is_capacity_response(response: &RemoteMap) -> bool {
    response
        .get("result")
        .and_then(Value::as_str)
        .map(is_capacity_text)
        .unwrap_or(false)
}

/// Clears the flag when a drain pass ends, even by panic.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Submits jobs and drains the pending FIFO.
pub struct QueueManager {
    api: Arc<dyn OAuthApi>,
    remote: RemoteConfig,
    config: QueueConfig,
    draining: AtomicBool,
}

impl QueueManager {
    pub fn new(api: Arc<dyn OAuthApi>, remote: RemoteConfig, config: QueueConfig) -> Self {
        Self {
            api,
            remote,
            config,
            draining: AtomicBool::new(false),
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.config.retry_delay()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// One submission attempt, no queueing.
    pub async fn try_submit(&self, uri: &str) -> EngineResult<Attempt> {
        let mut params = BTreeMap::new();
        params.insert(self.remote.download_uri_param.clone(), uri.to_string());

        let response = match self.api.query(&self.remote.download_uri_function, &params).await {
            Ok(response) => response,
            Err(EngineError::CapacityExhausted(reason)) => {
                tracing::debug!(reason = %reason, "Submission rejected for capacity");
                return Ok(Attempt::Full { response: RemoteMap::new() });
            }
            Err(e) => return Err(e),
        };

        if is_capacity_response(&response) {
            return Ok(Attempt::Full { response });
        }

        let cloud_id = response
            .get(&self.remote.cloud_item_id_key)
            .and_then(value_to_id)
            .ok_or_else(|| {
                EngineError::TransientRemote(format!(
                    "submission response has no `{}`",
                    self.remote.cloud_item_id_key
                ))
            })?;
        let hash = response
            .get(&self.remote.cloud_hash_key)
            .and_then(Value::as_str)
            .map(str::to_string);
        let name = response
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or(uri)
            .to_string();

        Ok(Attempt::Admitted {
            job: SubmittedJob { cloud_id, name, hash },
            response,
        })
    }

    /// Submit `uri`, deferring to the FIFO when the remote is full.
    ///
    /// With `autoclear`, a full remote is cleared once and the submission
    /// retried before deferring.
    pub async fn submit(
        &self,
        pool: &RwLock<DownloadPool>,
        association_id: &str,
        uri: &str,
        autoclear: bool,
        cancel: &CancellationToken,
    ) -> EngineResult<Admission> {
        let mut attempt = self.try_submit(uri).await?;

        if autoclear && matches!(attempt, Attempt::Full { .. }) {
            tracing::info!("Remote full; autoclear requested");
            self.escalate(cancel).await?;
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(AUTOCLEAR_SETTLE) => {}
            }
            attempt = self.try_submit(uri).await?;
        }

        match attempt {
            Attempt::Admitted { job, response } => {
                tracing::info!(cloud_id = %job.cloud_id, "Submission admitted");
                Ok(Admission::Admitted { job, response })
            }
            Attempt::Full { response } => {
                let pending = {
                    let mut pool = resilient_write(pool);
                    pool.push_pending(PendingSubmission::new(association_id, uri));
                    pool.pending_len()
                };
                tracing::info!(pending, "Remote full; submission deferred");
                Ok(Admission::Enqueued { response })
            }
        }
    }

    /// Delete every job the remote knows about. Returns how many were
    /// deleted; individual delete failures are logged and skipped.
    pub async fn escalate(&self, cancel: &CancellationToken) -> EngineResult<usize> {
        let jobs = fetch_listing(
            self.api.as_ref(),
            &self.remote.downloading_path_key,
            self.remote.poll_retries,
            self.remote.poll_interval(),
            cancel,
        )
        .await?;

        tracing::warn!(jobs = jobs.len(), "Remote capacity exhausted; clearing remote jobs");

        let mut deleted = 0;
        for job in &jobs {
            let kind = delete_kind(job, &self.remote.downloading_path_key);
            match delete_job(self.api.as_ref(), &job.id, &kind).await {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(cloud_id = %job.id, "Failed to delete remote job: {}", e),
            }
        }
        Ok(deleted)
    }

    /// Retry pending submissions until the FIFO is empty or `cancel` fires.
    ///
    /// Only one drain runs at a time; a call made while another drain is
    /// active returns `Ok(0)` immediately. `on_admitted` receives each
    /// admitted job with its association id.
    pub async fn drain<F>(
        &self,
        pool: &RwLock<DownloadPool>,
        cancel: &CancellationToken,
        on_admitted: F,
    ) -> EngineResult<usize>
    where
        F: Fn(SubmittedJob, String),
    {
        let mut admitted = 0;

        loop {
            if self.draining.swap(true, Ordering::SeqCst) {
                return Ok(admitted);
            }
            {
                let _guard = DrainGuard(&self.draining);
                admitted += self.drain_pass(pool, cancel, &on_admitted).await?;
            }
            // Pick up anything pushed while the guard was being released.
            let pending = resilient_write(pool).pending_len();
            if pending == 0 || cancel.is_cancelled() {
                return Ok(admitted);
            }
        }
    }

    async fn drain_pass<F>(
        &self,
        pool: &RwLock<DownloadPool>,
        cancel: &CancellationToken,
        on_admitted: &F,
    ) -> EngineResult<usize>
    where
        F: Fn(SubmittedJob, String),
    {
        let threshold = self.config.escalation_threshold.max(1);
        let mut failures: u32 = 0;
        let mut admitted = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(admitted);
            }
            let Some(next) = resilient_write(pool).pop_pending() else {
                return Ok(admitted);
            };

            match self.try_submit(&next.uri).await {
                Ok(Attempt::Admitted { job, .. }) => {
                    failures = 0;
                    admitted += 1;
                    tracing::info!(cloud_id = %job.cloud_id, "Deferred submission admitted");
                    on_admitted(job, next.association_id);
                    continue;
                }
                Ok(Attempt::Full { .. }) => {
                    resilient_write(pool).requeue_front(next);
                    failures += 1;
                    tracing::debug!(failures, "Remote still full");
                    if failures >= threshold {
                        if let Err(e) = self.escalate(cancel).await {
                            tracing::error!("Escalation failed: {}", e);
                        }
                        failures = 0;
                    }
                }
                Err(e) => {
                    resilient_write(pool).requeue_front(next);
                    tracing::warn!("Deferred submission failed: {}", e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(admitted),
                _ = tokio::time::sleep(self.config.retry_delay()) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Remote that is full for the first `full_for` submissions.
    struct FullRemote {
        full_for: usize,
        submissions: AtomicUsize,
        listings: AtomicUsize,
        deletes: Mutex<Vec<String>>,
    }

    impl FullRemote {
        fn new(full_for: usize) -> Self {
            Self {
                full_for,
                submissions: AtomicUsize::new(0),
                listings: AtomicUsize::new(0),
                deletes: Mutex::new(Vec::new()),
            }
        }
    }

    fn map(value: Value) -> RemoteMap {
        value.as_object().cloned().unwrap()
    }

    #[async_trait]
    impl OAuthApi for FullRemote {
        async fn query(&self, function: &str, params: &BTreeMap<String, String>) -> EngineResult<RemoteMap> {
            if function == "delete" {
                self.deletes.lock().unwrap().push(params["delete_arr"].clone());
                return Ok(map(json!({"result": "ok"})));
            }
            let n = self.submissions.fetch_add(1, Ordering::SeqCst);
            if n < self.full_for {
                Ok(map(json!({"result": "queue_full"})))
            } else {
                Ok(map(json!({"result": "ok", "id": 500 + n, "hash": "h", "title": "Movie"})))
            }
        }

        async fn api_call(
            &self,
            _path: &str,
            _method: &str,
            _params: &BTreeMap<String, String>,
        ) -> EngineResult<RemoteMap> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            Ok(map(json!({
                "transfers": [{"id": 1, "name": "a", "progress": "5", "progress_url": "/p/1"}],
                "folders": [{"id": 2, "name": "b", "size": 10}]
            })))
        }
    }

    fn manager(api: Arc<FullRemote>) -> QueueManager {
        QueueManager::new(
            api,
            RemoteConfig { poll_interval_ms: 1, ..RemoteConfig::default() },
            QueueConfig { retry_delay_ms: 1, escalation_threshold: 4 },
        )
    }

    #[test]
    fn test_capacity_detection() {
        assert!(is_capacity_response(&map(json!({"result": "error: queue_full"}))));
        assert!(is_capacity_response(&map(json!({"result": "not_enough_space"}))));
        assert!(!is_capacity_response(&map(json!({"result": "ok"}))));
        assert!(!is_capacity_response(&map(json!({"id": 3}))));
    }

    #[tokio::test]
    async fn test_submit_admitted() {
        let api = Arc::new(FullRemote::new(0));
        let queue = manager(api);
        let pool = RwLock::new(DownloadPool::new());
        let admission = queue
            .submit(&pool, "tt1", "magnet:x", false, &CancellationToken::new())
            .await
            .unwrap();
        match admission {
            Admission::Admitted { job, .. } => {
                assert_eq!(job.cloud_id, "500");
                assert_eq!(job.name, "Movie");
                assert_eq!(job.hash.as_deref(), Some("h"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_remote_defers() {
        let api = Arc::new(FullRemote::new(1));
        let queue = manager(api.clone());
        let pool = RwLock::new(DownloadPool::new());
        let admission = queue
            .submit(&pool, "tt1", "magnet:x", false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(admission.is_enqueued());
        assert_eq!(resilient_write(&pool).pending_len(), 1);
        assert_eq!(api.listings.load(Ordering::SeqCst), 0);
    }

    /// Remote whose client reports capacity as an error.
    struct RejectingRemote;

    #[async_trait]
    impl OAuthApi for RejectingRemote {
        async fn query(&self, _function: &str, _params: &BTreeMap<String, String>) -> EngineResult<RemoteMap> {
            Err(EngineError::CapacityExhausted("not_enough_space".to_string()))
        }

        async fn api_call(
            &self,
            _path: &str,
            _method: &str,
            _params: &BTreeMap<String, String>,
        ) -> EngineResult<RemoteMap> {
            Err(EngineError::TransientRemote("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_capacity_error_defers() {
        let queue = QueueManager::new(
            Arc::new(RejectingRemote),
            RemoteConfig::default(),
            QueueConfig { retry_delay_ms: 1, escalation_threshold: 4 },
        );
        assert!(matches!(queue.try_submit("magnet:x").await.unwrap(), Attempt::Full { .. }));

        let pool = RwLock::new(DownloadPool::new());
        let admission = queue
            .submit(&pool, "tt1", "magnet:x", false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(admission.is_enqueued());
        assert_eq!(resilient_write(&pool).pending_len(), 1);
    }

    #[tokio::test]
    async fn test_autoclear_escalates_once_then_retries() {
        let api = Arc::new(FullRemote::new(1));
        let queue = manager(api.clone());
        let pool = RwLock::new(DownloadPool::new());
        let admission = queue
            .submit(&pool, "tt1", "magnet:x", true, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!admission.is_enqueued());
        assert_eq!(api.listings.load(Ordering::SeqCst), 1);
        assert_eq!(api.deletes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_drain_escalates_after_four_failures() {
        let api = Arc::new(FullRemote::new(4));
        let queue = manager(api.clone());
        let pool = RwLock::new(DownloadPool::new());
        resilient_write(&pool).push_pending(PendingSubmission::new("tt1", "magnet:x"));

        let admitted_ids = Mutex::new(Vec::new());
        let admitted = queue
            .drain(&pool, &CancellationToken::new(), |job, assoc| {
                admitted_ids.lock().unwrap().push((job.cloud_id, assoc));
            })
            .await
            .unwrap();

        assert_eq!(admitted, 1);
        assert_eq!(api.submissions.load(Ordering::SeqCst), 5);
        assert_eq!(api.listings.load(Ordering::SeqCst), 1);

        let deletes = api.deletes.lock().unwrap();
        assert_eq!(deletes.len(), 2);
        assert!(deletes[0].contains(r#""type":"transfer""#));
        assert!(deletes[1].contains(r#""type":"folder""#));

        assert_eq!(admitted_ids.lock().unwrap()[0], ("504".to_string(), "tt1".to_string()));
        assert_eq!(resilient_write(&pool).pending_len(), 0);
        assert!(!queue.is_draining());
    }

    #[tokio::test]
    async fn test_drain_stops_on_cancel() {
        let api = Arc::new(FullRemote::new(usize::MAX));
        let queue = manager(api);
        let pool = RwLock::new(DownloadPool::new());
        resilient_write(&pool).push_pending(PendingSubmission::new("tt1", "magnet:x"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let admitted = queue.drain(&pool, &cancel, |_, _| {}).await.unwrap();
        assert_eq!(admitted, 0);
        assert_eq!(resilient_write(&pool).pending_len(), 1);
    }
}
