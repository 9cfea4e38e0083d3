// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download manager: the engine that owns the pool.
//!
//! Everything that touches the pool goes through [`DownloadManager`]. The
//! pool sits behind a std `RwLock` that is only ever held for short,
//! synchronous sections; every network call, process spawn and file move
//! happens with the lock released.
//!
//! Background work (one watcher per submitted job, one transfer and monitor
//! per client download, the queue drain) runs on tokio tasks that own a
//! child of the manager's root [`CancellationToken`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::commands::{ExternalCommands, ProcessCommands};
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::locks::{resilient_read, resilient_write};
use crate::queue::{Admission, QueueManager};
use crate::remote::oauth::HttpOAuthClient;
use crate::remote::resolver::HttpMovieResolver;
use crate::remote::watcher::{JobWatcher, WatchOutcome};
use crate::remote::{delete_job, fetch_listing, MovieResolver, OAuthApi};
use crate::scan::{disk_cloud_id, CommandStatusReader, DiskScanner, StatusReader};
use crate::transfer::{move_file, TransferOutcome, TransferRequest, TransferWorker};
use crate::utils::renamed_file_name;
use super::ops::{Condition, GatedOp};
use super::persist::SnapshotStore;
use super::state::DownloadPool;
use super::types::{DownloadItem, SubmittedJob, PROGRESS_DONE};

/// Collaborators the manager talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn OAuthApi>,
    pub resolver: Arc<dyn MovieResolver>,
    pub commands: Arc<dyn ExternalCommands>,
    pub status: Arc<dyn StatusReader>,
}

impl Collaborators {
    /// Production collaborators built from the config.
    pub fn from_config(config: &Config) -> EngineResult<Self> {
        let commands: Arc<dyn ExternalCommands> =
            Arc::new(ProcessCommands::new(config.commands.clone()));
        Ok(Self {
            api: Arc::new(HttpOAuthClient::new(config.oauth.clone())?),
            resolver: Arc::new(HttpMovieResolver::new(config.metadata_url.clone())?),
            status: Arc::new(CommandStatusReader::new(
                Arc::clone(&commands),
                config.placeholder_suffix.clone(),
            )),
            commands,
        })
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total: usize,
    pub associated: usize,
    pub unassociated: usize,
    pub pending: usize,
}

struct Inner {
    config: Config,
    pool: RwLock<DownloadPool>,
    store: SnapshotStore,
    /// Serializes snapshot writes.
    save_lock: Mutex<()>,
    scanner: DiskScanner,
    collaborators: Collaborators,
    watcher: JobWatcher,
    transfer: TransferWorker,
    queue: QueueManager,
    shutdown: CancellationToken,
    /// Cancellation tokens of active watchers and transfers, by cloud id.
    jobs: RwLock<HashMap<String, CancellationToken>>,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

impl DownloadManager {
    /// Create a manager with explicit collaborators. The pool starts empty;
    /// call [`read_from_disk`](Self::read_from_disk) to populate it.
    pub fn new(config: Config, collaborators: Collaborators) -> EngineResult<Self> {
        let transfer = TransferWorker::new(&config.transfer, config.temp_dir.clone())?;
        let watcher = JobWatcher::new(Arc::clone(&collaborators.api), config.remote.clone());
        let queue = QueueManager::new(
            Arc::clone(&collaborators.api),
            config.remote.clone(),
            config.queue.clone(),
        );

        let inner = Inner {
            store: SnapshotStore::new(config.snapshot_path.clone()),
            scanner: DiskScanner::from_config(&config),
            pool: RwLock::new(DownloadPool::new()),
            save_lock: Mutex::new(()),
            collaborators,
            watcher,
            transfer,
            queue,
            shutdown: CancellationToken::new(),
            jobs: RwLock::new(HashMap::new()),
            config,
        };

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Create a manager with the production collaborators.
    pub fn from_config(config: Config) -> EngineResult<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::new(config, collaborators)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The remote API, for pass-through calls.
    pub fn api(&self) -> Arc<dyn OAuthApi> {
        Arc::clone(&self.inner.collaborators.api)
    }

    // ---------------------------------------------------------------------
    // Reconciliation and persistence
    // ---------------------------------------------------------------------

    /// Startup: scan synced storage, then merge the saved snapshot.
    pub async fn read_from_disk(&self) -> EngineResult<()> {
        self.refresh_disk_downloads().await?;

        let store = self.inner.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(EngineError::internal)?;
        let records = match loaded {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Ignoring unreadable snapshot: {:#}", e);
                Vec::new()
            }
        };

        let stats = {
            let mut pool = resilient_write(&self.inner.pool);
            pool.restore(&records);
            stats_of(&pool)
        };
        tracing::info!(
            total = stats.total,
            associated = stats.associated,
            "Loaded {} snapshot records",
            records.len()
        );
        Ok(())
    }

    /// Write the pool snapshot. Concurrent saves are serialized.
    pub async fn save_to_disk(&self) -> EngineResult<()> {
        self.inner.save().await
    }

    /// Rescan synced storage and replace every disk item.
    pub async fn refresh_disk_downloads(&self) -> EngineResult<usize> {
        self.inner.refresh_disk_downloads().await
    }

    /// Fetch the remote listing and reconcile oauth items against it.
    /// Returns the number of derelicts removed.
    pub async fn refresh_remote(&self) -> EngineResult<usize> {
        let removed = self.inner.refresh_remote().await?;
        self.inner.save().await?;
        Ok(removed)
    }

    /// Refresh from both sources and return the pool. A remote failure is
    /// logged; the disk view is still refreshed.
    pub async fn get_downloads(&self) -> EngineResult<Vec<DownloadItem>> {
        if let Err(e) = self.inner.refresh_remote().await {
            tracing::warn!("Remote refresh failed: {}", e);
        }
        self.inner.refresh_disk_downloads().await?;
        self.inner.save().await?;
        Ok(self.downloads())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn downloads(&self) -> Vec<DownloadItem> {
        resilient_read(&self.inner.pool).downloads()
    }

    pub fn get(&self, cloud_id: &str) -> Option<DownloadItem> {
        resilient_read(&self.inner.pool).get(cloud_id).cloned()
    }

    pub fn collections(&self) -> BTreeMap<String, usize> {
        resilient_read(&self.inner.pool).collections().clone()
    }

    pub fn associated_ids(&self) -> Vec<String> {
        resilient_read(&self.inner.pool).associated_ids()
    }

    pub fn stats(&self) -> PoolStats {
        stats_of(&resilient_read(&self.inner.pool))
    }

    /// Attach an association id to an item.
    pub async fn associate(&self, cloud_id: &str, association_id: &str) -> EngineResult<()> {
        resilient_write(&self.inner.pool).associate(cloud_id, association_id)?;
        self.inner.save().await
    }

    // ---------------------------------------------------------------------
    // Submission and background work
    // ---------------------------------------------------------------------

    /// Submit `uri` to the remote. Admitted jobs are registered and watched;
    /// deferred ones are retried by the queue drain.
    pub async fn submit(&self, uri: &str, association_id: &str, autoclear: bool) -> EngineResult<Admission> {
        let admission = self
            .inner
            .queue
            .submit(&self.inner.pool, association_id, uri, autoclear, &self.inner.shutdown)
            .await?;

        match &admission {
            Admission::Admitted { job, .. } => {
                self.inner.register_admitted(job, association_id);
                self.inner.save().await?;
            }
            Admission::Enqueued { .. } => {
                self.inner.schedule_drain(self.inner.queue.retry_delay());
            }
        }
        Ok(admission)
    }

    /// Start a client transfer of `uri` for an existing item.
    pub async fn start_background_download(&self, cloud_id: &str, uri: &str, file_name: &str) -> EngineResult<()> {
        let expected_size = {
            let pool = resilient_read(&self.inner.pool);
            let item = pool.require(cloud_id)?;
            if item.is_downloading_client {
                return Err(EngineError::PreconditionFailed("isDownloadingClient".to_string()));
            }
            item.size
        };

        let request = TransferRequest {
            cloud_id: cloud_id.to_string(),
            url: uri.to_string(),
            file_name: file_name.to_string(),
            expected_size,
        };
        self.inner.spawn_transfer(request);
        Ok(())
    }

    /// Cancel the watcher or transfer running for `cloud_id`.
    pub fn cancel_job(&self, cloud_id: &str) -> EngineResult<()> {
        let token = resilient_read(&self.inner.jobs)
            .get(cloud_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(cloud_id.to_string()))?;
        token.cancel();
        tracing::info!(cloud_id, "Cancelled background job");
        Ok(())
    }

    /// Number of watchers and transfers still running.
    pub fn active_jobs(&self) -> usize {
        resilient_read(&self.inner.jobs).len()
    }

    /// Stop all background work and write a final snapshot.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.inner.shutdown.cancel();
        self.inner.save().await
    }

    /// Token cancelled by [`shutdown`](Self::shutdown).
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // ---------------------------------------------------------------------
    // Gated operations
    // ---------------------------------------------------------------------

    /// Drop the local copy of a fully synced file.
    pub async fn evict(&self, cloud_id: &str) -> EngineResult<()> {
        let path = self.inner.checked_path(cloud_id, GatedOp::Evict)?;
        self.inner.collaborators.commands.evict(&path.on_disk).await?;

        if let Some(item) = resilient_write(&self.inner.pool).get_mut(cloud_id) {
            item.is_local_to_client = false;
        }
        self.inner.save().await
    }

    /// Move a file into `<root>/<collection>/`. Returns the new cloud id.
    pub async fn add_to_collection(&self, cloud_id: &str, collection: &str) -> EngineResult<String> {
        let collection = collection.trim_matches('/');
        if collection.is_empty() || collection.contains('/') || collection == ".." {
            return Err(EngineError::PreconditionFailed(format!("invalid collection name {:?}", collection)));
        }

        let path = self.inner.checked_path(cloud_id, GatedOp::AddToCollection)?;
        let missing = || EngineError::PreconditionFailed(Condition::HasLocalPath.name().to_string());
        let dir = self.inner.scanner.root().join(collection);
        let dest = dir.join(path.on_disk.file_name().ok_or_else(missing)?);
        let materialized = dir.join(path.materialized.file_name().ok_or_else(missing)?);

        move_file(&path.on_disk, &dest).await?;
        let new_id = self
            .inner
            .append_filler(cloud_id, materialized, Some(collection.to_string()))?;
        tracing::info!(cloud_id, collection, "Moved into collection");
        self.inner.save().await?;
        Ok(new_id)
    }

    /// Rename a file after `title`, keeping its extension. Returns the new
    /// file name.
    pub async fn rename(&self, cloud_id: &str, title: &str) -> EngineResult<String> {
        self.inner.rename(cloud_id, title).await
    }

    /// Streamable URL for a synced file.
    pub async fn stream_url(&self, cloud_id: &str) -> EngineResult<String> {
        let path = self.inner.checked_path(cloud_id, GatedOp::GetStreamUrl)?;
        self.inner.collaborators.commands.stream_link(&path.on_disk).await
    }
}

fn stats_of(pool: &DownloadPool) -> PoolStats {
    let (associated, unassociated) = pool.association_counts();
    PoolStats {
        total: pool.len(),
        associated,
        unassociated,
        pending: pool.pending_len(),
    }
}

/// Paths of an item that passed its gate.
struct ItemPath {
    /// The file's path once materialized; cloud ids derive from it.
    materialized: PathBuf,
    /// The file actually present: the placeholder when the content is not
    /// local.
    on_disk: PathBuf,
}

/// Removes a job's token when its task ends.
struct JobGuard {
    inner: Arc<Inner>,
    cloud_id: String,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        resilient_write(&self.inner.jobs).remove(&self.cloud_id);
    }
}

impl Inner {
    async fn save(&self) -> EngineResult<()> {
        let _guard = self.save_lock.lock().await;
        let (records, stats) = {
            let pool = resilient_read(&self.pool);
            (pool.snapshot(), stats_of(&pool))
        };

        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.save(&records))
            .await
            .map_err(EngineError::internal)?
            .map_err(EngineError::internal)?;

        tracing::info!(
            total = stats.total,
            associated = stats.associated,
            unassociated = stats.unassociated,
            "Saved download pool"
        );
        Ok(())
    }

    async fn refresh_disk_downloads(&self) -> EngineResult<usize> {
        let status = match self.collaborators.status.read_status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("Sync status unavailable, scanning without it: {}", e);
                Default::default()
            }
        };

        let scanner = self.scanner.clone();
        let result = tokio::task::spawn_blocking(move || scanner.scan(&status))
            .await
            .map_err(EngineError::internal)?;
        let count = result.items.len();

        resilient_write(&self.pool).replace_disk_items(result);
        Ok(count)
    }

    async fn refresh_remote(&self) -> EngineResult<usize> {
        let fetched_at = resilient_read(&self.pool).generation();
        let jobs = fetch_listing(
            self.collaborators.api.as_ref(),
            &self.config.remote.downloading_path_key,
            self.config.remote.poll_retries,
            self.config.remote.poll_interval(),
            &self.shutdown,
        )
        .await?;
        Ok(resilient_write(&self.pool).refresh_download_states(&jobs, fetched_at))
    }

    /// Look up `cloud_id`, check `op`'s preconditions, return its paths.
    fn checked_path(&self, cloud_id: &str, op: GatedOp) -> EngineResult<ItemPath> {
        let pool = resilient_read(&self.pool);
        let item = pool.require(cloud_id)?;
        op.check(item)?;
        let materialized = item
            .local_path
            .clone()
            .ok_or_else(|| EngineError::PreconditionFailed(Condition::HasLocalPath.name().to_string()))?;
        let on_disk = self.scanner.on_disk_path(&materialized, item.is_local_to_client);
        Ok(ItemPath { materialized, on_disk })
    }

    /// Append a filler entry for `cloud_id`'s item at `new_path`.
    fn append_filler(&self, cloud_id: &str, new_path: PathBuf, collection: Option<String>) -> EngineResult<String> {
        let new_id = disk_cloud_id(&new_path);
        let name = new_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut pool = resilient_write(&self.pool);
        let mut filler = pool.require(cloud_id)?.filler(new_id.clone(), name, new_path);
        if collection.is_some() {
            filler.collection = collection;
        }
        pool.append(filler);
        Ok(new_id)
    }

    async fn rename(&self, cloud_id: &str, title: &str) -> EngineResult<String> {
        // Rename requires local content, so the materialized path is on disk.
        let path = self.checked_path(cloud_id, GatedOp::Rename)?.materialized;
        let new_name = renamed_file_name(title, &path);
        if new_name.is_empty() || new_name.starts_with('.') {
            return Err(EngineError::PreconditionFailed(format!("title {:?} yields no file name", title)));
        }
        let dest = path.with_file_name(&new_name);
        if dest == path {
            return Ok(new_name);
        }

        tokio::fs::rename(&path, &dest).await?;
        self.append_filler(cloud_id, dest, None)?;
        tracing::info!(cloud_id, new_name = %new_name, "Renamed download");
        self.save().await?;
        Ok(new_name)
    }

    fn register_admitted(self: &Arc<Self>, job: &SubmittedJob, association_id: &str) {
        resilient_write(&self.pool).register_oauth_start(job, association_id);
        self.spawn_watch(job.cloud_id.clone());
    }

    /// Register a cancellation token for a background job.
    fn job_token(self: &Arc<Self>, cloud_id: &str) -> (CancellationToken, JobGuard) {
        let token = self.shutdown.child_token();
        resilient_write(&self.jobs).insert(cloud_id.to_string(), token.clone());
        let guard = JobGuard {
            inner: Arc::clone(self),
            cloud_id: cloud_id.to_string(),
        };
        (token, guard)
    }

    fn spawn_watch(self: &Arc<Self>, cloud_id: String) {
        let inner = Arc::clone(self);
        let (token, guard) = self.job_token(&cloud_id);
        tokio::spawn(async move {
            match inner.watch_job(&cloud_id, &token).await {
                Ok(Some(request)) => {
                    // The transfer takes over the job slot.
                    drop(guard);
                    inner.spawn_transfer(request);
                }
                Ok(None) => {}
                Err(e) => tracing::error!(cloud_id = %cloud_id, "Watching remote job failed: {}", e),
            }
        });
    }

    /// Watch a job until the remote finishes it, then resolve what to fetch.
    async fn watch_job(&self, cloud_id: &str, token: &CancellationToken) -> EngineResult<Option<TransferRequest>> {
        let outcome = self
            .watcher
            .watch(
                cloud_id,
                token,
                || resilient_read(&self.pool).generation(),
                |jobs, fetched_at| {
                    resilient_write(&self.pool).refresh_download_states(jobs, fetched_at);
                },
            )
            .await;
        self.save().await?;

        let job = match outcome? {
            WatchOutcome::Completed(job) => job,
            WatchOutcome::Vanished | WatchOutcome::Cancelled => return Ok(None),
        };

        let file = self.watcher.select_playable(cloud_id).await?;
        let url = self.watcher.resolve_url(&file).await?;
        Ok(Some(TransferRequest {
            cloud_id: cloud_id.to_string(),
            url,
            file_name: file.name,
            expected_size: if file.size > 0 { file.size } else { job.size },
        }))
    }

    fn spawn_transfer(self: &Arc<Self>, request: TransferRequest) {
        if let Some(item) = resilient_write(&self.pool).get_mut(&request.cloud_id) {
            item.is_downloading_client = true;
            item.has_downloaded_client = false;
            item.progress = 0.0;
            item.time_started = Utc::now().timestamp();
        }

        let inner = Arc::clone(self);
        let (token, guard) = self.job_token(&request.cloud_id);
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = inner.run_transfer(&request, &token).await {
                tracing::error!(cloud_id = %request.cloud_id, "Transfer failed: {}", e);
            }
        });
    }

    async fn run_transfer(self: &Arc<Self>, request: &TransferRequest, token: &CancellationToken) -> EngineResult<()> {
        let sink = Arc::clone(self);
        let cloud_id = request.cloud_id.clone();
        let result = self
            .transfer
            .download(request, token, move |sample| {
                resilient_write(&sink.pool).apply_progress(&cloud_id, &sample);
            })
            .await;

        match result {
            Ok(outcome) => self.finish_transfer(request, outcome).await,
            Err(e) => {
                if let Some(item) = resilient_write(&self.pool).get_mut(&request.cloud_id) {
                    item.is_downloading_client = false;
                    item.progress = 0.0;
                    item.progress_velocity = 0.0;
                }
                self.save().await?;
                Err(e)
            }
        }
    }

    async fn finish_transfer(self: &Arc<Self>, request: &TransferRequest, outcome: TransferOutcome) -> EngineResult<()> {
        // Remote file names may carry directories; only the last component lands.
        let file_name = Path::new(&request.file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.bin", request.cloud_id));
        let dest = self.scanner.root().join(&file_name);
        if let Err(e) = move_file(&outcome.temp_path, &dest).await {
            if let Some(item) = resilient_write(&self.pool).get_mut(&request.cloud_id) {
                item.is_downloading_client = false;
            }
            return Err(e);
        }

        let disk_id = disk_cloud_id(&dest);
        let association_id = {
            let mut pool = resilient_write(&self.pool);
            let association_id = match pool.get_mut(&request.cloud_id) {
                Some(item) => {
                    item.progress = PROGRESS_DONE;
                    item.is_downloading_client = false;
                    item.has_downloaded_client = true;
                    item.association_id.clone()
                }
                None => String::new(),
            };

            let mut entry = DownloadItem::disk(disk_id.clone(), file_name.as_str(), dest.clone());
            entry.association_id = association_id.clone();
            entry.size = i64::try_from(outcome.bytes).unwrap_or(-1);
            entry.progress = PROGRESS_DONE;
            entry.is_local_to_client = true;
            entry.is_uploading_client = true;
            entry.collection = self.scanner.collection_of(&dest);
            pool.append(entry);
            association_id
        };
        tracing::info!(
            cloud_id = %request.cloud_id,
            bytes = outcome.bytes,
            "Transfer complete: {:?}",
            dest
        );

        if let Err(e) = delete_job(self.collaborators.api.as_ref(), &request.cloud_id, "folder").await {
            tracing::warn!(cloud_id = %request.cloud_id, "Failed to delete remote copy: {}", e);
        }

        if !association_id.is_empty() {
            match self.collaborators.resolver.resolve_imdb(&association_id).await {
                Ok(meta) => {
                    let title = meta.get("title").and_then(|t| t.as_str()).unwrap_or_default();
                    if let Err(e) = self.rename(&disk_id, title).await {
                        tracing::warn!(cloud_id = %disk_id, "Rename after transfer failed: {}", e);
                    }
                }
                Err(e) => tracing::warn!(association_id = %association_id, "Metadata lookup failed: {}", e),
            }
        }

        if let Err(e) = self.refresh_remote().await {
            tracing::warn!("Remote refresh after transfer failed: {}", e);
        }
        self.save().await?;
        self.schedule_drain(Duration::ZERO);
        Ok(())
    }

    /// Run the queue drain after `delay`, unless one is already running.
    fn schedule_drain(self: &Arc<Self>, delay: Duration) {
        if resilient_read(&self.pool).pending_len() == 0 {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let token = inner.shutdown.child_token();
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let registrar = Arc::clone(&inner);
            let result = inner
                .queue
                .drain(&inner.pool, &token, move |job, association_id| {
                    registrar.register_admitted(&job, &association_id);
                })
                .await;

            match result {
                Ok(0) => {}
                Ok(admitted) => {
                    tracing::info!(admitted, "Queue drain admitted deferred submissions");
                    if let Err(e) = inner.save().await {
                        tracing::error!("Failed to save after drain: {}", e);
                    }
                }
                Err(e) => tracing::error!("Queue drain failed: {}", e),
            }
        });
    }
}
