// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory pool state and reconciliation.
//!
//! The pool merges three sources that each see only part of the picture:
//! the disk scan (replaces every disk item at once), the remote listing
//! (updates oauth items one record at a time and sweeps derelicts) and the
//! persisted snapshot (restores oauth items and disk associations at
//! startup).
//!
//! Items are kept in an [`IndexMap`] keyed by cloud id, so lookups are O(1),
//! ordering is stable, and sweeps are a single `retain`.

use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::error::{EngineError, EngineResult};
use crate::remote::RemoteJob;
use crate::scan::ScanResult;
use super::types::{
    DownloadItem, PendingSubmission, PersistedRecord, ProgressSample, SourceKind, SubmittedJob,
};

/// Shared pool of download items.
#[derive(Debug, Default)]
pub struct DownloadPool {
    items: IndexMap<String, DownloadItem>,
    collections: BTreeMap<String, usize>,
    pending: VecDeque<PendingSubmission>,
    generation: u64,
    /// Generation at which each submission not yet confirmed by a listing
    /// was registered.
    registered: HashMap<String, u64>,
}

impl DownloadPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, cloud_id: &str) -> Option<&DownloadItem> {
        self.items.get(cloud_id)
    }

    pub fn get_mut(&mut self, cloud_id: &str) -> Option<&mut DownloadItem> {
        self.items.get_mut(cloud_id)
    }

    /// Lookup that reports a missing id as `NotFound`.
    pub fn require(&self, cloud_id: &str) -> EngineResult<&DownloadItem> {
        self.items
            .get(cloud_id)
            .ok_or_else(|| EngineError::NotFound(cloud_id.to_string()))
    }

    /// Ordered copy of every item.
    pub fn downloads(&self) -> Vec<DownloadItem> {
        self.items.values().cloned().collect()
    }

    /// Replace the disk-origin subset with a fresh scan.
    ///
    /// Associations are carried forward by cloud id from the disk items being
    /// replaced. Oauth items are untouched.
    pub fn replace_disk_items(&mut self, scan: ScanResult) {
        let associations: HashMap<String, String> = self
            .items
            .values()
            .filter(|it| it.is_disk() && it.is_associated())
            .map(|it| (it.cloud_id.clone(), it.association_id.clone()))
            .collect();

        self.items.retain(|_, it| !it.is_disk());

        for mut item in scan.items {
            if item.association_id.is_empty() {
                if let Some(assoc) = associations.get(&item.cloud_id) {
                    item.association_id = assoc.clone();
                }
            }
            self.items.insert(item.cloud_id.clone(), item);
        }

        self.collections = scan.collections;
    }

    /// Merge a loaded snapshot into a pool that already holds a scan.
    ///
    /// Oauth records come back as cloud-complete, idle items. Disk records
    /// only contribute their association to the matching scanned item.
    pub fn restore(&mut self, records: &[PersistedRecord]) {
        let mut restored = 0;
        let mut merged = 0;

        for record in records.iter().filter(|r| r.source == SourceKind::OAuth) {
            if self.items.contains_key(&record.id) {
                continue;
            }
            self.items
                .insert(record.id.clone(), DownloadItem::oauth_restored(record));
            restored += 1;
        }

        for record in records.iter().filter(|r| r.source == SourceKind::Disk) {
            if let Some(item) = self.items.get_mut(&record.id) {
                if item.is_disk() {
                    item.association_id = record.imdb_id.clone();
                    merged += 1;
                }
            }
        }

        tracing::debug!(restored, merged, "Restored pool snapshot");
    }

    /// Durable projection of the whole pool, in order.
    pub fn snapshot(&self) -> Vec<PersistedRecord> {
        self.items.values().map(DownloadItem::to_record).collect()
    }

    /// (associated, unassociated) item counts.
    pub fn association_counts(&self) -> (usize, usize) {
        let associated = self.items.values().filter(|it| it.is_associated()).count();
        (associated, self.items.len() - associated)
    }

    /// Registration counter. Stamp a listing with this before fetching it
    /// and pass the stamp to
    /// [`refresh_download_states`](Self::refresh_download_states).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Add a just-submitted job at the front of the pool.
    pub fn register_oauth_start(&mut self, job: &SubmittedJob, association_id: &str) {
        self.generation += 1;
        self.registered.insert(job.cloud_id.clone(), self.generation);
        let item = DownloadItem::oauth_started(job, association_id);
        self.items.shift_insert(0, item.cloud_id.clone(), item);
    }

    /// Reconcile oauth items against one listing batch fetched at
    /// generation `fetched_at`.
    ///
    /// Returns the number of derelict items removed. Items mid-transfer to the
    /// client are kept; their remote copy is deleted by the transfer itself.
    /// Items registered after the fetch started cannot be in the batch and
    /// are kept too.
    pub fn refresh_download_states(&mut self, jobs: &[RemoteJob], fetched_at: u64) -> usize {
        let listed: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();

        for job in jobs {
            let key = self.find_oauth_key(job, &listed);

            let item = match key {
                Some(key) if key != job.id => self.rekey(&key, &job.id),
                Some(key) => self.items.get_mut(&key),
                None => {
                    let item = DownloadItem::oauth_discovered(&job.id, &job.name);
                    self.items.insert(job.id.clone(), item);
                    self.items.get_mut(&job.id)
                }
            };

            let Some(item) = item else { continue };
            match job.progress {
                Some(progress) => {
                    item.progress = progress;
                    item.is_downloading_cloud = true;
                    item.has_downloaded_cloud = false;
                }
                None => {
                    item.is_downloading_cloud = false;
                    item.has_downloaded_cloud = true;
                }
            }
            item.size = job.size;
        }

        let registered = &self.registered;
        let before = self.items.len();
        self.items.retain(|id, it| {
            it.source != SourceKind::OAuth
                || listed.contains(id.as_str())
                || it.is_downloading_client
                || registered.get(id).map_or(false, |at| *at > fetched_at)
        });
        let removed = before - self.items.len();

        // Once a listing fetched after registration has been applied, the
        // listing alone decides.
        let items = &self.items;
        self.registered
            .retain(|id, at| *at > fetched_at && items.contains_key(id));

        if removed > 0 {
            tracing::info!(removed, "Swept derelict remote jobs");
        }
        removed
    }

    /// Pool key for `job`: the item with its id, or else an oauth item with
    /// its name that the batch does not list under its own id.
    fn find_oauth_key(&self, job: &RemoteJob, listed: &HashSet<&str>) -> Option<String> {
        if self.items.get(&job.id).map_or(false, DownloadItem::is_oauth) {
            return Some(job.id.clone());
        }
        if job.name.is_empty() {
            return None;
        }
        self.items
            .values()
            .find(|it| it.is_oauth() && it.name == job.name && !listed.contains(it.cloud_id.as_str()))
            .map(|it| it.cloud_id.clone())
    }

    /// Move an item to a new key, keeping its position.
    fn rekey(&mut self, old: &str, new: &str) -> Option<&mut DownloadItem> {
        let (index, _, mut item) = self.items.shift_remove_full(old)?;
        if let Some(at) = self.registered.remove(old) {
            self.registered.insert(new.to_string(), at);
        }
        item.cloud_id = new.to_string();
        let index = index.min(self.items.len());
        self.items.shift_insert(index, new.to_string(), item);
        self.items.get_mut(new)
    }

    /// Set an item's association id.
    pub fn associate(&mut self, cloud_id: &str, association_id: &str) -> EngineResult<()> {
        let item = self
            .items
            .get_mut(cloud_id)
            .ok_or_else(|| EngineError::NotFound(cloud_id.to_string()))?;
        item.association_id = association_id.to_string();
        tracing::info!(cloud_id, association_id, "Associated download");
        Ok(())
    }

    /// Every non-empty association id.
    pub fn associated_ids(&self) -> Vec<String> {
        self.items
            .values()
            .filter(|it| it.is_associated())
            .map(|it| it.association_id.clone())
            .collect()
    }

    pub fn collections(&self) -> &BTreeMap<String, usize> {
        &self.collections
    }

    /// Append an item, replacing any existing item with the same id in place.
    pub fn append(&mut self, item: DownloadItem) {
        self.items.insert(item.cloud_id.clone(), item);
    }

    /// Apply a transfer progress sample to an item.
    pub fn apply_progress(&mut self, cloud_id: &str, sample: &ProgressSample) {
        if let Some(item) = self.items.get_mut(cloud_id) {
            item.progress = sample.progress;
            match sample.velocity {
                Some(v) => item.progress_velocity = v,
                None => item.progress_velocity = 0.0,
            }
            item.avg_progress_velocity = sample.avg_velocity;
            item.velocity_sample_count = sample.sample_count;
        }
    }

    pub fn push_pending(&mut self, submission: PendingSubmission) {
        self.pending.push_back(submission);
    }

    /// Put a submission back at the head after a failed attempt.
    pub fn requeue_front(&mut self, submission: PendingSubmission) {
        self.pending.push_front(submission);
    }

    pub fn pop_pending(&mut self) -> Option<PendingSubmission> {
        self.pending.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
