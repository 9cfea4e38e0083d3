// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Synced storage scanner.
//!
//! Walks the synced root and turns every media file into a disk-origin
//! [`DownloadItem`]. Whether a file is materialized comes from its name (the
//! placeholder suffix); whether it finished uploading comes from the sync
//! client's status report.
//!
//! # Classification
//!
//! | On disk            | Status      | local | uploading | uploaded |
//! |--------------------|-------------|-------|-----------|----------|
//! | `.Name.ext.icloud` | any         | no    | no        | yes      |
//! | `Name.ext`         | evictable   | yes   | no        | yes      |
//! | `Name.ext`         | otherwise   | yes   | yes       | no       |

pub mod status;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::Config;
use crate::download::types::DownloadItem;
use status::{materialized_name, placeholder_name, StatusMap};

pub use status::{parse_status_report, CommandStatusReader, FileStatus, StatusReader};

/// Prefix of every disk-origin cloud id.
pub const DISK_ID_PREFIX: &str = "icloud_";

/// Output of one scan.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub items: Vec<DownloadItem>,
    /// Collection name to number of media files in it.
    pub collections: BTreeMap<String, usize>,
}

/// Cloud id of the file at `materialized_path`.
pub fn disk_cloud_id(materialized_path: &Path) -> String {
    format!("{}{}", DISK_ID_PREFIX, materialized_path.display())
}

/// Walks the synced root.
#[derive(Debug, Clone)]
pub struct DiskScanner {
    root: PathBuf,
    placeholder_suffix: String,
    media_extensions: Vec<String>,
}

impl DiskScanner {
    pub fn new(
        root: impl Into<PathBuf>,
        placeholder_suffix: impl Into<String>,
        media_extensions: Vec<String>,
    ) -> Self {
        Self {
            root: root.into(),
            placeholder_suffix: placeholder_suffix.into(),
            media_extensions: media_extensions
                .into_iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.synced_root.clone(),
            config.placeholder_suffix.clone(),
            config.media_extensions.clone(),
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path a file will have once materialized, and whether it is a
    /// placeholder now.
    pub fn materialized_path(&self, path: &Path) -> (PathBuf, bool) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return (path.to_path_buf(), false);
        };
        match materialized_name(name, &self.placeholder_suffix) {
            (real, true) => (path.with_file_name(real), true),
            (_, false) => (path.to_path_buf(), false),
        }
    }

    /// Where the file for `materialized` sits on disk: the file itself when
    /// its content is local, its placeholder otherwise.
    pub fn on_disk_path(&self, materialized: &Path, is_local: bool) -> PathBuf {
        if is_local || self.placeholder_suffix.is_empty() {
            return materialized.to_path_buf();
        }
        match materialized.file_name().and_then(|n| n.to_str()) {
            Some(name) => materialized.with_file_name(placeholder_name(name, &self.placeholder_suffix)),
            None => materialized.to_path_buf(),
        }
    }

    pub fn is_media(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.media_extensions.iter().any(|m| m.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    /// First directory under the root, for nested files.
    pub fn collection_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let mut components = relative.components();
        let first = components.next()?;
        // A file directly under the root has no collection.
        components.next()?;
        Some(first.as_os_str().to_string_lossy().into_owned())
    }

    /// Walk the root and classify every media file.
    ///
    /// Blocking; run it off the async runtime.
    pub fn scan(&self, status: &StatusMap) -> ScanResult {
        let mut result = ScanResult::default();

        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let (path, placeholder) = self.materialized_path(entry.path());
            if !self.is_media(&path) {
                continue;
            }
            // Unreadable entries are left out of the pool.
            let Ok(metadata) = entry.metadata() else {
                continue;
            };

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let file_status = status.get(&name);
            let mut item = DownloadItem::disk(disk_cloud_id(&path), name.as_str(), path.clone());

            if placeholder {
                item.is_local_to_client = false;
                item.is_uploading_client = false;
                item.has_uploaded_client = true;
                match file_status {
                    Some(FileStatus { size: Some(size), .. }) => item.size = *size,
                    _ => {
                        tracing::warn!(file = %name, "Placeholder has no reported size");
                        item.size = -1;
                    }
                }
                if matches!(file_status, Some(s) if !s.evictable) {
                    tracing::warn!(file = %name, "status mismatch: placeholder reported as not evictable");
                }
            } else {
                let evictable = file_status.map(|s| s.evictable).unwrap_or(false);
                item.is_local_to_client = true;
                item.is_uploading_client = !evictable;
                item.has_uploaded_client = evictable;
                item.size = i64::try_from(metadata.len()).unwrap_or(-1);
            }

            if let Some(collection) = self.collection_of(&path) {
                *result.collections.entry(collection.clone()).or_insert(0) += 1;
                item.collection = Some(collection);
            }

            result.items.push(item);
        }

        tracing::debug!(
            items = result.items.len(),
            collections = result.collections.len(),
            "Scanned {:?}",
            self.root
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn scanner(root: &Path) -> DiskScanner {
        DiskScanner::new(
            root,
            ".icloud",
            vec!["mp4".to_string(), "mkv".to_string()],
        )
    }

    fn touch(path: &Path, bytes: usize) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_classification() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let root = dir.path();
        touch(&root.join("synced.mp4"), 10);
        touch(&root.join("uploading.mkv"), 20);
        touch(&root.join("Horror").join(".Remote.mp4.icloud"), 1);
        touch(&root.join("notes.txt"), 5);

        let mut status = StatusMap::new();
        status.insert("synced.mp4".into(), FileStatus { evictable: true, size: Some(10) });
        status.insert("Remote.mp4".into(), FileStatus { evictable: true, size: Some(4096) });

        let result = scanner(root).scan(&status);
        assert_eq!(result.items.len(), 3);

        let by_name = |n: &str| result.items.iter().find(|i| i.name == n).unwrap();

        let synced = by_name("synced.mp4");
        assert!(synced.is_local_to_client && synced.has_uploaded_client && !synced.is_uploading_client);
        assert_eq!(synced.size, 10);
        assert_eq!(synced.collection, None);

        let uploading = by_name("uploading.mkv");
        assert!(uploading.is_uploading_client && !uploading.has_uploaded_client);

        let remote = by_name("Remote.mp4");
        assert!(!remote.is_local_to_client && remote.has_uploaded_client);
        assert!(remote.has_downloaded_client);
        assert_eq!(remote.size, 4096);
        assert_eq!(remote.collection.as_deref(), Some("Horror"));
        assert_eq!(
            remote.cloud_id,
            disk_cloud_id(&root.join("Horror").join("Remote.mp4"))
        );
        assert_eq!(result.collections.get("Horror"), Some(&1));
    }

    #[test]
    fn test_on_disk_path_of_placeholder() {
        let scanner = scanner(Path::new("/r"));
        let materialized = Path::new("/r/Horror/Remote.mp4");
        assert_eq!(
            scanner.on_disk_path(materialized, false),
            PathBuf::from("/r/Horror/.Remote.mp4.icloud")
        );
        assert_eq!(scanner.on_disk_path(materialized, true), materialized);
        assert_eq!(
            scanner.materialized_path(&scanner.on_disk_path(materialized, false)),
            (materialized.to_path_buf(), true)
        );
    }

    #[test]
    fn test_placeholder_without_status_has_unknown_size() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        touch(&dir.path().join(".Lost.mkv.icloud"), 1);
        let result = scanner(dir.path()).scan(&StatusMap::new());
        assert_eq!(result.items[0].size, -1);
    }

    #[test]
    fn test_repeated_scans_are_identical() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for name in ["b.mp4", "a.mp4", "c/d.mkv", "c/.e.mp4.icloud"] {
            touch(&dir.path().join(name), 3);
        }
        let scanner = scanner(dir.path());
        let ids = |r: ScanResult| r.items.into_iter().map(|i| i.cloud_id).collect::<Vec<_>>();
        let first = ids(scanner.scan(&StatusMap::new()));
        let second = ids(scanner.scan(&StatusMap::new()));
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let result = scanner(&dir.path().join("absent")).scan(&StatusMap::new());
        assert!(result.items.is_empty());
    }
}
