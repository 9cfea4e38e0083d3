// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration for mediafetch
//!
//! This module keeps one pool of download items consistent across three
//! sources that each see part of the picture:
//! - The synced storage scan (disk items, replaced wholesale)
//! - The remote job listing (oauth items, updated and swept per poll)
//! - The persisted snapshot (associations that survive restarts)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ JobWatcher      │────▶│ TransferWorker  │
//! │ (engine)        │     │ (per job, tokio)│     │ + ProgressMon.  │
//! └───┬─────────┬───┘     └─────────────────┘     └─────────────────┘
//!     │         │
//!     ▼         ▼
//! ┌────────┐ ┌──────────────┐   ┌─────────────────┐
//! │ Pool   │ │ QueueManager │──▶│ OAuthApi        │
//! │ (RwLock│ │ (FIFO drain) │   │ (remote service)│
//! └───┬────┘ └──────────────┘   └─────────────────┘
//!     ▼
//! ┌─────────────────┐
//! │ SnapshotStore   │
//! │ (persistent)    │
//! └─────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use mediafetch::config::Config;
//! use mediafetch::download::DownloadManager;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = DownloadManager::from_config(Config::load(None)?)?;
//! manager.read_from_disk().await?;
//!
//! // Submit a job; it is watched and transferred in the background.
//! let admission = manager.submit("magnet:?xt=urn:btih:abc", "tt0133093", false).await?;
//! println!("enqueued: {}", admission.is_enqueued());
//!
//! for item in manager.downloads() {
//!     println!("{} {} {:.1}%", item.cloud_id, item.name, item.progress);
//! }
//! # Ok(())
//! # }
//! ```

pub mod types;
pub mod state;
pub mod persist;
pub mod ops;
pub mod manager;

// Re-export commonly used items
pub use types::{DownloadItem, PersistedRecord, SourceKind, PROGRESS_DONE};
pub use state::DownloadPool;
pub use persist::SnapshotStore;
pub use ops::{Condition, GatedOp};
pub use manager::{Collaborators, DownloadManager, PoolStats};
