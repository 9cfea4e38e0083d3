// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Preconditions of the mutating operations on disk items.

use super::types::DownloadItem;
use crate::error::{EngineError, EngineResult};

/// A single state requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    HasDownloadedClient,
    HasUploadedClient,
    IsLocalToClient,
    DiskOrigin,
    HasLocalPath,
    Associated,
}

impl Condition {
    pub fn holds(self, item: &DownloadItem) -> bool {
        match self {
            Condition::HasDownloadedClient => item.has_downloaded_client,
            Condition::HasUploadedClient => item.has_uploaded_client,
            Condition::IsLocalToClient => item.is_local_to_client,
            Condition::DiskOrigin => item.is_disk(),
            Condition::HasLocalPath => item.local_path.is_some(),
            Condition::Associated => item.is_associated(),
        }
    }

    /// Name reported in `PreconditionFailed`.
    pub fn name(self) -> &'static str {
        match self {
            Condition::HasDownloadedClient => "hasDownloadedClient",
            Condition::HasUploadedClient => "hasUploadedClient",
            Condition::IsLocalToClient => "isLocalToClient",
            Condition::DiskOrigin => "source=disk",
            Condition::HasLocalPath => "localPath",
            Condition::Associated => "imdb_id",
        }
    }
}

/// Mutating operations that are only valid in certain item states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatedOp {
    Evict,
    AddToCollection,
    Rename,
    GetStreamUrl,
}

impl GatedOp {
    /// Conditions in the order they are checked.
    pub fn conditions(self) -> &'static [Condition] {
        use Condition::*;
        match self {
            GatedOp::Evict => &[
                HasDownloadedClient,
                HasUploadedClient,
                IsLocalToClient,
                DiskOrigin,
                HasLocalPath,
            ],
            GatedOp::AddToCollection => &[HasUploadedClient, DiskOrigin, HasLocalPath],
            GatedOp::Rename => &[
                IsLocalToClient,
                HasDownloadedClient,
                DiskOrigin,
                HasLocalPath,
                Associated,
            ],
            GatedOp::GetStreamUrl => &[HasUploadedClient, DiskOrigin, HasLocalPath],
        }
    }

    /// First failing condition, if any.
    pub fn first_failure(self, item: &DownloadItem) -> Option<Condition> {
        self.conditions().iter().copied().find(|c| !c.holds(item))
    }

    /// `PreconditionFailed` naming the first failing condition.
    pub fn check(self, item: &DownloadItem) -> EngineResult<()> {
        match self.first_failure(item) {
            None => Ok(()),
            Some(condition) => {
                tracing::debug!(
                    cloud_id = %item.cloud_id,
                    "{:?} rejected: {} does not hold",
                    self,
                    condition.name()
                );
                Err(EngineError::PreconditionFailed(condition.name().to_string()))
            }
        }
    }
}
