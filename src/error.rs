// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy for the download engine.
//!
//! Every engine operation returns an [`EngineResult`]. Nothing is allowed to
//! unwind past a component boundary; the service layer converts whatever
//! reaches it into a response envelope.

use thiserror::Error;

/// Errors produced by the engine and its collaborators.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No pool item exists for the given cloud id.
    #[error("no item found for id {0}")]
    NotFound(String),

    /// The item exists but is in the wrong state for the requested operation.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Network or remote-side failure, already retried where appropriate.
    #[error("remote error: {0}")]
    TransientRemote(String),

    /// The remote service has no room for another job.
    #[error("remote capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Unexpected internal fault.
    #[error("internal error: {0}")]
    Unrecoverable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// True for errors worth retrying in place.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::TransientRemote(_))
    }

    /// Wrap an `anyhow` error coming out of the snapshot store or config layer.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        EngineError::Unrecoverable(err.to_string())
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::TransientRemote(format!("request timed out: {}", err))
        } else if err.is_connect() {
            EngineError::TransientRemote(format!("connection failed: {}", err))
        } else {
            EngineError::TransientRemote(err.to_string())
        }
    }
}

/// Result alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;
