//! Core engine logic.
//!
//! This module contains:
//! - StageRegistry: keyed stage configuration and approver resolution
//! - ApprovalLedger: approval seeding, decision recording, quorum
//! - PipelineEngine: the orchestrating state machine
//! - EngineError: the crate's error taxonomy

pub mod engine;
pub mod ledger;
pub mod registry;

use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::DispatchError;
use crate::domain::{ApprovalStatus, ArtifactType};
use crate::store::StoreError;

// Re-export commonly used types
pub use engine::{DecisionOutcome, PipelineEngine};
pub use ledger::{ApprovalLedger, ApprovalTally};
pub use registry::{ApproverResolver, PipelineStage, StageRegistry, StaticAssignment};

/// Engine-level failures.
///
/// Retry never happens at this level: retryable dispatch failures are
/// absorbed by the engine's bounded retry loop, and anything that escapes
/// here is surfaced to the caller as final.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No stage configured for an artifact type; a deployment error
    #[error("no pipeline stage configured for artifact type {artifact_type}")]
    UnknownType { artifact_type: ArtifactType },

    /// No stage with that order index
    #[error("no pipeline stage at order index {index}")]
    IndexOutOfRange { index: usize },

    /// The stage table itself is malformed
    #[error("invalid stage table: {detail}")]
    InvalidStageTable { detail: String },

    /// Unknown artifact or approval id
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// The requested operation does not apply to the record's type/status
    #[error("invalid operation on artifact {artifact_id}: {detail}")]
    Validation { artifact_id: Uuid, detail: String },

    /// A decision arrived for an approval that has already been decided
    #[error("approval {approval_id} already decided ({status}); original decision stands")]
    ApprovalConflict {
        approval_id: Uuid,
        status: ApprovalStatus,
    },

    /// Transform dispatch failed past the retry budget (or fatally)
    #[error("transform dispatch failed for artifact {artifact_id} at stage {stage}: {source}")]
    Dispatch {
        artifact_id: Uuid,
        stage: usize,
        source: DispatchError,
    },

    /// Storage backend failure
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, id } => EngineError::NotFound { kind, id },
            StoreError::AlreadyDecided { id, status } => EngineError::ApprovalConflict {
                approval_id: id,
                status,
            },
            StoreError::Backend(detail) => EngineError::Store(detail),
        }
    }
}
