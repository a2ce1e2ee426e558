//! Durable storage seam for artifacts, approvals and completion records.
//!
//! The engine holds no authoritative state of its own: every decision is
//! re-read from a `PipelineStore` before being acted on, and every status
//! change goes through a guarded (compare-and-set) update. Two
//! implementations ship with the crate: [`MemoryStore`] for tests and
//! development, and [`SqliteStore`] for durable single-node deployments.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    Approval, ApprovalStatus, Artifact, ArtifactStatus, CompletionRecord, Decision, NewApproval,
    NewArtifact,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Storage-level failures
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record with that id
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: Uuid },

    /// Guarded approval update hit a record that already left PENDING
    #[error("approval {id} already decided ({status})")]
    AlreadyDecided { id: Uuid, status: ApprovalStatus },

    /// Backend failure (I/O, SQL, serialization)
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// The single seam to durable artifact/approval/completion storage.
///
/// Mutations are atomic per record: `set_artifact_status` and
/// `decide_approval` are compare-and-set operations, and
/// `record_completion` is a create-if-absent keyed by the branch parent.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persist a new artifact; the store assigns id, hash and timestamps
    async fn create_artifact(&self, new: NewArtifact) -> Result<Artifact, StoreError>;

    /// Fetch an artifact by id
    async fn get_artifact(&self, id: Uuid) -> Result<Artifact, StoreError>;

    /// All artifacts derived from the given parent
    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Artifact>, StoreError>;

    /// Atomically move an artifact from `from` to `to`.
    ///
    /// Returns false (without touching the record) when the current status
    /// is not `from`; the caller lost the race or is replaying.
    async fn set_artifact_status(
        &self,
        id: Uuid,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> Result<bool, StoreError>;

    /// Persist a new PENDING approval request
    async fn create_approval(&self, new: NewApproval) -> Result<Approval, StoreError>;

    /// Fetch an approval by id
    async fn get_approval(&self, id: Uuid) -> Result<Approval, StoreError>;

    /// Atomically transition a PENDING approval to the given decision.
    ///
    /// Fails with [`StoreError::AlreadyDecided`] when the record is not
    /// PENDING; the stored decision is left untouched.
    async fn decide_approval(
        &self,
        id: Uuid,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Approval, StoreError>;

    /// Consistent snapshot of all approval records for an artifact
    async fn list_approvals(&self, artifact_id: Uuid) -> Result<Vec<Approval>, StoreError>;

    /// Atomically create the completion record for a branch parent.
    ///
    /// Returns `None` when a record for that parent already exists: the
    /// caller lost the finalize race and must not finalize again.
    async fn record_completion(
        &self,
        parent_id: Uuid,
        validation_schema_id: Uuid,
        storage_schema_id: Uuid,
    ) -> Result<Option<CompletionRecord>, StoreError>;

    /// Fetch the completion record for a branch parent, if any
    async fn get_completion(&self, parent_id: Uuid) -> Result<Option<CompletionRecord>, StoreError>;
}
