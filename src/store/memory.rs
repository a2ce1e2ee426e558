//! In-memory store for tests and local development.
//!
//! All records live behind a single mutex, so every guarded update is
//! trivially atomic. The async trait methods never hold the lock across an
//! await point.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::domain::{
    content_hash, Approval, ApprovalStatus, Artifact, ArtifactStatus, CompletionRecord, Decision,
    NewApproval, NewArtifact,
};

use super::{PipelineStore, StoreError};

#[derive(Default)]
struct Inner {
    artifacts: HashMap<Uuid, Artifact>,
    approvals: HashMap<Uuid, Approval>,
    /// Keyed by branch parent id; the map entry is the exactly-once guard
    completions: HashMap<Uuid, CompletionRecord>,
}

/// Mutex-guarded in-process store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if a panic escaped while holding the
        // lock; the store is unusable at that point anyway.
        self.inner.lock().expect("memory store lock poisoned")
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn create_artifact(&self, new: NewArtifact) -> Result<Artifact, StoreError> {
        let now = Utc::now();
        let artifact = Artifact {
            id: Uuid::new_v4(),
            name: new.name,
            artifact_type: new.artifact_type,
            content_hash: content_hash(&new.content),
            content: new.content,
            status: ArtifactStatus::Draft,
            created_by: new.created_by,
            parent_id: new.parent_id,
            created_at: now,
            updated_at: now,
        };

        self.lock().artifacts.insert(artifact.id, artifact.clone());
        Ok(artifact)
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Artifact, StoreError> {
        self.lock()
            .artifacts
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "artifact", id })
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        let mut children: Vec<Artifact> = self
            .lock()
            .artifacts
            .values()
            .filter(|a| a.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|a| a.created_at);
        Ok(children)
    }

    async fn set_artifact_status(
        &self,
        id: Uuid,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let artifact = inner
            .artifacts
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "artifact", id })?;

        if artifact.status != from {
            return Ok(false);
        }

        artifact.status = to;
        artifact.updated_at = Utc::now();
        Ok(true)
    }

    async fn create_approval(&self, new: NewApproval) -> Result<Approval, StoreError> {
        let now = Utc::now();
        let approval = Approval {
            id: Uuid::new_v4(),
            artifact_id: new.artifact_id,
            stakeholder_id: new.stakeholder_id,
            status: ApprovalStatus::Pending,
            comment: None,
            created_at: now,
            updated_at: now,
        };

        self.lock().approvals.insert(approval.id, approval.clone());
        Ok(approval)
    }

    async fn get_approval(&self, id: Uuid) -> Result<Approval, StoreError> {
        self.lock()
            .approvals
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound { kind: "approval", id })
    }

    async fn decide_approval(
        &self,
        id: Uuid,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Approval, StoreError> {
        let mut inner = self.lock();
        let approval = inner
            .approvals
            .get_mut(&id)
            .ok_or(StoreError::NotFound { kind: "approval", id })?;

        if approval.status != ApprovalStatus::Pending {
            return Err(StoreError::AlreadyDecided {
                id,
                status: approval.status,
            });
        }

        approval.status = decision.as_status();
        if comment.is_some() {
            approval.comment = comment;
        }
        approval.updated_at = Utc::now();
        Ok(approval.clone())
    }

    async fn list_approvals(&self, artifact_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        let mut approvals: Vec<Approval> = self
            .lock()
            .approvals
            .values()
            .filter(|a| a.artifact_id == artifact_id)
            .cloned()
            .collect();
        approvals.sort_by_key(|a| a.created_at);
        Ok(approvals)
    }

    async fn record_completion(
        &self,
        parent_id: Uuid,
        validation_schema_id: Uuid,
        storage_schema_id: Uuid,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let mut inner = self.lock();
        if inner.completions.contains_key(&parent_id) {
            return Ok(None);
        }

        let record = CompletionRecord {
            id: Uuid::new_v4(),
            parent_id,
            validation_schema_id,
            storage_schema_id,
            status: "completed".to_string(),
            completed_at: Utc::now(),
        };
        inner.completions.insert(parent_id, record.clone());
        Ok(Some(record))
    }

    async fn get_completion(&self, parent_id: Uuid) -> Result<Option<CompletionRecord>, StoreError> {
        Ok(self.lock().completions.get(&parent_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_artifact_create_and_get() {
        let store = MemoryStore::new();
        let created = store
            .create_artifact(NewArtifact::root("Checkout Flow", json!({"body": "spec"}), "test"))
            .await
            .unwrap();

        assert_eq!(created.status, ArtifactStatus::Draft);
        assert!(created.parent_id.is_none());

        let fetched = store.get_artifact(created.id).await.unwrap();
        assert_eq!(fetched.name, "Checkout Flow");
    }

    #[tokio::test]
    async fn test_status_cas_swaps_once() {
        let store = MemoryStore::new();
        let artifact = store
            .create_artifact(NewArtifact::root("spec", json!({}), "test"))
            .await
            .unwrap();

        let swapped = store
            .set_artifact_status(artifact.id, ArtifactStatus::Draft, ArtifactStatus::PendingApproval)
            .await
            .unwrap();
        assert!(swapped);

        // Same guard again: current status no longer matches
        let swapped_again = store
            .set_artifact_status(artifact.id, ArtifactStatus::Draft, ArtifactStatus::PendingApproval)
            .await
            .unwrap();
        assert!(!swapped_again);
    }

    #[tokio::test]
    async fn test_decide_approval_once() {
        let store = MemoryStore::new();
        let artifact = store
            .create_artifact(NewArtifact::root("spec", json!({}), "test"))
            .await
            .unwrap();
        let approval = store
            .create_approval(NewApproval {
                artifact_id: artifact.id,
                stakeholder_id: "product-owner".to_string(),
            })
            .await
            .unwrap();

        let decided = store
            .decide_approval(approval.id, Decision::Approved, Some("lgtm".to_string()))
            .await
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.comment.as_deref(), Some("lgtm"));

        let err = store
            .decide_approval(approval.id, Decision::Rejected, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyDecided { .. }));

        // Original decision stands
        let stored = store.get_approval(approval.id).await.unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn test_completion_insert_is_create_if_absent() {
        let store = MemoryStore::new();
        let parent = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let first = store.record_completion(parent, a, b).await.unwrap();
        assert!(first.is_some());

        let second = store.record_completion(parent, a, b).await.unwrap();
        assert!(second.is_none());

        let stored = store.get_completion(parent).await.unwrap().unwrap();
        assert_eq!(stored.id, first.unwrap().id);
    }
}
