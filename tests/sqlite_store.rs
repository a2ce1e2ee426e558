//! SQLite Store Integration Tests
//!
//! The durable store must provide the same guarded-update semantics the
//! engine leans on, survive process restarts, and serialize concurrent
//! decisions through its compare-and-set updates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;

use stagegate::{
    ApprovalStatus, ArtifactStatus, ArtifactType, Decision, DecisionOutcome, DispatchError,
    NewApproval, NewArtifact, PipelineEngine, PipelineStore, SqliteStore, StageRegistry,
    StoreError, TransformDispatcher,
};

struct ScriptedDispatcher {
    outputs: HashMap<String, Value>,
}

impl ScriptedDispatcher {
    fn with_defaults() -> Self {
        let mut outputs = HashMap::new();
        outputs.insert("domain_modeler".to_string(), json!({"entities": ["Cart"]}));
        outputs.insert("api_generator".to_string(), json!({"actions": []}));
        outputs.insert("interface_generator".to_string(), json!({"interfaces": []}));
        outputs.insert(
            "schema_generator".to_string(),
            json!({"validation_schema": {}, "storage_schema": {}}),
        );
        Self { outputs }
    }
}

#[async_trait]
impl TransformDispatcher for ScriptedDispatcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        transform: &str,
        _input: &Value,
        _timeout: Duration,
    ) -> Result<Value, DispatchError> {
        self.outputs
            .get(transform)
            .cloned()
            .ok_or_else(|| DispatchError::ProcessorNotFound {
                transform: transform.to_string(),
            })
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("stagegate.db");

    let artifact_id = {
        let store = SqliteStore::open(&db_path).unwrap();
        let artifact = store
            .create_artifact(NewArtifact::root("Checkout Flow", json!({"body": "spec"}), "test"))
            .await
            .unwrap();
        store
            .create_approval(NewApproval {
                artifact_id: artifact.id,
                stakeholder_id: "product-owner".to_string(),
            })
            .await
            .unwrap();
        artifact.id
    };

    // A fresh handle sees everything the first one wrote
    let store = SqliteStore::open(&db_path).unwrap();
    let artifact = store.get_artifact(artifact_id).await.unwrap();
    assert_eq!(artifact.name, "Checkout Flow");
    assert_eq!(artifact.content, json!({"body": "spec"}));

    let approvals = store.list_approvals(artifact_id).await.unwrap();
    assert_eq!(approvals.len(), 1);
    assert_eq!(approvals[0].status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn test_concurrent_decisions_serialize_through_cas() {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
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

    let store_a = Arc::clone(&store);
    let store_b = Arc::clone(&store);
    let id = approval.id;
    let (a, b) = tokio::join!(
        tokio::spawn(async move { store_a.decide_approval(id, Decision::Approved, None).await }),
        tokio::spawn(async move { store_b.decide_approval(id, Decision::Rejected, None).await }),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // Exactly one decision wins; the loser sees the conflict
    assert_eq!(a.is_ok() as u32 + b.is_ok() as u32, 1);
    let conflict = if a.is_err() { a.unwrap_err() } else { b.unwrap_err() };
    assert!(matches!(conflict, StoreError::AlreadyDecided { .. }));

    // The stored status matches whichever decision won
    let stored = store.get_approval(id).await.unwrap();
    assert_ne!(stored.status, ApprovalStatus::Pending);
}

#[tokio::test]
async fn test_engine_run_resumes_across_restart() {
    let temp = TempDir::new().unwrap();
    let db_path = temp.path().join("stagegate.db");
    let registry = StageRegistry::default_stages;

    // First "process": start the run and approve the root
    let (root_id, domain_model_id) = {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let engine = PipelineEngine::new(
            Arc::clone(&store) as Arc<dyn PipelineStore>,
            registry(),
            Arc::new(ScriptedDispatcher::with_defaults()),
        );

        let root = engine
            .start_run("Checkout Flow", json!({"body": "spec"}), "test")
            .await
            .unwrap();
        let approvals = store.list_approvals(root.id).await.unwrap();
        let outcome = engine
            .record_decision(approvals[0].id, Decision::Approved, None)
            .await
            .unwrap();

        let created = match outcome {
            DecisionOutcome::Advanced { created, .. } => created,
            other => panic!("expected Advanced, got {other:?}"),
        };
        (root.id, created[0].id)
    };

    // Second "process": a brand-new engine picks up where the first stopped
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine = PipelineEngine::new(
        Arc::clone(&store) as Arc<dyn PipelineStore>,
        registry(),
        Arc::new(ScriptedDispatcher::with_defaults()),
    );

    let root = store.get_artifact(root_id).await.unwrap();
    assert_eq!(root.status, ArtifactStatus::Approved);

    let approvals = store.list_approvals(domain_model_id).await.unwrap();
    let outcome = engine
        .record_decision(approvals[0].id, Decision::Approved, None)
        .await
        .unwrap();

    match outcome {
        DecisionOutcome::Advanced { created, .. } => {
            assert_eq!(created.len(), 1);
            assert_eq!(created[0].artifact_type, ArtifactType::ApiSpec);
        }
        other => panic!("expected Advanced, got {other:?}"),
    }
}

#[tokio::test]
async fn test_status_cas_distinguishes_race_from_missing() {
    let store = SqliteStore::open_in_memory().unwrap();
    let artifact = store
        .create_artifact(NewArtifact::root("spec", json!({}), "test"))
        .await
        .unwrap();

    // Wrong expected status: lost race, no error
    let swapped = store
        .set_artifact_status(artifact.id, ArtifactStatus::Approved, ArtifactStatus::Failed)
        .await
        .unwrap();
    assert!(!swapped);

    // Unknown id: an error, not a silent false
    let err = store
        .set_artifact_status(
            uuid::Uuid::new_v4(),
            ArtifactStatus::Draft,
            ArtifactStatus::PendingApproval,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
}
