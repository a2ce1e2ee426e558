//! The pipeline engine: an event-driven state machine over the store.
//!
//! The engine reacts to discrete operations (run started, decision
//! recorded, artifact rejected/re-triggered); it never polls. It holds no
//! state of its own (every operation re-reads the store, and every status
//! transition is a compare-and-set), so steps for different runs (and for
//! the two branch siblings within one run) can execute on independent
//! workers, and a crash mid-run is recovered by replaying the operation.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::dispatch::{RetryPolicy, TransformDispatcher};
use crate::domain::{
    Artifact, ArtifactStatus, ArtifactType, CompletionRecord, Decision, NewArtifact,
};
use crate::store::PipelineStore;

use super::ledger::ApprovalLedger;
use super::registry::{ApproverResolver, PipelineStage, StageRegistry, StaticAssignment};
use super::EngineError;

/// Actor name recorded on artifacts the engine derives
const ENGINE_ACTOR: &str = "pipeline-engine";

/// Default wall-clock budget for one transform invocation
const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(300);

/// What a decision event led to
#[derive(Debug)]
pub enum DecisionOutcome {
    /// Quorum not yet reached; artifact still awaiting approval
    Pending { approved: u32, required: u32 },

    /// Quorum was reached but another worker won the advance; nothing to do
    AlreadyAdvanced,

    /// Artifact approved; `created` holds the newly created successor(s)
    /// (empty when a replay found them already in place)
    Advanced {
        artifact: Artifact,
        created: Vec<Artifact>,
    },

    /// Terminal artifact approved; its sibling has not finished yet
    AwaitingSibling { artifact: Artifact },

    /// Both branch siblings approved; the run is finalized
    PipelineCompleted { completion: CompletionRecord },

    /// The artifact was rejected while its transform was in flight;
    /// the output was discarded
    Cancelled { artifact: Artifact },
}

/// Orchestrates artifact lifecycle, approval gating, transform dispatch and
/// the fan-out/fan-in join
pub struct PipelineEngine {
    store: Arc<dyn PipelineStore>,
    registry: StageRegistry,
    resolver: Box<dyn ApproverResolver>,
    ledger: ApprovalLedger,
    dispatcher: Arc<dyn TransformDispatcher>,
    retry: RetryPolicy,
    dispatch_timeout: Duration,
}

impl PipelineEngine {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        registry: StageRegistry,
        dispatcher: Arc<dyn TransformDispatcher>,
    ) -> Self {
        let ledger = ApprovalLedger::new(Arc::clone(&store));
        Self {
            store,
            registry,
            resolver: Box::new(StaticAssignment),
            ledger,
            dispatcher,
            retry: RetryPolicy::default(),
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    /// Replace the approver resolution policy
    pub fn with_resolver(mut self, resolver: Box<dyn ApproverResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the dispatch retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the per-dispatch timeout
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// The stage table this engine runs against
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Start a new pipeline run from a root specification.
    ///
    /// Creates the root artifact, seeds its approvals and puts it up for
    /// decision.
    #[instrument(skip(self, content), fields(name = %name))]
    pub async fn start_run(
        &self,
        name: &str,
        content: Value,
        created_by: &str,
    ) -> Result<Artifact, EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::Validation {
                artifact_id: Uuid::nil(),
                detail: "root artifact name is required".to_string(),
            });
        }
        if content.is_null() {
            return Err(EngineError::Validation {
                artifact_id: Uuid::nil(),
                detail: "root artifact content is required".to_string(),
            });
        }

        // Fail before creating anything if the table is misconfigured
        self.registry.stage_for_type(ArtifactType::RootSpec)?;

        let artifact = self
            .store
            .create_artifact(NewArtifact::root(name, content, created_by))
            .await?;
        let artifact = self.gate_for_approval(artifact).await?;

        info!(artifact = %artifact.id, "Pipeline run started");
        Ok(artifact)
    }

    /// Handle one stakeholder decision.
    ///
    /// Records the decision (conflicts surface, never retried), re-evaluates
    /// quorum over a fresh snapshot, and advances the pipeline if this decision
    /// completed the quorum and this worker wins the status swap.
    #[instrument(skip(self, comment), fields(approval = %approval_id, decision = %decision))]
    pub async fn record_decision(
        &self,
        approval_id: Uuid,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<DecisionOutcome, EngineError> {
        let approval = self
            .ledger
            .record_decision(approval_id, decision, comment)
            .await?;

        let artifact = self.store.get_artifact(approval.artifact_id).await?;
        let stage = self.registry.stage_for_type(artifact.artifact_type)?;

        let tally = self.ledger.tally(artifact.id).await?;
        if !tally.meets(stage.required_approvals) {
            debug!(
                artifact = %artifact.id,
                approved = tally.approved,
                required = stage.required_approvals,
                "Quorum not reached"
            );
            return Ok(DecisionOutcome::Pending {
                approved: tally.approved,
                required: stage.required_approvals,
            });
        }

        // Quorum holds. Exactly one worker may advance: the status swap is
        // the guard, so a lost race (or a replayed event) stops here.
        let won = self
            .store
            .set_artifact_status(
                artifact.id,
                ArtifactStatus::PendingApproval,
                ArtifactStatus::Approved,
            )
            .await?;
        if !won {
            debug!(artifact = %artifact.id, "Artifact already advanced");
            return Ok(DecisionOutcome::AlreadyAdvanced);
        }

        let artifact = self.store.get_artifact(artifact.id).await?;
        info!(
            artifact = %artifact.id,
            artifact_type = %artifact.artifact_type,
            stage = stage.order_index,
            "Quorum reached; artifact approved"
        );

        self.advance(&artifact, stage).await
    }

    /// Explicitly reject an artifact, halting its branch.
    ///
    /// This is the only path to REJECTED: an individual stakeholder's
    /// rejected vote is recorded but never changes artifact status.
    /// Works on any non-rejected artifact; rejecting an APPROVED one is the
    /// cancellation signal for a transform still in flight; descendants
    /// already created are left untouched.
    #[instrument(skip(self), fields(artifact = %artifact_id))]
    pub async fn reject_artifact(&self, artifact_id: Uuid) -> Result<Artifact, EngineError> {
        let artifact = self.store.get_artifact(artifact_id).await?;
        if artifact.status == ArtifactStatus::Rejected {
            return Err(EngineError::Validation {
                artifact_id,
                detail: "artifact is already rejected".to_string(),
            });
        }

        let moved = self
            .store
            .set_artifact_status(artifact_id, artifact.status, ArtifactStatus::Rejected)
            .await?;
        if !moved {
            return Err(EngineError::Validation {
                artifact_id,
                detail: "artifact status changed concurrently; not rejected".to_string(),
            });
        }

        let artifact = self.store.get_artifact(artifact_id).await?;
        warn!(artifact = %artifact.id, artifact_type = %artifact.artifact_type, "Artifact rejected");
        Ok(artifact)
    }

    /// Manually re-trigger the onward transform of a FAILED artifact.
    #[instrument(skip(self), fields(artifact = %artifact_id))]
    pub async fn retry_artifact(&self, artifact_id: Uuid) -> Result<DecisionOutcome, EngineError> {
        let artifact = self.store.get_artifact(artifact_id).await?;
        if artifact.status != ArtifactStatus::Failed {
            return Err(EngineError::Validation {
                artifact_id,
                detail: format!("only FAILED artifacts can be re-triggered, not {}", artifact.status),
            });
        }

        let stage = self.registry.stage_for_type(artifact.artifact_type)?;
        let moved = self
            .store
            .set_artifact_status(artifact_id, ArtifactStatus::Failed, ArtifactStatus::Approved)
            .await?;
        if !moved {
            return Ok(DecisionOutcome::AlreadyAdvanced);
        }

        let artifact = self.store.get_artifact(artifact_id).await?;
        info!(artifact = %artifact.id, "Re-triggering transform dispatch");
        self.advance(&artifact, stage).await
    }

    /// The completion record for a branch parent, if the run has finalized
    pub async fn completion(
        &self,
        parent_id: Uuid,
    ) -> Result<Option<CompletionRecord>, EngineError> {
        Ok(self.store.get_completion(parent_id).await?)
    }

    /// Seed approvals for a freshly created (or half-gated) artifact and
    /// put it up for decision. Idempotent: seeding tops up missing
    /// records and the promotion is a guarded swap.
    async fn gate_for_approval(&self, artifact: Artifact) -> Result<Artifact, EngineError> {
        let stage = self.registry.stage_for_type(artifact.artifact_type)?;
        let approvers = self.resolver.approvers_for(stage);

        self.ledger.seed_approvals(artifact.id, &approvers).await?;
        self.store
            .set_artifact_status(
                artifact.id,
                ArtifactStatus::Draft,
                ArtifactStatus::PendingApproval,
            )
            .await?;

        let artifact = self.store.get_artifact(artifact.id).await?;
        info!(
            artifact = %artifact.id,
            artifact_type = %artifact.artifact_type,
            stage = stage.order_index,
            required = stage.required_approvals,
            "Artifact awaiting approval"
        );
        Ok(artifact)
    }

    /// Move the pipeline past an artifact that just reached APPROVED.
    async fn advance(
        &self,
        artifact: &Artifact,
        stage: &PipelineStage,
    ) -> Result<DecisionOutcome, EngineError> {
        if stage.is_terminal() {
            return self.join_siblings(artifact).await;
        }

        // Validated at table load; a missing transform here is a config bug
        let transform = stage.transform.as_deref().ok_or_else(|| {
            EngineError::InvalidStageTable {
                detail: format!("stage {} has successors but no transform", stage.artifact_type),
            }
        })?;

        // Dedup key is (parent, target type): anything already created by an
        // earlier attempt survives, and a child stuck in DRAFT (crash between
        // create and seed) is re-gated rather than re-created.
        let children = self.store.children_of(artifact.id).await?;
        let mut created = Vec::new();
        let mut missing = Vec::new();
        for target in &stage.successors {
            match children.iter().find(|c| c.artifact_type == *target) {
                Some(child) if child.status == ArtifactStatus::Draft => {
                    debug!(child = %child.id, "Finishing interrupted gating");
                    created.push(self.gate_for_approval(child.clone()).await?);
                }
                Some(child) => {
                    debug!(
                        child = %child.id,
                        child_type = %child.artifact_type,
                        "Successor already exists; skipping"
                    );
                }
                None => missing.push(*target),
            }
        }

        if missing.is_empty() {
            return Ok(DecisionOutcome::Advanced {
                artifact: artifact.clone(),
                created,
            });
        }

        let output = self.dispatch_with_retry(artifact, stage, transform).await?;

        // The artifact may have been rejected while the transform ran;
        // re-read before acting and discard the output if so.
        let current = self.store.get_artifact(artifact.id).await?;
        if current.status != ArtifactStatus::Approved {
            warn!(
                artifact = %current.id,
                status = %current.status,
                "Artifact left APPROVED during dispatch; discarding transform output"
            );
            return Ok(DecisionOutcome::Cancelled { artifact: current });
        }

        for target in missing {
            let content = if stage.is_branch() {
                match output.get(target.payload_key()) {
                    Some(payload) => payload.clone(),
                    None => {
                        // Same contract-violation path as an unparseable
                        // output: mark FAILED and surface
                        let source = crate::dispatch::DispatchError::OutputParseError {
                            transform: transform.to_string(),
                            detail: format!("output missing key '{}'", target.payload_key()),
                        };
                        error!(
                            artifact = %artifact.id,
                            stage = stage.order_index,
                            error = %source,
                            "Branch transform output incomplete"
                        );
                        self.store
                            .set_artifact_status(
                                artifact.id,
                                ArtifactStatus::Approved,
                                ArtifactStatus::Failed,
                            )
                            .await?;
                        return Err(EngineError::Dispatch {
                            artifact_id: artifact.id,
                            stage: stage.order_index,
                            source,
                        });
                    }
                }
            } else {
                output.clone()
            };

            let child = self
                .store
                .create_artifact(NewArtifact::derived(artifact, target, content, ENGINE_ACTOR))
                .await?;
            let child = self.gate_for_approval(child).await?;
            info!(
                parent = %artifact.id,
                child = %child.id,
                child_type = %child.artifact_type,
                "Created successor artifact"
            );
            created.push(child);
        }

        Ok(DecisionOutcome::Advanced {
            artifact: artifact.clone(),
            created,
        })
    }

    /// Invoke a transform with bounded retries and backoff.
    ///
    /// Fatal dispatcher errors (unknown transform, unparseable output) and
    /// exhausted retries both mark the dispatching artifact FAILED so the
    /// stall is visible on its branch and `retry_artifact` can recover it.
    async fn dispatch_with_retry(
        &self,
        artifact: &Artifact,
        stage: &PipelineStage,
        transform: &str,
    ) -> Result<Value, EngineError> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(
                transform,
                attempt,
                artifact = %artifact.id,
                content_hash = %artifact.content_hash,
                "Dispatching transform"
            );

            match self
                .dispatcher
                .invoke(transform, &artifact.content, self.dispatch_timeout)
                .await
            {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        transform,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transform failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        artifact = %artifact.id,
                        stage = stage.order_index,
                        attempt,
                        error = %e,
                        "Transform dispatch failed permanently"
                    );
                    let marked = self
                        .store
                        .set_artifact_status(
                            artifact.id,
                            ArtifactStatus::Approved,
                            ArtifactStatus::Failed,
                        )
                        .await?;
                    if !marked {
                        warn!(artifact = %artifact.id, "Could not mark artifact FAILED; status changed concurrently");
                    }
                    return Err(EngineError::Dispatch {
                        artifact_id: artifact.id,
                        stage: stage.order_index,
                        source: e,
                    });
                }
            }
        }
    }

    /// Fan-in barrier at the end of the pipeline.
    ///
    /// Each terminal sibling checks, on its own approval, whether the other
    /// sibling has already finished; last to finish performs the finalize.
    /// The store's create-if-absent completion insert is the exactly-once
    /// guard, so a concurrent double arrival cannot double-fire.
    async fn join_siblings(&self, artifact: &Artifact) -> Result<DecisionOutcome, EngineError> {
        let parent_id = artifact.parent_id.ok_or_else(|| EngineError::Validation {
            artifact_id: artifact.id,
            detail: "terminal artifact has no parent; cannot join".to_string(),
        })?;

        let siblings = self.store.children_of(parent_id).await?;
        let sibling = siblings
            .iter()
            .find(|s| s.id != artifact.id && s.artifact_type != artifact.artifact_type);

        let sibling = match sibling {
            Some(s) if s.status == ArtifactStatus::Approved => s,
            _ => {
                info!(
                    artifact = %artifact.id,
                    parent = %parent_id,
                    "Branch side approved; waiting for sibling"
                );
                return Ok(DecisionOutcome::AwaitingSibling {
                    artifact: artifact.clone(),
                });
            }
        };

        let (validation_id, storage_id) =
            if artifact.artifact_type == ArtifactType::ValidationSchema {
                (artifact.id, sibling.id)
            } else {
                (sibling.id, artifact.id)
            };

        match self
            .store
            .record_completion(parent_id, validation_id, storage_id)
            .await?
        {
            Some(completion) => {
                info!(
                    parent = %parent_id,
                    validation_schema = %completion.validation_schema_id,
                    storage_schema = %completion.storage_schema_id,
                    "Pipeline completed"
                );
                Ok(DecisionOutcome::PipelineCompleted { completion })
            }
            None => {
                // Lost the finalize race to the sibling's handler; report the
                // record it produced
                let completion = self.store.get_completion(parent_id).await?.ok_or_else(|| {
                    EngineError::Store("completion vanished after insert conflict".to_string())
                })?;
                debug!(parent = %parent_id, "Completion already recorded");
                Ok(DecisionOutcome::PipelineCompleted { completion })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    struct NullDispatcher;

    #[async_trait]
    impl TransformDispatcher for NullDispatcher {
        fn name(&self) -> &str {
            "null"
        }

        async fn invoke(
            &self,
            transform: &str,
            _input: &Value,
            _timeout: Duration,
        ) -> Result<Value, DispatchError> {
            Err(DispatchError::ProcessorNotFound {
                transform: transform.to_string(),
            })
        }

        async fn health_check(&self) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn engine() -> PipelineEngine {
        PipelineEngine::new(
            Arc::new(MemoryStore::new()),
            StageRegistry::default_stages(),
            Arc::new(NullDispatcher),
        )
    }

    #[tokio::test]
    async fn test_start_run_requires_content() {
        let engine = engine();
        let err = engine
            .start_run("Checkout Flow", Value::Null, "test")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_start_run_gates_root() {
        let engine = engine();
        let root = engine
            .start_run("Checkout Flow", json!({"body": "spec"}), "test")
            .await
            .unwrap();

        assert_eq!(root.artifact_type, ArtifactType::RootSpec);
        assert_eq!(root.status, ArtifactStatus::PendingApproval);
        assert!(root.parent_id.is_none());
    }
}
