//! Approval ledger: seeding requests, recording decisions, computing quorum.
//!
//! Seeding is idempotent (re-invocation never duplicates a request) and a
//! decision lands atomically through the store's guarded update, so two
//! concurrent decisions for the same record cannot both succeed.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::domain::{Approval, ApprovalStatus, Decision, NewApproval};
use crate::store::PipelineStore;

use super::EngineError;

/// Snapshot counts over one artifact's approval records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApprovalTally {
    pub approved: u32,
    pub rejected: u32,
    pub pending: u32,
}

impl ApprovalTally {
    /// Quorum is a pure "enough yes votes" test; rejections are counted
    /// separately and never subtract
    pub fn meets(&self, required: u32) -> bool {
        self.approved >= required
    }
}

/// Tracks approval requests and decisions per artifact
pub struct ApprovalLedger {
    store: Arc<dyn PipelineStore>,
}

impl ApprovalLedger {
    pub fn new(store: Arc<dyn PipelineStore>) -> Self {
        Self { store }
    }

    /// Seed one PENDING record per approver that does not already have one.
    ///
    /// Returns the full record set for the artifact (existing + new), so a
    /// retried creation event converges on the same state.
    pub async fn seed_approvals(
        &self,
        artifact_id: Uuid,
        approvers: &[String],
    ) -> Result<Vec<Approval>, EngineError> {
        let existing = self.store.list_approvals(artifact_id).await?;

        let mut seeded = 0;
        for stakeholder in approvers {
            if existing.iter().any(|a| &a.stakeholder_id == stakeholder) {
                continue;
            }
            self.store
                .create_approval(NewApproval {
                    artifact_id,
                    stakeholder_id: stakeholder.clone(),
                })
                .await?;
            seeded += 1;
        }

        if seeded > 0 {
            info!(artifact = %artifact_id, seeded, "Seeded approval requests");
        } else {
            debug!(artifact = %artifact_id, "Approvals already seeded");
        }

        Ok(self.store.list_approvals(artifact_id).await?)
    }

    /// Atomically transition a PENDING record to the decision.
    ///
    /// Surfaced, not retried: a conflict means the record was already
    /// decided and the original decision stands.
    pub async fn record_decision(
        &self,
        approval_id: Uuid,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Approval, EngineError> {
        let approval = self
            .store
            .decide_approval(approval_id, decision, comment)
            .await?;

        info!(
            approval = %approval.id,
            artifact = %approval.artifact_id,
            stakeholder = %approval.stakeholder_id,
            decision = %decision,
            "Decision recorded"
        );

        Ok(approval)
    }

    /// Count decisions over a consistent snapshot of the artifact's records
    pub async fn tally(&self, artifact_id: Uuid) -> Result<ApprovalTally, EngineError> {
        let approvals = self.store.list_approvals(artifact_id).await?;

        let mut tally = ApprovalTally {
            approved: 0,
            rejected: 0,
            pending: 0,
        };
        for approval in &approvals {
            match approval.status {
                ApprovalStatus::Approved => tally.approved += 1,
                ApprovalStatus::Rejected => tally.rejected += 1,
                ApprovalStatus::Pending => tally.pending += 1,
            }
        }

        Ok(tally)
    }

    /// True iff the artifact has at least `required` APPROVED decisions
    pub async fn quorum(&self, artifact_id: Uuid, required: u32) -> Result<bool, EngineError> {
        Ok(self.tally(artifact_id).await?.meets(required))
    }
}
