//! Approval records: one stakeholder's decision on one artifact.
//!
//! A record is seeded as PENDING and leaves that status exactly once.
//! Decided records are immutable; a second decision is a conflict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single stakeholder's recorded decision on an artifact
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    /// Unique identifier
    pub id: Uuid,

    /// Artifact the decision is about
    pub artifact_id: Uuid,

    /// Stakeholder the decision was requested from
    pub stakeholder_id: String,

    /// Current status of the request
    pub status: ApprovalStatus,

    /// Optional free-text comment attached with the decision
    pub comment: Option<String>,

    /// When the request was seeded
    pub created_at: DateTime<Utc>,

    /// When the decision landed (seeding time until then)
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    /// Whether this record still accepts a decision
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

/// Create-side view of an approval request
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub artifact_id: Uuid,
    pub stakeholder_id: String,
}

/// Status of an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    /// Seeded, no decision yet
    Pending,

    /// Stakeholder approved
    Approved,

    /// Stakeholder rejected
    Rejected,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// A decision submitted by a stakeholder (never PENDING)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    /// The approval status this decision transitions the record to
    pub fn as_status(&self) -> ApprovalStatus {
        match self {
            Decision::Approved => ApprovalStatus::Approved,
            Decision::Rejected => ApprovalStatus::Rejected,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Approved => f.write_str("APPROVED"),
            Decision::Rejected => f.write_str("REJECTED"),
        }
    }
}
