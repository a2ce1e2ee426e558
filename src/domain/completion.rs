//! Pipeline completion record produced by the fan-in join.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Result of the join barrier: both terminal siblings reached APPROVED.
///
/// At most one record exists per branch parent; the store enforces this,
/// which is what makes finalization fire exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    /// Unique identifier
    pub id: Uuid,

    /// The branch-stage artifact both siblings were derived from
    pub parent_id: Uuid,

    /// The approved validation-schema sibling
    pub validation_schema_id: Uuid,

    /// The approved storage-schema sibling
    pub storage_schema_id: Uuid,

    /// Terminal status; always "completed"
    pub status: String,

    /// When the last sibling arrived
    pub completed_at: DateTime<Utc>,
}
