//! stagegate - Approval-gated artifact pipeline engine
//!
//! Moves a specification document through an ordered sequence of derived
//! artifacts (requirements -> domain model -> API spec -> interface
//! description -> output schemas), where every stage transition is gated by
//! a quorum of stakeholder approvals.
//!
//! # Architecture
//!
//! The engine is an event-driven state machine over a durable store:
//! - All authoritative state lives in the store; the engine re-reads before
//!   every action and is stateless across restarts
//! - Status transitions are compare-and-set, so stage advancement happens
//!   exactly once even when decision events race or replay
//! - The final stage fans out into two sibling schemas; a create-if-absent
//!   completion record is the fan-in barrier
//!
//! # Modules
//!
//! - `domain`: Persisted data model (Artifact, Approval, CompletionRecord)
//! - `core`: Engine logic (StageRegistry, ApprovalLedger, PipelineEngine)
//! - `store`: Storage seam (PipelineStore trait; memory + SQLite)
//! - `dispatch`: Transform boundary (process + http dispatchers)
//! - `cli`: Command-line trigger surface
//!
//! # Usage
//!
//! ```bash
//! # Start a run (root content as JSON on stdin)
//! echo '{"body": "..."}' | stagegate run "Checkout Flow"
//!
//! # Record a stakeholder decision
//! stagegate decide <approval-id> approve --comment "ship it"
//!
//! # Inspect an artifact
//! stagegate status <artifact-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use crate::core::{
    ApprovalLedger, ApprovalTally, ApproverResolver, DecisionOutcome, EngineError, PipelineEngine,
    PipelineStage, StageRegistry, StaticAssignment,
};
pub use crate::dispatch::{
    DispatchError, HttpDispatcher, ProcessDispatcher, RetryPolicy, TransformDispatcher,
};
pub use crate::domain::{
    Approval, ApprovalStatus, Artifact, ArtifactStatus, ArtifactType, CompletionRecord, Decision,
    NewApproval, NewArtifact,
};
pub use crate::store::{MemoryStore, PipelineStore, SqliteStore, StoreError};
