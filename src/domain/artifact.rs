//! Artifacts flowing through the delivery pipeline.
//!
//! An artifact is one versioned document: the root specification or any of
//! the documents derived from it. Its type pins it to exactly one pipeline
//! stage; its status is mutated only by the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A document produced at one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    /// Unique identifier
    pub id: Uuid,

    /// Human-readable name (e.g. "Domain Model for Checkout Flow")
    pub name: String,

    /// Type of artifact; determines the pipeline stage
    pub artifact_type: ArtifactType,

    /// Opaque structured payload; the engine never looks inside
    pub content: serde_json::Value,

    /// Lifecycle status
    pub status: ArtifactStatus,

    /// Who created this artifact (engine operation or external actor)
    pub created_by: String,

    /// Artifact this one was derived from; the root has none
    pub parent_id: Option<Uuid>,

    /// Short fingerprint of the content, for logs and dedup diagnostics
    pub content_hash: String,

    /// When the artifact was created
    pub created_at: DateTime<Utc>,

    /// Last status change
    pub updated_at: DateTime<Utc>,
}

/// Create-side view of an artifact, handed to the store
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub name: String,
    pub artifact_type: ArtifactType,
    pub content: serde_json::Value,
    pub created_by: String,
    pub parent_id: Option<Uuid>,
}

impl NewArtifact {
    /// Root artifact for a new pipeline run
    pub fn root(
        name: impl Into<String>,
        content: serde_json::Value,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            artifact_type: ArtifactType::RootSpec,
            content,
            created_by: created_by.into(),
            parent_id: None,
        }
    }

    /// Artifact derived from a parent by a transform
    pub fn derived(
        parent: &Artifact,
        artifact_type: ArtifactType,
        content: serde_json::Value,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            name: format!("{} for {}", artifact_type.label(), parent.name),
            artifact_type,
            content,
            created_by: created_by.into(),
            parent_id: Some(parent.id),
        }
    }
}

/// The six artifact types, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    /// The root specification a run starts from
    RootSpec,

    /// Domain entities extracted from the root spec
    DomainModel,

    /// API actions derived from the domain model
    ApiSpec,

    /// Interface description generated from the API spec
    InterfaceSpec,

    /// Input-validation schema (one of the two terminal siblings)
    ValidationSchema,

    /// Storage schema (the other terminal sibling)
    StorageSchema,
}

impl ArtifactType {
    /// All types, in pipeline order
    pub const ALL: [ArtifactType; 6] = [
        ArtifactType::RootSpec,
        ArtifactType::DomainModel,
        ArtifactType::ApiSpec,
        ArtifactType::InterfaceSpec,
        ArtifactType::ValidationSchema,
        ArtifactType::StorageSchema,
    ];

    /// Human-readable label used when naming derived artifacts
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactType::RootSpec => "Root Spec",
            ArtifactType::DomainModel => "Domain Model",
            ArtifactType::ApiSpec => "API Spec",
            ArtifactType::InterfaceSpec => "Interface Spec",
            ArtifactType::ValidationSchema => "Validation Schema",
            ArtifactType::StorageSchema => "Storage Schema",
        }
    }

    /// Key under which a multi-output transform reports this type's payload
    pub fn payload_key(&self) -> &'static str {
        match self {
            ArtifactType::RootSpec => "root_spec",
            ArtifactType::DomainModel => "domain_model",
            ArtifactType::ApiSpec => "api_spec",
            ArtifactType::InterfaceSpec => "interface_spec",
            ArtifactType::ValidationSchema => "validation_schema",
            ArtifactType::StorageSchema => "storage_schema",
        }
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle status of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactStatus {
    /// Created, approvals not yet seeded
    Draft,

    /// Waiting for its approval quorum
    PendingApproval,

    /// Quorum reached; terminal for decisions
    Approved,

    /// Explicitly rejected; terminal
    Rejected,

    /// Onward transform dispatch exhausted its retries; needs manual re-trigger
    Failed,
}

impl ArtifactStatus {
    /// Whether no further decisions are accepted in this status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ArtifactStatus::Draft | ArtifactStatus::PendingApproval)
    }
}

impl std::fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactStatus::Draft => "DRAFT",
            ArtifactStatus::PendingApproval => "PENDING_APPROVAL",
            ArtifactStatus::Approved => "APPROVED",
            ArtifactStatus::Rejected => "REJECTED",
            ArtifactStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Short content fingerprint (first 16 hex chars of SHA256 of the JSON)
pub fn content_hash(content: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.to_string().as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..8])
}
