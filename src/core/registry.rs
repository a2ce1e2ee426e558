//! Pipeline stage configuration.
//!
//! Stage tables are defined in YAML (or built in) and are read-only at run
//! time. Lookup by artifact type is a keyed map, since the engine resolves
//! a stage on every creation and approval-check event.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::ArtifactType;

use super::EngineError;

/// Configuration for one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStage {
    /// Position along the pipeline; strictly increasing
    pub order_index: usize,

    /// The artifact type gated at this stage
    pub artifact_type: ArtifactType,

    /// How many APPROVED decisions advance the artifact
    pub required_approvals: u32,

    /// Stakeholders asked to decide (consumed through an ApproverResolver)
    #[serde(default)]
    pub approvers: Vec<String>,

    /// Transform producing this stage's successors; None at terminal stages
    #[serde(default)]
    pub transform: Option<String>,

    /// Artifact types derived from this stage: zero, one, or two
    /// (two only at the branch stage)
    #[serde(default)]
    pub successors: Vec<ArtifactType>,
}

impl PipelineStage {
    /// A stage whose single transform fans out into two siblings
    pub fn is_branch(&self) -> bool {
        self.successors.len() == 2
    }

    /// A stage with nothing downstream (the fan-in siblings)
    pub fn is_terminal(&self) -> bool {
        self.successors.is_empty()
    }
}

/// Serde wrapper matching the YAML file layout
#[derive(Debug, Deserialize)]
struct StageTable {
    stages: Vec<PipelineStage>,
}

/// Keyed stage configuration: type -> stage, plus an order-sorted index
#[derive(Debug, Clone)]
pub struct StageRegistry {
    by_type: HashMap<ArtifactType, PipelineStage>,
    /// Types sorted by order_index
    ordered: Vec<ArtifactType>,
}

impl StageRegistry {
    /// Build a registry from a stage list, validating the table shape
    pub fn new(stages: Vec<PipelineStage>) -> Result<Self, EngineError> {
        if stages.is_empty() {
            return Err(invalid("stage table is empty"));
        }

        let mut by_type = HashMap::new();
        for stage in stages {
            if stage.required_approvals == 0 {
                return Err(invalid(format!(
                    "stage {} requires zero approvals",
                    stage.artifact_type
                )));
            }
            if (stage.approvers.len() as u32) < stage.required_approvals {
                return Err(invalid(format!(
                    "stage {} assigns {} approvers but requires {}",
                    stage.artifact_type,
                    stage.approvers.len(),
                    stage.required_approvals
                )));
            }
            if stage.successors.len() > 2 {
                return Err(invalid(format!(
                    "stage {} has {} successors (max 2)",
                    stage.artifact_type,
                    stage.successors.len()
                )));
            }
            if !stage.successors.is_empty() && stage.transform.is_none() {
                return Err(invalid(format!(
                    "stage {} has successors but no transform",
                    stage.artifact_type
                )));
            }
            if by_type.insert(stage.artifact_type, stage.clone()).is_some() {
                return Err(invalid(format!(
                    "artifact type {} is mapped to more than one stage",
                    stage.artifact_type
                )));
            }
        }

        for artifact_type in ArtifactType::ALL {
            if !by_type.contains_key(&artifact_type) {
                return Err(invalid(format!("artifact type {artifact_type} is unmapped")));
            }
        }

        let mut ordered: Vec<ArtifactType> = by_type.keys().copied().collect();
        ordered.sort_by_key(|t| by_type[t].order_index);
        for pair in ordered.windows(2) {
            if by_type[&pair[0]].order_index == by_type[&pair[1]].order_index {
                return Err(invalid(format!(
                    "stages {} and {} share order index {}",
                    pair[0], pair[1], by_type[&pair[0]].order_index
                )));
            }
        }

        let mut branch_count = 0;
        for stage in by_type.values() {
            if stage.is_branch() {
                branch_count += 1;
            }
            for successor in &stage.successors {
                let successor_stage = by_type.get(successor).ok_or_else(|| {
                    invalid(format!(
                        "stage {} names unmapped successor {successor}",
                        stage.artifact_type
                    ))
                })?;
                if successor_stage.order_index <= stage.order_index {
                    return Err(invalid(format!(
                        "successor {successor} does not come after stage {}",
                        stage.artifact_type
                    )));
                }
                if stage.is_branch() && !successor_stage.is_terminal() {
                    return Err(invalid(format!(
                        "branch successor {successor} must be a terminal stage"
                    )));
                }
            }
        }
        if branch_count != 1 {
            return Err(invalid(format!(
                "expected exactly one branch stage, found {branch_count}"
            )));
        }

        Ok(Self { by_type, ordered })
    }

    /// The built-in six-stage delivery table
    pub fn default_stages() -> Self {
        let stages = vec![
            PipelineStage {
                order_index: 0,
                artifact_type: ArtifactType::RootSpec,
                required_approvals: 1,
                approvers: vec!["product-owner".to_string()],
                transform: Some("domain_modeler".to_string()),
                successors: vec![ArtifactType::DomainModel],
            },
            PipelineStage {
                order_index: 1,
                artifact_type: ArtifactType::DomainModel,
                required_approvals: 1,
                approvers: vec!["domain-architect".to_string()],
                transform: Some("api_generator".to_string()),
                successors: vec![ArtifactType::ApiSpec],
            },
            PipelineStage {
                order_index: 2,
                artifact_type: ArtifactType::ApiSpec,
                required_approvals: 2,
                approvers: vec!["api-architect".to_string(), "tech-lead".to_string()],
                transform: Some("interface_generator".to_string()),
                successors: vec![ArtifactType::InterfaceSpec],
            },
            PipelineStage {
                order_index: 3,
                artifact_type: ArtifactType::InterfaceSpec,
                required_approvals: 1,
                approvers: vec!["tech-lead".to_string()],
                transform: Some("schema_generator".to_string()),
                successors: vec![ArtifactType::ValidationSchema, ArtifactType::StorageSchema],
            },
            PipelineStage {
                order_index: 4,
                artifact_type: ArtifactType::ValidationSchema,
                required_approvals: 2,
                approvers: vec!["frontend-lead".to_string(), "qa-lead".to_string()],
                transform: None,
                successors: vec![],
            },
            PipelineStage {
                order_index: 5,
                artifact_type: ArtifactType::StorageSchema,
                required_approvals: 2,
                approvers: vec!["data-engineer".to_string(), "dba".to_string()],
                transform: None,
                successors: vec![],
            },
        ];

        Self::new(stages).expect("built-in stage table is valid")
    }

    /// Load a stage table from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stage table: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse a stage table from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let table: StageTable =
            serde_yaml::from_str(content).context("Failed to parse stage table YAML")?;
        Self::new(table.stages).context("Invalid stage table")
    }

    /// Resolve the stage gating an artifact type; O(1)
    pub fn stage_for_type(&self, artifact_type: ArtifactType) -> Result<&PipelineStage, EngineError> {
        self.by_type
            .get(&artifact_type)
            .ok_or(EngineError::UnknownType { artifact_type })
    }

    /// Resolve a stage by its order index
    pub fn stage_by_order(&self, index: usize) -> Result<&PipelineStage, EngineError> {
        self.ordered
            .iter()
            .map(|t| &self.by_type[t])
            .find(|s| s.order_index == index)
            .ok_or(EngineError::IndexOutOfRange { index })
    }

    /// All stages in pipeline order
    pub fn stages(&self) -> impl Iterator<Item = &PipelineStage> {
        self.ordered.iter().map(|t| &self.by_type[t])
    }

    /// Number of configured stages
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

fn invalid(detail: impl Into<String>) -> EngineError {
    EngineError::InvalidStageTable {
        detail: detail.into(),
    }
}

/// Resolves the stakeholders asked to approve an artifact at a stage.
///
/// Decouples approver selection from stage lookup so deployments can plug in
/// directory- or role-based resolution without touching the registry.
pub trait ApproverResolver: Send + Sync {
    fn approvers_for(&self, stage: &PipelineStage) -> Vec<String>;
}

/// Default resolver: the approver list configured on the stage itself
pub struct StaticAssignment;

impl ApproverResolver for StaticAssignment {
    fn approvers_for(&self, stage: &PipelineStage) -> Vec<String> {
        stage.approvers.clone()
    }
}
