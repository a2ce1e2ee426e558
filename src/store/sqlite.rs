//! SQLite-backed durable store.
//!
//! One in-process connection per store, guarded by a mutex; every call is a
//! single statement (or statement pair) against the database, so the guarded
//! updates inherit SQLite's per-statement atomicity:
//! - status changes are `UPDATE ... WHERE id = ? AND status = ?`
//! - the completion insert is `INSERT OR IGNORE` against a UNIQUE(parent_id)
//!   constraint

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::domain::{
    content_hash, Approval, ApprovalStatus, Artifact, ArtifactStatus, ArtifactType,
    CompletionRecord, Decision, NewApproval, NewArtifact,
};

use super::{PipelineStore, StoreError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS artifacts (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    artifact_type TEXT NOT NULL,
    content       TEXT NOT NULL,
    status        TEXT NOT NULL,
    created_by    TEXT NOT NULL,
    parent_id     TEXT,
    content_hash  TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_artifacts_parent ON artifacts(parent_id);

CREATE TABLE IF NOT EXISTS approvals (
    id             TEXT PRIMARY KEY,
    artifact_id    TEXT NOT NULL,
    stakeholder_id TEXT NOT NULL,
    status         TEXT NOT NULL,
    comment        TEXT,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL,
    UNIQUE(artifact_id, stakeholder_id)
);
CREATE INDEX IF NOT EXISTS idx_approvals_artifact ON approvals(artifact_id);

CREATE TABLE IF NOT EXISTS completions (
    id                   TEXT PRIMARY KEY,
    parent_id            TEXT NOT NULL UNIQUE,
    validation_schema_id TEXT NOT NULL,
    storage_schema_id    TEXT NOT NULL,
    status               TEXT NOT NULL,
    completed_at         TEXT NOT NULL
);
";

/// Durable store over a single SQLite database file
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        Self::with_connection(conn)
    }

    /// Open a throwaway in-memory database
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite store lock poisoned")
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn artifact_type_to_str(t: ArtifactType) -> &'static str {
    match t {
        ArtifactType::RootSpec => "ROOT_SPEC",
        ArtifactType::DomainModel => "DOMAIN_MODEL",
        ArtifactType::ApiSpec => "API_SPEC",
        ArtifactType::InterfaceSpec => "INTERFACE_SPEC",
        ArtifactType::ValidationSchema => "VALIDATION_SCHEMA",
        ArtifactType::StorageSchema => "STORAGE_SCHEMA",
    }
}

fn artifact_type_from_str(s: &str) -> Result<ArtifactType, StoreError> {
    match s {
        "ROOT_SPEC" => Ok(ArtifactType::RootSpec),
        "DOMAIN_MODEL" => Ok(ArtifactType::DomainModel),
        "API_SPEC" => Ok(ArtifactType::ApiSpec),
        "INTERFACE_SPEC" => Ok(ArtifactType::InterfaceSpec),
        "VALIDATION_SCHEMA" => Ok(ArtifactType::ValidationSchema),
        "STORAGE_SCHEMA" => Ok(ArtifactType::StorageSchema),
        other => Err(StoreError::Backend(format!("unknown artifact type column: {other}"))),
    }
}

fn artifact_status_from_str(s: &str) -> Result<ArtifactStatus, StoreError> {
    match s {
        "DRAFT" => Ok(ArtifactStatus::Draft),
        "PENDING_APPROVAL" => Ok(ArtifactStatus::PendingApproval),
        "APPROVED" => Ok(ArtifactStatus::Approved),
        "REJECTED" => Ok(ArtifactStatus::Rejected),
        "FAILED" => Ok(ArtifactStatus::Failed),
        other => Err(StoreError::Backend(format!("unknown artifact status column: {other}"))),
    }
}

fn approval_status_from_str(s: &str) -> Result<ApprovalStatus, StoreError> {
    match s {
        "PENDING" => Ok(ApprovalStatus::Pending),
        "APPROVED" => Ok(ApprovalStatus::Approved),
        "REJECTED" => Ok(ApprovalStatus::Rejected),
        other => Err(StoreError::Backend(format!("unknown approval status column: {other}"))),
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(format!("bad uuid column: {e}")))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp column: {e}")))
}

fn artifact_from_row(row: &Row<'_>) -> Result<Artifact, StoreError> {
    let id: String = row.get(0).map_err(backend)?;
    let name: String = row.get(1).map_err(backend)?;
    let artifact_type: String = row.get(2).map_err(backend)?;
    let content: String = row.get(3).map_err(backend)?;
    let status: String = row.get(4).map_err(backend)?;
    let created_by: String = row.get(5).map_err(backend)?;
    let parent_id: Option<String> = row.get(6).map_err(backend)?;
    let hash: String = row.get(7).map_err(backend)?;
    let created_at: String = row.get(8).map_err(backend)?;
    let updated_at: String = row.get(9).map_err(backend)?;

    Ok(Artifact {
        id: parse_uuid(&id)?,
        name,
        artifact_type: artifact_type_from_str(&artifact_type)?,
        content: serde_json::from_str(&content)
            .map_err(|e| StoreError::Backend(format!("bad content column: {e}")))?,
        status: artifact_status_from_str(&status)?,
        created_by,
        parent_id: parent_id.as_deref().map(parse_uuid).transpose()?,
        content_hash: hash,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn approval_from_row(row: &Row<'_>) -> Result<Approval, StoreError> {
    let id: String = row.get(0).map_err(backend)?;
    let artifact_id: String = row.get(1).map_err(backend)?;
    let stakeholder_id: String = row.get(2).map_err(backend)?;
    let status: String = row.get(3).map_err(backend)?;
    let comment: Option<String> = row.get(4).map_err(backend)?;
    let created_at: String = row.get(5).map_err(backend)?;
    let updated_at: String = row.get(6).map_err(backend)?;

    Ok(Approval {
        id: parse_uuid(&id)?,
        artifact_id: parse_uuid(&artifact_id)?,
        stakeholder_id,
        status: approval_status_from_str(&status)?,
        comment,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn completion_from_row(row: &Row<'_>) -> Result<CompletionRecord, StoreError> {
    let id: String = row.get(0).map_err(backend)?;
    let parent_id: String = row.get(1).map_err(backend)?;
    let validation: String = row.get(2).map_err(backend)?;
    let storage: String = row.get(3).map_err(backend)?;
    let status: String = row.get(4).map_err(backend)?;
    let completed_at: String = row.get(5).map_err(backend)?;

    Ok(CompletionRecord {
        id: parse_uuid(&id)?,
        parent_id: parse_uuid(&parent_id)?,
        validation_schema_id: parse_uuid(&validation)?,
        storage_schema_id: parse_uuid(&storage)?,
        status,
        completed_at: parse_time(&completed_at)?,
    })
}

#[async_trait]
impl PipelineStore for SqliteStore {
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

        self.lock()
            .execute(
                "INSERT INTO artifacts (id, name, artifact_type, content, status, created_by, \
                 parent_id, content_hash, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    artifact.id.to_string(),
                    artifact.name,
                    artifact_type_to_str(artifact.artifact_type),
                    artifact.content.to_string(),
                    artifact.status.to_string(),
                    artifact.created_by,
                    artifact.parent_id.map(|p| p.to_string()),
                    artifact.content_hash,
                    artifact.created_at.to_rfc3339(),
                    artifact.updated_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;

        Ok(artifact)
    }

    async fn get_artifact(&self, id: Uuid) -> Result<Artifact, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, artifact_type, content, status, created_by, parent_id, \
                 content_hash, created_at, updated_at FROM artifacts WHERE id = ?1",
                params![id.to_string()],
                |row| Ok(artifact_from_row(row)),
            )
            .optional()
            .map_err(backend)?;

        match row {
            Some(result) => result,
            None => Err(StoreError::NotFound { kind: "artifact", id }),
        }
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<Artifact>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, artifact_type, content, status, created_by, parent_id, \
                 content_hash, created_at, updated_at FROM artifacts \
                 WHERE parent_id = ?1 ORDER BY created_at",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map(params![parent_id.to_string()], |row| Ok(artifact_from_row(row)))
            .map_err(backend)?;

        let mut children = Vec::new();
        for row in rows {
            children.push(row.map_err(backend)??);
        }
        Ok(children)
    }

    async fn set_artifact_status(
        &self,
        id: Uuid,
        from: ArtifactStatus,
        to: ArtifactStatus,
    ) -> Result<bool, StoreError> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE artifacts SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    to.to_string(),
                    Utc::now().to_rfc3339(),
                    id.to_string(),
                    from.to_string()
                ],
            )
            .map_err(backend)?;

        if changed > 0 {
            return Ok(true);
        }

        // Distinguish a lost race from a missing record
        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM artifacts WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;

        match exists {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound { kind: "artifact", id }),
        }
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

        self.lock()
            .execute(
                "INSERT INTO approvals (id, artifact_id, stakeholder_id, status, comment, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    approval.id.to_string(),
                    approval.artifact_id.to_string(),
                    approval.stakeholder_id,
                    approval.status.to_string(),
                    approval.comment,
                    approval.created_at.to_rfc3339(),
                    approval.updated_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;

        Ok(approval)
    }

    async fn get_approval(&self, id: Uuid) -> Result<Approval, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, artifact_id, stakeholder_id, status, comment, created_at, updated_at \
                 FROM approvals WHERE id = ?1",
                params![id.to_string()],
                |row| Ok(approval_from_row(row)),
            )
            .optional()
            .map_err(backend)?;

        match row {
            Some(result) => result,
            None => Err(StoreError::NotFound { kind: "approval", id }),
        }
    }

    async fn decide_approval(
        &self,
        id: Uuid,
        decision: Decision,
        comment: Option<String>,
    ) -> Result<Approval, StoreError> {
        let conn = self.lock();
        let changed = conn
            .execute(
                "UPDATE approvals SET status = ?1, comment = COALESCE(?2, comment), \
                 updated_at = ?3 WHERE id = ?4 AND status = 'PENDING'",
                params![
                    decision.as_status().to_string(),
                    comment,
                    Utc::now().to_rfc3339(),
                    id.to_string()
                ],
            )
            .map_err(backend)?;

        let row = conn
            .query_row(
                "SELECT id, artifact_id, stakeholder_id, status, comment, created_at, updated_at \
                 FROM approvals WHERE id = ?1",
                params![id.to_string()],
                |row| Ok(approval_from_row(row)),
            )
            .optional()
            .map_err(backend)?;

        let approval = match row {
            Some(result) => result?,
            None => return Err(StoreError::NotFound { kind: "approval", id }),
        };

        if changed == 0 {
            return Err(StoreError::AlreadyDecided {
                id,
                status: approval.status,
            });
        }

        Ok(approval)
    }

    async fn list_approvals(&self, artifact_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, artifact_id, stakeholder_id, status, comment, created_at, updated_at \
                 FROM approvals WHERE artifact_id = ?1 ORDER BY created_at",
            )
            .map_err(backend)?;

        let rows = stmt
            .query_map(params![artifact_id.to_string()], |row| Ok(approval_from_row(row)))
            .map_err(backend)?;

        let mut approvals = Vec::new();
        for row in rows {
            approvals.push(row.map_err(backend)??);
        }
        Ok(approvals)
    }

    async fn record_completion(
        &self,
        parent_id: Uuid,
        validation_schema_id: Uuid,
        storage_schema_id: Uuid,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let record = CompletionRecord {
            id: Uuid::new_v4(),
            parent_id,
            validation_schema_id,
            storage_schema_id,
            status: "completed".to_string(),
            completed_at: Utc::now(),
        };

        let conn = self.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO completions (id, parent_id, validation_schema_id, \
                 storage_schema_id, status, completed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.to_string(),
                    record.parent_id.to_string(),
                    record.validation_schema_id.to_string(),
                    record.storage_schema_id.to_string(),
                    record.status,
                    record.completed_at.to_rfc3339(),
                ],
            )
            .map_err(backend)?;

        if inserted > 0 {
            Ok(Some(record))
        } else {
            Ok(None)
        }
    }

    async fn get_completion(&self, parent_id: Uuid) -> Result<Option<CompletionRecord>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, parent_id, validation_schema_id, storage_schema_id, status, \
                 completed_at FROM completions WHERE parent_id = ?1",
                params![parent_id.to_string()],
                |row| Ok(completion_from_row(row)),
            )
            .optional()
            .map_err(backend)?;

        row.transpose()
    }
}
