use super::{ArtifactId, ExecutionId, InvalidTransition, JobId, PoolId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    File,
    Directory,
    Archive,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Pending,
    Uploading,
    Stored,
    Expired,
    Deleted,
}

impl ArtifactStatus {
    pub fn can_transition_to(&self, target: ArtifactStatus) -> bool {
        use ArtifactStatus::*;
        matches!(
            (self, target),
            (Pending, Uploading | Deleted)
                | (Uploading, Stored | Pending)
                | (Stored, Expired | Deleted)
                | (Expired, Deleted)
        )
    }
}

impl Display for ArtifactStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ArtifactStatus::Pending => "pending",
            ArtifactStatus::Uploading => "uploading",
            ArtifactStatus::Stored => "stored",
            ArtifactStatus::Expired => "expired",
            ArtifactStatus::Deleted => "deleted",
        };
        write!(f, "{s}")
    }
}

/// Output produced by an execution and tracked for later retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    pub name: String,
    pub version: String,
    pub artifact_type: ArtifactType,
    pub status: ArtifactStatus,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub pool_id: PoolId,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Artifact {
    pub fn update_status(&mut self, target: ArtifactStatus) -> Result<(), InvalidTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new("artifact", self.status, target));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}
