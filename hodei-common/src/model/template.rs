use super::{ExecutionDefinition, InvalidTransition, ResourceRequirements, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Draft,
    Validating,
    Published,
    Deprecated,
    Archived,
}

impl TemplateStatus {
    pub fn can_transition_to(&self, target: TemplateStatus) -> bool {
        use TemplateStatus::*;
        matches!(
            (self, target),
            (Draft, Validating | Archived)
                | (Validating, Draft | Published)
                | (Published, Deprecated)
                | (Deprecated, Published | Archived)
        )
    }
}

impl Display for TemplateStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TemplateStatus::Draft => "draft",
            TemplateStatus::Validating => "validating",
            TemplateStatus::Published => "published",
            TemplateStatus::Deprecated => "deprecated",
            TemplateStatus::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TemplateStats {
    pub total_instantiations: u64,
}

/// Versioned job blueprint. Only `Published` versions may be instantiated;
/// `(name, version)` is unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub name: String,
    pub version: semver::Version,
    pub description: String,
    pub status: TemplateStatus,
    pub payload: ExecutionDefinition,
    pub default_parameters: HashMap<String, String>,
    pub resource_requirements: ResourceRequirements,
    pub stats: TemplateStats,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn new(
        name: impl Into<String>,
        version: semver::Version,
        payload: ExecutionDefinition,
        created_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TemplateId::generate(),
            name: name.into(),
            version,
            description: String::new(),
            status: TemplateStatus::Draft,
            payload,
            default_parameters: HashMap::new(),
            resource_requirements: ResourceRequirements::default(),
            stats: TemplateStats::default(),
            created_by: created_by.into(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_status(&mut self, target: TemplateStatus) -> Result<(), InvalidTransition> {
        if self.status == target {
            return Ok(());
        }
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new("template", self.status, target));
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_instantiable(&self) -> bool {
        self.status == TemplateStatus::Published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_r::test;

    #[test]
    fn publication_requires_validation() {
        let mut template = Template::new(
            "nightly-build",
            semver::Version::new(1, 0, 0),
            ExecutionDefinition::shell(["make"]),
            "tests",
        );
        assert!(template.update_status(TemplateStatus::Published).is_err());
        template.update_status(TemplateStatus::Validating).unwrap();
        template.update_status(TemplateStatus::Published).unwrap();
        assert!(template.is_instantiable());
    }

    #[test]
    fn archived_templates_stay_archived() {
        let mut template = Template::new(
            "nightly-build",
            semver::Version::new(1, 0, 0),
            ExecutionDefinition::shell(["make"]),
            "tests",
        );
        template.update_status(TemplateStatus::Archived).unwrap();
        assert!(template.update_status(TemplateStatus::Draft).is_err());
        assert!(!template.is_instantiable());
    }
}
