use crate::repo::RepoError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use hodei_common::model::{Template, TemplateId};
use std::collections::HashMap;
use std::sync::RwLock;

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Upsert by id; `(name, version)` stays unique across templates.
    async fn save(&self, template: &Template) -> Result<(), RepoError>;

    async fn find_by_id(&self, id: &TemplateId) -> Result<Option<Template>, RepoError>;

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &semver::Version,
    ) -> Result<Option<Template>, RepoError>;

    /// All versions of one template name, newest first.
    async fn find_by_name(&self, name: &str) -> Result<Vec<Template>, RepoError>;

    fn list(&self, page: u32, page_size: u32) -> BoxStream<'static, Result<Template, RepoError>>;

    /// Substring match on name and description.
    async fn search(&self, query: &str) -> Result<Vec<Template>, RepoError>;

    async fn exists_by_name_and_version(
        &self,
        name: &str,
        version: &semver::Version,
    ) -> Result<bool, RepoError>;

    async fn update_statistics(
        &self,
        id: &TemplateId,
        instantiations_delta: u64,
    ) -> Result<(), RepoError>;

    async fn exists(&self, id: &TemplateId) -> Result<bool, RepoError>;
}

#[derive(Default)]
pub struct InMemoryTemplateRepository {
    templates: RwLock<HashMap<TemplateId, Template>>,
}

impl InMemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, filter: impl Fn(&Template) -> bool) -> Vec<Template> {
        let templates = self.templates.read().unwrap();
        let mut result: Vec<Template> = templates
            .values()
            .filter(|template| filter(template))
            .cloned()
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| b.version.cmp(&a.version)));
        result
    }
}

#[async_trait]
impl TemplateRepository for InMemoryTemplateRepository {
    async fn save(&self, template: &Template) -> Result<(), RepoError> {
        let mut templates = self.templates.write().unwrap();
        let conflict = templates.values().any(|existing| {
            existing.id != template.id
                && existing.name == template.name
                && existing.version == template.version
        });
        if conflict {
            return Err(RepoError::UniqueViolation(format!(
                "template {}@{}",
                template.name, template.version
            )));
        }
        templates.insert(template.id.clone(), template.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &TemplateId) -> Result<Option<Template>, RepoError> {
        Ok(self.templates.read().unwrap().get(id).cloned())
    }

    async fn find_by_name_and_version(
        &self,
        name: &str,
        version: &semver::Version,
    ) -> Result<Option<Template>, RepoError> {
        Ok(self
            .templates
            .read()
            .unwrap()
            .values()
            .find(|template| template.name == name && &template.version == version)
            .cloned())
    }

    async fn find_by_name(&self, name: &str) -> Result<Vec<Template>, RepoError> {
        Ok(self.sorted(|template| template.name == name))
    }

    fn list(&self, page: u32, page_size: u32) -> BoxStream<'static, Result<Template, RepoError>> {
        let templates = self
            .sorted(|_| true)
            .into_iter()
            .skip(page as usize * page_size as usize)
            .take(page_size as usize)
            .map(Ok)
            .collect::<Vec<_>>();
        futures::stream::iter(templates).boxed()
    }

    async fn search(&self, query: &str) -> Result<Vec<Template>, RepoError> {
        let query = query.to_lowercase();
        Ok(self.sorted(|template| {
            template.name.to_lowercase().contains(&query)
                || template.description.to_lowercase().contains(&query)
        }))
    }

    async fn exists_by_name_and_version(
        &self,
        name: &str,
        version: &semver::Version,
    ) -> Result<bool, RepoError> {
        Ok(self
            .templates
            .read()
            .unwrap()
            .values()
            .any(|template| template.name == name && &template.version == version))
    }

    async fn update_statistics(
        &self,
        id: &TemplateId,
        instantiations_delta: u64,
    ) -> Result<(), RepoError> {
        let mut templates = self.templates.write().unwrap();
        let template = templates
            .get_mut(id)
            .ok_or_else(|| RepoError::NotFound(format!("template {id}")))?;
        template.stats.total_instantiations += instantiations_delta;
        Ok(())
    }

    async fn exists(&self, id: &TemplateId) -> Result<bool, RepoError> {
        Ok(self.templates.read().unwrap().contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hodei_common::model::ExecutionDefinition;
    use test_r::test;

    #[test]
    async fn name_and_version_stay_unique() {
        let repo = InMemoryTemplateRepository::new();
        let first = Template::new(
            "deploy",
            semver::Version::new(1, 0, 0),
            ExecutionDefinition::shell(["true"]),
            "tests",
        );
        let second = Template::new(
            "deploy",
            semver::Version::new(1, 0, 0),
            ExecutionDefinition::shell(["false"]),
            "tests",
        );
        repo.save(&first).await.unwrap();
        assert!(matches!(
            repo.save(&second).await,
            Err(RepoError::UniqueViolation(_))
        ));

        // a new version of the same name is fine
        let upgraded = Template::new(
            "deploy",
            semver::Version::new(1, 1, 0),
            ExecutionDefinition::shell(["true"]),
            "tests",
        );
        repo.save(&upgraded).await.unwrap();
        let versions = repo.find_by_name("deploy").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, semver::Version::new(1, 1, 0));
    }
}
