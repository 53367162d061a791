pub mod artifact;
pub mod job;
pub mod pool;
pub mod template;
pub mod worker;

pub use artifact::{ArtifactRepository, InMemoryArtifactRepository};
pub use job::{InMemoryJobRepository, JobRepository};
pub use pool::{InMemoryResourcePoolRepository, ResourcePoolRepository};
pub use template::{InMemoryTemplateRepository, TemplateRepository};
pub use worker::{InMemoryWorkerRepository, WorkerRepository};

/// Persistence failures as seen by the core. Backends map their native
/// errors onto these; the in-memory implementations only ever produce
/// `NotFound` and `UniqueViolation`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepoError {
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("repository operation failed: {0}")]
    OperationFailed(String),
}
