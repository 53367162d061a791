use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod artifact;
pub mod execution;
pub mod job;
pub mod pool;
pub mod quota;
pub mod template;
pub mod worker;

pub use artifact::*;
pub use execution::*;
pub use job::*;
pub use pool::*;
pub use quota::*;
pub use template::*;
pub use worker::*;

macro_rules! newtype_id {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

newtype_id!(JobId);
newtype_id!(TemplateId);
newtype_id!(PoolId);
newtype_id!(WorkerId);
newtype_id!(ExecutionId);
newtype_id!(ArtifactId);
newtype_id!(
    /// Identifier of a compute instance as known to its provider backend.
    InstanceId
);

/// Error produced by every guarded status mutator in the model. Status
/// transitions are the sole gating mechanism; nothing else in the system
/// special-cases a status value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {entity} status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn new(entity: &'static str, from: impl ToString, to: impl ToString) -> Self {
        Self {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// Resources a job asks for, and the granularity at which quota and
/// placement reason about capacity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceRequirements {
    pub fn new(cpu_cores: f64, memory_bytes: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes,
            disk_bytes: 0,
        }
    }
}
