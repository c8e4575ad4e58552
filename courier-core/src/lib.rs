//! # courier-core: shared model for the Courier notification engine
//!
//! Everything the execution crates agree on lives here:
//!
//! - **Ids**: typed newtypes (`JobId`, `NotificationId`, ...) so ids of
//!   different entities cannot be mixed up
//! - **Entities**: `NotificationEntity`, `JobEntity`, step definitions,
//!   execution details
//! - **Repositories**: async persistence contracts plus in-memory versions
//! - **Errors**: the engine taxonomy (`CourierError`) and the repository
//!   error kinds it is translated from
//! - **Configuration**: `COURIER__*` environment loading into typed settings
//!
//! ```rust
//! use courier_core::prelude::*;
//!
//! let step = StepDefinition::new("welcome-email", StepType::Email);
//! assert!(step.active);
//! assert_eq!(step.step_type.channel(), Some(ChannelType::Email));
//! ```

pub mod config;
pub mod entities;
pub mod error;
pub mod ids;
pub mod repository;

#[cfg(feature = "tracing-basic")]
pub mod telemetry;

pub use config::{ConfigError, CourierConfig, EngineSettings, RuntimeEnv};
pub use entities::{
    ChannelType, ExecutionDetail, ExecutionDetailStatus, JobEntity, JobStatus, NotificationEntity, StepDefinition,
    StepType, Subscriber, WorkflowTemplate,
};
pub use error::{CourierError, CourierResult, ErrorKind, RepositoryError, RepositoryResult};
pub use ids::{
    EnvironmentId, ExecutionDetailId, JobId, NotificationId, OrganizationId, SubscriberId, TemplateId,
    TransactionId,
};
pub use repository::{ExecutionDetailsRepository, JobRepository, NotificationRepository, Repositories};

pub mod prelude {
    pub use crate::config::{CourierConfig, EngineSettings};
    pub use crate::entities::*;
    pub use crate::error::{CourierError, CourierResult, ErrorKind, RepositoryError, RepositoryResult};
    pub use crate::ids::*;
    pub use crate::repository::{ExecutionDetailsRepository, JobRepository, NotificationRepository, Repositories};
}
