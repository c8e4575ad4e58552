//! # courier-workflow: notification job execution
//!
//! Turns a workflow trigger into a chain of jobs and runs them:
//!
//! - **Job builder**: one job per active step, chained through `parent_id`,
//!   with digest steps merged into a pending digest window
//! - **Run job**: executes a step under a distributed lock and drops the
//!   subscriber's cached feed afterwards
//! - **Queue service**: enqueues jobs, retries webhook-gated steps with
//!   backoff and moves the chain along once a job settles
//! - **Engine**: wiring plus a graceful shutdown that drains workers and locks
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use courier_core::prelude::*;
//! use courier_workflow::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let repositories = Repositories::in_memory();
//! let engine = NotificationEngine::in_memory(
//!     &EngineSettings::default(),
//!     repositories.clone(),
//!     Arc::new(LoggingStepExecutor),
//! )
//! .unwrap();
//!
//! let env = EnvironmentId::new();
//! let org = OrganizationId::new();
//! let template = WorkflowTemplate::new("Welcome", "welcome", vec![StepDefinition::new("email", StepType::Email)]);
//! let subscriber = Subscriber::new("user-1", env.clone(), org.clone());
//! let request = TriggerRequest::new(env, org, serde_json::json!({"name": "Ada"}));
//!
//! let (_, jobs) = engine.trigger(&request, &template, &subscriber, &HashMap::new()).await.unwrap();
//! assert_eq!(jobs.len(), 1);
//! # });
//! ```

pub mod builder;
pub mod digest;
pub mod engine;
pub mod executor;
pub mod queue_service;
pub mod run_job;
pub mod shutdown;

pub use builder::{NotificationJobBuilder, TemplateProviderIds, TriggerRequest};
pub use digest::{DigestFilter, MergingDigestFilter, PassThroughDigestFilter};
pub use engine::NotificationEngine;
pub use executor::{LoggingStepExecutor, StepExecutor};
pub use queue_service::{should_backoff, WorkflowQueueService, DEFAULT_ATTEMPTS};
pub use run_job::{lock_resource, RunJob};
pub use shutdown::shutdown_signal;

pub mod prelude {
    pub use crate::builder::{NotificationJobBuilder, TemplateProviderIds, TriggerRequest};
    pub use crate::digest::{DigestFilter, MergingDigestFilter, PassThroughDigestFilter};
    pub use crate::engine::NotificationEngine;
    pub use crate::executor::{LoggingStepExecutor, StepExecutor};
    pub use crate::queue_service::WorkflowQueueService;
}
