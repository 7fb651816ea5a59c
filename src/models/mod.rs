//! # Data Models
//!
//! SeaORM entities for the persistent state of the orchestration pipeline,
//! plus the typed job specification and the status state machines.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod event;
pub mod github_subscription;
pub mod identity;
pub mod job;
pub mod job_execution;
pub mod project;
pub mod step_execution;
pub mod subscription;

pub use event::Entity as Event;
pub use github_subscription::Entity as GithubSubscription;
pub use identity::Entity as Identity;
pub use job::{Entity as Job, JobSpec, RunnerRef, Step};
pub use job_execution::{Entity as JobExecution, ExecutionStatus};
pub use project::Entity as Project;
pub use step_execution::{Entity as StepExecution, StepStatus};
pub use subscription::{Entity as Subscription, SubscriptionStatus};

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "jobline".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
