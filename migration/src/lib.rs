pub use sea_orm_migration::prelude::*;

mod m2026_02_10_000100_create_projects;
mod m2026_02_10_000200_create_jobs;
mod m2026_02_10_000300_create_identities;
mod m2026_02_10_000400_create_subscriptions;
mod m2026_02_10_000500_create_github_subscriptions;
mod m2026_02_10_000600_create_events;
mod m2026_02_10_000700_create_job_executions;
mod m2026_02_10_000800_create_step_executions;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2026_02_10_000100_create_projects::Migration),
            Box::new(m2026_02_10_000200_create_jobs::Migration),
            Box::new(m2026_02_10_000300_create_identities::Migration),
            Box::new(m2026_02_10_000400_create_subscriptions::Migration),
            Box::new(m2026_02_10_000500_create_github_subscriptions::Migration),
            Box::new(m2026_02_10_000600_create_events::Migration),
            Box::new(m2026_02_10_000700_create_job_executions::Migration),
            Box::new(m2026_02_10_000800_create_step_executions::Migration),
        ]
    }
}
