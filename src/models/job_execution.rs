//! Job execution entity model and its status state machine.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job_executions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    pub job_id: Uuid,

    /// Bound event that materialised this execution, when there is one.
    pub event_id: Option<Uuid>,

    pub status: String,

    /// Earliest instant the scheduler may start this execution.
    pub scheduled_at: DateTimeWithTimeZone,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    pub step_count: i32,

    /// Opaque per-backend state owned by the runner.
    #[sea_orm(column_type = "JsonBinary")]
    pub runner_data: Option<JsonValue>,

    pub failure_message: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::project::Entity",
        from = "Column::ProjectId",
        to = "super::project::Column::Id"
    )]
    Project,
    #[sea_orm(
        belongs_to = "super::job::Entity",
        from = "Column::JobId",
        to = "super::job::Column::Id"
    )]
    Job,
    #[sea_orm(has_many = "super::step_execution::Entity")]
    StepExecutions,
}

impl Related<super::project::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Project.def()
    }
}

impl Related<super::job::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Job.def()
    }
}

impl Related<super::step_execution::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StepExecutions.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn execution_status(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::parse(&self.status)
    }
}

/// Job execution lifecycle states.
///
/// Transitions are monotonic; terminal states never transition again. At
/// most one worker holds an execution through the `created → started` window
/// thanks to the scheduler's advisory lock plus the status-guarded UPDATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Created,
    Started,
    AbortRequested,
    Successful,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Created => "created",
            ExecutionStatus::Started => "started",
            ExecutionStatus::AbortRequested => "abort_requested",
            ExecutionStatus::Successful => "successful",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(ExecutionStatus::Created),
            "started" => Some(ExecutionStatus::Started),
            "abort_requested" => Some(ExecutionStatus::AbortRequested),
            "successful" => Some(ExecutionStatus::Successful),
            "failed" => Some(ExecutionStatus::Failed),
            "aborted" => Some(ExecutionStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Successful | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }

    /// Whether the transition `self → next` is a member of the allowed set.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Created, Started)
                | (Created, Aborted)
                | (Started, AbortRequested)
                | (Started, Successful)
                | (Started, Failed)
                | (Started, Aborted)
                | (AbortRequested, Successful)
                | (AbortRequested, Failed)
                | (AbortRequested, Aborted)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ExecutionStatus::*;
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [Created, Started, AbortRequested, Successful, Failed, Aborted] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("running"), None);
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [Successful, Failed, Aborted] {
            assert!(terminal.is_terminal());
            for next in [Created, Started, AbortRequested, Successful, Failed, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn allowed_transitions() {
        assert!(Created.can_transition_to(Started));
        assert!(Created.can_transition_to(Aborted));
        assert!(Started.can_transition_to(Successful));
        assert!(Started.can_transition_to(Failed));
        assert!(Started.can_transition_to(Aborted));
        assert!(Started.can_transition_to(AbortRequested));
        assert!(AbortRequested.can_transition_to(Aborted));

        assert!(!Created.can_transition_to(Successful));
        assert!(!Created.can_transition_to(Failed));
        assert!(!Started.can_transition_to(Created));
        assert!(!AbortRequested.can_transition_to(Started));
    }
}
