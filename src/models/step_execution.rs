//! Step execution entity model, ordered by position within its parent job
//! execution. Steps share the parent lifecycle: a terminal parent implies
//! all steps are terminal.

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "step_executions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    pub job_execution_id: Uuid,

    /// 1-based position within the parent execution.
    pub position: i32,

    pub status: String,

    pub started_at: Option<DateTimeWithTimeZone>,

    pub finished_at: Option<DateTimeWithTimeZone>,

    /// Bounded tail of combined stdout and stderr.
    pub output: Option<String>,

    pub failure_message: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job_execution::Entity",
        from = "Column::JobExecutionId",
        to = "super::job_execution::Column::Id"
    )]
    JobExecution,
}

impl Related<super::job_execution::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobExecution.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    pub fn step_status(&self) -> Option<StepStatus> {
        StepStatus::parse(&self.status)
    }
}

/// Step execution lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Created,
    Started,
    Successful,
    Failed,
    Aborted,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Created => "created",
            StepStatus::Started => "started",
            StepStatus::Successful => "successful",
            StepStatus::Failed => "failed",
            StepStatus::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(StepStatus::Created),
            "started" => Some(StepStatus::Started),
            "successful" => Some(StepStatus::Successful),
            "failed" => Some(StepStatus::Failed),
            "aborted" => Some(StepStatus::Aborted),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Successful | StepStatus::Failed | StepStatus::Aborted
        )
    }

    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Created, Started)
                | (Created, Aborted)
                | (Started, Successful)
                | (Started, Failed)
                | (Started, Aborted)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::StepStatus::*;
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [Created, Started, Successful, Failed, Aborted] {
            assert_eq!(StepStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(StepStatus::parse("skipped"), None);
    }

    #[test]
    fn terminal_states_never_transition() {
        for terminal in [Successful, Failed, Aborted] {
            for next in [Created, Started, Successful, Failed, Aborted] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn skipped_steps_abort_from_created() {
        assert!(Created.can_transition_to(Aborted));
        assert!(!Created.can_transition_to(Failed));
    }
}
