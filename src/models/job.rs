//! Job entity model and the typed job specification.
//!
//! The jobs table stores the full [`JobSpec`] as JSON; the concurrency limit
//! is mirrored into its own column so the scheduler's selection query can
//! gate on in-flight counts without JSON extraction. Deleting a job is soft:
//! `disabled` flips to true and existing executions keep their job id.

use std::collections::BTreeMap;

use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    pub project_id: Uuid,

    pub name: String,

    /// The full typed specification, serialised [`JobSpec`].
    #[sea_orm(column_type = "JsonBinary")]
    pub spec: JsonValue,

    /// Maximum in-flight executions for this job; 0 means unlimited.
    pub concurrency: i32,

    pub disabled: bool,

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
}

impl Related<super::project::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Project.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Deserialises the stored spec.
    pub fn parse_spec(&self) -> Result<JobSpec, JobSpecError> {
        JobSpec::from_value(self.spec.clone())
    }
}

/// Errors produced while parsing or validating a job specification.
#[derive(Debug, Error)]
pub enum JobSpecError {
    #[error("invalid job specification: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("job specification has no steps")]
    NoSteps,
    #[error("step {position}: exactly one of command or script must be set")]
    AmbiguousStep { position: usize },
    #[error("unknown runner '{0}'")]
    UnknownRunner(String),
}

/// Typed job specification stored on the job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub runner: RunnerRef,
    pub steps: Vec<Step>,
    /// Variables injected into the environment of every step.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Maximum in-flight executions; 0 means unlimited. A value of 1 also
    /// yields per-job ordered execution.
    #[serde(default)]
    pub concurrency: u32,
    /// Wall-clock deadline for a whole execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Declared parameters a triggering event may carry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<ParameterSpec>,
}

/// Reference to the runner backend executing the steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "JsonValue::is_null")]
    pub parameters: JsonValue,
}

/// A single step of a job.
///
/// A step either carries an inline shell command or a script whose content
/// is uploaded into the execution's working directory and invoked from
/// there. `{{dir}}` in a command is substituted with the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
}

/// Declared parameter of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub kind: ParameterKind,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    #[default]
    String,
    Number,
    Boolean,
}

impl JobSpec {
    pub fn from_value(value: JsonValue) -> Result<Self, JobSpecError> {
        let spec: JobSpec = serde_json::from_value(value)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn to_value(&self) -> JsonValue {
        serde_json::to_value(self).expect("job spec serialisation is infallible")
    }

    pub fn validate(&self) -> Result<(), JobSpecError> {
        if self.steps.is_empty() {
            return Err(JobSpecError::NoSteps);
        }

        for (index, step) in self.steps.iter().enumerate() {
            if step.command.is_some() == step.script.is_some() {
                return Err(JobSpecError::AmbiguousStep {
                    position: index + 1,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn command_step(command: &str) -> Step {
        Step {
            label: None,
            command: Some(command.to_string()),
            script: None,
        }
    }

    #[test]
    fn spec_roundtrips_through_json() {
        let spec = JobSpec {
            runner: RunnerRef {
                name: "local".to_string(),
                parameters: JsonValue::Null,
            },
            steps: vec![command_step("echo hello"), command_step("echo world")],
            environment: BTreeMap::from([("CI".to_string(), "true".to_string())]),
            concurrency: 1,
            timeout_seconds: Some(600),
            parameters: vec![],
        };

        let parsed = JobSpec::from_value(spec.to_value()).unwrap();
        assert_eq!(parsed, spec);
    }

    #[test]
    fn spec_without_steps_is_invalid() {
        let value = json!({"runner": {"name": "local"}, "steps": []});
        assert!(matches!(
            JobSpec::from_value(value),
            Err(JobSpecError::NoSteps)
        ));
    }

    #[test]
    fn step_needs_exactly_one_payload() {
        let both = json!({
            "runner": {"name": "local"},
            "steps": [{"command": "true", "script": "#!/bin/sh\ntrue"}]
        });
        assert!(matches!(
            JobSpec::from_value(both),
            Err(JobSpecError::AmbiguousStep { position: 1 })
        ));

        let neither = json!({
            "runner": {"name": "local"},
            "steps": [{"label": "noop"}]
        });
        assert!(matches!(
            JobSpec::from_value(neither),
            Err(JobSpecError::AmbiguousStep { position: 1 })
        ));
    }

    #[test]
    fn concurrency_defaults_to_unlimited() {
        let value = json!({
            "runner": {"name": "local"},
            "steps": [{"command": "true"}]
        });
        let spec = JobSpec::from_value(value).unwrap();
        assert_eq!(spec.concurrency, 0);
        assert!(spec.timeout_seconds.is_none());
    }
}
