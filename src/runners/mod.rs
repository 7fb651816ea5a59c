//! # Runners
//!
//! A runner is the backend executing a job's steps. Each backend registers a
//! [`RunnerDef`] keyed by name; instantiation yields a fresh
//! [`RunnerBehaviour`] per job execution, owning its backend resources until
//! `terminate`.

pub mod local;
pub mod ssh;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::models::job::{self, JobSpec, Step};
use crate::models::{job_execution, step_execution};
use crate::output::OutputSink;

/// Environment variable prefix reserved by the platform.
pub const ENV_PREFIX: &str = "JOBLINE_";

/// Errors produced by runner operations.
///
/// A step failure is an expected outcome and is kept distinct from
/// transport failures, where a step never reported its result.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("{reason}")]
    StepFailure { reason: String },
    #[error("context canceled")]
    Canceled,
    #[error("unknown runner '{0}'")]
    UnknownRunner(String),
    #[error("runner '{0}' is not configured")]
    NotConfigured(&'static str),
    #[error("runner initialisation failed: {0}")]
    Init(String),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RunnerError {
    pub fn step_failure(reason: impl Into<String>) -> Self {
        RunnerError::StepFailure {
            reason: reason.into(),
        }
    }
}

/// A file uploaded into the execution's working directory during `init`.
#[derive(Debug, Clone)]
pub struct ExecutionFile {
    pub name: String,
    pub content: Vec<u8>,
    pub executable: bool,
}

/// Per-execution context shared with the instantiated behaviour: the
/// execution row, its job spec, the merged environment, the file set, and
/// the cancellation token rooted in worker shutdown.
pub struct RunnerContext {
    pub execution: job_execution::Model,
    pub job: job::Model,
    pub spec: JobSpec,
    pub cancel: CancellationToken,
}

impl RunnerContext {
    pub fn new(
        execution: job_execution::Model,
        job: job::Model,
        spec: JobSpec,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution,
            job,
            spec,
            cancel,
        }
    }

    /// Files uploaded at `init`: one script file per script step.
    pub fn file_set(&self) -> Vec<ExecutionFile> {
        self.spec
            .steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| {
                step.script.as_ref().map(|script| ExecutionFile {
                    name: script_file_name(index + 1),
                    content: script.clone().into_bytes(),
                    executable: true,
                })
            })
            .collect()
    }

    /// Environment applied to every step: the platform-reserved variables
    /// plus the job-defined ones.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut environment = self.spec.environment.clone();
        environment.insert(
            format!("{ENV_PREFIX}JOB_ID"),
            self.execution.job_id.to_string(),
        );
        environment.insert(
            format!("{ENV_PREFIX}JOB_EXECUTION_ID"),
            self.execution.id.to_string(),
        );
        environment.insert(format!("{ENV_PREFIX}JOB_NAME"), self.job.name.clone());
        environment
    }

    /// Per-step environment: the shared variables plus the step number.
    pub fn step_environment(&self, position: i32) -> BTreeMap<String, String> {
        let mut environment = self.environment();
        environment.insert(format!("{ENV_PREFIX}STEP_NUMBER"), position.to_string());
        environment
    }

    /// Composes the command string of a step. Commands get `{{dir}}`
    /// substituted with the working directory; script steps invoke their
    /// uploaded file.
    pub fn step_command(&self, dir: &Path, position: i32, step: &Step) -> String {
        match (&step.command, &step.script) {
            (Some(command), _) => command.replace("{{dir}}", &dir.to_string_lossy()),
            (None, Some(_)) => dir
                .join(script_file_name(position as usize))
                .to_string_lossy()
                .into_owned(),
            (None, None) => String::new(),
        }
    }
}

fn script_file_name(position: usize) -> String {
    format!("step-{position}.sh")
}

/// Lifecycle of a runner behaviour bound to one job execution.
#[async_trait]
pub trait RunnerBehaviour: Send {
    /// Allocates backend resources and uploads the execution file set.
    /// Idempotent per execution id: the working directory is dedicated and
    /// cleaned before use.
    async fn init(&mut self) -> Result<(), RunnerError>;

    /// Runs one step, streaming output into the provided sinks. Honors
    /// context cancellation by signalling the remote process.
    async fn execute_step(
        &mut self,
        step_execution: &step_execution::Model,
        step: &Step,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<(), RunnerError>;

    /// Releases backend resources. Safe to call after a partial `init`.
    async fn terminate(&mut self);

    /// Working directory substituted for `{{dir}}` in step commands.
    fn dir_path(&self) -> PathBuf;
}

type InstantiateFn =
    fn(&AppConfig, Arc<RunnerContext>) -> Result<Box<dyn RunnerBehaviour>, RunnerError>;

/// A runner backend: a name and a factory producing one behaviour per job
/// execution.
pub struct RunnerDef {
    pub name: &'static str,
    instantiate: InstantiateFn,
}

static RUNNERS: OnceLock<HashMap<&'static str, RunnerDef>> = OnceLock::new();

fn registry() -> &'static HashMap<&'static str, RunnerDef> {
    RUNNERS.get_or_init(|| {
        let defs = [
            RunnerDef {
                name: "local",
                instantiate: local::instantiate,
            },
            RunnerDef {
                name: "ssh",
                instantiate: ssh::instantiate,
            },
        ];
        defs.into_iter().map(|def| (def.name, def)).collect()
    })
}

/// Instantiates a behaviour for the named runner backend.
pub fn instantiate(
    name: &str,
    config: &AppConfig,
    ctx: Arc<RunnerContext>,
) -> Result<Box<dyn RunnerBehaviour>, RunnerError> {
    let def = registry()
        .get(name)
        .ok_or_else(|| RunnerError::UnknownRunner(name.to_string()))?;
    (def.instantiate)(config, ctx)
}

/// Names of the registered runner backends, sorted.
pub fn runner_names() -> Vec<&'static str> {
    let mut names: Vec<_> = registry().keys().copied().collect();
    names.sort_unstable();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn context(spec: JobSpec) -> RunnerContext {
        let now = Utc::now().fixed_offset();
        let project_id = Uuid::new_v4();
        let job_id = Uuid::new_v4();

        let job = job::Model {
            id: job_id,
            project_id,
            name: "build".to_string(),
            spec: spec.to_value(),
            concurrency: spec.concurrency as i32,
            disabled: false,
            created_at: now,
            updated_at: now,
        };

        let execution = job_execution::Model {
            id: Uuid::new_v4(),
            project_id,
            job_id,
            event_id: None,
            status: "started".to_string(),
            scheduled_at: now,
            started_at: Some(now),
            finished_at: None,
            step_count: spec.steps.len() as i32,
            runner_data: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };

        RunnerContext::new(execution, job, spec, CancellationToken::new())
    }

    fn spec_with_steps(steps: serde_json::Value) -> JobSpec {
        JobSpec::from_value(json!({
            "runner": {"name": "local"},
            "steps": steps,
            "environment": {"CI": "true"},
        }))
        .unwrap()
    }

    #[test]
    fn command_substitutes_working_directory() {
        let spec = spec_with_steps(json!([{"command": "ls {{dir}}/artifacts"}]));
        let ctx = context(spec);

        let command = ctx.step_command(Path::new("/work/exec-1"), 1, &ctx.spec.steps[0].clone());
        assert_eq!(command, "ls /work/exec-1/artifacts");
    }

    #[test]
    fn script_steps_invoke_their_uploaded_file() {
        let spec = spec_with_steps(json!([
            {"command": "true"},
            {"script": "#!/bin/sh\necho hi\n"}
        ]));
        let ctx = context(spec);

        let command = ctx.step_command(Path::new("/work/exec-1"), 2, &ctx.spec.steps[1].clone());
        assert_eq!(command, "/work/exec-1/step-2.sh");

        let files = ctx.file_set();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "step-2.sh");
        assert!(files[0].executable);
    }

    #[test]
    fn environment_carries_platform_variables() {
        let spec = spec_with_steps(json!([{"command": "true"}]));
        let ctx = context(spec);

        let environment = ctx.step_environment(3);
        assert_eq!(environment.get("CI").map(String::as_str), Some("true"));
        assert_eq!(
            environment.get("JOBLINE_JOB_EXECUTION_ID"),
            Some(&ctx.execution.id.to_string())
        );
        assert_eq!(
            environment.get("JOBLINE_JOB_ID"),
            Some(&ctx.execution.job_id.to_string())
        );
        assert_eq!(
            environment.get("JOBLINE_STEP_NUMBER").map(String::as_str),
            Some("3")
        );
    }

    #[test]
    fn builtin_runners_are_registered() {
        assert_eq!(runner_names(), vec!["local", "ssh"]);
        assert!(matches!(
            instantiate(
                "missing",
                &AppConfig::default(),
                Arc::new(context(spec_with_steps(json!([{"command": "true"}]))))
            ),
            Err(RunnerError::UnknownRunner(_))
        ));
    }
}
