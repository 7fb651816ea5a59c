//! Local runner: executes steps as child processes through `sh -c`, each
//! execution in a dedicated working directory under the configured root.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

use crate::config::AppConfig;
use crate::models::job::Step;
use crate::models::step_execution;
use crate::output::OutputSink;
use crate::runners::{RunnerBehaviour, RunnerContext, RunnerError};

pub struct LocalRunner {
    ctx: Arc<RunnerContext>,
    dir: PathBuf,
    grace: Duration,
}

pub fn instantiate(
    config: &AppConfig,
    ctx: Arc<RunnerContext>,
) -> Result<Box<dyn RunnerBehaviour>, RunnerError> {
    let dir = PathBuf::from(&config.runner.local_root_directory)
        .join(ctx.execution.id.to_string());

    Ok(Box::new(LocalRunner {
        ctx,
        dir,
        grace: Duration::from_secs(config.runner.termination_grace_seconds),
    }))
}

#[async_trait]
impl RunnerBehaviour for LocalRunner {
    async fn init(&mut self) -> Result<(), RunnerError> {
        // The directory is dedicated to this execution id; clean any residue
        // from an earlier attempt before use.
        if tokio::fs::metadata(&self.dir).await.is_ok() {
            tokio::fs::remove_dir_all(&self.dir)
                .await
                .map_err(|err| RunnerError::Init(format!("cannot clean directory: {err}")))?;
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| RunnerError::Init(format!("cannot create directory: {err}")))?;

        for file in self.ctx.file_set() {
            let path = self.dir.join(&file.name);
            tokio::fs::write(&path, &file.content)
                .await
                .map_err(|err| {
                    RunnerError::Init(format!("cannot write file '{}': {err}", file.name))
                })?;

            #[cfg(unix)]
            if file.executable {
                use std::os::unix::fs::PermissionsExt;
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                    .await
                    .map_err(|err| {
                        RunnerError::Init(format!(
                            "cannot set permissions on '{}': {err}",
                            file.name
                        ))
                    })?;
            }
        }

        Ok(())
    }

    async fn execute_step(
        &mut self,
        step_execution: &step_execution::Model,
        step: &Step,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<(), RunnerError> {
        let command = self
            .ctx
            .step_command(&self.dir, step_execution.position, step);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(&self.dir)
            .envs(self.ctx.step_environment(step_execution.position))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RunnerError::Transport(format!("cannot start command: {err}")))?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Transport("cannot capture stdout".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Transport("cannot capture stderr".to_string()))?;

        let stdout_task = tokio::spawn(pump(stdout_pipe, stdout));
        let stderr_task = tokio::spawn(pump(stderr_pipe, stderr));

        let result = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => translate_exit_status(status),
                Err(err) => Err(RunnerError::Transport(format!("cannot wait for command: {err}"))),
            },
            _ = self.ctx.cancel.cancelled() => {
                if let Err(err) = child.start_kill() {
                    warn!(error = %err, "cannot kill program");
                }
                let _ = tokio::time::timeout(self.grace, child.wait()).await;
                Err(RunnerError::Canceled)
            }
        };

        // Drain whatever output was produced before exit or kill.
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        result
    }

    async fn terminate(&mut self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %err, "cannot delete directory");
            }
        }
    }

    fn dir_path(&self) -> PathBuf {
        self.dir.clone()
    }
}

async fn pump<R>(mut reader: R, sink: OutputSink)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
}

fn translate_exit_status(status: ExitStatus) -> Result<(), RunnerError> {
    if status.success() {
        return Ok(());
    }

    if let Some(code) = status.code() {
        return Err(RunnerError::step_failure(format!(
            "program exited with status {code}"
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(RunnerError::step_failure(format!(
                "program killed by signal {signal}"
            )));
        }
    }

    Err(RunnerError::step_failure("program terminated abnormally"))
}
