//! SSH runner: executes steps on a remote host, uploading the execution
//! file set over SFTP under `{root}/{execution_id}/` and running each step
//! in a fresh exec channel.
//!
//! libssh2 sessions are not thread-safe, so every blocking operation runs on
//! the blocking pool with the session moved in and out of the call.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use ssh2::{FileStat, Session, Sftp};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::{AppConfig, SshConfig};
use crate::models::job::Step;
use crate::models::step_execution;
use crate::output::OutputSink;
use crate::runners::{ExecutionFile, RunnerBehaviour, RunnerContext, RunnerError};

/// Session timeout for blocking reads, so the read loop can observe
/// cancellation between chunks.
const READ_TIMEOUT_MS: u32 = 500;

pub struct SshRunner {
    ctx: Arc<RunnerContext>,
    cfg: SshConfig,
    dir: PathBuf,
    session: Option<Session>,
}

pub fn instantiate(
    config: &AppConfig,
    ctx: Arc<RunnerContext>,
) -> Result<Box<dyn RunnerBehaviour>, RunnerError> {
    let cfg = config
        .ssh
        .clone()
        .ok_or(RunnerError::NotConfigured("ssh"))?;

    let dir = PathBuf::from(&cfg.root_directory).join(ctx.execution.id.to_string());

    Ok(Box::new(SshRunner {
        ctx,
        cfg,
        dir,
        session: None,
    }))
}

#[async_trait]
impl RunnerBehaviour for SshRunner {
    async fn init(&mut self) -> Result<(), RunnerError> {
        let cfg = self.cfg.clone();
        let dir = self.dir.clone();
        let file_set = self.ctx.file_set();

        let session = tokio::task::spawn_blocking(move || -> Result<Session, RunnerError> {
            let session = connect(&cfg)?;
            upload_file_set(&session, &dir, &file_set)?;
            Ok(session)
        })
        .await
        .map_err(|err| RunnerError::Transport(format!("runner task failed: {err}")))??;

        self.session = Some(session);

        Ok(())
    }

    async fn execute_step(
        &mut self,
        step_execution: &step_execution::Model,
        step: &Step,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<(), RunnerError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| RunnerError::Transport("session not initialised".to_string()))?;

        let command = self
            .ctx
            .step_command(&self.dir, step_execution.position, step);
        let environment = self.ctx.step_environment(step_execution.position);
        let cancel = self.ctx.cancel.clone();

        let (session, result) = tokio::task::spawn_blocking(move || {
            let result = run_remote_step(&session, &command, &environment, &cancel, stdout, stderr);
            (session, result)
        })
        .await
        .map_err(|err| RunnerError::Transport(format!("runner task failed: {err}")))?;

        self.session = Some(session);

        result
    }

    async fn terminate(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let root = PathBuf::from(&self.cfg.root_directory);

        let cleanup = tokio::task::spawn_blocking(move || -> Result<(), ssh2::Error> {
            let sftp = session.sftp()?;
            // Delete all files *in* the root directory, but never the root
            // itself; it is provided by the user and may carry specific
            // permissions.
            delete_directory_content(&sftp, &root)?;
            let _ = session.disconnect(None, "terminated", None);
            Ok(())
        })
        .await;

        match cleanup {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(dir = %self.dir.display(), error = %err, "cannot delete directory");
            }
            Err(err) => {
                warn!(error = %err, "runner cleanup task failed");
            }
        }
    }

    fn dir_path(&self) -> PathBuf {
        self.dir.clone()
    }
}

fn connect(cfg: &SshConfig) -> Result<Session, RunnerError> {
    let stream = TcpStream::connect((cfg.host.as_str(), cfg.port))
        .map_err(|err| RunnerError::Init(format!("cannot connect to {}: {err}", cfg.host)))?;

    let mut session = Session::new()
        .map_err(|err| RunnerError::Init(format!("cannot create session: {err}")))?;
    session.set_tcp_stream(stream);
    session
        .handshake()
        .map_err(|err| RunnerError::Init(format!("handshake failed: {err}")))?;

    if let Some(key_path) = cfg.private_key_path.as_deref() {
        session
            .userauth_pubkey_file(&cfg.user, None, Path::new(key_path), None)
            .map_err(|err| RunnerError::Init(format!("public key authentication failed: {err}")))?;
    } else if let Some(password) = cfg.password.as_deref() {
        session
            .userauth_password(&cfg.user, password)
            .map_err(|err| RunnerError::Init(format!("password authentication failed: {err}")))?;
    } else {
        return Err(RunnerError::Init(
            "no authentication method configured".to_string(),
        ));
    }

    Ok(session)
}

fn upload_file_set(
    session: &Session,
    dir: &Path,
    file_set: &[ExecutionFile],
) -> Result<(), RunnerError> {
    let sftp = session
        .sftp()
        .map_err(|err| RunnerError::Init(format!("cannot create sftp client: {err}")))?;

    // The directory is dedicated to this execution id; a redelivery of the
    // same execution finds it already present and reuses it after cleaning.
    match sftp.stat(dir) {
        Ok(_) => {
            delete_directory_content(&sftp, dir)
                .map_err(|err| RunnerError::Init(format!("cannot clean directory: {err}")))?;
        }
        Err(_) => {
            sftp.mkdir(dir, 0o755)
                .map_err(|err| RunnerError::Init(format!("cannot create directory: {err}")))?;
        }
    }

    for file in file_set {
        let path = dir.join(&file.name);

        let mut remote = sftp
            .create(&path)
            .map_err(|err| RunnerError::Init(format!("cannot create file '{}': {err}", file.name)))?;
        remote.write_all(&file.content).map_err(|err| {
            RunnerError::Init(format!("cannot write file '{}': {err}", file.name))
        })?;
        drop(remote);

        if file.executable {
            sftp.setstat(
                &path,
                FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: Some(0o755),
                    atime: None,
                    mtime: None,
                },
            )
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

fn run_remote_step(
    session: &Session,
    command: &str,
    environment: &BTreeMap<String, String>,
    cancel: &CancellationToken,
    stdout: OutputSink,
    stderr: OutputSink,
) -> Result<(), RunnerError> {
    session.set_timeout(READ_TIMEOUT_MS);

    let mut channel = session
        .channel_session()
        .map_err(|err| RunnerError::Transport(format!("cannot open session: {err}")))?;

    for (name, value) in environment {
        channel.setenv(name, value).map_err(|err| {
            RunnerError::Transport(format!("cannot set environment variable '{name}': {err}"))
        })?;
    }

    channel
        .exec(command)
        .map_err(|err| RunnerError::Transport(format!("cannot start command: {err}")))?;

    // Drain stdout (the channel itself), then stderr. The session timeout
    // bounds each read so cancellation is observed between chunks.
    let mut failure = drain(&mut channel, &stdout, cancel);
    if failure.is_none() {
        let mut err_stream = channel.stderr();
        failure = drain(&mut err_stream, &stderr, cancel);
    }

    if let Some(err) = failure {
        // Termination signal for the remote process: tearing the channel
        // down kills the command on the server side.
        let _ = channel.close();
        return Err(err);
    }

    channel
        .wait_close()
        .map_err(|err| RunnerError::Transport(format!("cannot close channel: {err}")))?;

    let exit_signal = channel
        .exit_signal()
        .map_err(|err| RunnerError::Transport(format!("cannot read exit signal: {err}")))?;
    if let Some(signal) = exit_signal.exit_signal {
        return Err(RunnerError::step_failure(format!(
            "program killed by signal {signal}"
        )));
    }

    let exit_status = channel
        .exit_status()
        .map_err(|err| RunnerError::Transport(format!("cannot read exit status: {err}")))?;
    if exit_status != 0 {
        return Err(RunnerError::step_failure(format!(
            "program exited with status {exit_status}"
        )));
    }

    Ok(())
}

/// Reads a stream to EOF into the sink, returning early on cancellation or
/// a transport failure.
fn drain<R: Read>(
    reader: &mut R,
    sink: &OutputSink,
    cancel: &CancellationToken,
) -> Option<RunnerError> {
    let mut buf = [0u8; 4096];

    loop {
        if cancel.is_cancelled() {
            return Some(RunnerError::Canceled);
        }

        match reader.read(&mut buf) {
            Ok(0) => return None,
            Ok(n) => sink.write(&buf[..n]),
            Err(err) if is_poll_interrupt(&err) => {}
            Err(err) => {
                return Some(RunnerError::Transport(format!("read failed: {err}")));
            }
        }
    }
}

fn is_poll_interrupt(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock)
}

fn delete_directory_content(sftp: &Sftp, dir: &Path) -> Result<(), ssh2::Error> {
    for (path, stat) in sftp.readdir(dir)? {
        if stat.is_dir() {
            delete_directory_content(sftp, &path)?;
            sftp.rmdir(&path)?;
        } else {
            sftp.unlink(&path)?;
        }
    }

    Ok(())
}
