//! Parallel remote command execution
//!
//! Two disciplines are offered on top of [`RemoteExecutor::spawn_each`]:
//!
//! - **Synchronous parallel** ([`RemoteExecutor::run_parallel`]): dispatch to
//!   every machine, then block until all of them report back.
//! - **Fire-and-forget** ([`RemoteExecutor::spawn_parallel`]): dispatch and
//!   hand back [`RemoteHandle`]s to be joined later.

use async_trait::async_trait;
use futures::future::join_all;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ExperimentError, Result};
use crate::types::Machine;

/// Exit code reported when a process was killed or never produced a status
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// One command destined for one machine
#[derive(Clone, Debug)]
pub struct RemoteCommand {
    pub machine: Machine,
    pub command: String,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
}

impl RemoteCommand {
    pub fn new(machine: Machine, command: impl Into<String>) -> Self {
        Self {
            machine,
            command: command.into(),
            stdout: None,
            stderr: None,
        }
    }

    pub fn with_output(mut self, stdout: PathBuf, stderr: PathBuf) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }
}

/// Outcome of joining a handle under a deadline
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Completed(i32),
    TimedOut,
}

/// In-flight remote process
#[derive(Debug)]
pub struct RemoteHandle {
    machine: Machine,
    task: JoinHandle<Result<i32>>,
}

impl RemoteHandle {
    pub fn new(machine: Machine, task: JoinHandle<Result<i32>>) -> Self {
        Self { machine, task }
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Cancel the task, which kills its child process
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Block until the process exits
    pub async fn join(self) -> Result<i32> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ExperimentError::Executor(format!(
                "task for {} failed: {}",
                self.machine, e
            ))),
        }
    }

    /// Block until the process exits or `deadline` elapses, killing it in the latter case
    pub async fn join_with_deadline(self, deadline: Duration) -> Result<JoinOutcome> {
        let Self { machine, mut task } = self;
        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(result)) => result.map(JoinOutcome::Completed),
            Ok(Err(e)) => Err(ExperimentError::Executor(format!(
                "task for {} failed: {}",
                machine, e
            ))),
            Err(_) => {
                // Aborting drops the child, which is spawned with kill_on_drop
                task.abort();
                let _ = task.await;
                Ok(JoinOutcome::TimedOut)
            }
        }
    }
}

/// Start every command with `spawn`.
///
/// If one fails, the commands already started are aborted before the error is returned.
pub fn spawn_all<F>(commands: Vec<RemoteCommand>, mut spawn: F) -> Result<Vec<RemoteHandle>>
where
    F: FnMut(RemoteCommand) -> Result<RemoteHandle>,
{
    let mut handles = Vec::with_capacity(commands.len());
    for command in commands {
        match spawn(command) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                warn!(
                    "Aborting {} started remote commands after spawn failure: {}",
                    handles.len(),
                    e
                );
                for handle in &handles {
                    handle.abort();
                }
                return Err(e);
            }
        }
    }
    Ok(handles)
}

/// Join every handle, mapping failures to [`EXIT_CODE_UNKNOWN`]
pub async fn join_all_codes(handles: Vec<RemoteHandle>) -> Vec<(Machine, i32)> {
    let joins = handles.into_iter().map(|handle| async move {
        let machine = handle.machine().clone();
        match handle.join().await {
            Ok(code) => (machine, code),
            Err(e) => {
                warn!("Failed to join remote command on {}: {}", machine, e);
                (machine, EXIT_CODE_UNKNOWN)
            }
        }
    });
    join_all(joins).await
}

/// Expand a `{}` output pattern for a machine
pub fn expand_pattern(pattern: &str, machine: &Machine) -> PathBuf {
    PathBuf::from(pattern.replace("{}", machine.address()))
}

/// `user@[address]:path` as understood by scp
pub fn remote_path(user: &str, machine: &Machine, path: &str) -> String {
    format!("{}@[{}]:{}", user, machine.address(), path)
}

/// Remote execution primitive
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Start one command per entry without waiting for completion
    fn spawn_each(&self, commands: Vec<RemoteCommand>) -> Result<Vec<RemoteHandle>>;

    /// Copy `sources[i]` to `destinations[i]` in parallel, returning exit codes in order
    async fn copy_parallel(&self, sources: &[String], destinations: &[String]) -> Result<Vec<i32>>;

    /// Start `command` on every machine without waiting for completion
    fn spawn_parallel(
        &self,
        machines: &[Machine],
        command: &str,
        stdout_pattern: Option<&str>,
        stderr_pattern: Option<&str>,
    ) -> Result<Vec<RemoteHandle>> {
        let commands = machines
            .iter()
            .map(|machine| RemoteCommand {
                machine: machine.clone(),
                command: command.to_string(),
                stdout: stdout_pattern.map(|p| expand_pattern(p, machine)),
                stderr: stderr_pattern.map(|p| expand_pattern(p, machine)),
            })
            .collect();
        self.spawn_each(commands)
    }

    /// Run `command` on every machine and wait for all of them, returning exit codes in order
    async fn run_parallel(&self, machines: &[Machine], command: &str) -> Result<Vec<i32>> {
        let handles = self.spawn_parallel(machines, command, None, None)?;
        Ok(join_all_codes(handles)
            .await
            .into_iter()
            .map(|(_, code)| code)
            .collect())
    }
}

/// Executor shelling out to `ssh` and `scp`
#[derive(Clone, Debug)]
pub struct SshExecutor {
    user: String,
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            connect_timeout_secs: 30,
        }
    }

    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ]
    }

    fn spawn_one(&self, cmd: RemoteCommand) -> Result<RemoteHandle> {
        debug!("ssh {}: {}", cmd.machine, cmd.command);
        let mut child = Command::new("ssh")
            .args(self.common_options())
            .arg(format!("{}@{}", self.user, cmd.machine.address()))
            .arg(&cmd.command)
            .stdin(Stdio::null())
            .stdout(Self::output_stdio(&cmd.stdout)?)
            .stderr(Self::output_stdio(&cmd.stderr)?)
            .kill_on_drop(true)
            .spawn()?;

        let task = tokio::spawn(async move {
            let status = child.wait().await?;
            Ok::<_, ExperimentError>(status.code().unwrap_or(EXIT_CODE_UNKNOWN))
        });
        Ok(RemoteHandle::new(cmd.machine, task))
    }

    fn output_stdio(path: &Option<PathBuf>) -> Result<Stdio> {
        match path {
            Some(path) => Ok(Stdio::from(std::fs::File::create(path)?)),
            None => Ok(Stdio::null()),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    fn spawn_each(&self, commands: Vec<RemoteCommand>) -> Result<Vec<RemoteHandle>> {
        spawn_all(commands, |cmd| self.spawn_one(cmd))
    }

    async fn copy_parallel(&self, sources: &[String], destinations: &[String]) -> Result<Vec<i32>> {
        if sources.len() != destinations.len() {
            return Err(ExperimentError::Executor(format!(
                "copy needs as many sources as destinations ({} != {})",
                sources.len(),
                destinations.len()
            )));
        }

        let copies = sources.iter().zip(destinations).map(|(src, dst)| {
            let options = self.common_options();
            async move {
                debug!("scp {} -> {}", src, dst);
                let status = Command::new("scp")
                    .args(options)
                    .arg("-q")
                    .arg(src)
                    .arg(dst)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await;
                match status {
                    Ok(status) => status.code().unwrap_or(EXIT_CODE_UNKNOWN),
                    Err(e) => {
                        warn!("Failed to run scp {} -> {}: {}", src, dst, e);
                        EXIT_CODE_UNKNOWN
                    }
                }
            }
        });

        Ok(join_all(copies).await)
    }
}
