#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::{
    ffi::{OsStr, OsString},
    path::Path,
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, BufReader},
    process::{Child, Command},
    time::timeout,
};

/// Ways a supervised subprocess can fail to produce output.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        /// Program that was being spawned.
        program: String,
        /// Underlying OS error.
        #[source]
        source:  std::io::Error,
    },
    /// The deadline elapsed; the child has been killed.
    #[error("subprocess exceeded its {0:?} deadline")]
    TimedOut(Duration),
    /// Reading pipes or waiting on the child failed.
    #[error("{0}")]
    Io(String),
}

/// Drop guard that terminates a spawned child process if callers forget to
/// await it.
struct ChildDropGuard(Option<Child>);

impl ChildDropGuard {
    /// Wraps the provided child process with the drop guard.
    fn new(child: Child) -> Self {
        Self(Some(child))
    }

    /// Returns a mutable reference to the underlying child process.
    fn child_mut(&mut self) -> anyhow::Result<&mut Child> {
        self.0
            .as_mut()
            .context("child process already taken from guard")
    }

    /// Prevents the guard from killing the process on drop.
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for ChildDropGuard {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.start_kill();
        }
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct Collected {
    /// Exit status returned by the process.
    pub status: std::process::ExitStatus,
    /// Contents written to stdout.
    pub stdout: Vec<u8>,
    /// Contents written to stderr.
    pub stderr: Vec<u8>,
}

impl Collected {
    /// Returns stdout followed by stderr as lossy UTF-8.
    pub fn combined_output(&self) -> String {
        format!(
            "{}\n{}",
            String::from_utf8_lossy(&self.stdout),
            String::from_utf8_lossy(&self.stderr)
        )
    }
}

/// Spawns a command with stdin closed and collects stdout/stderr.
///
/// When `deadline` elapses the child is killed and
/// [`ProcessError::TimedOut`] is returned.
pub async fn run_collect(
    program: impl AsRef<OsStr>,
    args: &[OsString],
    cwd: Option<&Path>,
    env: &[(OsString, OsString)],
    deadline: Option<Duration>,
) -> Result<Collected, ProcessError> {
    let program = program.as_ref();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (key, value) in env {
        cmd.env(key, value);
    }

    let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.to_string_lossy().into_owned(),
        source,
    })?;
    let mut guard = ChildDropGuard::new(child);

    let io_err = |e: anyhow::Error| ProcessError::Io(format!("{e:#}"));

    let stdout = guard
        .child_mut()
        .map_err(io_err)?
        .stdout
        .take()
        .ok_or_else(|| ProcessError::Io("missing stdout pipe".into()))?;
    let stderr = guard
        .child_mut()
        .map_err(io_err)?
        .stderr
        .take()
        .ok_or_else(|| ProcessError::Io("missing stderr pipe".into()))?;

    let out_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .context("failed to read stdout")?;
        Ok::<Vec<u8>, anyhow::Error>(buf)
    });

    let err_task = tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .context("failed to read stderr")?;
        Ok::<Vec<u8>, anyhow::Error>(buf)
    });

    let wait_future = async move {
        let mut guard = guard;
        let status = guard
            .child_mut()?
            .wait()
            .await
            .context("failed to wait on process")?;
        let stdout = out_task.await.context("stdout task join error")??;
        let stderr = err_task.await.context("stderr task join error")??;
        guard.disarm();
        Ok::<Collected, anyhow::Error>(Collected {
            status,
            stdout,
            stderr,
        })
    };

    match deadline {
        Some(limit) => match timeout(limit, wait_future).await {
            Ok(collected) => collected.map_err(io_err),
            Err(_) => Err(ProcessError::TimedOut(limit)),
        },
        None => wait_future.await.map_err(io_err),
    }
}
