//! Runs engine commands as plain subprocesses.
use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::{Duration, Instant},
};

pub use report_apis::TIMEOUT_STATUS;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The program could not be started at all
    #[error("failed to spawn {}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to wait for {}", program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("empty command line")]
    EmptyCommand,
}

/// One command to run
#[derive(Debug, Clone)]
pub struct CommandRequest<'a> {
    pub argv: &'a [String],
    /// Added on top of the inherited environment
    pub env: &'a [(String, String)],
    pub current_dir: &'a Path,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandOutcome {
    /// Exit code, `-signal` for signal deaths, [`TIMEOUT_STATUS`] on timeout
    pub status: i32,
    pub elapsed: Duration,
}

impl CommandOutcome {
    pub fn timed_out(&self) -> bool {
        self.status == TIMEOUT_STATUS
    }
}

/// Runs a command to completion or until its timeout expires. In the latter
/// case the child is killed and reaped.
///
/// Non-zero exit codes and timeouts are not errors.
#[tracing::instrument(skip(req), fields(program = %req.argv.first().map(String::as_str).unwrap_or("")))]
pub async fn run_command(req: CommandRequest<'_>) -> Result<CommandOutcome, RunError> {
    let (program, args) = req.argv.split_first().ok_or(RunError::EmptyCommand)?;
    let program = PathBuf::from(program);
    let mut cmd = tokio::process::Command::new(&program);
    cmd.args(args);
    cmd.envs(
        req.env
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    cmd.current_dir(req.current_dir);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd.kill_on_drop(true);

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(|source| RunError::Spawn {
        program: program.clone(),
        source,
    })?;
    let wait_err = |source| RunError::Wait {
        program: program.clone(),
        source,
    };
    let waited = tokio::time::timeout(req.timeout, child.wait()).await;
    let status = match waited {
        Ok(status) => status_code(status.map_err(wait_err)?),
        Err(_elapsed) => {
            tracing::warn!(timeout = ?req.timeout, "command timed out, killing it");
            child.kill().await.map_err(wait_err)?;
            TIMEOUT_STATUS
        }
    };
    let elapsed = start.elapsed();
    tracing::debug!(status, elapsed = ?elapsed, "command finished");
    Ok(CommandOutcome { status, elapsed })
}

#[cfg(unix)]
fn status_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => -signal,
        (None, None) => -1,
    }
}

#[cfg(not(unix))]
fn status_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
