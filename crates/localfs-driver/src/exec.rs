use std::{ffi::OsStr, process::Stdio};

use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("command exited with {code:?}: {stderr}")]
pub struct ExecFailure {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs `program` to completion, capturing output. Non-zero exit (or failure
/// to start at all) is an `Err` carrying whatever was captured.
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I) -> Result<ExecOutput, ExecFailure>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let out = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ExecFailure {
            code: None,
            stdout: String::new(),
            stderr: e.to_string(),
        })?;

    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    let code = out.status.code();
    if out.status.success() {
        Ok(ExecOutput {
            code,
            stdout,
            stderr,
        })
    } else {
        Err(ExecFailure {
            code,
            stdout,
            stderr,
        })
    }
}
