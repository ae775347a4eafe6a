use eyre::eyre;
use std::process::Stdio;
use std::str;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{handle_exec_error, handle_generic_error, Error};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/**
   Run a host command to completion, optionally feeding `stdin`, and
   return its output regardless of the exit status.
*/
pub async fn exec_output(
    desc: &str,
    command_path: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<ExecOutput, Error> {
    debug!(
        "Executing command for {}: {} {}",
        desc,
        command_path,
        itertools::join(args, " ")
    );

    let mut command = Command::new(command_path);
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(handle_exec_error(command_path))?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
    }

    let output = child.wait_with_output().await?;

    let stdout = str::from_utf8(&output.stdout)
        .map_err(handle_generic_error)?
        .to_string();

    let stderr = str::from_utf8(&output.stderr)
        .map_err(handle_generic_error)?
        .to_string();

    let exit_code = output.status.code().map(i64::from).unwrap_or(-1);

    trace!(
        "command exited with status {}, stdout: {}, stderr: {}",
        exit_code,
        stdout,
        stderr
    );

    Ok(ExecOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// Run a host command and fail on a non-zero exit status.
pub async fn simple_exec(
    desc: &str,
    command_path: &str,
    args: &[String],
) -> Result<ExecOutput, Error> {
    let output = exec_output(desc, command_path, args, None).await?;

    if output.is_success() {
        Ok(output)
    } else {
        Err(Error::generic(eyre!(
            "command exited with error status {} and message: {}",
            output.exit_code,
            output.stderr
        )))
    }
}
