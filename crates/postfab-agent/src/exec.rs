//! Instruction execution.
//!
//! A non-zero exit code is a result, not an error; only failure to spawn or
//! to capture output is reported as a failure.

use std::io::Write;
use std::process::Stdio;

use tracing::debug;

use postfab_proto::v1::{Command, CommandResponse, Script, ScriptResponse};

/// Run an executable with the given arguments and environment (appended to
/// the inherited environment), capturing stdout and stderr.
pub async fn run_command(command: &Command) -> std::io::Result<CommandResponse> {
    let mut cmd = tokio::process::Command::new(&command.command);
    cmd.args(&command.args).stdin(Stdio::null());
    apply_env(&mut cmd, &command.env);

    let output = cmd.output().await?;
    Ok(CommandResponse {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Stage the script body in a temporary file and run it as
/// `interpreter file args...`. The file is removed when execution finishes.
pub async fn run_script(script: &Script) -> std::io::Result<ScriptResponse> {
    let mut file = tempfile::Builder::new().prefix("postfab-").tempfile()?;
    file.as_file_mut().write_all(script.script.as_bytes())?;
    file.as_file_mut().flush()?;
    debug!(path = %file.path().display(), "staged script");

    let mut cmd = tokio::process::Command::new(&script.interpreter);
    cmd.arg(file.path())
        .args(&script.args)
        .stdin(Stdio::null());

    let output = cmd.output().await?;
    Ok(ScriptResponse {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

fn apply_env(cmd: &mut tokio::process::Command, env: &[String]) {
    for pair in env {
        if let Some((key, value)) = pair.split_once('=') {
            cmd.env(key, value);
        }
    }
}
