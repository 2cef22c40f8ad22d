//! Startup and shutdown hook scripts.
//!
//! Each script is a shell snippet run through `/bin/sh -c`. Its stdout is
//! forwarded line by line at info level and its stderr at error level, so
//! hook output ends up in the daemon's structured log.

use std::process::{ExitStatus, Stdio};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

const SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Copy)]
enum Output {
    Stdout,
    Stderr,
}

/// Run `script` to completion and return its exit status.
///
/// # Errors
///
/// Returns an error if the shell cannot be spawned or waited on.
pub async fn run_script(stage: &'static str, script: &str) -> Result<ExitStatus> {
    tracing::info!(stage, "running {} script", stage);

    let mut child = Command::new(SHELL)
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to spawn {stage} script"))?;

    let stdout = child
        .stdout
        .take()
        .context("script stdout was not captured")?;
    let stderr = child
        .stderr
        .take()
        .context("script stderr was not captured")?;

    let (_, _, status) = tokio::join!(
        forward_lines(stage, stdout, Output::Stdout),
        forward_lines(stage, stderr, Output::Stderr),
        child.wait(),
    );

    status.with_context(|| format!("failed to wait for {stage} script"))
}

/// Run the startup script, if configured.
///
/// # Errors
///
/// A nonzero exit is an error; the daemon must not start the guard after it.
pub async fn run_startup_script(script: &str) -> Result<()> {
    if script.trim().is_empty() {
        return Ok(());
    }

    let status = run_script("startup", script).await?;
    if !status.success() {
        return Err(anyhow::anyhow!("startup script failed with {}", status));
    }
    tracing::info!("startup script completed");
    Ok(())
}

/// Run the shutdown script, if configured. Failures are logged only.
pub async fn run_shutdown_script(script: &str) {
    if script.trim().is_empty() {
        return;
    }

    match run_script("shutdown", script).await {
        Ok(status) if status.success() => tracing::info!("shutdown script completed"),
        Ok(status) => tracing::error!(%status, "shutdown script failed"),
        Err(e) => tracing::error!(error = %e, "shutdown script could not run"),
    }
}

async fn forward_lines<R>(stage: &'static str, reader: R, output: Output)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match output {
                Output::Stdout => tracing::info!(stage, "{}", line),
                Output::Stderr => tracing::error!(stage, "{}", line),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(stage, error = %e, "failed to read script output");
                break;
            }
        }
    }
}
