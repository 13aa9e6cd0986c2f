//! Running external tools under a timeout and cancellation

use crate::error::{AssemblyError, Error, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Bytes of stderr kept in error messages
const STDERR_TAIL: usize = 2048;

/// Run `command` to completion
///
/// The child is killed when the timeout elapses, when `cancel` fires, or
/// when the returned future is dropped.
pub(crate) async fn run_tool(
    tool: &str,
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    tracing::debug!(tool, command = ?command.as_std(), "running external tool");

    let child = command.spawn().map_err(|e| AssemblyError::Spawn {
        tool: tool.to_string(),
        reason: e.to_string(),
    })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Err(_) => {
                return Err(AssemblyError::TimedOut {
                    tool: tool.to_string(),
                    timeout_secs: timeout.as_secs(),
                }
                .into());
            }
            Ok(output) => output.map_err(|e| AssemblyError::Spawn {
                tool: tool.to_string(),
                reason: e.to_string(),
            })?,
        },
    };

    if output.status.success() {
        return Ok(());
    }

    Err(AssemblyError::ExitStatus {
        tool: tool.to_string(),
        status: output.status.to_string(),
        stderr: stderr_tail(&output.stderr),
    }
    .into())
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
