//! One-shot command execution over an exec channel.
//!
//! Unlike a persistent shell, an exec channel keeps stdout and stderr apart
//! and reports the exit status (or signal) directly, so no framing is needed.
//! The connection comes from the pool and stays pooled afterwards.

use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::{SshError, SshResult};
use super::pool::TransportPool;
use super::transport::{ChannelEvent, TargetSpec};
use super::types::CommandResult;

/// Run `command` on `target` and collect its output.
///
/// Fails with a timeout error when the channel has not closed within
/// `timeout`; the channel is then closed from our side.
pub async fn run(
    pool: &TransportPool,
    target: &TargetSpec,
    command: &str,
    timeout: Duration,
) -> SshResult<CommandResult> {
    let transport = pool.acquire(target).await?;
    let mut channel = transport.open_exec(command).await?;
    info!(
        "Executing on {}@{}:{}: {}",
        target.username, target.host, target.port, command
    );

    // Pre-allocate buffers to reduce reallocations during output collection
    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::with_capacity(1024);
    let mut exit_code: Option<u32> = None;
    let mut signal: Option<String> = None;
    let mut closed = false;

    let collected = tokio::time::timeout(timeout, async {
        while let Some(event) = channel.reader.next_event().await {
            match event {
                ChannelEvent::Stdout(data) => stdout.extend_from_slice(&data),
                ChannelEvent::Stderr(data) => stderr.extend_from_slice(&data),
                ChannelEvent::ExitStatus(status) => exit_code = Some(status),
                ChannelEvent::ExitSignal(name) => signal = Some(name),
                ChannelEvent::Eof => {}
                ChannelEvent::Closed => {
                    closed = true;
                    break;
                }
            }
        }
    })
    .await;

    if collected.is_err() {
        warn!(
            "Command timed out after {:?} ({} bytes stdout, {} bytes stderr): {}",
            timeout,
            stdout.len(),
            stderr.len(),
            command
        );
        let _ = channel.writer.close().await;
        return Err(SshError::timeout(format!(
            "Command timed out after {}ms",
            timeout.as_millis()
        )));
    }

    // The stream ended without a close or any exit report: the connection dropped
    if !closed && exit_code.is_none() && signal.is_none() {
        warn!(
            "Channel lost before command finished ({} bytes stdout): {}",
            stdout.len(),
            command
        );
        return Err(SshError::channel(format!(
            "Connection lost while running '{}'",
            command
        )));
    }

    debug!("Command finished with {:?} / {:?}", exit_code, signal);
    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: exit_code.map(|c| c as i32),
        signal,
    })
}
