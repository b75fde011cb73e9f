//! Traceroute capture for fault evidence.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use super::ProbeError;

/// How much of the trace output is kept.
const TRACE_TAIL_CHARS: usize = 200;

/// Run `traceroute -n -m 10 -w 2` against `target` and return the tail of its output.
pub async fn run_traceroute(target: &str, timeout: Duration) -> Result<String, ProbeError> {
    let output = tokio::time::timeout(
        timeout,
        Command::new("traceroute")
            .args(["-n", "-m", "10", "-w", "2", target])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ProbeError::Timeout(timeout))?
    .map_err(|e| ProbeError::Transport(format!("failed to execute traceroute: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if stdout.trim().is_empty() {
        return Err(ProbeError::Transport(format!(
            "traceroute produced no output: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(tail_chars(&stdout, TRACE_TAIL_CHARS).to_string())
}

/// Last `n` characters of `s`, on a char boundary.
pub fn tail_chars(s: &str, n: usize) -> &str {
    match s.char_indices().rev().nth(n.saturating_sub(1)) {
        Some((idx, _)) if n > 0 => &s[idx..],
        _ if n == 0 => "",
        _ => s,
    }
}
