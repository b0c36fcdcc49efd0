//! Shell command execution for the `shell` tool

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::process::Command;
use tracing::{debug, warn};

const MAX_COMMAND_LENGTH: usize = 4_000;
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Patterns refused even after the user approved the call
const BLOCKED_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "sudo rm",
    "mkfs",
    "dd if=",
    ":(){ :|:& };:",
];

/// Run `command` through `sh -c` in `working_dir` with a 30 second timeout
pub async fn run_command(command: &str, working_dir: &Path) -> Result<String> {
    let command = command.trim();
    if command.is_empty() {
        return Err(anyhow!("Empty command"));
    }
    if command.len() > MAX_COMMAND_LENGTH {
        warn!("Blocked command exceeding max length: {} chars", command.len());
        return Err(anyhow!(
            "Command exceeds maximum length of {} characters",
            MAX_COMMAND_LENGTH
        ));
    }
    if let Some(pattern) = BLOCKED_PATTERNS.iter().find(|p| command.contains(*p)) {
        warn!("Blocked dangerous command: {}", command);
        return Err(anyhow!("Command blocked for safety: contains '{}'", pattern));
    }

    debug!("Running command: {} (in {})", command, working_dir.display());

    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| anyhow!("Command execution timed out after {} seconds", COMMAND_TIMEOUT.as_secs()))?
    .context("Failed to execute command")?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    let mut result = String::new();
    if !stdout.trim().is_empty() {
        result.push_str("STDOUT:\n");
        result.push_str(stdout.trim_end());
    }
    if !stderr.trim().is_empty() {
        if !result.is_empty() {
            result.push_str("\n\n");
        }
        result.push_str("STDERR:\n");
        result.push_str(stderr.trim_end());
    }
    if !output.status.success() {
        result.push_str(&format!(
            "\n\nExit code: {}",
            output.status.code().unwrap_or(-1)
        ));
    }
    if result.is_empty() {
        result.push_str("Command executed successfully (no output).");
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_command_echo() {
        let temp = TempDir::new().unwrap();
        let out = run_command("echo hello", temp.path()).await.unwrap();
        assert_eq!(out, "STDOUT:\nhello");
    }

    #[tokio::test]
    async fn test_run_command_no_output() {
        let temp = TempDir::new().unwrap();
        let out = run_command("true", temp.path()).await.unwrap();
        assert!(out.contains("no output"));
    }

    #[tokio::test]
    async fn test_run_command_reports_exit_code() {
        let temp = TempDir::new().unwrap();
        let out = run_command("echo oops >&2; exit 3", temp.path()).await.unwrap();
        assert!(out.contains("STDERR:\noops"));
        assert!(out.ends_with("Exit code: 3"));
    }

    #[tokio::test]
    async fn test_run_command_runs_in_working_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("marker.txt"), "x").unwrap();
        let out = run_command("ls", temp.path()).await.unwrap();
        assert!(out.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_run_command_blocks_dangerous() {
        let temp = TempDir::new().unwrap();
        assert!(run_command("sudo rm -rf /tmp/x", temp.path()).await.is_err());
        assert!(run_command("   ", temp.path()).await.is_err());
        assert!(run_command(&"a".repeat(5_000), temp.path()).await.is_err());
    }
}
