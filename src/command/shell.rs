//! Shell command execution

use tokio::process::Command;
use tracing::{debug, info};

/// Captured result of one command run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    /// Process exit status, `-1` if the process never reported one
    pub status_code: i32,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }

    /// Output forwarded to the control plane: stdout, or stderr on failure
    pub fn response_text(&self) -> &str {
        if self.success() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Payloads are authored with single-quoted literals; the shell gets double quotes
pub fn normalize_command(command: &str) -> String {
    command.replace('\'', "\"")
}

/// Run `command` through `/bin/sh -c`, capturing trimmed output
pub async fn run_shell(command: &str) -> ExecutionOutcome {
    info!("Execute command: {}", command);

    match Command::new("/bin/sh").arg("-c").arg(command).output().await {
        Ok(output) => {
            let outcome = ExecutionOutcome {
                stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                status_code: output.status.code().unwrap_or(-1),
            };
            debug!("Command exited with {}", outcome.status_code);
            outcome
        }
        Err(e) => ExecutionOutcome {
            stdout: String::new(),
            stderr: e.to_string(),
            status_code: -1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_command() {
        assert_eq!(normalize_command("echo 'hi there'"), "echo \"hi there\"");
    }

    #[tokio::test]
    async fn test_run_shell_captures_output() {
        let outcome = run_shell("echo hi; echo oops >&2").await;
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "hi");
        assert_eq!(outcome.stderr, "oops");
        assert_eq!(outcome.response_text(), "hi");
    }

    #[tokio::test]
    async fn test_run_shell_failure() {
        let outcome = run_shell("echo bad >&2; exit 3").await;
        assert_eq!(outcome.status_code, 3);
        assert!(!outcome.success());
        assert_eq!(outcome.response_text(), "bad");
    }
}
