//! External command execution for CLI-driven adapters

use crate::error::{Error, Result};
use tracing::debug;

const NO_ENTRY: &str = "No such file or directory";
const PERMISSION_DENIED: &[&str] = &["Permission denied", "EPERM", "(1) Operation not permitted"];

/// Output from a command execution
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The target of the command does not exist
    pub fn is_not_found(&self) -> bool {
        !self.success() && self.stderr.contains(NO_ENTRY)
    }

    pub fn is_permission_denied(&self) -> bool {
        !self.success() && PERMISSION_DENIED.iter().any(|p| self.stderr.contains(p))
    }

    /// Classify a failed command into a backend error
    pub fn into_error(self, operation: &str, target: &str) -> Error {
        if self.is_permission_denied() {
            return Error::PermissionDenied {
                operation: operation.to_string(),
                target: target.to_string(),
            };
        }
        let reason = match self.stderr.trim() {
            "" => format!("exit code {}", self.exit_code),
            stderr => stderr.lines().last().unwrap_or(stderr).to_string(),
        };
        Error::backend(operation, target, reason)
    }

    /// Fail unless the command exited cleanly
    pub fn check(self, operation: &str, target: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(self.into_error(operation, target))
        }
    }
}

/// Execute a command and return output regardless of exit code
pub async fn exec_unchecked(program: &str, args: &[String]) -> Result<CommandOutput> {
    debug!("Executing: {} {}", program, args.join(" "));

    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| Error::backend("exec", format!("{} {}", program, args.join(" ")), e.to_string()))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    debug!(
        "Command exited with code {}: {} {}",
        exit_code,
        program,
        args.join(" ")
    );

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
    })
}
