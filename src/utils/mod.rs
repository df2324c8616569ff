pub mod privilege;
pub mod progress;

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::Output;
use which::which;

/// Finds a client executable in the system PATH.
pub fn find_executable(tool: &str) -> Result<PathBuf> {
    which(tool).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure the client tools are installed and in your PATH.",
            tool
        )
    })
}

/// Turns a finished command into an error carrying its status and output when it did not succeed.
pub fn check_output(what: &str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "{} failed with status: {}\nStdout: {}\nStderr: {}",
        what,
        output.status,
        String::from_utf8_lossy(&output.stdout).trim(),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_find_executable_missing() {
        let err = find_executable("stackvault-no-such-tool").unwrap_err();
        assert!(err.to_string().contains("stackvault-no-such-tool"));
    }

    #[test]
    fn test_check_output_reports_stderr() -> anyhow::Result<()> {
        let ok = Command::new("sh").args(["-c", "true"]).output()?;
        assert!(check_output("true", &ok).is_ok());

        let failed = Command::new("sh").args(["-c", "echo boom >&2; exit 3"]).output()?;
        let err = check_output("boom step", &failed).unwrap_err().to_string();
        assert!(err.contains("boom step"));
        assert!(err.contains("boom"));
        Ok(())
    }
}
