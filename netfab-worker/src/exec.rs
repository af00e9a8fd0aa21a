use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Captured outcome of one external command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// First non-empty diagnostic line, preferring stderr.
    pub fn diagnostic(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        text.trim().to_string()
    }
}

/// Runs external networking tools and captures structured success/failure.
///
/// Every invocation carries a bounded timeout so a hung tool cannot stall a
/// controller indefinitely. A missing binary is reported as
/// `BackendUnavailable`, a non-zero exit as plain command output for the
/// caller to judge. Nothing is ever retried here.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Duration,
}

impl Executor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run with the default timeout. Non-zero exit is not an error.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.run_with_timeout(program, args, self.timeout).await
    }

    /// Run with an explicit timeout (diagnostic tools pick their own).
    pub async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::backend_unavailable(program, e.to_string()));
            }
            Ok(Err(e)) => {
                return Err(Error::system(
                    format!("spawn {program}"),
                    e.to_string(),
                ));
            }
            Err(_) => {
                return Err(Error::system(
                    format!("{program} {}", args.join(" ")),
                    format!("timed out after {}s", timeout.as_secs()),
                ));
            }
        };

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and map a non-zero exit into a `System` error labelled with `op`.
    pub async fn run_checked(
        &self,
        op: &str,
        program: &str,
        args: &[&str],
    ) -> Result<CommandOutput> {
        let output = self.run(program, args).await?;
        if !output.success {
            return Err(Error::system(op, output.diagnostic()));
        }
        Ok(output)
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
