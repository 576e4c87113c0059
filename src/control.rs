//! The `sv` control primitive.
//!
//! `sv -w <secs> <verb> <paths...>` blocks until every service reaches the
//! requested state or the timeout expires; exit code 0 means all converged.

use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::debug;

/// Verbs issued to `sv`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Start,
    /// Stop, escalating to KILL once the wait expires.
    ForceStop,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Start => "start",
            Verb::ForceStop => "force-stop",
        }
    }
}

/// Result of one control invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Issues control commands to the supervision daemon.
pub trait ControlChannel {
    fn control(&self, verb: Verb, timeout: Duration, services: &[PathBuf]) -> io::Result<ControlOutput>;
}

/// Runs the `sv` binary.
#[derive(Debug, Clone)]
pub struct SvControl {
    binary: PathBuf,
}

impl SvControl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ControlChannel for SvControl {
    fn control(&self, verb: Verb, timeout: Duration, services: &[PathBuf]) -> io::Result<ControlOutput> {
        let mut command = Command::new(&self.binary);
        command
            .arg("-w")
            .arg(timeout.as_secs().max(1).to_string())
            .arg(verb.as_str())
            .args(services);
        debug!(command = ?command, "running control command");
        let output = command.output()?;
        Ok(ControlOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
