//! Notices emitted while supervising services.
//!
//! The lifecycle controller runs synchronously and reports progress over a
//! channel; the CLI prints each event as it arrives.

/// Represents an operator-visible step of a lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The supervision daemon was not running and has been spawned.
    DaemonStarted { pid: u32 },
    /// The supervision daemon was told to stop supervising.
    DaemonUnloaded,
    /// A start command is about to be issued.
    Starting { services: Vec<String> },
    /// A stop command is about to be issued.
    Stopping { services: Vec<String> },
    /// A stop attempt did not converge and will be retried.
    Retrying {
        services: Vec<String>,
        attempt: u32,
        max: u32,
    },
    /// A control command reported failure.
    ControlFailed {
        verb: &'static str,
        services: Vec<String>,
        stderr: String,
    },
    /// A started service's ready message.
    Ready { service: String, message: String },
}
