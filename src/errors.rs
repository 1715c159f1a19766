//! Typed error hierarchy for the sandbox supervisor.
//!
//! Two enums cover the two sides of the supervisor:
//! - `ControlError`: failures reported by the process runtime
//! - `SupervisorError`: failures surfaced to callers of a `ContainerActor`

use thiserror::Error;

/// Errors reported by a [`ProcessControl`](crate::container::control::ProcessControl)
/// implementation.
///
/// Runtimes that only expose free-form text report it as `Message`; the
/// classifier in `container::control` turns that text into one of the typed
/// variants.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("there is no container instance that can be provided to this actor")]
    NoInstance,

    #[error("the container is not listening on port {port}")]
    NotListening { port: u16 },

    #[error("runtime signalled the container to exit: {exit_code}")]
    Signalled { exit_code: i32 },

    #[error("container exited with unexpected exit code: {exit_code}")]
    NonZeroExit { exit_code: i32 },

    #[error("{0}")]
    Message(String),

    #[error("process runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the supervisor core.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Transient capacity condition. Callers turn this into a 503.
    #[error("there is no container instance that can be provided to this actor")]
    NoInstanceAvailable,

    #[error("container crashed while waiting for port {port}")]
    ProcessCrashed { port: u16 },

    #[error("container exited before it became ready (exit code {exit_code})")]
    ExitedEarly { exit_code: i32 },

    #[error("container did not start after {tries} attempts")]
    DidNotStart { tries: u32 },

    #[error("port {port} did not become ready after {tries} attempts")]
    PortNotReady { port: u16, tries: u32 },

    #[error("operation aborted by caller")]
    Aborted,

    #[error("no task handler registered under '{name}'")]
    UnknownCallback { name: String },

    #[error("task time is out of range: {0}")]
    ScheduleOutOfRange(String),

    /// A failure raised inside the exclusive start section, carried out as text.
    #[error("start sequence failed: {0}")]
    StartSequence(String),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SupervisorError {
    /// True for the capacity condition the proxy reports as 503.
    pub fn is_no_instance(&self) -> bool {
        matches!(
            self,
            SupervisorError::NoInstanceAvailable | SupervisorError::Control(ControlError::NoInstance)
        )
    }
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_error_messages_match_runtime_text() {
        let err = ControlError::Signalled { exit_code: 137 };
        assert_eq!(
            err.to_string(),
            "runtime signalled the container to exit: 137"
        );
        let err = ControlError::NonZeroExit { exit_code: 2 };
        assert_eq!(
            err.to_string(),
            "container exited with unexpected exit code: 2"
        );
    }

    #[test]
    fn no_instance_is_detected_through_control_wrapper() {
        assert!(SupervisorError::NoInstanceAvailable.is_no_instance());
        assert!(SupervisorError::from(ControlError::NoInstance).is_no_instance());
        assert!(!SupervisorError::Aborted.is_no_instance());
    }

    #[test]
    fn did_not_start_carries_tries() {
        let err = SupervisorError::DidNotStart { tries: 26 };
        match &err {
            SupervisorError::DidNotStart { tries } => assert_eq!(*tries, 26),
            _ => panic!("Expected DidNotStart variant"),
        }
        assert!(err.to_string().contains("26"));
    }

    #[test]
    fn storage_error_keeps_source() {
        let err = SupervisorError::Storage(anyhow::anyhow!("disk full"));
        assert!(err.to_string().contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
