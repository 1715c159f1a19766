//! The process-control seam.
//!
//! `ProcessControl` is everything the supervisor needs from a runtime that
//! actually hosts the worker process. Runtimes that only report failures as
//! text are classified here by message content.

use std::sync::LazyLock;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use futures::future::BoxFuture;
use regex::Regex;

use super::models::{Signal, StartConfig};
use crate::errors::ControlError;

const NO_INSTANCE_MESSAGE: &str = "there is no container instance that can be provided";
const NOT_LISTENING_MESSAGE: &str = "the container is not listening";
const RUNTIME_SIGNALLED_MESSAGE: &str = "runtime signalled the container to exit";
const NON_ZERO_EXIT_MESSAGE: &str = "container exited with unexpected exit code";

static EXIT_CODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?\d+)\D*$").expect("static regex"));

/// Future returned by [`ProcessControl::monitor`]. Resolves once per start
/// cycle: `Ok` on a clean exit, `Err` on abnormal exit or when there is no
/// process to watch.
pub type ExitFuture = BoxFuture<'static, Result<(), ControlError>>;

/// Control surface of the runtime hosting a worker process.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Live runtime view; may disagree with the persisted status.
    fn is_running(&self) -> bool;

    async fn start(&self, config: StartConfig) -> Result<(), ControlError>;

    async fn signal(&self, signal: Signal) -> Result<(), ControlError>;

    async fn destroy(&self) -> Result<(), ControlError>;

    /// Lightweight liveness request against `port`.
    async fn probe_port(&self, port: u16) -> Result<(), ControlError>;

    /// Watch the current process until it exits.
    fn monitor(&self) -> ExitFuture;

    /// Forward an HTTP exchange to the process's exposed `port`.
    async fn forward(
        &self,
        port: u16,
        request: Request<Body>,
    ) -> Result<Response<Body>, ControlError>;
}

/// Settled result of an exit monitor, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    Clean,
    /// Transient: the runtime had nothing to watch.
    NoInstance,
    RuntimeSignalled { exit_code: i32 },
    NonZeroExit { exit_code: i32 },
    Unclassified(String),
}

impl ExitOutcome {
    pub fn from_result(result: &Result<(), ControlError>) -> Self {
        match result {
            Ok(()) => Self::Clean,
            Err(err) => classify(err),
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Clean => Some(0),
            Self::RuntimeSignalled { exit_code } | Self::NonZeroExit { exit_code } => {
                Some(*exit_code)
            }
            Self::NoInstance | Self::Unclassified(_) => None,
        }
    }
}

/// Classify a runtime error into the exit taxonomy.
pub fn classify(err: &ControlError) -> ExitOutcome {
    match err {
        ControlError::NoInstance => ExitOutcome::NoInstance,
        ControlError::Signalled { exit_code } => ExitOutcome::RuntimeSignalled {
            exit_code: *exit_code,
        },
        ControlError::NonZeroExit { exit_code } => ExitOutcome::NonZeroExit {
            exit_code: *exit_code,
        },
        ControlError::Message(msg) => classify_message(msg),
        other => ExitOutcome::Unclassified(other.to_string()),
    }
}

/// Classify free-form runtime text. Matching is case-insensitive; the exit
/// code is the last integer in the message.
pub fn classify_message(message: &str) -> ExitOutcome {
    let lower = message.to_lowercase();
    if lower.contains(NO_INSTANCE_MESSAGE) {
        return ExitOutcome::NoInstance;
    }
    if lower.contains(RUNTIME_SIGNALLED_MESSAGE) {
        if let Some(exit_code) = extract_exit_code(message) {
            return ExitOutcome::RuntimeSignalled { exit_code };
        }
    } else if lower.contains(NON_ZERO_EXIT_MESSAGE)
        && let Some(exit_code) = extract_exit_code(message)
    {
        return ExitOutcome::NonZeroExit { exit_code };
    }
    ExitOutcome::Unclassified(message.to_string())
}

pub fn extract_exit_code(message: &str) -> Option<i32> {
    EXIT_CODE_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn is_not_listening(err: &ControlError) -> bool {
    match err {
        ControlError::NotListening { .. } => true,
        ControlError::Message(msg) => msg.to_lowercase().contains(NOT_LISTENING_MESSAGE),
        _ => false,
    }
}

pub fn is_no_instance(err: &ControlError) -> bool {
    matches!(classify(err), ExitOutcome::NoInstance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_runtime_signal_text() {
        assert_eq!(
            classify_message("Runtime signalled the container to exit: 137"),
            ExitOutcome::RuntimeSignalled { exit_code: 137 }
        );
    }

    #[test]
    fn classifies_non_zero_exit_text() {
        assert_eq!(
            classify_message("container exited with unexpected exit code: 2."),
            ExitOutcome::NonZeroExit { exit_code: 2 }
        );
    }

    #[test]
    fn classifies_no_instance_text() {
        let msg = "There is no Container instance that can be provided to this actor";
        assert_eq!(classify_message(msg), ExitOutcome::NoInstance);
        assert!(is_no_instance(&ControlError::Message(msg.to_string())));
    }

    #[test]
    fn signal_without_code_is_unclassified() {
        assert!(matches!(
            classify_message("runtime signalled the container to exit"),
            ExitOutcome::Unclassified(_)
        ));
    }

    #[test]
    fn anything_else_is_unclassified() {
        assert_eq!(
            classify_message("network partition"),
            ExitOutcome::Unclassified("network partition".to_string())
        );
        let io = ControlError::Io(std::io::Error::other("boom"));
        assert!(matches!(classify(&io), ExitOutcome::Unclassified(_)));
    }

    #[test]
    fn typed_errors_skip_text_matching() {
        assert_eq!(
            classify(&ControlError::Signalled { exit_code: 9 }),
            ExitOutcome::RuntimeSignalled { exit_code: 9 }
        );
        assert_eq!(
            ExitOutcome::from_result(&Err(ControlError::NonZeroExit { exit_code: 1 })).exit_code(),
            Some(1)
        );
        assert_eq!(ExitOutcome::from_result(&Ok(())).exit_code(), Some(0));
    }

    #[test]
    fn not_listening_detection() {
        assert!(is_not_listening(&ControlError::NotListening { port: 8080 }));
        assert!(is_not_listening(&ControlError::Message(
            "The container is not listening in the TCP address 10.0.0.1:8080".to_string()
        )));
        assert!(!is_not_listening(&ControlError::NoInstance));
    }
}
