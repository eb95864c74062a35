use lifecycle_common::client::{AwsError, ServiceError};
use thiserror::Error;

/// Conditions that end an event source. Everything else a source runs into is
/// logged and retried on the next cycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("dispatcher channel closed while {0} source was running")]
    DispatcherClosed(String),
}

/// Enumeration of errors returned by the action handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("service action failed: {0}")]
    Action(#[from] ServiceError),
    #[error("failed to complete lifecycle action: {0}")]
    Completion(#[from] AwsError),
}

/// Enumeration of reasons the coordinator stopped with a failure.
#[derive(Error, Debug)]
pub enum ShutdownError {
    #[error("{name} source failed: {error}")]
    SourceFailed { name: String, error: SourceError },
    #[error("source task panicked: {0}")]
    SourcePanicked(String),
}
