//! Collaborator interfaces used by the lifecycle manager.
//!
//! Follows the trait-based client pattern: a real implementation talks to AWS or
//! systemd, and a manual mock in [`crate::mock`] is always available for tests.

use async_trait::async_trait;
use thiserror::Error;

use crate::hooks::{ActionOutcome, HookQueue, QueueMessage};
use crate::notice::{LifecycleAction, Notice};

/// Enumeration of errors returned by the AWS collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AwsError {
    #[error("instance metadata request for {path} failed: {message}")]
    Metadata { path: String, message: String },
    #[error("invalid spot termination time {value}: {message}")]
    InvalidTerminationTime { value: String, message: String },
    #[error("instance {0} is not controlled by an auto scaling group")]
    NoAutoScalingGroup(String),
    #[error("{operation} failed: {message}")]
    Operation { operation: String, message: String },
    #[error("invalid notification target: {0}")]
    InvalidTarget(String),
}

impl AwsError {
    pub fn operation(operation: &str, message: impl Into<String>) -> Self {
        AwsError::Operation {
            operation: operation.to_owned(),
            message: message.into(),
        }
    }
}

/// Enumeration of errors returned when controlling the managed service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("systemd unit {0} was not found")]
    UnitNotFound(String),
    #[error("failed to run systemctl for unit {unit}: {message}")]
    Spawn { unit: String, message: String },
    #[error("failed to {action} systemd unit {unit}: {message}")]
    Failed {
        unit: String,
        action: String,
        message: String,
    },
}

/// Polls instance metadata for an impending spot reclamation.
#[async_trait]
pub trait NoticeSource: Send + Sync {
    /// Returns a spot termination notice once EC2 has scheduled this instance for reclamation.
    async fn poll_spot_termination(&self) -> Result<Option<Notice>, AwsError>;
}

/// A hook queue shared by every instance of the group.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Identity used to filter messages addressed to this instance.
    async fn instance_id(&self) -> Result<String, AwsError>;

    /// Wait for a batch of messages without hiding them from other consumers.
    async fn receive_messages(&self, queue: &HookQueue) -> Result<Vec<QueueMessage>, AwsError>;

    /// Acknowledge a message. Only ever called for messages addressed to this instance.
    async fn delete_message(&self, queue: &HookQueue, receipt_handle: &str)
        -> Result<(), AwsError>;
}

/// The client side of the Auto Scaling lifecycle hook protocol.
#[async_trait]
pub trait LifecycleProtocolClient: Send + Sync {
    async fn send_heartbeat(&self, action: &LifecycleAction) -> Result<(), AwsError>;

    async fn complete_action(
        &self,
        action: &LifecycleAction,
        outcome: ActionOutcome,
    ) -> Result<(), AwsError>;
}

/// Finds the hook queues this instance must listen to. Called once at startup.
#[async_trait]
pub trait QueueDiscovery: Send + Sync {
    async fn discover_hooks(&self) -> Result<Vec<HookQueue>, AwsError>;
}

/// Starts and stops the managed service, waiting for the operation to finish.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn start(&self) -> Result<(), ServiceError>;
    async fn stop(&self) -> Result<(), ServiceError>;
}
