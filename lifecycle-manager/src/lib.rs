//! Keeps a systemd service in step with the EC2 instance lifecycle.
//!
//! Event sources watch instance metadata and the lifecycle hook queues, the
//! dispatcher hands their notices to the handler one at a time, and the
//! handler starts or stops the service and answers the Auto Scaling hook.

pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod health;
pub mod metrics_consts;
pub mod server;
pub mod source;
