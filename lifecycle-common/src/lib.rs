//! Shared lifecycle types and the collaborators the lifecycle manager talks to:
//! instance metadata, hook queues, the Auto Scaling lifecycle hook protocol and systemd.

pub mod aws;
pub mod client;
pub mod hooks;
pub mod mock;
pub mod notice;
pub mod service;
