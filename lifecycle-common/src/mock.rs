//! Mock collaborators for testing - always available, no conditional compilation needed.
//!
//! Every mock appends to a shared [`CallLog`] so tests can assert on the relative
//! order of service actions, heartbeats and completions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::client::{
    AwsError, LifecycleProtocolClient, MessageChannel, NoticeSource, QueueDiscovery,
    ServiceController, ServiceError,
};
use crate::hooks::{ActionOutcome, HookQueue, QueueMessage};
use crate::notice::{LifecycleAction, Notice};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    PollSpot,
    Receive { queue: String },
    Delete { queue: String, receipt_handle: String },
    Heartbeat(LifecycleAction),
    Complete(LifecycleAction, ActionOutcome),
    Start,
    Stop,
}

#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call: Call) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().into_iter().filter(|c| predicate(c)).count()
    }
}

/// Mock AWS client with scripted responses.
///
/// Unscripted spot polls return `Ok(None)`. Unscripted receives wait for `idle_wait`
/// and return no messages, like an SQS long poll on an empty queue.
pub struct MockAwsClient {
    instance_id: String,
    log: CallLog,
    idle_wait: Duration,
    spot_responses: Mutex<VecDeque<Result<Option<Notice>, AwsError>>>,
    receive_responses: Mutex<HashMap<String, VecDeque<Result<Vec<QueueMessage>, AwsError>>>>,
    delete_error: Option<AwsError>,
    heartbeat_error: Option<AwsError>,
    complete_error: Option<AwsError>,
    hooks: Result<Vec<HookQueue>, AwsError>,
}

impl MockAwsClient {
    pub fn new(instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_owned(),
            log: CallLog::new(),
            idle_wait: Duration::from_secs(1),
            spot_responses: Mutex::new(VecDeque::new()),
            receive_responses: Mutex::new(HashMap::new()),
            delete_error: None,
            heartbeat_error: None,
            complete_error: None,
            hooks: Ok(Vec::new()),
        }
    }

    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// Queue up the result of the next spot poll.
    pub fn spot_ret(self, response: Result<Option<Notice>, AwsError>) -> Self {
        if let Ok(mut responses) = self.spot_responses.lock() {
            responses.push_back(response);
        }
        self
    }

    /// Queue up the result of the next receive on the queue named `queue`.
    pub fn receive_ret(self, queue: &str, response: Result<Vec<QueueMessage>, AwsError>) -> Self {
        if let Ok(mut responses) = self.receive_responses.lock() {
            responses
                .entry(queue.to_owned())
                .or_default()
                .push_back(response);
        }
        self
    }

    pub fn delete_err(mut self, error: AwsError) -> Self {
        self.delete_error = Some(error);
        self
    }

    pub fn heartbeat_err(mut self, error: AwsError) -> Self {
        self.heartbeat_error = Some(error);
        self
    }

    pub fn complete_err(mut self, error: AwsError) -> Self {
        self.complete_error = Some(error);
        self
    }

    pub fn hooks_ret(mut self, hooks: Result<Vec<HookQueue>, AwsError>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    fn next_receive(&self, queue: &str) -> Option<Result<Vec<QueueMessage>, AwsError>> {
        self.receive_responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.get_mut(queue).and_then(VecDeque::pop_front))
    }
}

#[async_trait]
impl NoticeSource for MockAwsClient {
    async fn poll_spot_termination(&self) -> Result<Option<Notice>, AwsError> {
        self.log.record(Call::PollSpot);
        self.spot_responses
            .lock()
            .ok()
            .and_then(|mut responses| responses.pop_front())
            .unwrap_or(Ok(None))
    }
}

#[async_trait]
impl MessageChannel for MockAwsClient {
    async fn instance_id(&self) -> Result<String, AwsError> {
        Ok(self.instance_id.clone())
    }

    async fn receive_messages(&self, queue: &HookQueue) -> Result<Vec<QueueMessage>, AwsError> {
        self.log.record(Call::Receive {
            queue: queue.name.clone(),
        });
        match self.next_receive(&queue.name) {
            Some(response) => response,
            None => {
                tokio::time::sleep(self.idle_wait).await;
                Ok(Vec::new())
            }
        }
    }

    async fn delete_message(
        &self,
        queue: &HookQueue,
        receipt_handle: &str,
    ) -> Result<(), AwsError> {
        self.log.record(Call::Delete {
            queue: queue.name.clone(),
            receipt_handle: receipt_handle.to_owned(),
        });
        self.delete_error.clone().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl LifecycleProtocolClient for MockAwsClient {
    async fn send_heartbeat(&self, action: &LifecycleAction) -> Result<(), AwsError> {
        self.log.record(Call::Heartbeat(action.clone()));
        self.heartbeat_error.clone().map_or(Ok(()), Err)
    }

    async fn complete_action(
        &self,
        action: &LifecycleAction,
        outcome: ActionOutcome,
    ) -> Result<(), AwsError> {
        self.log.record(Call::Complete(action.clone(), outcome));
        self.complete_error.clone().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl QueueDiscovery for MockAwsClient {
    async fn discover_hooks(&self) -> Result<Vec<HookQueue>, AwsError> {
        self.hooks.clone()
    }
}

/// Mock service that takes `duration` to start or stop.
pub struct MockService {
    log: CallLog,
    duration: Duration,
    start_error: Option<ServiceError>,
    stop_error: Option<ServiceError>,
}

impl MockService {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            duration: Duration::ZERO,
            start_error: None,
            stop_error: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn start_err(mut self, error: ServiceError) -> Self {
        self.start_error = Some(error);
        self
    }

    pub fn stop_err(mut self, error: ServiceError) -> Self {
        self.stop_error = Some(error);
        self
    }

    async fn run(&self, call: Call, error: &Option<ServiceError>) -> Result<(), ServiceError> {
        self.log.record(call);
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        error.clone().map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ServiceController for MockService {
    async fn start(&self) -> Result<(), ServiceError> {
        self.run(Call::Start, &self.start_error).await
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.run(Call::Stop, &self.stop_error).await
    }
}
