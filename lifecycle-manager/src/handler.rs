//! Carries out the action a notice calls for.
//!
//! Launch and termination actions run under the lifecycle hook protocol: a
//! heartbeat task keeps the hook alive while the service action runs, and the
//! action is completed exactly once afterwards, whatever its outcome.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lifecycle_common::client::{LifecycleProtocolClient, ServiceController, ServiceError};
use lifecycle_common::hooks::ActionOutcome;
use lifecycle_common::notice::{LifecycleAction, Notice};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::metrics_consts::{COMPLETIONS, HEARTBEATS};

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, notice: &Notice) -> Result<(), HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceAction {
    Start,
    Stop,
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAction::Start => write!(f, "start"),
            ServiceAction::Stop => write!(f, "stop"),
        }
    }
}

pub struct ServiceHandler {
    service: Arc<dyn ServiceController>,
    protocol: Arc<dyn LifecycleProtocolClient>,
    heartbeat_interval: Duration,
}

impl ServiceHandler {
    pub fn new(
        service: Arc<dyn ServiceController>,
        protocol: Arc<dyn LifecycleProtocolClient>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            service,
            protocol,
            heartbeat_interval,
        }
    }

    async fn run(&self, action: ServiceAction) -> Result<(), ServiceError> {
        match action {
            ServiceAction::Start => self.service.start().await,
            ServiceAction::Stop => self.service.stop().await,
        }
    }

    async fn run_lifecycle_action(
        &self,
        service_action: ServiceAction,
        action: &LifecycleAction,
    ) -> Result<(), HandlerError> {
        info!(hook = %action.hook_name, action = %service_action, "running lifecycle action");

        let heartbeat = Heartbeat::spawn(
            self.protocol.clone(),
            action.clone(),
            self.heartbeat_interval,
        );
        let result = self.run(service_action).await;
        heartbeat.stop().await;

        // Failed actions are completed with CONTINUE too; the error is reported below.
        let completion = self
            .protocol
            .complete_action(action, ActionOutcome::Continue)
            .await;
        match &completion {
            Ok(()) => {
                metrics::counter!(COMPLETIONS, "outcome" => "success").increment(1);
                info!(hook = %action.hook_name, outcome = ActionOutcome::Continue.as_str(), "completed lifecycle action");
            }
            Err(_) => metrics::counter!(COMPLETIONS, "outcome" => "failure").increment(1),
        }

        match (result, completion) {
            (Err(error), Err(completion_error)) => {
                error!(hook = %action.hook_name, error = %completion_error, "failed to complete lifecycle action");
                Err(HandlerError::Action(error))
            }
            (Err(error), Ok(())) => Err(HandlerError::Action(error)),
            (Ok(()), Err(completion_error)) => Err(HandlerError::Completion(completion_error)),
            (Ok(()), Ok(())) => Ok(()),
        }
    }
}

#[async_trait]
impl Handler for ServiceHandler {
    async fn handle(&self, notice: &Notice) -> Result<(), HandlerError> {
        match notice {
            // Nothing to acknowledge for spot reclamation, just get out of the way.
            Notice::SpotTermination { deadline } => {
                info!(%deadline, "stopping service before spot reclamation");
                self.run(ServiceAction::Stop).await?;
                Ok(())
            }
            Notice::Launch(action) => self.run_lifecycle_action(ServiceAction::Start, action).await,
            Notice::Termination(action) => {
                self.run_lifecycle_action(ServiceAction::Stop, action).await
            }
        }
    }
}

/// Periodic heartbeats for one lifecycle action.
///
/// Stopped explicitly with [`Heartbeat::stop`]; dropping it also cancels the task.
struct Heartbeat {
    stop: DropGuard,
    task: JoinHandle<()>,
}

impl Heartbeat {
    fn spawn(
        protocol: Arc<dyn LifecycleProtocolClient>,
        action: LifecycleAction,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match protocol.send_heartbeat(&action).await {
                    Ok(()) => {
                        metrics::counter!(HEARTBEATS, "outcome" => "success").increment(1);
                        debug!(hook = %action.hook_name, "sent lifecycle heartbeat");
                    }
                    Err(error) => {
                        metrics::counter!(HEARTBEATS, "outcome" => "failure").increment(1);
                        warn!(hook = %action.hook_name, %error, "failed to send lifecycle heartbeat");
                    }
                }
            }
        });

        Self {
            stop: token.drop_guard(),
            task,
        }
    }

    /// Cancels the task and waits for it, including any heartbeat in flight.
    async fn stop(self) {
        let Heartbeat { stop, task } = self;
        drop(stop);
        if let Err(error) = task.await {
            error!(%error, "heartbeat task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use lifecycle_common::client::AwsError;
    use lifecycle_common::mock::{Call, CallLog, MockAwsClient, MockService};

    use super::*;

    const HEARTBEAT: Duration = Duration::from_secs(10);

    fn handler(client: MockAwsClient, service: MockService) -> ServiceHandler {
        ServiceHandler::new(Arc::new(service), Arc::new(client), HEARTBEAT)
    }

    fn heartbeats(log: &CallLog) -> usize {
        log.count(|c| matches!(c, Call::Heartbeat(_)))
    }

    fn completions(log: &CallLog) -> usize {
        log.count(|c| matches!(c, Call::Complete(..)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_spot_stops_without_hook_protocol() {
        let log = CallLog::new();
        let handler = handler(
            MockAwsClient::new("i-1").with_log(log.clone()),
            MockService::new(log.clone()).with_duration(HEARTBEAT * 3),
        );

        let deadline = "2024-01-01T00:05:00Z".parse().unwrap();
        assert_eq!(handler.handle(&Notice::spot(deadline)).await, Ok(()));
        assert_eq!(log.calls(), vec![Call::Stop]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_heartbeats_then_completes() {
        let log = CallLog::new();
        let handler = handler(
            MockAwsClient::new("i-1").with_log(log.clone()),
            MockService::new(log.clone()).with_duration(HEARTBEAT * 3 + HEARTBEAT / 2),
        );

        let notice = Notice::launch("launch-hook", "tok-1");
        assert_eq!(handler.handle(&notice).await, Ok(()));

        let action = LifecycleAction::new("launch-hook", "tok-1");
        let calls = log.calls();
        assert_eq!(calls.first(), Some(&Call::Start));
        assert_eq!(
            calls.last(),
            Some(&Call::Complete(action.clone(), ActionOutcome::Continue))
        );
        assert_eq!(heartbeats(&log), 3);
        assert_eq!(completions(&log), 1);

        // Nothing is sent once the action has been completed.
        tokio::time::sleep(HEARTBEAT * 5).await;
        assert_eq!(heartbeats(&log), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quick_action_sends_no_heartbeat() {
        let log = CallLog::new();
        let handler = handler(
            MockAwsClient::new("i-1").with_log(log.clone()),
            MockService::new(log.clone()).with_duration(HEARTBEAT / 2),
        );

        let notice = Notice::termination("termination-hook", "tok-2");
        assert_eq!(handler.handle(&notice).await, Ok(()));

        let action = LifecycleAction::new("termination-hook", "tok-2");
        assert_eq!(
            log.calls(),
            vec![Call::Stop, Call::Complete(action, ActionOutcome::Continue)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_action_is_still_completed() {
        let log = CallLog::new();
        let failure = ServiceError::Failed {
            unit: "web.service".to_owned(),
            action: "start".to_owned(),
            message: "systemctl exited with status 1".to_owned(),
        };
        let handler = handler(
            MockAwsClient::new("i-1").with_log(log.clone()),
            MockService::new(log.clone()).start_err(failure.clone()),
        );

        let notice = Notice::launch("launch-hook", "tok-1");
        assert_eq!(
            handler.handle(&notice).await,
            Err(HandlerError::Action(failure))
        );
        assert_eq!(
            log.calls(),
            vec![
                Call::Start,
                Call::Complete(
                    LifecycleAction::new("launch-hook", "tok-1"),
                    ActionOutcome::Continue
                )
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_error_is_returned() {
        let log = CallLog::new();
        let completion_error = AwsError::operation("CompleteLifecycleAction", "token expired");
        let handler = handler(
            MockAwsClient::new("i-1")
                .with_log(log.clone())
                .complete_err(completion_error.clone()),
            MockService::new(log.clone()),
        );

        let notice = Notice::termination("termination-hook", "tok-2");
        assert_eq!(
            handler.handle(&notice).await,
            Err(HandlerError::Completion(completion_error))
        );
        assert_eq!(completions(&log), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_error_wins_over_completion_error() {
        let log = CallLog::new();
        let failure = ServiceError::UnitNotFound("web.service".to_owned());
        let handler = handler(
            MockAwsClient::new("i-1")
                .with_log(log.clone())
                .complete_err(AwsError::operation("CompleteLifecycleAction", "throttled")),
            MockService::new(log.clone()).stop_err(failure.clone()),
        );

        let notice = Notice::termination("termination-hook", "tok-2");
        assert_eq!(
            handler.handle(&notice).await,
            Err(HandlerError::Action(failure))
        );
        assert_eq!(completions(&log), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_failures_do_not_stop_heartbeats() {
        let log = CallLog::new();
        let handler = handler(
            MockAwsClient::new("i-1")
                .with_log(log.clone())
                .heartbeat_err(AwsError::operation("RecordLifecycleActionHeartbeat", "throttled")),
            MockService::new(log.clone()).with_duration(HEARTBEAT * 4 + HEARTBEAT / 2),
        );

        let notice = Notice::launch("launch-hook", "tok-1");
        assert_eq!(handler.handle(&notice).await, Ok(()));
        assert_eq!(heartbeats(&log), 4);
        assert_eq!(completions(&log), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_heartbeats() {
        let log = CallLog::new();
        let handler = handler(
            MockAwsClient::new("i-1").with_log(log.clone()),
            MockService::new(log.clone()).with_duration(HEARTBEAT * 100),
        );

        let notice = Notice::launch("launch-hook", "tok-1");
        let interrupted =
            tokio::time::timeout(HEARTBEAT * 2 + HEARTBEAT / 2, handler.handle(&notice)).await;
        assert!(interrupted.is_err());
        let sent = heartbeats(&log);
        assert_eq!(sent, 2);

        tokio::time::sleep(HEARTBEAT * 5).await;
        assert_eq!(heartbeats(&log), sent);
        assert_eq!(completions(&log), 0);
    }
}
