use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lifecycle_common::client::{AwsError, MessageChannel};
use lifecycle_common::hooks::{HookQueue, LifecycleMessage, QueueMessage};
use lifecycle_common::notice::Notice;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{EventSource, PendingSlot};
use crate::error::SourceError;
use crate::health::HealthHandle;
use crate::metrics_consts::{QUEUE_MESSAGES_SKIPPED, SOURCE_ERRORS};

/// Listens to the queue a lifecycle hook notifies, which every instance of the
/// group shares. Messages addressed to other instances are left in place.
pub struct QueueSource {
    channel: Arc<dyn MessageChannel>,
    queue: HookQueue,
    notices: mpsc::Sender<Notice>,
    error_backoff: Duration,
    liveness: HealthHandle,
    pending: PendingSlot,
}

impl QueueSource {
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        queue: HookQueue,
        notices: mpsc::Sender<Notice>,
        error_backoff: Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            channel,
            queue,
            notices,
            error_backoff,
            liveness,
            pending: PendingSlot::default(),
        }
    }

    /// Claims the first message addressed to this instance: deletes it and holds
    /// its notice. Later matches in the same batch stay queued for the next receive.
    async fn claim(&mut self, messages: Vec<QueueMessage>) -> Result<(), AwsError> {
        if messages.is_empty() {
            return Ok(());
        }
        let instance_id = self.channel.instance_id().await?;

        for message in messages {
            let parsed = match LifecycleMessage::parse(&message.body) {
                Ok(parsed) => parsed,
                Err(error) => {
                    metrics::counter!(QUEUE_MESSAGES_SKIPPED, "reason" => "unparseable")
                        .increment(1);
                    debug!(queue = %self.queue.name, %error, "skipping message that is not a lifecycle action");
                    continue;
                }
            };
            if parsed.instance_id != instance_id {
                metrics::counter!(QUEUE_MESSAGES_SKIPPED, "reason" => "other_instance")
                    .increment(1);
                debug!(queue = %self.queue.name, instance_id = %parsed.instance_id, "skipping message for another instance");
                continue;
            }

            self.channel
                .delete_message(&self.queue, &message.receipt_handle)
                .await?;
            let notice = parsed.into_notice(self.queue.transition);
            info!(queue = %self.queue.name, %notice, "claimed lifecycle action");
            self.pending.hold(notice);
            return Ok(());
        }

        Ok(())
    }
}

#[async_trait]
impl EventSource for QueueSource {
    fn name(&self) -> String {
        format!("queue {}", self.queue.name)
    }

    async fn listen(&mut self, shutdown: CancellationToken) -> Result<(), SourceError> {
        let name = self.name();
        info!(queue = %self.queue.name, transition = %self.queue.transition, "listening for lifecycle actions");

        loop {
            if self.pending.is_occupied() {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    offered = self.pending.offer_while_live(&self.notices, &name, &self.liveness) => offered?,
                }
                continue;
            }

            // Only the long poll races shutdown. A claimed message is always handed on.
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.channel.receive_messages(&self.queue) => received,
            };
            self.liveness.report_healthy();

            let result = match received {
                Ok(messages) => self.claim(messages).await,
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                metrics::counter!(SOURCE_ERRORS, "source" => "queue").increment(1);
                warn!(queue = %self.queue.name, %error, "failed to poll lifecycle queue");
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.error_backoff) => {}
                }
            }
        }

        info!(queue = %self.queue.name, "queue source stopped");
        Ok(())
    }
}
