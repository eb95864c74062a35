use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::imds::client::error::ImdsError;
use aws_config::imds::Client as ImdsClient;
use aws_config::SdkConfig;
use aws_sdk_autoscaling::error::DisplayErrorContext;
use aws_sdk_autoscaling::Client as AutoScalingClient;
use aws_sdk_sqs::Client as SqsClient;
use chrono::{DateTime, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::client::{
    AwsError, LifecycleProtocolClient, MessageChannel, NoticeSource, QueueDiscovery,
};
use crate::hooks::{
    ActionOutcome, HookQueue, LifecycleTransition, ParseArnError, QueueMessage, TargetArn,
};
use crate::notice::{LifecycleAction, Notice};

const INSTANCE_ID_PATH: &str = "/latest/meta-data/instance-id";
const SPOT_TERMINATION_PATH: &str = "/latest/meta-data/spot/termination-time";

/// Parameters of the SQS long poll issued by `receive_messages`.
#[derive(Debug, Clone, Copy)]
pub struct ReceiveOptions {
    pub max_messages: i32,
    pub wait_time_seconds: i32,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time_seconds: 20,
        }
    }
}

/// Real implementation of every AWS collaborator, backed by IMDS, SQS and Auto Scaling.
///
/// The instance id and the Auto Scaling group name cannot change while the process
/// runs, so both are fetched on first use and reused afterwards.
pub struct AwsClient {
    imds: ImdsClient,
    autoscaling: AutoScalingClient,
    sqs: SqsClient,
    receive: ReceiveOptions,
    instance_id: OnceCell<String>,
    group_name: OnceCell<String>,
}

impl AwsClient {
    pub fn new(config: &SdkConfig, receive: ReceiveOptions) -> Self {
        Self {
            imds: ImdsClient::builder().build(),
            autoscaling: AutoScalingClient::new(config),
            sqs: SqsClient::new(config),
            receive,
            instance_id: OnceCell::new(),
            group_name: OnceCell::new(),
        }
    }

    /// Load the shared AWS configuration from the environment (falling back to IMDS on EC2).
    pub async fn from_env(receive: ReceiveOptions) -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(&config, receive)
    }

    async fn metadata(&self, path: &str) -> Result<String, ImdsError> {
        let value = self.imds.get(path).await?;
        Ok(value.as_ref().to_owned())
    }

    /// The Auto Scaling group this instance belongs to.
    pub async fn group_name(&self) -> Result<&str, AwsError> {
        let name = self
            .group_name
            .get_or_try_init(|| async {
                let instance_id = self.instance_id().await?;
                let output = self
                    .autoscaling
                    .describe_auto_scaling_instances()
                    .instance_ids(instance_id.clone())
                    .send()
                    .await
                    .map_err(|e| {
                        AwsError::operation(
                            "DescribeAutoScalingInstances",
                            DisplayErrorContext(&e).to_string(),
                        )
                    })?;

                let names: Vec<Option<&str>> = output
                    .auto_scaling_instances()
                    .iter()
                    .map(|details| details.auto_scaling_group_name())
                    .collect();
                single_group_name(instance_id, &names)
            })
            .await?;

        Ok(name.as_str())
    }
}

fn metadata_error(path: &str, error: ImdsError) -> AwsError {
    AwsError::Metadata {
        path: path.to_owned(),
        message: error.to_string(),
    }
}

fn is_not_found(error: &ImdsError) -> bool {
    match error {
        ImdsError::ErrorResponse(response) => response.response().status().as_u16() == 404,
        _ => false,
    }
}

/// Parse the value of the spot termination-time metadata key.
pub fn parse_termination_time(value: &str) -> Result<DateTime<Utc>, AwsError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|deadline| deadline.with_timezone(&Utc))
        .map_err(|e| AwsError::InvalidTerminationTime {
            value: value.to_owned(),
            message: e.to_string(),
        })
}

/// The group name from a `DescribeAutoScalingInstances` answer for one instance.
fn single_group_name(instance_id: String, names: &[Option<&str>]) -> Result<String, AwsError> {
    match names {
        [Some(name)] => Ok((*name).to_owned()),
        _ => Err(AwsError::NoAutoScalingGroup(instance_id)),
    }
}

/// The fields of a lifecycle hook that decide which queue to listen to.
#[derive(Debug, Clone, Copy)]
pub struct HookDescription<'a> {
    pub name: &'a str,
    pub target: Option<&'a str>,
    pub transition: Option<&'a str>,
}

/// Picks the SQS targets to listen to, once per target ARN, sorted by queue name.
///
/// Hooks without a target, with a non-SQS target or with an unknown transition
/// are skipped. A malformed target ARN is an error.
pub fn hook_targets(
    hooks: &[HookDescription<'_>],
) -> Result<Vec<(TargetArn, LifecycleTransition)>, AwsError> {
    let mut targets: HashMap<&str, (TargetArn, LifecycleTransition)> = HashMap::new();
    for hook in hooks {
        let Some(target) = hook.target else {
            debug!(hook = hook.name, "lifecycle hook has no notification target");
            continue;
        };
        if targets.contains_key(target) {
            debug!(
                hook = hook.name,
                notification_target = target,
                "notification target already known"
            );
            continue;
        }

        let arn: TargetArn = target
            .parse()
            .map_err(|e: ParseArnError| AwsError::InvalidTarget(e.to_string()))?;
        if arn.service != "sqs" {
            debug!(
                hook = hook.name,
                notification_target = target,
                "skipping non-SQS notification target"
            );
            continue;
        }

        let Some(Ok(transition)) = hook.transition.map(str::parse::<LifecycleTransition>) else {
            warn!(
                hook = hook.name,
                "skipping lifecycle hook with an unknown transition"
            );
            continue;
        };
        targets.insert(target, (arn, transition));
    }

    let mut unique: Vec<(TargetArn, LifecycleTransition)> = targets.into_values().collect();
    unique.sort_by(|a, b| a.0.resource.cmp(&b.0.resource));
    Ok(unique)
}

#[async_trait]
impl NoticeSource for AwsClient {
    async fn poll_spot_termination(&self) -> Result<Option<Notice>, AwsError> {
        match self.metadata(SPOT_TERMINATION_PATH).await {
            Ok(value) => Ok(Some(Notice::spot(parse_termination_time(&value)?))),
            // The key only exists once the instance has been marked for reclamation.
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(metadata_error(SPOT_TERMINATION_PATH, error)),
        }
    }
}

#[async_trait]
impl MessageChannel for AwsClient {
    async fn instance_id(&self) -> Result<String, AwsError> {
        let id = self
            .instance_id
            .get_or_try_init(|| async {
                self.metadata(INSTANCE_ID_PATH)
                    .await
                    .map_err(|e| metadata_error(INSTANCE_ID_PATH, e))
            })
            .await?;

        Ok(id.clone())
    }

    async fn receive_messages(&self, queue: &HookQueue) -> Result<Vec<QueueMessage>, AwsError> {
        // A zero visibility timeout keeps messages visible to the rest of the group.
        let output = self
            .sqs
            .receive_message()
            .queue_url(&queue.url)
            .max_number_of_messages(self.receive.max_messages)
            .wait_time_seconds(self.receive.wait_time_seconds)
            .visibility_timeout(0)
            .send()
            .await
            .map_err(|e| {
                AwsError::operation(
                    "ReceiveMessage",
                    aws_sdk_sqs::error::DisplayErrorContext(&e).to_string(),
                )
            })?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|message| match (message.body(), message.receipt_handle()) {
                (Some(body), Some(receipt_handle)) => {
                    Some(QueueMessage::new(body, receipt_handle))
                }
                _ => None,
            })
            .collect();

        Ok(messages)
    }

    async fn delete_message(
        &self,
        queue: &HookQueue,
        receipt_handle: &str,
    ) -> Result<(), AwsError> {
        self.sqs
            .delete_message()
            .queue_url(&queue.url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| {
                AwsError::operation(
                    "DeleteMessage",
                    aws_sdk_sqs::error::DisplayErrorContext(&e).to_string(),
                )
            })?;

        Ok(())
    }
}

#[async_trait]
impl LifecycleProtocolClient for AwsClient {
    async fn send_heartbeat(&self, action: &LifecycleAction) -> Result<(), AwsError> {
        let instance_id = self.instance_id().await?;
        let group_name = self.group_name().await?;

        self.autoscaling
            .record_lifecycle_action_heartbeat()
            .auto_scaling_group_name(group_name)
            .instance_id(instance_id)
            .lifecycle_hook_name(&action.hook_name)
            .lifecycle_action_token(&action.action_token)
            .send()
            .await
            .map_err(|e| {
                AwsError::operation(
                    "RecordLifecycleActionHeartbeat",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;

        Ok(())
    }

    async fn complete_action(
        &self,
        action: &LifecycleAction,
        outcome: ActionOutcome,
    ) -> Result<(), AwsError> {
        let instance_id = self.instance_id().await?;
        let group_name = self.group_name().await?;

        self.autoscaling
            .complete_lifecycle_action()
            .auto_scaling_group_name(group_name)
            .instance_id(instance_id)
            .lifecycle_hook_name(&action.hook_name)
            .lifecycle_action_token(&action.action_token)
            .lifecycle_action_result(outcome.as_str())
            .send()
            .await
            .map_err(|e| {
                AwsError::operation(
                    "CompleteLifecycleAction",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;

        Ok(())
    }
}

#[async_trait]
impl QueueDiscovery for AwsClient {
    async fn discover_hooks(&self) -> Result<Vec<HookQueue>, AwsError> {
        let group_name = self.group_name().await?;

        let output = self
            .autoscaling
            .describe_lifecycle_hooks()
            .auto_scaling_group_name(group_name)
            .send()
            .await
            .map_err(|e| {
                AwsError::operation("DescribeLifecycleHooks", DisplayErrorContext(&e).to_string())
            })?;

        let descriptions: Vec<HookDescription<'_>> = output
            .lifecycle_hooks()
            .iter()
            .map(|hook| HookDescription {
                name: hook.lifecycle_hook_name().unwrap_or_default(),
                target: hook.notification_target_arn(),
                transition: hook.lifecycle_transition(),
            })
            .collect();

        let mut queues = Vec::new();
        for (arn, transition) in hook_targets(&descriptions)? {
            let url_output = self
                .sqs
                .get_queue_url()
                .queue_name(&arn.resource)
                .queue_owner_aws_account_id(&arn.account_id)
                .send()
                .await
                .map_err(|e| {
                    AwsError::operation(
                        "GetQueueUrl",
                        aws_sdk_sqs::error::DisplayErrorContext(&e).to_string(),
                    )
                })?;
            let Some(url) = url_output.queue_url() else {
                return Err(AwsError::operation(
                    "GetQueueUrl",
                    format!("no url returned for queue {}", arn.resource),
                ));
            };

            info!(queue = %arn.resource, %transition, "discovered lifecycle hook queue");
            queues.push(HookQueue {
                transition,
                name: arn.resource,
                url: url.to_owned(),
            });
        }

        Ok(queues)
    }
}
