use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::notice::Notice;

pub const LAUNCH_TRANSITION: &str = "autoscaling:EC2_INSTANCE_LAUNCHING";
pub const TERMINATION_TRANSITION: &str = "autoscaling:EC2_INSTANCE_TERMINATING";

/// Enumeration of the lifecycle transitions a hook can pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleTransition {
    Launch,
    Termination,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid LifecycleTransition")]
pub struct ParseTransitionError(pub String);

/// Allow casting LifecycleTransition from the strings Auto Scaling uses.
impl FromStr for LifecycleTransition {
    type Err = ParseTransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            LAUNCH_TRANSITION => Ok(LifecycleTransition::Launch),
            TERMINATION_TRANSITION => Ok(LifecycleTransition::Termination),
            invalid => Err(ParseTransitionError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for LifecycleTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleTransition::Launch => f.write_str(LAUNCH_TRANSITION),
            LifecycleTransition::Termination => f.write_str(TERMINATION_TRANSITION),
        }
    }
}

/// The answer sent back to Auto Scaling when a lifecycle action is completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Continue,
    Abandon,
}

impl ActionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionOutcome::Continue => "CONTINUE",
            ActionOutcome::Abandon => "ABANDON",
        }
    }
}

/// An SQS queue receiving the notifications of one or more lifecycle hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookQueue {
    pub transition: LifecycleTransition,
    pub name: String,
    pub url: String,
}

/// A raw message received from a hook queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub body: String,
    pub receipt_handle: String,
}

impl QueueMessage {
    pub fn new(body: &str, receipt_handle: &str) -> Self {
        Self {
            body: body.to_owned(),
            receipt_handle: receipt_handle.to_owned(),
        }
    }
}

/// The body Auto Scaling publishes when an instance enters a lifecycle hook.
/// Test notifications lack the instance fields and fail to parse.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LifecycleMessage {
    #[serde(rename = "EC2InstanceId", alias = "EC2InstanceID")]
    pub instance_id: String,
    #[serde(rename = "LifecycleHookName")]
    pub hook_name: String,
    #[serde(rename = "LifecycleActionToken")]
    pub action_token: String,
    #[serde(rename = "LifecycleTransition")]
    pub transition: String,
}

impl LifecycleMessage {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// Build the notice for this message. The message's own transition wins over the
    /// queue's, since one queue may be shared by a launch and a termination hook.
    pub fn into_notice(self, fallback: LifecycleTransition) -> Notice {
        let transition = self.transition.parse().unwrap_or(fallback);
        match transition {
            LifecycleTransition::Launch => Notice::launch(&self.hook_name, &self.action_token),
            LifecycleTransition::Termination => {
                Notice::termination(&self.hook_name, &self.action_token)
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid ARN")]
pub struct ParseArnError(pub String);

/// The parts of a notification target ARN needed to resolve a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetArn {
    pub service: String,
    pub region: String,
    pub account_id: String,
    pub resource: String,
}

impl FromStr for TargetArn {
    type Err = ParseArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // arn:partition:service:region:account-id:resource
        let parts: Vec<&str> = s.splitn(6, ':').collect();
        match parts.as_slice() {
            ["arn", partition, service, region, account_id, resource]
                if !partition.is_empty() && !service.is_empty() && !resource.is_empty() =>
            {
                Ok(TargetArn {
                    service: (*service).to_owned(),
                    region: (*region).to_owned(),
                    account_id: (*account_id).to_owned(),
                    resource: (*resource).to_owned(),
                })
            }
            _ => Err(ParseArnError(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAUNCH_BODY: &str = r#"{
        "Origin": "EC2",
        "LifecycleHookName": "launch-hook",
        "Destination": "AutoScalingGroup",
        "AccountId": "123456789012",
        "RequestId": "6b7e1a7c-0000-0000-0000-000000000000",
        "LifecycleTransition": "autoscaling:EC2_INSTANCE_LAUNCHING",
        "AutoScalingGroupName": "web",
        "Service": "AWS Auto Scaling",
        "Time": "2024-01-01T00:00:00.000Z",
        "EC2InstanceId": "i-0123456789abcdef0",
        "LifecycleActionToken": "tok-1"
    }"#;

    #[test]
    fn test_transition_from_str() {
        assert_eq!(
            LAUNCH_TRANSITION.parse::<LifecycleTransition>(),
            Ok(LifecycleTransition::Launch)
        );
        assert_eq!(
            TERMINATION_TRANSITION.parse::<LifecycleTransition>(),
            Ok(LifecycleTransition::Termination)
        );
        assert_eq!(
            "autoscaling:TEST_NOTIFICATION".parse::<LifecycleTransition>(),
            Err(ParseTransitionError(
                "autoscaling:TEST_NOTIFICATION".to_owned()
            ))
        );
    }

    #[test]
    fn test_parse_lifecycle_message() {
        let message = LifecycleMessage::parse(LAUNCH_BODY).unwrap();

        assert_eq!(message.instance_id, "i-0123456789abcdef0");
        assert_eq!(message.hook_name, "launch-hook");
        assert_eq!(message.action_token, "tok-1");
        assert_eq!(
            message.into_notice(LifecycleTransition::Termination),
            Notice::launch("launch-hook", "tok-1")
        );
    }

    #[test]
    fn test_test_notification_does_not_parse() {
        let body = r#"{
            "AccountId": "123456789012",
            "RequestId": "6b7e1a7c-0000-0000-0000-000000000000",
            "AutoScalingGroupARN": "arn:aws:autoscaling:us-east-1:123456789012:autoScalingGroup:web",
            "AutoScalingGroupName": "web",
            "Service": "AWS Auto Scaling",
            "Event": "autoscaling:TEST_NOTIFICATION",
            "Time": "2024-01-01T00:00:00.000Z"
        }"#;

        assert!(LifecycleMessage::parse(body).is_err());
        assert!(LifecycleMessage::parse("not json").is_err());
    }

    #[test]
    fn test_unknown_transition_falls_back_to_queue() {
        let message = LifecycleMessage {
            instance_id: "i-1".to_owned(),
            hook_name: "drain".to_owned(),
            action_token: "tok".to_owned(),
            transition: "something-else".to_owned(),
        };

        assert_eq!(
            message.into_notice(LifecycleTransition::Termination),
            Notice::termination("drain", "tok")
        );
    }

    #[test]
    fn test_parse_target_arn() {
        let arn: TargetArn = "arn:aws:sqs:us-east-1:123456789012:lifecycle-events"
            .parse()
            .unwrap();

        assert_eq!(arn.service, "sqs");
        assert_eq!(arn.region, "us-east-1");
        assert_eq!(arn.account_id, "123456789012");
        assert_eq!(arn.resource, "lifecycle-events");

        assert!("arn:aws:sqs".parse::<TargetArn>().is_err());
        assert!("urn:aws:sqs:us-east-1:123456789012:q".parse::<TargetArn>().is_err());
    }

    #[test]
    fn test_action_outcome_as_str() {
        assert_eq!(ActionOutcome::Continue.as_str(), "CONTINUE");
        assert_eq!(ActionOutcome::Abandon.as_str(), "ABANDON");
    }
}
