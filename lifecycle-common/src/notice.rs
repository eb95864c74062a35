use std::fmt;

use chrono::{DateTime, Utc};

/// The hook name and token identifying one pending lifecycle action.
/// Both are required to record heartbeats and to complete the action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleAction {
    pub hook_name: String,
    pub action_token: String,
}

impl LifecycleAction {
    pub fn new(hook_name: &str, action_token: &str) -> Self {
        Self {
            hook_name: hook_name.to_owned(),
            action_token: action_token.to_owned(),
        }
    }
}

/// A single lifecycle event detected for this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// The instance is being reclaimed by EC2. There is no lifecycle hook to answer.
    SpotTermination { deadline: DateTime<Utc> },
    /// The instance is paused in `Pending:Wait` and must be put in service.
    Launch(LifecycleAction),
    /// The instance is paused in `Terminating:Wait` and must be drained.
    Termination(LifecycleAction),
}

impl Notice {
    pub fn spot(deadline: DateTime<Utc>) -> Self {
        Notice::SpotTermination { deadline }
    }

    pub fn launch(hook_name: &str, action_token: &str) -> Self {
        Notice::Launch(LifecycleAction::new(hook_name, action_token))
    }

    pub fn termination(hook_name: &str, action_token: &str) -> Self {
        Notice::Termination(LifecycleAction::new(hook_name, action_token))
    }

    /// Stable label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::SpotTermination { .. } => "spot",
            Notice::Launch(_) => "launch",
            Notice::Termination(_) => "termination",
        }
    }

    /// The lifecycle action this notice must acknowledge, if it takes part in the hook protocol.
    pub fn lifecycle_action(&self) -> Option<&LifecycleAction> {
        match self {
            Notice::SpotTermination { .. } => None,
            Notice::Launch(action) | Notice::Termination(action) => Some(action),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::SpotTermination { deadline } => {
                write!(f, "spot termination at {}", deadline.to_rfc3339())
            }
            Notice::Launch(action) | Notice::Termination(action) => {
                write!(f, "{} notice for hook {}", self.kind(), action.hook_name)
            }
        }
    }
}
