pub const NOTICES_RECEIVED: &str = "lifecycle_notices_received_total";
pub const NOTICES_HANDLED: &str = "lifecycle_notices_handled_total";
pub const HEARTBEATS: &str = "lifecycle_heartbeats_total";
pub const COMPLETIONS: &str = "lifecycle_completions_total";
pub const SOURCE_ERRORS: &str = "lifecycle_source_errors_total";
pub const QUEUE_MESSAGES_SKIPPED: &str = "lifecycle_queue_messages_skipped_total";
pub const ACTION_DURATION: &str = "lifecycle_action_duration_seconds";
