//! Metric names and labels for audience pipeline monitoring.

/// Label for the outcome a task was settled with.
pub const OUTCOME_LABEL: &str = "outcome";

/// Label for the error kind of a failure.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the analytical query name.
pub const QUERY_LABEL: &str = "query";

/// Label for the kind of change message.
pub const STATUS_LABEL: &str = "status";

// Scheduler metrics

/// Counter for reconciliation tasks enqueued by the scheduler.
pub const AUDIENCE_TASKS_DISPATCHED_TOTAL: &str = "audience_tasks_dispatched_total";

/// Counter for reconciliation tasks the scheduler failed to enqueue.
pub const AUDIENCE_TASK_DISPATCH_FAILURES_TOTAL: &str = "audience_task_dispatch_failures_total";

/// Gauge for the unix timestamp of the last completed dispatch.
pub const AUDIENCE_SCHEDULER_LAST_RUN_TIMESTAMP: &str = "audience_scheduler_last_run_timestamp";

// Worker metrics

/// Counter for settled tasks, labeled by outcome.
pub const AUDIENCE_TASKS_SETTLED_TOTAL: &str = "audience_tasks_settled_total";

/// Histogram for the processing duration of a task in seconds.
pub const AUDIENCE_TASK_DURATION_SECONDS: &str = "audience_task_duration_seconds";

/// Counter for members appended by reconciliations.
pub const AUDIENCE_MEMBERS_APPENDED_TOTAL: &str = "audience_members_appended_total";

/// Counter for members removed explicitly.
pub const AUDIENCE_MEMBERS_REMOVED_TOTAL: &str = "audience_members_removed_total";

/// Counter for change messages published.
pub const AUDIENCE_CHANGES_PUBLISHED_TOTAL: &str = "audience_changes_published_total";

/// Counter for change messages that failed to publish.
pub const AUDIENCE_CHANGE_PUBLISH_FAILURES_TOTAL: &str = "audience_change_publish_failures_total";

// Source metrics

/// Histogram for analytical source query durations in seconds.
pub const AUDIENCE_SOURCE_QUERY_DURATION_SECONDS: &str = "audience_source_query_duration_seconds";
