use crate::error::{AudienceError, ErrorKind};
use crate::queue::TaskOutcome;

/// Policy describing how a task that failed with an [`AudienceError`] is settled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct TaskOutcomePolicy {
    outcome: TaskOutcome,
    solution: Option<&'static str>,
}

impl TaskOutcomePolicy {
    const fn new(outcome: TaskOutcome, solution: Option<&'static str>) -> Self {
        Self { outcome, solution }
    }

    /// Returns the outcome the delivery is settled with.
    pub fn outcome(&self) -> TaskOutcome {
        self.outcome
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Builds a [`TaskOutcomePolicy`] from an [`AudienceError`] so that every worker settles
/// failed tasks the same way.
///
/// Aggregated errors are requeued if any of their errors is transient.
pub fn build_task_outcome_policy(error: &AudienceError) -> TaskOutcomePolicy {
    if let Some(errors) = error.errors() {
        let requeue = errors
            .iter()
            .any(|error| build_task_outcome_policy(error).outcome() == TaskOutcome::Requeue);

        return if requeue {
            TaskOutcomePolicy::new(TaskOutcome::Requeue, None)
        } else {
            TaskOutcomePolicy::new(
                TaskOutcome::Drop,
                Some("Inspect the aggregated errors, none of them is transient."),
            )
        };
    }

    match error.kind() {
        // Transient failures. Keep this list narrow, a requeued task comes back until it succeeds.
        ErrorKind::SourceUnavailable
        | ErrorKind::SourceTimeout
        | ErrorKind::StoreUnavailable
        | ErrorKind::PersistenceFailed => TaskOutcomePolicy::new(TaskOutcome::Requeue, None),

        ErrorKind::InvalidFilter | ErrorKind::ValidationError => TaskOutcomePolicy::new(
            TaskOutcome::Drop,
            Some("Fix the audience filter: it needs a lower date bound and may span at most 366 days."),
        ),
        ErrorKind::SourceQueryFailed => TaskOutcomePolicy::new(
            TaskOutcome::Drop,
            Some("Check the analytical source schema and the generated candidate query."),
        ),
        ErrorKind::AudienceNotFound => TaskOutcomePolicy::new(
            TaskOutcome::Drop,
            Some("The audience was deleted after the task was issued, no action is needed."),
        ),
        ErrorKind::MalformedMessage | ErrorKind::DeserializationError => TaskOutcomePolicy::new(
            TaskOutcome::Drop,
            Some("Inspect the dead-lettered message, its producer emitted an invalid payload."),
        ),

        // Special handling for fault injection tests.
        #[cfg(feature = "failpoints")]
        ErrorKind::WithRequeue => TaskOutcomePolicy::new(TaskOutcome::Requeue, None),
        #[cfg(feature = "failpoints")]
        ErrorKind::WithDrop => {
            TaskOutcomePolicy::new(TaskOutcome::Drop, Some("Cannot retry this error."))
        }

        // Anything else is not known to recover by itself.
        _ => TaskOutcomePolicy::new(
            TaskOutcome::Drop,
            Some(
                "There is no single prescribed solution for this error. The next scheduled run issues a new task for the audience.",
            ),
        ),
    }
}
