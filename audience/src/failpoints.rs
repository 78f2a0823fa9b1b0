use fail::fail_point;

use crate::bail;
use crate::error::{AudienceResult, ErrorKind};

/// Fires after membership was persisted and before the change message is published.
pub const TASK_WORKER__AFTER_PERSIST: &str = "task_worker.after_persist";

/// Fires before the analytical source is queried.
pub const TASK_WORKER__BEFORE_SOURCE_QUERY: &str = "task_worker.before_source_query";

/// Fires between two task publishes of a scheduler dispatch.
pub const SCHEDULER__BETWEEN_PUBLISHES: &str = "scheduler.between_publishes";

/// Evaluates the fail point `name`.
///
/// The fail point parameter selects the error kind: `requeue` raises
/// [`ErrorKind::WithRequeue`], `drop` (the default) raises [`ErrorKind::WithDrop`].
pub fn audience_fail_point(name: &str) -> AudienceResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("requeue") => ErrorKind::WithRequeue,
            _ => ErrorKind::WithDrop,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
