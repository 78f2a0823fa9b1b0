use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::AudienceResult;
use crate::messages::AudienceChangeMessage;
use crate::queue::ChangePublisher;
use crate::test_utils::notify::TimedNotify;

type ChangeCondition = Box<dyn Fn(&[AudienceChangeMessage]) -> bool + Send + Sync>;

struct Inner {
    changes: Vec<AudienceChangeMessage>,
    conditions: Vec<(ChangeCondition, Arc<Notify>)>,
}

impl Inner {
    fn check_conditions(&mut self) {
        let changes = &self.changes;
        self.conditions.retain(|(condition, notify)| {
            let met = condition(changes);
            if met {
                notify.notify_one();
            }

            !met
        });
    }
}

/// Change publisher recording every published message.
///
/// Tests register conditions over the published messages and wait for them with
/// [`TimedNotify::notified`].
#[derive(Clone)]
pub struct NotifyingPublisher {
    inner: Arc<Mutex<Inner>>,
}

impl NotifyingPublisher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                changes: Vec::new(),
                conditions: Vec::new(),
            })),
        }
    }

    pub async fn changes(&self) -> Vec<AudienceChangeMessage> {
        self.inner.lock().await.changes.clone()
    }

    /// Returns a notify fired once `condition` holds for the published messages.
    ///
    /// The condition is checked right away, so registering after the fact still notifies.
    pub async fn notify_on_changes<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&[AudienceChangeMessage]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());

        let mut inner = self.inner.lock().await;
        inner.conditions.push((Box::new(condition), notify.clone()));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Returns a notify fired once at least `count` messages were published.
    pub async fn wait_for_changes(&self, count: usize) -> TimedNotify {
        self.notify_on_changes(move |changes| changes.len() >= count)
            .await
    }
}

impl Default for NotifyingPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotifyingPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingPublisher").finish_non_exhaustive()
    }
}

impl ChangePublisher for NotifyingPublisher {
    async fn publish_change(&self, message: &AudienceChangeMessage) -> AudienceResult<()> {
        let mut inner = self.inner.lock().await;
        inner.changes.push(message.clone());
        inner.check_conditions();

        Ok(())
    }
}
