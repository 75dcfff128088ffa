use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::modules::access::core::access_guard::{AccessGuard, Action, Resource};
use crate::shared::core::application_error::ApplicationError;
use crate::shared::infrastructure::change_outbox::{ChangeOutbox, OutboxEvent};

pub const DEFAULT_FAILED_LIMIT: usize = 50;
pub const MAX_FAILED_LIMIT: usize = 500;

/// Operator access to events the reconciler gave up on.
pub struct FailedEventsHandler<TOutbox>
where
    TOutbox: ChangeOutbox + ?Sized,
{
    outbox: Arc<TOutbox>,
    guard: Arc<AccessGuard>,
}

impl<TOutbox> FailedEventsHandler<TOutbox>
where
    TOutbox: ChangeOutbox + ?Sized,
{
    pub fn new(outbox: Arc<TOutbox>, guard: Arc<AccessGuard>) -> Self {
        Self { outbox, guard }
    }

    pub async fn list(
        &self,
        token: Option<&str>,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxEvent>, ApplicationError> {
        self.authorize_operator(token, now)?;
        let limit = limit.unwrap_or(DEFAULT_FAILED_LIMIT).clamp(1, MAX_FAILED_LIMIT);
        Ok(self.outbox.failed(limit).await?)
    }

    pub async fn retry(
        &self,
        token: Option<&str>,
        sequence: i64,
        now: DateTime<Utc>,
    ) -> Result<(), ApplicationError> {
        let subject = self.authorize_operator(token, now)?;
        self.outbox.requeue_failed(sequence, now).await?;
        tracing::info!(sequence, subject = %subject, "failed outbox event requeued");
        Ok(())
    }

    fn authorize_operator(&self, token: Option<&str>, now: DateTime<Utc>) -> Result<String, ApplicationError> {
        let principal = self.guard.authenticate(token, now)?;
        self.guard
            .authorize(&principal, Action::OperateSync, &Resource::SyncQueue)
            .into_result()?;
        Ok(principal.subject)
    }
}
