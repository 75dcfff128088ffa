use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::modules::access::core::access_guard::{AccessGuard, Action, Resource};
use crate::modules::listings::core::listing::{ListingMutation, WriteOutcome};
use crate::modules::listings::use_cases::delete_listing::command::DeleteListing;
use crate::modules::listings::use_cases::update_listing::handler::live_listing;
use crate::shared::core::application_error::ApplicationError;
use crate::shared::infrastructure::listing_store::ListingStore;

pub struct DeleteListingHandler<TStore>
where
    TStore: ListingStore + ?Sized,
{
    store: Arc<TStore>,
    guard: Arc<AccessGuard>,
}

impl<TStore> DeleteListingHandler<TStore>
where
    TStore: ListingStore + ?Sized,
{
    pub fn new(store: Arc<TStore>, guard: Arc<AccessGuard>) -> Self {
        Self { store, guard }
    }

    pub async fn handle(
        &self,
        token: Option<&str>,
        command: DeleteListing,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, ApplicationError> {
        let principal = self.guard.authenticate(token, now)?;
        let current = live_listing(&*self.store, &command.listing_id).await?;
        self.guard
            .authorize(
                &principal,
                Action::DeleteListing,
                &Resource::Listing {
                    owner_id: current.owner_id,
                },
            )
            .into_result()?;

        let version = self
            .store
            .write(
                &command.listing_id,
                command.expected_version,
                ListingMutation::Delete,
                now,
            )
            .await?;
        tracing::info!(listing_id = %command.listing_id, version, subject = %principal.subject, "listing deleted");
        Ok(WriteOutcome {
            listing_id: command.listing_id,
            version,
        })
    }
}
