use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::modules::access::core::access_guard::{AccessGuard, Action, Resource};
use crate::modules::listings::core::listing::{Listing, ListingMutation, WriteOutcome};
use crate::modules::listings::use_cases::update_listing::command::UpdateListing;
use crate::shared::core::application_error::ApplicationError;
use crate::shared::infrastructure::listing_store::ListingStore;

pub struct UpdateListingHandler<TStore>
where
    TStore: ListingStore + ?Sized,
{
    store: Arc<TStore>,
    guard: Arc<AccessGuard>,
}

impl<TStore> UpdateListingHandler<TStore>
where
    TStore: ListingStore + ?Sized,
{
    pub fn new(store: Arc<TStore>, guard: Arc<AccessGuard>) -> Self {
        Self { store, guard }
    }

    pub async fn handle(
        &self,
        token: Option<&str>,
        command: UpdateListing,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, ApplicationError> {
        let principal = self.guard.authenticate(token, now)?;
        let current = live_listing(&*self.store, &command.listing_id).await?;
        self.guard
            .authorize(
                &principal,
                Action::UpdateListing,
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
                ListingMutation::Update(command.patch),
                now,
            )
            .await?;
        tracing::info!(listing_id = %command.listing_id, version, subject = %principal.subject, "listing updated");
        Ok(WriteOutcome {
            listing_id: command.listing_id,
            version,
        })
    }
}

/// Load a listing that exists and is not tombstoned.
pub async fn live_listing<TStore>(store: &TStore, listing_id: &str) -> Result<Listing, ApplicationError>
where
    TStore: ListingStore + ?Sized,
{
    store
        .get(listing_id)
        .await?
        .filter(|listing| !listing.is_deleted())
        .ok_or_else(|| ApplicationError::NotFound(format!("listing {listing_id}")))
}
