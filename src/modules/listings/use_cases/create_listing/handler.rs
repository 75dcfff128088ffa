use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::modules::access::core::access_guard::{AccessGuard, Action, Resource};
use crate::modules::listings::core::listing::{ListingMutation, WriteOutcome};
use crate::modules::listings::use_cases::create_listing::command::CreateListing;
use crate::shared::core::application_error::ApplicationError;
use crate::shared::infrastructure::listing_store::ListingStore;

pub struct CreateListingHandler<TStore>
where
    TStore: ListingStore + ?Sized,
{
    store: Arc<TStore>,
    guard: Arc<AccessGuard>,
}

impl<TStore> CreateListingHandler<TStore>
where
    TStore: ListingStore + ?Sized,
{
    pub fn new(store: Arc<TStore>, guard: Arc<AccessGuard>) -> Self {
        Self { store, guard }
    }

    pub async fn handle(
        &self,
        token: Option<&str>,
        command: CreateListing,
        now: DateTime<Utc>,
    ) -> Result<WriteOutcome, ApplicationError> {
        let principal = self.guard.authenticate(token, now)?;
        let owner_id = command
            .owner_id
            .clone()
            .unwrap_or_else(|| principal.subject.clone());
        self.guard
            .authorize(
                &principal,
                Action::CreateListing,
                &Resource::Listing {
                    owner_id: owner_id.clone(),
                },
            )
            .into_result()?;

        let listing_id = command.listing_id.clone();
        let version = self
            .store
            .write(
                &listing_id,
                0,
                ListingMutation::Create(command.into_new_listing(owner_id)),
                now,
            )
            .await?;
        tracing::info!(listing_id = %listing_id, version, subject = %principal.subject, "listing created");
        Ok(WriteOutcome { listing_id, version })
    }
}
