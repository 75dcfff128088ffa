use std::sync::Arc;

use crate::modules::access::core::access_guard::AccessGuard;
use crate::modules::listings::use_cases::create_listing::handler::CreateListingHandler;
use crate::modules::listings::use_cases::delete_listing::handler::DeleteListingHandler;
use crate::modules::listings::use_cases::update_listing::handler::UpdateListingHandler;
use crate::modules::sync::use_cases::failed_events::handler::FailedEventsHandler;
use crate::shared::infrastructure::change_outbox::ChangeOutbox;
use crate::shared::infrastructure::listing_store::ListingStore;
use crate::shared::infrastructure::search_index::SearchIndex;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ListingStore>,
    pub outbox: Arc<dyn ChangeOutbox>,
    pub search_index: Arc<dyn SearchIndex>,
    pub guard: Arc<AccessGuard>,
    pub create_listing: Arc<CreateListingHandler<dyn ListingStore>>,
    pub update_listing: Arc<UpdateListingHandler<dyn ListingStore>>,
    pub delete_listing: Arc<DeleteListingHandler<dyn ListingStore>>,
    pub failed_events: Arc<FailedEventsHandler<dyn ChangeOutbox>>,
}

impl AppState {
    /// Wire handlers around a store that also hosts the change outbox.
    pub fn new<TStore>(store: Arc<TStore>, search_index: Arc<dyn SearchIndex>, guard: Arc<AccessGuard>) -> Self
    where
        TStore: ListingStore + ChangeOutbox + 'static,
    {
        let listing_store: Arc<dyn ListingStore> = store.clone();
        let outbox: Arc<dyn ChangeOutbox> = store;
        Self {
            create_listing: Arc::new(CreateListingHandler::new(listing_store.clone(), guard.clone())),
            update_listing: Arc::new(UpdateListingHandler::new(listing_store.clone(), guard.clone())),
            delete_listing: Arc::new(DeleteListingHandler::new(listing_store.clone(), guard.clone())),
            failed_events: Arc::new(FailedEventsHandler::new(outbox.clone(), guard.clone())),
            store: listing_store,
            outbox,
            search_index,
            guard,
        }
    }
}
