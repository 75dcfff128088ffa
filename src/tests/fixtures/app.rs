// Application state wired over in memory adapters, for inbound adapter tests.

use std::sync::Arc;

use crate::modules::access::core::access_guard::{AccessGuard, AccessPolicy};
use crate::modules::access::core::token_verifier::TokenVerifier;
use crate::shared::infrastructure::listing_store::in_memory::InMemoryListingStore;
use crate::shared::infrastructure::search_index::in_memory::InMemorySearchIndex;
use crate::shell::state::AppState;
use crate::tests::fixtures::tokens::key_set;

pub struct TestApp {
    pub state: AppState,
    pub store: Arc<InMemoryListingStore>,
    pub index: Arc<InMemorySearchIndex>,
}

pub fn make_test_app() -> TestApp {
    make_test_app_with(InMemoryListingStore::new())
}

pub fn make_test_app_with(store: InMemoryListingStore) -> TestApp {
    let store = Arc::new(store);
    let index = Arc::new(InMemorySearchIndex::new());
    let guard = Arc::new(AccessGuard::new(
        TokenVerifier::new(key_set()),
        AccessPolicy::default(),
    ));
    TestApp {
        state: AppState::new(store.clone(), index.clone(), guard),
        store,
        index,
    }
}
