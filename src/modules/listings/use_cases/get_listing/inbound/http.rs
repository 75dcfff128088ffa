use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};

use crate::modules::listings::use_cases::update_listing::handler::live_listing;
use crate::shell::state::AppState;

/// Read a listing from the store, which is authoritative even while the index lags.
pub async fn handle(State(state): State<AppState>, Path(listing_id): Path<String>) -> Response {
    match live_listing(&*state.store, &listing_id).await {
        Ok(listing) => Json(listing).into_response(),
        Err(err) => err.into_response(),
    }
}
