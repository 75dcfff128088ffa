use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use crate::modules::access::adapters::inbound::bearer::bearer_token;
use crate::modules::listings::core::listing::{ListingPatch, ListingStatus};
use crate::modules::listings::use_cases::update_listing::command::UpdateListing;
use crate::shared::core::application_error::error_response;
use crate::shell::state::AppState;

#[derive(Deserialize)]
pub struct UpdateListingBody {
    pub expected_version: i64,
    pub title: Option<String>,
    pub price_cents: Option<i64>,
    pub status: Option<ListingStatus>,
    pub category: Option<String>,
}

pub async fn handle(
    State(state): State<AppState>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<UpdateListingBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    let command = UpdateListing {
        listing_id,
        expected_version: body.expected_version,
        patch: ListingPatch {
            title: body.title,
            price_cents: body.price_cents,
            status: body.status,
            category: body.category,
        },
    };

    match state
        .update_listing
        .handle(bearer_token(&headers), command, Utc::now())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => err.into_response(),
    }
}
