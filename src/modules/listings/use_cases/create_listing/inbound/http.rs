use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::modules::access::adapters::inbound::bearer::bearer_token;
use crate::modules::listings::core::listing::ListingStatus;
use crate::modules::listings::use_cases::create_listing::command::CreateListing;
use crate::shared::core::application_error::error_response;
use crate::shell::state::AppState;

#[derive(Deserialize)]
pub struct CreateListingBody {
    pub title: String,
    pub price_cents: i64,
    pub category: String,
    pub status: Option<ListingStatus>,
    pub owner_id: Option<String>,
}

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateListingBody>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    let command = CreateListing {
        listing_id: Uuid::now_v7().to_string(),
        owner_id: body.owner_id,
        title: body.title,
        price_cents: body.price_cents,
        status: body.status,
        category: body.category,
    };

    match state
        .create_listing
        .handle(bearer_token(&headers), command, Utc::now())
        .await
    {
        Ok(outcome) => (StatusCode::CREATED, Json(outcome)).into_response(),
        Err(err) => err.into_response(),
    }
}
