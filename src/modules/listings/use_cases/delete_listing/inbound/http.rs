use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use crate::modules::access::adapters::inbound::bearer::bearer_token;
use crate::modules::listings::use_cases::delete_listing::command::DeleteListing;
use crate::shared::core::application_error::error_response;
use crate::shell::state::AppState;

#[derive(Deserialize)]
pub struct DeleteListingParams {
    pub expected_version: i64,
}

pub async fn handle(
    State(state): State<AppState>,
    Path(listing_id): Path<String>,
    headers: HeaderMap,
    params: Result<Query<DeleteListingParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    let command = DeleteListing {
        listing_id,
        expected_version: params.expected_version,
    };

    match state
        .delete_listing
        .handle(bearer_token(&headers), command, Utc::now())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => err.into_response(),
    }
}
