use axum::{
    Json,
    extract::{Query, State, rejection::QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::modules::listings::core::listing::ListingStatus;
use crate::shared::core::application_error::{ApplicationError, error_response};
use crate::shared::infrastructure::search_index::SearchQuery;
use crate::shell::state::AppState;

#[derive(Deserialize)]
pub struct SearchListingsParams {
    pub q: Option<String>,
    pub category: Option<String>,
    pub status: Option<ListingStatus>,
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl From<SearchListingsParams> for SearchQuery {
    fn from(params: SearchListingsParams) -> Self {
        Self {
            text: params.q,
            category: params.category,
            status: params.status,
            min_price_cents: params.min_price,
            max_price_cents: params.max_price,
            offset: params.offset.unwrap_or(0),
            limit: params.limit,
        }
    }
}

/// Search the index. Results may trail the listing store by the outbox lag.
pub async fn handle(
    State(state): State<AppState>,
    params: Result<Query<SearchListingsParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    match state.search_index.search(&params.into()).await {
        Ok(hits) => Json(hits).into_response(),
        Err(err) => ApplicationError::from(err).into_response(),
    }
}
