use axum::{
    Json,
    extract::{Path, Query, State, rejection::QueryRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Deserialize;

use crate::modules::access::adapters::inbound::bearer::bearer_token;
use crate::shared::core::application_error::error_response;
use crate::shell::state::AppState;

#[derive(Deserialize)]
pub struct FailedEventsParams {
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: Result<Query<FailedEventsParams>, QueryRejection>,
) -> Response {
    let Query(params) = match params {
        Ok(params) => params,
        Err(rejection) => return error_response(StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text()),
    };

    match state
        .failed_events
        .list(bearer_token(&headers), params.limit, Utc::now())
        .await
    {
        Ok(events) => Json(events).into_response(),
        Err(err) => err.into_response(),
    }
}

pub async fn retry(State(state): State<AppState>, Path(sequence): Path<i64>, headers: HeaderMap) -> Response {
    match state
        .failed_events
        .retry(bearer_token(&headers), sequence, Utc::now())
        .await
    {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod failed_events_http_inbound_tests {
    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode, header::AUTHORIZATION},
        routing::{get, post},
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::modules::listings::core::listing::ListingMutation;
    use crate::shared::infrastructure::change_outbox::ChangeOutbox;
    use crate::shared::infrastructure::listing_store::ListingStore;
    use crate::shell::state::AppState;
    use crate::tests::fixtures::app::{TestApp, make_test_app};
    use crate::tests::fixtures::listings::{at, make_new_listing};
    use crate::tests::fixtures::tokens::{admin_token, bearer, owner_token};

    use super::{list, retry};

    async fn app_with_failed_event() -> TestApp {
        let test_app = make_test_app();
        test_app
            .store
            .write("listing-0001", 0, ListingMutation::Create(make_new_listing()), at(0))
            .await
            .unwrap();
        let batch = test_app.store.fetch_batch(10, at(0)).await.unwrap();
        test_app
            .store
            .mark_failed(batch[0].sequence, "retry window exhausted", at(0))
            .await
            .unwrap();
        test_app
    }

    fn app(state: AppState) -> Router {
        Router::new()
            .route("/sync/failed", get(list))
            .route("/sync/failed/{sequence}/retry", post(retry))
            .with_state(state)
    }

    #[tokio::test]
    async fn it_should_list_failed_events_with_their_reason() {
        let test_app = app_with_failed_event().await;
        let response = app(test_app.state)
            .oneshot(
                Request::get("/sync/failed")
                    .header(AUTHORIZATION, bearer(&admin_token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json[0]["listing_id"], "listing-0001");
        assert_eq!(json[0]["state"], "failed");
        assert_eq!(json[0]["last_error"], "retry window exhausted");
    }

    #[tokio::test]
    async fn it_should_requeue_a_failed_event() {
        let test_app = app_with_failed_event().await;
        let sequence = test_app.store.failed(10).await.unwrap()[0].sequence;
        let response = app(test_app.state)
            .oneshot(
                Request::post(format!("/sync/failed/{sequence}/retry"))
                    .header(AUTHORIZATION, bearer(&admin_token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(test_app.store.failed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_should_return_403_for_a_listing_owner() {
        let test_app = app_with_failed_event().await;
        let response = app(test_app.state)
            .oneshot(
                Request::get("/sync/failed")
                    .header(AUTHORIZATION, bearer(&owner_token("user-owner-0001")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn it_should_return_404_for_an_unknown_sequence() {
        let test_app = app_with_failed_event().await;
        let response = app(test_app.state)
            .oneshot(
                Request::post("/sync/failed/999/retry")
                    .header(AUTHORIZATION, bearer(&admin_token()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
