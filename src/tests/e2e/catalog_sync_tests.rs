use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header::AUTHORIZATION};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tower::ServiceExt;

use crate::modules::access::core::access_guard::{AccessGuard, AccessPolicy};
use crate::modules::access::core::token_verifier::TokenVerifier;
use crate::modules::sync::core::projection::project;
use crate::modules::sync::core::retry_policy::RetryPolicy;
use crate::modules::sync::drift_sweep::DriftSweeper;
use crate::modules::sync::reconciler::{Reconciler, ReconcilerSettings};
use crate::shared::infrastructure::change_outbox::{ChangeOutbox, DeliveryState};
use crate::shared::infrastructure::listing_store::ListingStore;
use crate::shared::infrastructure::listing_store::in_memory::InMemoryListingStore;
use crate::shared::infrastructure::listing_store::sqlite::SqliteListingStore;
use crate::shared::infrastructure::search_index::SearchIndex;
use crate::shared::infrastructure::search_index::in_memory::InMemorySearchIndex;
use crate::shell::http::router;
use crate::shell::state::AppState;
use crate::tests::fixtures::app::make_test_app;
use crate::tests::fixtures::tokens::{admin_token, bearer, key_set, owner_token};

const SELLER: &str = "user-seller-0001";

fn settings() -> ReconcilerSettings {
    ReconcilerSettings {
        batch_size: 50,
        index_timeout: Duration::from_millis(200),
        retry: RetryPolicy {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 8_000,
            retry_window_ms: 30_000,
        },
    }
}

fn later(start: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    start + ChronoDuration::seconds(seconds)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn json_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header(AUTHORIZATION, bearer(token))
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn create_listing(app: &Router) -> String {
    let (status, json) = send(
        app,
        json_request(
            "POST",
            "/listings",
            &owner_token(SELLER),
            json!({ "title": "Vintage road bike", "price_cents": 25_000, "category": "bikes", "status": "active" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    json["listing_id"].as_str().unwrap().to_string()
}

async fn update_price(app: &Router, listing_id: &str, expected_version: i64, price_cents: i64) -> StatusCode {
    let (status, _) = send(
        app,
        json_request(
            "PUT",
            &format!("/listings/{listing_id}"),
            &owner_token(SELLER),
            json!({ "expected_version": expected_version, "price_cents": price_cents }),
        ),
    )
    .await;
    status
}

async fn search(app: &Router, query: &str) -> Value {
    let (status, json) = send(
        app,
        Request::get(format!("/listings/search?{query}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    json
}

#[tokio::test]
async fn it_should_converge_search_after_successive_updates() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    reconciler.drain_once(later(start, 1)).await.unwrap();
    assert_eq!(search(&app, "q=road").await[0]["version"], 1);

    assert_eq!(update_price(&app, &listing_id, 1, 22_000).await, StatusCode::OK);
    assert_eq!(update_price(&app, &listing_id, 2, 19_000).await, StatusCode::OK);
    // The index lags until the reconciler runs; the store is already at v3.
    assert_eq!(search(&app, "q=road").await[0]["version"], 1);
    let (_, stored) = send(&app, Request::get(format!("/listings/{listing_id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(stored["version"], 3);

    let report = reconciler.drain_once(later(start, 2)).await.unwrap();
    assert_eq!(report.delivered, 2);

    let hits = search(&app, "q=road").await;
    assert_eq!(hits.as_array().unwrap().len(), 1);
    assert_eq!(hits[0]["version"], 3);
    assert_eq!(hits[0]["price_cents"], 19_000);
    assert!(!test_app.store.has_undelivered(&listing_id).await.unwrap());
}

#[tokio::test]
async fn it_should_ignore_a_duplicate_delivery() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    reconciler.drain_once(later(start, 1)).await.unwrap();
    let indexed = test_app.index.document(&listing_id).await.unwrap();

    // Deliver the same version again, once directly and once through the outbox.
    test_app.index.upsert(indexed.clone()).await.unwrap();
    test_app.store.enqueue_resync(&listing_id, later(start, 2)).await.unwrap();
    let report = reconciler.drain_once(later(start, 3)).await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(test_app.index.document(&listing_id).await.unwrap(), indexed);
    assert_eq!(test_app.index.len().await, 1);
}

#[tokio::test]
async fn it_should_fence_out_an_out_of_order_delivery() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    update_price(&app, &listing_id, 1, 22_000).await;
    update_price(&app, &listing_id, 2, 19_000).await;

    // v3 reaches the index before v1 and v2 are delivered.
    let latest = test_app.store.get(&listing_id).await.unwrap().unwrap();
    test_app.index.upsert(project(&latest)).await.unwrap();

    let report = reconciler.drain_once(later(start, 1)).await.unwrap();
    assert_eq!(report.superseded, 2);
    assert_eq!(report.delivered, 1);

    let document = test_app.index.document(&listing_id).await.unwrap();
    assert_eq!(document.version, 3);
    assert_eq!(document.price_cents, 19_000);
}

#[tokio::test]
async fn it_should_heal_drift_after_the_index_loses_a_document() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let sweeper = DriftSweeper::new(
        test_app.store.clone(),
        test_app.store.clone(),
        test_app.index.clone(),
        100,
    );
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    reconciler.drain_once(later(start, 1)).await.unwrap();
    test_app.index.remove(&listing_id).await;
    assert!(search(&app, "q=road").await.as_array().unwrap().is_empty());

    let sweep = sweeper.sweep_once(later(start, 2)).await.unwrap();
    assert_eq!(sweep.enqueued, 1);
    reconciler.drain_once(later(start, 3)).await.unwrap();

    assert_eq!(search(&app, "q=road").await[0]["listing_id"], listing_id.as_str());
    assert!(sweeper.sweep_once(later(start, 4)).await.unwrap().drift.is_empty());
}

#[tokio::test]
async fn it_should_leave_an_exhausted_event_queryable_as_failed() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    test_app.index.set_offline(true);
    let mut seconds = 1;
    while reconciler.drain_once(later(start, seconds)).await.unwrap().failed == 0 {
        assert!(seconds < 120, "event was never parked");
        seconds += 1;
    }

    let admin = admin_token();
    let (status, failed) = send(
        &app,
        Request::get("/sync/failed")
            .header(AUTHORIZATION, bearer(&admin))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(failed[0]["listing_id"], listing_id.as_str());
    assert_eq!(failed[0]["state"], "failed");
    let sequence = failed[0]["sequence"].as_i64().unwrap();

    // The listing itself stays readable while its index delivery is parked.
    let (status, _) = send(&app, Request::get(format!("/listings/{listing_id}")).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);

    test_app.index.set_offline(false);
    let (status, _) = send(
        &app,
        Request::post(format!("/sync/failed/{sequence}/retry"))
            .header(AUTHORIZATION, bearer(&admin))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let report = reconciler.drain_once(later(start, seconds + 1)).await.unwrap();
    assert_eq!(report.delivered, 1);
    let events = test_app.store.outbox_events_for(&listing_id).await;
    assert_eq!(events[0].state, DeliveryState::Delivered);
}

#[tokio::test]
async fn it_should_let_exactly_one_concurrent_writer_win() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    let (first, second) = tokio::join!(
        update_price(&app, &listing_id, 1, 10_000),
        update_price(&app, &listing_id, 1, 12_000),
    );
    let mut statuses = [first.as_u16(), second.as_u16()];
    statuses.sort();
    assert_eq!(statuses, [200, 409]);

    reconciler.drain_once(later(start, 1)).await.unwrap();
    let stored = test_app.store.get(&listing_id).await.unwrap().unwrap();
    let indexed = test_app.index.document(&listing_id).await.unwrap();
    assert_eq!(stored.version, 2);
    assert_eq!(indexed.version, 2);
    assert_eq!(indexed.price_cents, stored.price_cents);
}

#[tokio::test]
async fn it_should_converge_on_the_sqlite_backend() {
    let store = Arc::new(SqliteListingStore::in_memory().await.unwrap());
    let index = Arc::new(InMemorySearchIndex::new());
    let guard = Arc::new(AccessGuard::new(TokenVerifier::new(key_set()), AccessPolicy::default()));
    let app = router(AppState::new(store.clone(), index.clone(), guard));
    let reconciler = Reconciler::new(store.clone(), index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    assert_eq!(update_price(&app, &listing_id, 1, 21_000).await, StatusCode::OK);
    assert_eq!(update_price(&app, &listing_id, 1, 20_000).await, StatusCode::CONFLICT);
    let (status, _) = send(
        &app,
        Request::delete(format!("/listings/{listing_id}?expected_version=2"))
            .header(AUTHORIZATION, bearer(&owner_token(SELLER)))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let report = reconciler.drain_once(later(start, 1)).await.unwrap();
    assert_eq!(report.delivered, 3);
    assert!(index.is_empty().await);
    assert!(!store.has_undelivered(&listing_id).await.unwrap());
    let tombstone = store.get(&listing_id).await.unwrap().unwrap();
    assert_eq!(tombstone.version, 3);
    assert!(tombstone.is_deleted());
}

#[tokio::test]
async fn it_should_keep_search_reads_separate_from_store_failures() {
    let mut store = InMemoryListingStore::new();
    store.toggle_offline();
    let index = Arc::new(InMemorySearchIndex::new());
    let guard = Arc::new(AccessGuard::new(TokenVerifier::new(key_set()), AccessPolicy::default()));
    let app = router(AppState::new(Arc::new(store), index.clone(), guard));

    let (status, json) = send(&app, Request::get("/listings/search?q=bike").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));

    let (status, json) = send(&app, Request::get("/listings/listing-0001").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json["error"]["code"], 500);
}

#[tokio::test]
async fn it_should_not_resurrect_a_deleted_listing_when_its_stale_event_is_retried() {
    let test_app = make_test_app();
    let app = router(test_app.state.clone());
    let reconciler = Reconciler::new(test_app.store.clone(), test_app.index.clone(), settings());
    let start = Utc::now();

    let listing_id = create_listing(&app).await;
    test_app.index.set_offline(true);
    let mut seconds = 1;
    while reconciler.drain_once(later(start, seconds)).await.unwrap().failed == 0 {
        assert!(seconds < 120, "event was never parked");
        seconds += 1;
    }
    test_app.index.set_offline(false);

    let (status, _) = send(
        &app,
        Request::delete(format!("/listings/{listing_id}?expected_version=1"))
            .header(AUTHORIZATION, bearer(&owner_token(SELLER)))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reconciler.drain_once(later(start, seconds + 1)).await.unwrap().delivered, 1);

    let sequence = test_app.store.failed(10).await.unwrap()[0].sequence;
    let (status, _) = send(
        &app,
        Request::post(format!("/sync/failed/{sequence}/retry"))
            .header(AUTHORIZATION, bearer(&admin_token()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    reconciler.drain_once(later(start, seconds + 2)).await.unwrap();

    assert!(test_app.index.document(&listing_id).await.is_none());
    assert!(search(&app, "q=road").await.as_array().unwrap().is_empty());
    assert!(!test_app.store.has_undelivered(&listing_id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn it_should_converge_a_sqlite_file_under_concurrent_writers_and_draining() {
    let directory = tempfile::tempdir().unwrap();
    let store = Arc::new(
        SqliteListingStore::open(&directory.path().join("catalog.db"))
            .await
            .unwrap(),
    );
    let index = Arc::new(InMemorySearchIndex::new());
    let guard = Arc::new(AccessGuard::new(TokenVerifier::new(key_set()), AccessPolicy::default()));
    let app = router(AppState::new(store.clone(), index.clone(), guard));
    let reconciler = Arc::new(Reconciler::new(store.clone(), index.clone(), settings()));

    let mut listing_ids = Vec::new();
    for _ in 0..4 {
        listing_ids.push(create_listing(&app).await);
    }

    let done = Arc::new(AtomicBool::new(false));
    let draining = {
        let reconciler = reconciler.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let (mut unsettled, mut errors) = (0, 0);
            while !done.load(Ordering::SeqCst) {
                match reconciler.drain_once(Utc::now()).await {
                    Ok(report) => unsettled += report.unsettled,
                    Err(_) => errors += 1,
                }
                tokio::task::yield_now().await;
            }
            (unsettled, errors)
        })
    };

    let writers: Vec<_> = listing_ids
        .iter()
        .cloned()
        .map(|listing_id| {
            let app = app.clone();
            tokio::spawn(async move {
                let mut statuses = Vec::new();
                for version in 1..=25 {
                    statuses.push(update_price(&app, &listing_id, version, 1_000 + version).await);
                }
                statuses
            })
        })
        .collect();
    for writer in writers {
        let statuses = writer.await.unwrap();
        assert!(statuses.iter().all(|status| *status == StatusCode::OK), "{statuses:?}");
    }
    done.store(true, Ordering::SeqCst);
    assert_eq!(draining.await.unwrap(), (0, 0));

    while !reconciler.drain_once(Utc::now()).await.unwrap().is_idle() {}
    for listing_id in &listing_ids {
        let stored = store.get(listing_id).await.unwrap().unwrap();
        let indexed = index.document(listing_id).await.unwrap();
        assert_eq!(stored.version, 26);
        assert_eq!(indexed.version, 26);
        assert_eq!(indexed.price_cents, 1_025);
        assert!(!store.has_undelivered(listing_id).await.unwrap());
    }
}
