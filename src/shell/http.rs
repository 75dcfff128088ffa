use axum::{
    Extension, Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::modules::listings::use_cases::create_listing::inbound::http as create_http;
use crate::modules::listings::use_cases::delete_listing::inbound::http as delete_http;
use crate::modules::listings::use_cases::get_listing::inbound::http as get_http;
use crate::modules::listings::use_cases::search_listings::inbound::http as search_http;
use crate::modules::listings::use_cases::update_listing::inbound::http as update_http;
use crate::modules::sync::use_cases::failed_events::inbound::http as failed_http;
use crate::shell::graphql;
use crate::shell::state::AppState;

pub fn router(state: AppState) -> Router {
    let schema = graphql::build_schema(state.clone());
    Router::new()
        .route("/listings", post(create_http::handle))
        .route("/listings/search", get(search_http::handle))
        .route(
            "/listings/{id}",
            get(get_http::handle)
                .put(update_http::handle)
                .delete(delete_http::handle),
        )
        .route("/sync/failed", get(failed_http::list))
        .route("/sync/failed/{sequence}/retry", post(failed_http::retry))
        .route("/graphql", get(graphql::graphiql).post(graphql::handle))
        .layer(Extension(schema))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
