use async_graphql::{EmptySubscription, Schema, http::GraphiQLSource};
use async_graphql_axum::{GraphQLRequest, GraphQLResponse};
use axum::{Extension, http::HeaderMap, response::Html};

use crate::modules::access::adapters::inbound::bearer::BearerToken;
pub use crate::modules::listings::use_cases::search_listings::inbound::graphql::QueryRoot;
pub use crate::modules::listings::use_cases::update_listing::inbound::graphql::MutationRoot;
pub use crate::shell::state::AppState;

pub type AppSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

pub fn build_schema(state: AppState) -> AppSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(state)
        .finish()
}

/// Resolvers authenticate through the same guard as the REST routes, so the
/// bearer token travels with the request.
pub async fn handle(Extension(schema): Extension<AppSchema>, headers: HeaderMap, request: GraphQLRequest) -> GraphQLResponse {
    let request = request.into_inner().data(BearerToken::from_headers(&headers));
    schema.execute(request).await.into()
}

pub async fn graphiql() -> Html<String> {
    Html(GraphiQLSource::build().endpoint("/graphql").finish())
}
