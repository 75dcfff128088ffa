use async_graphql::{Context, ID, Object, Result as GqlResult, SimpleObject};

use crate::modules::listings::core::listing::ListingStatus;
use crate::shared::core::application_error::ApplicationError;
use crate::shared::infrastructure::search_index::{SearchHit, SearchQuery};
use crate::shell::state::AppState;

#[derive(SimpleObject, Clone)]
pub struct GqlSearchHit {
    pub listing_id: ID,
    pub version: i64,
    pub owner_id: String,
    pub title: String,
    pub category: String,
    pub status: String,
    pub price_cents: i64,
    pub updated_at: i64,
}

impl From<SearchHit> for GqlSearchHit {
    fn from(hit: SearchHit) -> Self {
        Self {
            listing_id: ID(hit.listing_id),
            version: hit.version,
            owner_id: hit.owner_id,
            title: hit.title,
            category: hit.category,
            status: hit.status.to_string(),
            price_cents: hit.price_cents,
            updated_at: hit.updated_at,
        }
    }
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    #[allow(clippy::too_many_arguments)]
    async fn search_listings(
        &self,
        context: &Context<'_>,
        text: Option<String>,
        category: Option<String>,
        status: Option<String>,
        min_price_cents: Option<i64>,
        max_price_cents: Option<i64>,
        offset: Option<i64>,
        limit: Option<i64>,
    ) -> GqlResult<Vec<GqlSearchHit>> {
        let state = context.data::<AppState>()?;
        let status = status
            .map(|raw| raw.parse::<ListingStatus>())
            .transpose()
            .map_err(|err| ApplicationError::Invalid(err.to_string()).into_graphql())?;

        let query = SearchQuery {
            text,
            category,
            status,
            min_price_cents,
            max_price_cents,
            offset: offset.unwrap_or(0).max(0) as usize,
            limit: limit.map(|limit| limit.max(0) as usize),
        };
        let hits = state
            .search_index
            .search(&query)
            .await
            .map_err(|err| ApplicationError::from(err).into_graphql())?;
        Ok(hits.into_iter().map(Into::into).collect())
    }
}
