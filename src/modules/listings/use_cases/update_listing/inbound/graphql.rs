use async_graphql::{Context, ID, Object, Result as GqlResult, SimpleObject};
use chrono::Utc;

use crate::modules::access::adapters::inbound::bearer::BearerToken;
use crate::modules::listings::core::listing::{ListingPatch, ListingStatus, WriteOutcome};
use crate::modules::listings::use_cases::update_listing::command::UpdateListing;
use crate::shared::core::application_error::ApplicationError;
use crate::shell::state::AppState;

#[derive(SimpleObject, Clone)]
pub struct GqlWriteOutcome {
    pub listing_id: ID,
    pub version: i64,
}

impl From<WriteOutcome> for GqlWriteOutcome {
    fn from(outcome: WriteOutcome) -> Self {
        Self {
            listing_id: ID(outcome.listing_id),
            version: outcome.version,
        }
    }
}

pub struct MutationRoot;

#[Object]
impl MutationRoot {
    #[allow(clippy::too_many_arguments)]
    async fn update_listing(
        &self,
        context: &Context<'_>,
        listing_id: ID,
        expected_version: i64,
        title: Option<String>,
        price_cents: Option<i64>,
        status: Option<String>,
        category: Option<String>,
    ) -> GqlResult<GqlWriteOutcome> {
        let state = context.data::<AppState>()?;
        let token = context.data_opt::<BearerToken>().and_then(BearerToken::as_deref);

        let status = status
            .map(|raw| raw.parse::<ListingStatus>())
            .transpose()
            .map_err(|err| ApplicationError::Invalid(err.to_string()).into_graphql())?;
        let command = UpdateListing {
            listing_id: listing_id.0,
            expected_version,
            patch: ListingPatch {
                title,
                price_cents,
                status,
                category,
            },
        };

        let outcome = state
            .update_listing
            .handle(token, command, Utc::now())
            .await
            .map_err(ApplicationError::into_graphql)?;
        Ok(outcome.into())
    }
}
