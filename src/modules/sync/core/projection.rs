use crate::modules::listings::core::listing::Listing;
use crate::shared::infrastructure::change_outbox::OutboxEvent;
use crate::shared::infrastructure::search_index::SearchDocument;

/// The search document for a committed listing snapshot.
pub fn project(listing: &Listing) -> SearchDocument {
    SearchDocument {
        listing_id: listing.listing_id.clone(),
        version: listing.version,
        owner_id: listing.owner_id.clone(),
        title: listing.title.clone(),
        category: listing.category.clone(),
        status: listing.status,
        price_cents: listing.price_cents,
        updated_at: listing.updated_at,
        search_text: format!("{} {}", listing.title, listing.category).to_lowercase(),
    }
}

/// Decode the listing snapshot carried by an outbox event and check it belongs to the event.
pub fn decode_snapshot(event: &OutboxEvent) -> Result<Listing, String> {
    let listing: Listing = serde_json::from_value(event.payload.clone())
        .map_err(|err| format!("malformed payload: {err}"))?;
    if listing.listing_id != event.listing_id || listing.version != event.listing_version {
        return Err(format!(
            "payload describes {} v{}, event describes {} v{}",
            listing.listing_id, listing.version, event.listing_id, event.listing_version
        ));
    }
    Ok(listing)
}
