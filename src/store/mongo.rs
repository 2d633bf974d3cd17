use super::{PatchGuard, Store, StoreError};
use crate::models::{Bid, Listing, ListingPatch, ListingStatus, User};
use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::{
    Client, Collection, IndexModel,
    bson::{self, Bson, Document, doc},
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
};
use tracing::info;

const DUPLICATE_KEY: i32 = 11000;

pub struct MongoStore {
    users: Collection<User>,
    listings: Collection<Listing>,
    bids: Collection<Bid>,
}

impl MongoStore {
    pub async fn connect(url: &str, database: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(url).await?;
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;
        let db = client.database(database);
        let store = Self {
            users: db.collection("users"),
            listings: db.collection("listings"),
            bids: db.collection("bids"),
        };
        store.ensure_indexes().await?;
        info!(target = "auction.store", database, "connected to MongoDB");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = |keys: Document| {
            IndexModel::builder()
                .keys(keys)
                .options(IndexOptions::builder().unique(true).build())
                .build()
        };
        self.users.create_index(unique(doc! { "email": 1 })).await?;
        self.users.create_index(unique(doc! { "user_id": 1 })).await?;
        self.listings
            .create_index(unique(doc! { "listing_id": 1 }))
            .await?;
        self.listings
            .create_index(IndexModel::builder().keys(doc! { "seller_id": 1, "created_at": -1 }).build())
            .await?;
        self.bids
            .create_index(IndexModel::builder().keys(doc! { "listing_id": 1 }).build())
            .await?;
        Ok(())
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(write)) if write.code == DUPLICATE_KEY
    )
}

fn guard_filter(listing_id: &str, guard: &PatchGuard) -> Document {
    let mut filter = doc! { "listing_id": listing_id };
    if let Some(seller) = &guard.seller_id {
        filter.insert("seller_id", seller.as_str());
    }
    if let Some(phase) = guard.phase {
        filter.insert("pipeline_phase", phase as i32);
    }
    if let Some(status) = guard.status {
        filter.insert("status", status.as_str());
    }
    filter
}

/// Timestamps are stored as RFC 3339 strings whose fraction width varies, so
/// the server-side sort is only approximate.
fn newest_first(mut listings: Vec<Listing>) -> Vec<Listing> {
    listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    listings
}

fn update_document(patch: &ListingPatch) -> Result<Document, StoreError> {
    let set = bson::to_document(patch).map_err(|err| StoreError::Backend(err.to_string()))?;
    let mut update = doc! { "$set": set };
    if !patch.append_reports.is_empty() {
        let reports =
            bson::to_bson(&patch.append_reports).map_err(|err| StoreError::Backend(err.to_string()))?;
        update.insert("$push", doc! { "stage_reports": { "$each": reports } });
    }
    Ok(update)
}

#[async_trait]
impl Store for MongoStore {
    fn backend(&self) -> &'static str {
        "mongodb"
    }

    async fn create_user(&self, user: User) -> Result<(), StoreError> {
        match self.users.insert_one(user).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(StoreError::Duplicate("email")),
            Err(err) => Err(err.into()),
        }
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.find_one(doc! { "email": email }).await?)
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.find_one(doc! { "user_id": user_id }).await?)
    }

    async fn insert_listing(&self, listing: Listing) -> Result<(), StoreError> {
        match self.listings.insert_one(listing).await {
            Ok(_) => Ok(()),
            Err(err) if is_duplicate_key(&err) => Err(StoreError::Duplicate("listing")),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_listing(&self, listing_id: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self
            .listings
            .find_one(doc! { "listing_id": listing_id })
            .await?)
    }

    async fn list_by_seller(&self, seller_id: &str) -> Result<Vec<Listing>, StoreError> {
        let cursor = self
            .listings
            .find(doc! { "seller_id": seller_id })
            .sort(doc! { "created_at": -1 })
            .await?;
        Ok(newest_first(cursor.try_collect().await?))
    }

    async fn list_active(&self) -> Result<Vec<Listing>, StoreError> {
        let cursor = self
            .listings
            .find(doc! { "status": ListingStatus::AuctionActive.as_str() })
            .sort(doc! { "created_at": -1 })
            .await?;
        Ok(newest_first(cursor.try_collect().await?))
    }

    async fn apply_patch(
        &self,
        listing_id: &str,
        guard: PatchGuard,
        patch: ListingPatch,
    ) -> Result<bool, StoreError> {
        let result = self
            .listings
            .update_one(guard_filter(listing_id, &guard), update_document(&patch)?)
            .await?;
        Ok(result.matched_count == 1)
    }

    async fn insert_bid(&self, bid: Bid) -> Result<(), StoreError> {
        self.bids.insert_one(bid).await?;
        Ok(())
    }

    async fn distinct_bidders(&self, listing_id: &str) -> Result<u32, StoreError> {
        let bidders: Vec<Bson> = self
            .bids
            .distinct("user_id", doc! { "listing_id": listing_id })
            .await?;
        Ok(bidders.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListingDetails, StageReport};
    use chrono::{DateTime, Utc};
    use serde_json::json;

    #[test]
    fn guard_becomes_filter() {
        let guard = PatchGuard::owned_by("s1")
            .at_phase(2)
            .with_status(ListingStatus::Authenticated);
        let filter = guard_filter("l1", &guard);
        assert_eq!(filter.get_str("listing_id").expect("id"), "l1");
        assert_eq!(filter.get_str("seller_id").expect("seller"), "s1");
        assert_eq!(filter.get_i32("pipeline_phase").expect("phase"), 2);
        assert_eq!(filter.get_str("status").expect("status"), "AUTHENTICATED");
    }

    #[test]
    fn patch_sets_present_fields_and_pushes_reports() {
        let mut patch = ListingPatch::advance_to(ListingStatus::Priced);
        patch.starting_price = Some(75.0);
        patch.append_reports.push(StageReport::new("pricing", 12, json!({})));
        let update = update_document(&patch).expect("update");
        let set = update.get_document("$set").expect("$set");
        assert_eq!(set.get_str("status").expect("status"), "PRICED");
        assert_eq!(set.get_f64("starting_price").expect("price"), 75.0);
        assert!(!set.contains_key("title"));
        assert!(!set.contains_key("append_reports"));
        assert!(update.get_document("$push").is_ok());
    }

    #[test]
    fn listings_sort_on_instant_not_text() {
        let at = |listing_id: &str, stamp: &str| {
            let mut listing = Listing::draft(
                listing_id.to_string(),
                "s1".to_string(),
                Vec::new(),
                ListingDetails::default(),
            );
            listing.created_at = DateTime::parse_from_rfc3339(stamp)
                .expect("stamp")
                .with_timezone(&Utc);
            listing
        };
        // As text, "...05Z" sorts after "...05.5Z"; as instants it is earlier.
        let listings = vec![
            at("whole", "2026-03-01T10:00:05Z"),
            at("fraction", "2026-03-01T10:00:05.5Z"),
            at("older", "2026-03-01T09:59:59.999Z"),
        ];
        let ids: Vec<String> = newest_first(listings)
            .into_iter()
            .map(|l| l.listing_id)
            .collect();
        assert_eq!(ids, ["fraction", "whole", "older"]);
    }

    #[test]
    fn empty_reports_skip_push() {
        let update = update_document(&ListingPatch::default()).expect("update");
        assert!(update.get_document("$push").is_err());
        assert!(update.get_document("$set").expect("$set").contains_key("updated_at"));
    }
}
