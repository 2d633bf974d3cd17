use super::{PatchGuard, Store, StoreError};
use crate::models::{Bid, Listing, ListingPatch, ListingStatus, User};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    users: HashMap<String, User>,
    listings: HashMap<String, Listing>,
    bids: Vec<Bid>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

#[async_trait]
impl Store for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn create_user(&self, user: User) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.users.values().any(|existing| existing.email == user.email) {
            return Err(StoreError::Duplicate("email"));
        }
        tables.users.insert(user.user_id.clone(), user);
        Ok(())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.users.values().find(|user| user.email == email).cloned())
    }

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.tables.lock().await.users.get(user_id).cloned())
    }

    async fn insert_listing(&self, listing: Listing) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.listings.contains_key(&listing.listing_id) {
            return Err(StoreError::Duplicate("listing"));
        }
        tables.listings.insert(listing.listing_id.clone(), listing);
        Ok(())
    }

    async fn get_listing(&self, listing_id: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self.tables.lock().await.listings.get(listing_id).cloned())
    }

    async fn list_by_seller(&self, seller_id: &str) -> Result<Vec<Listing>, StoreError> {
        let tables = self.tables.lock().await;
        let mut listings: Vec<Listing> = tables
            .listings
            .values()
            .filter(|listing| listing.seller_id == seller_id)
            .cloned()
            .collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listings)
    }

    async fn list_active(&self) -> Result<Vec<Listing>, StoreError> {
        let tables = self.tables.lock().await;
        let mut listings: Vec<Listing> = tables
            .listings
            .values()
            .filter(|listing| listing.status == ListingStatus::AuctionActive)
            .cloned()
            .collect();
        listings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listings)
    }

    async fn apply_patch(
        &self,
        listing_id: &str,
        guard: PatchGuard,
        patch: ListingPatch,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.listings.get_mut(listing_id) {
            Some(listing) if guard.matches(listing) => {
                patch.apply(listing);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn insert_bid(&self, bid: Bid) -> Result<(), StoreError> {
        self.tables.lock().await.bids.push(bid);
        Ok(())
    }

    async fn distinct_bidders(&self, listing_id: &str) -> Result<u32, StoreError> {
        let tables = self.tables.lock().await;
        let bidders: HashSet<&str> = tables
            .bids
            .iter()
            .filter(|bid| bid.listing_id == listing_id)
            .map(|bid| bid.user_id.as_str())
            .collect();
        Ok(bidders.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListingDetails, Role};
    use chrono::{Duration, Utc};

    fn user(id: &str, email: &str) -> User {
        User {
            user_id: id.into(),
            email: email.into(),
            password_hash: "hash".into(),
            role: Role::Seller,
            name: String::new(),
            created_at: Utc::now(),
        }
    }

    fn listing(id: &str, seller: &str) -> Listing {
        Listing::draft(id.into(), seller.into(), Vec::new(), ListingDetails::default())
    }

    fn bid(listing: &str, user: &str) -> Bid {
        Bid {
            bid_id: format!("{listing}-{user}"),
            listing_id: listing.into(),
            user_id: user.into(),
            amount: 10.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_email_is_rejected() {
        let store = MemoryStore::default();
        store.create_user(user("u1", "a@b.c")).await.expect("first");
        let err = store.create_user(user("u2", "a@b.c")).await.expect_err("dup");
        assert!(matches!(err, StoreError::Duplicate("email")));
        assert!(store.find_user_by_email("a@b.c").await.expect("find").is_some());
    }

    #[tokio::test]
    async fn seller_listings_are_newest_first() {
        let store = MemoryStore::default();
        let mut older = listing("old", "s1");
        older.created_at = Utc::now() - Duration::hours(1);
        store.insert_listing(older).await.expect("insert");
        store.insert_listing(listing("new", "s1")).await.expect("insert");
        store.insert_listing(listing("other", "s2")).await.expect("insert");
        let ids: Vec<String> = store
            .list_by_seller("s1")
            .await
            .expect("list")
            .into_iter()
            .map(|l| l.listing_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn guarded_patch_only_applies_once() {
        let store = MemoryStore::default();
        store.insert_listing(listing("l1", "s1")).await.expect("insert");
        let advance = || ListingPatch::advance_to(ListingStatus::Authenticated);
        let guard = || PatchGuard::owned_by("s1").at_phase(1);
        assert!(store.apply_patch("l1", guard(), advance()).await.expect("first"));
        assert!(!store.apply_patch("l1", guard(), advance()).await.expect("second"));
        assert!(
            !store
                .apply_patch("l1", PatchGuard::owned_by("s2"), advance())
                .await
                .expect("other seller")
        );
        let stored = store.get_listing("l1").await.expect("get").expect("exists");
        assert_eq!(stored.pipeline_phase, 2);
    }

    #[tokio::test]
    async fn bidders_are_counted_once() {
        let store = MemoryStore::default();
        for (listing, user) in [("l1", "b1"), ("l1", "b1"), ("l1", "b2"), ("l2", "b3")] {
            store.insert_bid(bid(listing, user)).await.expect("bid");
        }
        assert_eq!(store.distinct_bidders("l1").await.expect("count"), 2);
        assert_eq!(store.distinct_bidders("l3").await.expect("count"), 0);
    }
}
