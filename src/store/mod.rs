mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::config::env_string;
use crate::models::{Bid, Listing, ListingPatch, ListingStatus, User};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    Duplicate(&'static str),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Conditions a listing must satisfy for a patch to be written. Every set
/// condition is matched together with the update so concurrent phase calls
/// cannot both advance the same listing.
#[derive(Debug, Clone, Default)]
pub struct PatchGuard {
    pub seller_id: Option<String>,
    pub phase: Option<u8>,
    pub status: Option<ListingStatus>,
}

impl PatchGuard {
    pub fn owned_by(seller_id: &str) -> Self {
        Self {
            seller_id: Some(seller_id.to_string()),
            ..Self::default()
        }
    }

    pub fn at_phase(mut self, phase: u8) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_status(mut self, status: ListingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, listing: &Listing) -> bool {
        self.seller_id
            .as_deref()
            .is_none_or(|seller| listing.seller_id == seller)
            && self.phase.is_none_or(|phase| listing.pipeline_phase == phase)
            && self.status.is_none_or(|status| listing.status == status)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Fails with `StoreError::Duplicate` when the email is taken.
    async fn create_user(&self, user: User) -> Result<(), StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn find_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;

    async fn insert_listing(&self, listing: Listing) -> Result<(), StoreError>;

    async fn get_listing(&self, listing_id: &str) -> Result<Option<Listing>, StoreError>;

    /// Newest first.
    async fn list_by_seller(&self, seller_id: &str) -> Result<Vec<Listing>, StoreError>;

    async fn list_active(&self) -> Result<Vec<Listing>, StoreError>;

    /// Applies `patch` only when the listing matches `guard`. Returns whether
    /// a listing was updated.
    async fn apply_patch(
        &self,
        listing_id: &str,
        guard: PatchGuard,
        patch: ListingPatch,
    ) -> Result<bool, StoreError>;

    async fn insert_bid(&self, bid: Bid) -> Result<(), StoreError>;

    async fn distinct_bidders(&self, listing_id: &str) -> Result<u32, StoreError>;
}

pub type SharedStore = Arc<dyn Store>;

/// MongoDB when `MONGO_URL` is set, otherwise an in-process store.
pub async fn from_env() -> Result<SharedStore, StoreError> {
    match env_string("MONGO_URL") {
        Some(url) => {
            let database =
                env_string("DATABASE_NAME").unwrap_or_else(|| "sealed_auction".to_string());
            let store = MongoStore::connect(&url, &database).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!(
                target = "auction.store",
                "MONGO_URL not set; using in-memory store"
            );
            Ok(Arc::new(MemoryStore::default()))
        }
    }
}
