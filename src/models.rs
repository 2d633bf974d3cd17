use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Seller,
    Buyer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Seller => "seller",
            Role::Buyer => "buyer",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    #[serde(default)]
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserResponse {
    pub user_id: String,
    pub email: String,
    pub role: Role,
    pub name: String,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.user_id.clone(),
            email: user.email.clone(),
            role: user.role,
            name: user.name.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub user: UserResponse,
}

/// Lifecycle of a listing. Each status corresponds to exactly one
/// `pipeline_phase` value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListingStatus {
    Uploaded,
    Authenticated,
    Priced,
    Posted,
    AuctionActive,
}

impl ListingStatus {
    pub fn phase(&self) -> u8 {
        match self {
            ListingStatus::Uploaded => 1,
            ListingStatus::Authenticated => 2,
            ListingStatus::Priced => 3,
            ListingStatus::Posted => 4,
            ListingStatus::AuctionActive => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Uploaded => "UPLOADED",
            ListingStatus::Authenticated => "AUTHENTICATED",
            ListingStatus::Priced => "PRICED",
            ListingStatus::Posted => "POSTED",
            ListingStatus::AuctionActive => "AUCTION_ACTIVE",
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub filename: String,
    pub original_name: String,
    pub local_path: String,
    pub mime_type: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub width: u32,
    pub height: u32,
    /// Base64 payload of the compressed image, only kept for small files.
    pub inline_data: Option<String>,
    pub external_ref: Option<String>,
}

/// A supporting document (certificate, invoice, provenance record) stored
/// as uploaded, next to the listing's images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub filename: String,
    pub original_name: String,
    pub local_path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Blockchain {
    pub auction_address: Option<String>,
    pub tx_hash: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: String,
    pub seller_id: String,
    pub images: Vec<ImageRecord>,
    #[serde(default)]
    pub documents: Vec<DocumentRecord>,
    pub status: ListingStatus,
    pub pipeline_phase: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub title: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub starting_price: Option<f64>,
    #[serde(default)]
    pub participants_count: u32,
    pub end_time: Option<DateTime<Utc>>,
    pub ai_analysis: Option<Value>,
    pub price_estimation: Option<Value>,
    pub generated_post: Option<Value>,
    #[serde(default)]
    pub blockchain: Blockchain,
    #[serde(default)]
    pub stage_reports: Vec<StageReport>,
}

impl Listing {
    pub fn draft(
        listing_id: String,
        seller_id: String,
        images: Vec<ImageRecord>,
        details: ListingDetails,
    ) -> Self {
        let now = Utc::now();
        Self {
            listing_id,
            seller_id,
            images,
            documents: Vec::new(),
            status: ListingStatus::Uploaded,
            pipeline_phase: ListingStatus::Uploaded.phase(),
            created_at: now,
            updated_at: now,
            title: details.title,
            category: details.category,
            description: details.description,
            starting_price: None,
            participants_count: 0,
            end_time: None,
            ai_analysis: None,
            price_estimation: None,
            generated_post: None,
            blockchain: Blockchain::default(),
            stage_reports: Vec::new(),
        }
    }

    /// Seller-facing copy: everything except inline image payloads.
    pub fn without_payloads(mut self) -> Self {
        for image in &mut self.images {
            image.inline_data = None;
        }
        self
    }

    pub fn buyer_view(&self) -> ListingBuyerView {
        ListingBuyerView {
            listing_id: self.listing_id.clone(),
            images: self
                .images
                .iter()
                .cloned()
                .map(|mut image| {
                    image.inline_data = None;
                    image
                })
                .collect(),
            status: self.status,
            title: self.title.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
            starting_price: self.starting_price,
            participants_count: self.participants_count,
            end_time: self.end_time,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// What a buyer is allowed to see of a listing. Pricing internals, the
/// authenticity report, the seller, supporting documents, the generated post,
/// the chain reference and pipeline progress are never part of it.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingBuyerView {
    pub listing_id: String,
    pub images: Vec<ImageRecord>,
    pub status: ListingStatus,
    pub title: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub starting_price: Option<f64>,
    pub participants_count: u32,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListingDetails {
    pub title: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
}

/// Partial update applied by the phase endpoints. `None` fields are left
/// untouched; `updated_at` is always written.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ListingPatch {
    pub status: Option<ListingStatus>,
    pub pipeline_phase: Option<u8>,
    pub title: Option<String>,
    pub starting_price: Option<f64>,
    pub participants_count: Option<u32>,
    pub end_time: Option<DateTime<Utc>>,
    pub ai_analysis: Option<Value>,
    pub price_estimation: Option<Value>,
    pub generated_post: Option<Value>,
    pub blockchain: Option<Blockchain>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    pub append_reports: Vec<StageReport>,
}

impl Default for ListingPatch {
    fn default() -> Self {
        Self {
            status: None,
            pipeline_phase: None,
            title: None,
            starting_price: None,
            participants_count: None,
            end_time: None,
            ai_analysis: None,
            price_estimation: None,
            generated_post: None,
            blockchain: None,
            updated_at: Utc::now(),
            append_reports: Vec::new(),
        }
    }
}

impl ListingPatch {
    pub fn advance_to(status: ListingStatus) -> Self {
        Self {
            status: Some(status),
            pipeline_phase: Some(status.phase()),
            ..Self::default()
        }
    }

    pub fn apply(self, listing: &mut Listing) {
        if let Some(status) = self.status {
            listing.status = status;
        }
        if let Some(phase) = self.pipeline_phase {
            listing.pipeline_phase = phase;
        }
        if let Some(title) = self.title {
            listing.title = Some(title);
        }
        if let Some(price) = self.starting_price {
            listing.starting_price = Some(price);
        }
        if let Some(count) = self.participants_count {
            listing.participants_count = count;
        }
        if let Some(end_time) = self.end_time {
            listing.end_time = Some(end_time);
        }
        if let Some(analysis) = self.ai_analysis {
            listing.ai_analysis = Some(analysis);
        }
        if let Some(estimation) = self.price_estimation {
            listing.price_estimation = Some(estimation);
        }
        if let Some(post) = self.generated_post {
            listing.generated_post = Some(post);
        }
        if let Some(chain) = self.blockchain {
            listing.blockchain = chain;
        }
        listing.updated_at = self.updated_at;
        listing.stage_reports.extend(self.append_reports);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: String,
    pub listing_id: String,
    pub user_id: String,
    pub amount: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadResponse {
    pub listing_id: String,
    pub message: String,
    pub images: usize,
    #[serde(default)]
    pub documents: usize,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResponse {
    pub listing_id: String,
    pub message: String,
    pub phase: u8,
    pub status: ListingStatus,
    pub starting_price: Option<f64>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidResponse {
    pub message: String,
    pub participants: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms: elapsed_ms as u64,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
