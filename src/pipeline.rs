//! Seller phase transitions and buyer bids.
//!
//! Each phase call loads the listing, checks ownership and the current
//! phase, runs its stage and commits the result with a write guarded on the
//! phase it started from. A listing therefore only ever moves forward, one
//! phase at a time.

use crate::authenticity::{AgentError, AgentImage, AuthenticityAgent, ItemContext};
use crate::config::SearchKeys;
use crate::llm::Models;
use crate::models::{
    Bid, BidResponse, Blockchain, Listing, ListingPatch, ListingStatus, PhaseResponse, StageReport,
};
use crate::post_gen::{PostGenerator, PostInput};
use crate::pricing::{PriceAdvisor, PriceInput};
use crate::store::{PatchGuard, SharedStore, StoreError};
use crate::upload;
use chrono::{Duration, Utc};
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

const AUCTION_DAYS: i64 = 7;
const PRICING_IMAGES: usize = 3;

#[derive(Clone)]
pub struct Pipeline {
    store: SharedStore,
    agent: Arc<AuthenticityAgent>,
    pricing: PriceAdvisor,
    posts: PostGenerator,
}

impl Pipeline {
    pub fn new(
        store: SharedStore,
        agent: AuthenticityAgent,
        pricing: PriceAdvisor,
        posts: PostGenerator,
    ) -> Self {
        Self {
            store,
            agent: Arc::new(agent),
            pricing,
            posts,
        }
    }

    pub fn from_env(store: SharedStore, models: &Models, keys: &SearchKeys) -> Self {
        Self::new(
            store,
            AuthenticityAgent::from_env(models, keys),
            PriceAdvisor::new(models.reasoning.clone()),
            PostGenerator::new(models.vision.clone(), models.reasoning.clone()),
        )
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Phase 1 -> 2. A rejected listing keeps its phase; the verdict is
    /// stored either way.
    pub async fn analyze(
        &self,
        listing_id: &str,
        seller_id: &str,
    ) -> Result<PhaseResponse, PipelineError> {
        let listing = self.owned_listing(listing_id, seller_id, "analyze").await?;
        expect_phase(&listing, ListingStatus::Uploaded, "analyze")?;
        let images = load_agent_images(&listing).await?;
        let item = ItemContext {
            listing_id: listing.listing_id.clone(),
            category: listing.category.clone(),
            description: listing.description.clone(),
        };

        let mut stages = Vec::new();
        let verdict = self
            .capture_stage("authenticity", &mut stages, async {
                let verdict = self.agent.run(&item, &images).await.map_err(agent_error)?;
                let output = json!({
                    "verdict": verdict.label(),
                    "images": images.len(),
                });
                Ok(StageOutcome::new(verdict, output))
            })
            .await?;

        let analysis = serde_json::to_value(&verdict)
            .map_err(|err| PipelineError::internal("analyze", err.to_string()))?;
        let validated = verdict.is_validated();
        let mut patch = if validated {
            ListingPatch::advance_to(ListingStatus::Authenticated)
        } else {
            ListingPatch::default()
        };
        patch.ai_analysis = Some(analysis.clone());
        patch.append_reports = stages.clone();
        self.commit(&listing, ListingStatus::Uploaded, patch, "analyze")
            .await?;

        let status = if validated {
            ListingStatus::Authenticated
        } else {
            ListingStatus::Uploaded
        };
        info!(
            target = "auction.pipeline",
            listing_id,
            verdict = verdict.label(),
            "analysis finished"
        );
        Ok(PhaseResponse {
            listing_id: listing.listing_id,
            message: if validated {
                "Authenticity check passed".into()
            } else {
                format!("Authenticity check rejected the listing: {}", verdict.label())
            },
            phase: status.phase(),
            status,
            starting_price: None,
            end_time: None,
            result: Some(analysis),
            stages,
        })
    }

    /// Phase 2 -> 3.
    pub async fn estimate(
        &self,
        listing_id: &str,
        seller_id: &str,
    ) -> Result<PhaseResponse, PipelineError> {
        let listing = self.owned_listing(listing_id, seller_id, "estimate").await?;
        expect_phase(&listing, ListingStatus::Authenticated, "estimate")?;

        let mut images = Vec::new();
        for record in listing.images.iter().take(PRICING_IMAGES) {
            match upload::load_image(record).await {
                Ok(bytes) => images.push(bytes),
                Err(err) => warn!(
                    target = "auction.pipeline",
                    file = %record.filename,
                    error = %err,
                    "image unavailable for pricing"
                ),
            }
        }
        let input = PriceInput {
            title: listing.title.clone(),
            category: listing.category.clone(),
            description: listing.description.clone(),
            images,
        };

        let mut stages = Vec::new();
        let recommendation = self
            .capture_stage("pricing", &mut stages, async {
                let recommendation = self.pricing.recommend(&input).await;
                let output = json!({
                    "engine": recommendation.engine_used,
                    "images": input.images.len(),
                });
                Ok(StageOutcome::new(recommendation, output))
            })
            .await?;

        let estimation = serde_json::to_value(&recommendation)
            .map_err(|err| PipelineError::internal("estimate", err.to_string()))?;
        let mut patch = ListingPatch::advance_to(ListingStatus::Priced);
        patch.starting_price = Some(recommendation.starting_price);
        patch.price_estimation = Some(estimation.clone());
        patch.append_reports = stages.clone();
        self.commit(&listing, ListingStatus::Authenticated, patch, "estimate")
            .await?;

        Ok(PhaseResponse {
            listing_id: listing.listing_id,
            message: "Price estimation complete".into(),
            phase: ListingStatus::Priced.phase(),
            status: ListingStatus::Priced,
            starting_price: Some(recommendation.starting_price),
            end_time: None,
            result: Some(estimation),
            stages,
        })
    }

    /// Phase 3 -> 4.
    pub async fn generate(
        &self,
        listing_id: &str,
        seller_id: &str,
    ) -> Result<PhaseResponse, PipelineError> {
        let listing = self.owned_listing(listing_id, seller_id, "generate").await?;
        expect_phase(&listing, ListingStatus::Priced, "generate")?;

        let image = match listing.images.first() {
            Some(record) => upload::load_image(record).await.ok(),
            None => None,
        };
        let input = PostInput {
            title: listing.title.clone(),
            category: listing.category.clone(),
            description: listing.description.clone(),
            starting_price: listing.starting_price,
            image,
            validation: listing.ai_analysis.clone(),
        };

        let mut stages = Vec::new();
        let post = self
            .capture_stage("post_generation", &mut stages, async {
                let post = self.posts.generate(&input).await;
                let output = json!({ "engine": post.engine_used, "title": post.title });
                Ok(StageOutcome::new(post, output))
            })
            .await?;

        let generated = serde_json::to_value(&post)
            .map_err(|err| PipelineError::internal("generate", err.to_string()))?;
        let mut patch = ListingPatch::advance_to(ListingStatus::Posted);
        patch.title = Some(post.title.clone());
        patch.generated_post = Some(generated.clone());
        patch.append_reports = stages.clone();
        self.commit(&listing, ListingStatus::Priced, patch, "generate")
            .await?;

        Ok(PhaseResponse {
            listing_id: listing.listing_id,
            message: "Auction post generated".into(),
            phase: ListingStatus::Posted.phase(),
            status: ListingStatus::Posted,
            starting_price: listing.starting_price,
            end_time: None,
            result: Some(generated),
            stages,
        })
    }

    /// Phase 4 -> 5. Opens bidding for seven days. The chain reference is a
    /// placeholder until on-chain deployment exists.
    pub async fn deploy(
        &self,
        listing_id: &str,
        seller_id: &str,
    ) -> Result<PhaseResponse, PipelineError> {
        let listing = self.owned_listing(listing_id, seller_id, "deploy").await?;
        expect_phase(&listing, ListingStatus::Posted, "deploy")?;

        let end_time = Utc::now() + Duration::days(AUCTION_DAYS);
        let blockchain = Blockchain {
            auction_address: Some(format!(
                "0x{}",
                listing.listing_id.chars().take(40).collect::<String>()
            )),
            tx_hash: Some(format!("0x{}", hex::encode(rand::random::<[u8; 32]>()))),
        };
        let mut patch = ListingPatch::advance_to(ListingStatus::AuctionActive);
        patch.participants_count = Some(0);
        patch.end_time = Some(end_time);
        patch.blockchain = Some(blockchain.clone());
        let report = StageReport::new("deploy", 0, json!({ "end_time": end_time }));
        patch.append_reports = vec![report.clone()];
        self.commit(&listing, ListingStatus::Posted, patch, "deploy")
            .await?;

        info!(target = "auction.pipeline", listing_id, %end_time, "auction opened");
        Ok(PhaseResponse {
            listing_id: listing.listing_id,
            message: "Auction launched".into(),
            phase: ListingStatus::AuctionActive.phase(),
            status: ListingStatus::AuctionActive,
            starting_price: listing.starting_price,
            end_time: Some(end_time),
            result: Some(json!({ "blockchain": blockchain })),
            stages: vec![report],
        })
    }

    /// Records a sealed bid and refreshes the distinct-bidder count.
    pub async fn place_bid(
        &self,
        listing_id: &str,
        bidder_id: &str,
        amount: f64,
    ) -> Result<BidResponse, PipelineError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(PipelineError::invalid_input("bid", "Invalid amount"));
        }
        let listing = self
            .store
            .get_listing(listing_id)
            .await
            .map_err(|err| store_error("bid", err))?
            .filter(|listing| listing.status == ListingStatus::AuctionActive)
            .ok_or_else(|| PipelineError::not_found("bid", "Auction not found or closed"))?;
        if listing.end_time.is_some_and(|end| end <= Utc::now()) {
            return Err(PipelineError::conflict("bid", "Auction has ended"));
        }
        let minimum = listing.starting_price.unwrap_or(0.0);
        if amount < minimum {
            return Err(PipelineError::invalid_input(
                "bid",
                format!("Amount must be at least {minimum} €"),
            ));
        }

        let bid = Bid {
            bid_id: Uuid::new_v4().to_string(),
            listing_id: listing_id.to_string(),
            user_id: bidder_id.to_string(),
            amount,
            created_at: Utc::now(),
        };
        self.store
            .insert_bid(bid)
            .await
            .map_err(|err| store_error("bid", err))?;
        let participants = self
            .store
            .distinct_bidders(listing_id)
            .await
            .map_err(|err| store_error("bid", err))?;
        let patch = ListingPatch {
            participants_count: Some(participants),
            ..ListingPatch::default()
        };
        self.store
            .apply_patch(listing_id, PatchGuard::default(), patch)
            .await
            .map_err(|err| store_error("bid", err))?;

        crate::metrics::bid_placed();
        info!(target = "auction.pipeline", listing_id, participants, "sealed bid recorded");
        Ok(BidResponse {
            message: "Sealed bid recorded".into(),
            participants,
        })
    }

    async fn owned_listing(
        &self,
        listing_id: &str,
        seller_id: &str,
        stage: &'static str,
    ) -> Result<Listing, PipelineError> {
        self.store
            .get_listing(listing_id)
            .await
            .map_err(|err| store_error(stage, err))?
            .filter(|listing| listing.seller_id == seller_id)
            .ok_or_else(|| PipelineError::not_found(stage, "Listing not found"))
    }

    async fn commit(
        &self,
        listing: &Listing,
        from: ListingStatus,
        patch: ListingPatch,
        stage: &'static str,
    ) -> Result<(), PipelineError> {
        let guard = PatchGuard::owned_by(&listing.seller_id).at_phase(from.phase());
        let applied = self
            .store
            .apply_patch(&listing.listing_id, guard, patch)
            .await
            .map_err(|err| store_error(stage, err))?;
        if applied {
            Ok(())
        } else {
            Err(PipelineError::conflict(
                stage,
                "Listing moved to another phase while this one was running",
            ))
        }
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

fn expect_phase(
    listing: &Listing,
    expected: ListingStatus,
    stage: &'static str,
) -> Result<(), PipelineError> {
    if listing.pipeline_phase == expected.phase() {
        Ok(())
    } else {
        Err(PipelineError::conflict(
            stage,
            format!(
                "Listing is in phase {} ({}); this step requires phase {} ({})",
                listing.pipeline_phase,
                listing.status.as_str(),
                expected.phase(),
                expected.as_str()
            ),
        ))
    }
}

async fn load_agent_images(listing: &Listing) -> Result<Vec<AgentImage>, PipelineError> {
    let mut images = Vec::with_capacity(listing.images.len());
    for record in &listing.images {
        let bytes = upload::load_image(record)
            .await
            .map_err(|err| PipelineError::internal("analyze", err.to_string()))?;
        images.push(AgentImage {
            filename: record.filename.clone(),
            local_path: record.local_path.clone(),
            bytes: bytes.into(),
        });
    }
    Ok(images)
}

fn agent_error(err: AgentError) -> PipelineError {
    match err {
        AgentError::NoImages | AgentError::Imaging(_) => {
            PipelineError::invalid_input("authenticity", err.to_string())
        }
        AgentError::Duplicate(_) | AgentError::Task(_) => {
            PipelineError::internal("authenticity", err.to_string())
        }
    }
}

fn store_error(stage: &'static str, err: StoreError) -> PipelineError {
    warn!(target = "auction.store", stage, error = %err, "store call failed");
    PipelineError::internal(stage, err.to_string())
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    Internal,
}

impl PipelineError {
    fn with_kind(kind: PipelineErrorKind, stage: &'static str, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(PipelineErrorKind::InvalidInput, stage, message)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(PipelineErrorKind::NotFound, stage, message)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(PipelineErrorKind::Conflict, stage, message)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(PipelineErrorKind::Internal, stage, message)
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::authenticity::agent::ImageForensics;
    use crate::authenticity::ai_detect::AiImageDetector;
    use crate::authenticity::comparative::ComparativeSearcher;
    use crate::authenticity::duplicate::{DEFAULT_THRESHOLD, DuplicateChecker, MemoryIndex};
    use crate::authenticity::reverse_search::ReverseImageSearcher;
    use crate::authenticity::vision::VisionAnalyzer;
    use crate::imaging::tests::{detailed_rgb, encode};
    use crate::llm::json::tests::ScriptedModel;
    use crate::models::{ImageRecord, ListingDetails};
    use crate::store::MemoryStore;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use image::ImageFormat;

    /// Pipeline whose every external dependency is unconfigured or fails,
    /// so each stage takes its fallback path.
    pub(crate) fn offline_pipeline(store: SharedStore) -> Pipeline {
        let model = || Arc::new(ScriptedModel::new(vec![]));
        let agent = AuthenticityAgent::new(
            DuplicateChecker::new(Arc::new(MemoryIndex::default()), DEFAULT_THRESHOLD),
            Arc::new(ImageForensics),
            ReverseImageSearcher::new(&SearchKeys::default()),
            Arc::new(AiImageDetector::new(None)),
            VisionAnalyzer::new(model()),
            ComparativeSearcher::new(SearchKeys::default()).without_public_sources(),
            model(),
        );
        Pipeline::new(
            store,
            agent,
            PriceAdvisor::new(model()),
            PostGenerator::new(model(), model()),
        )
    }

    fn inline_image(listing_id: &str, seed: u8) -> ImageRecord {
        let bytes = encode(&detailed_rgb(64, 64, seed), ImageFormat::Png);
        ImageRecord {
            filename: format!("{listing_id}_0.jpg"),
            original_name: "item.png".into(),
            local_path: format!("uploads/{listing_id}_0.jpg"),
            mime_type: "image/png".into(),
            sha256: String::new(),
            size_bytes: bytes.len() as u64,
            width: 64,
            height: 64,
            inline_data: Some(BASE64.encode(&bytes)),
            external_ref: None,
        }
    }

    async fn seeded(listing_id: &str) -> (Pipeline, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::default());
        let listing = Listing::draft(
            listing_id.into(),
            "seller-1".into(),
            vec![inline_image(listing_id, 0)],
            ListingDetails {
                title: Some("Bronze figure".into()),
                category: Some("sculpture".into()),
                description: Some("Patinated bronze".into()),
            },
        );
        store.insert_listing(listing).await.expect("insert");
        (offline_pipeline(store.clone()), store)
    }

    #[tokio::test]
    async fn phases_advance_in_order() {
        let (pipeline, store) = seeded("l-1").await;

        let analyzed = pipeline.analyze("l-1", "seller-1").await.expect("analyze");
        assert_eq!(analyzed.phase, 2);
        assert_eq!(analyzed.result.as_ref().expect("result")["verdict"], "validated");

        let estimated = pipeline.estimate("l-1", "seller-1").await.expect("estimate");
        assert_eq!(estimated.starting_price, Some(75.0));

        let generated = pipeline.generate("l-1", "seller-1").await.expect("generate");
        assert_eq!(generated.status, ListingStatus::Posted);

        let deployed = pipeline.deploy("l-1", "seller-1").await.expect("deploy");
        assert_eq!(deployed.phase, 5);

        let stored = store.get_listing("l-1").await.expect("get").expect("exists");
        assert_eq!(stored.status, ListingStatus::AuctionActive);
        assert_eq!(stored.title.as_deref(), Some("Auction: Bronze figure"));
        assert_eq!(stored.participants_count, 0);
        assert_eq!(stored.blockchain.auction_address.as_deref(), Some("0xl-1"));
        assert_eq!(stored.blockchain.tx_hash.as_ref().map(String::len), Some(66));
        assert!(stored.end_time.expect("end") > Utc::now() + Duration::days(6));
        let names: Vec<&str> = stored.stage_reports.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["authenticity", "pricing", "post_generation", "deploy"]);
    }

    #[tokio::test]
    async fn out_of_order_and_foreign_calls_are_refused() {
        let (pipeline, _store) = seeded("l-2").await;

        let err = pipeline.estimate("l-2", "seller-1").await.expect_err("too early");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);

        let err = pipeline.analyze("l-2", "seller-2").await.expect_err("not owner");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);

        pipeline.analyze("l-2", "seller-1").await.expect("analyze");
        let err = pipeline.analyze("l-2", "seller-1").await.expect_err("repeat");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
    }

    #[tokio::test]
    async fn rejected_analysis_keeps_phase() {
        let (pipeline, store) = seeded("l-3").await;
        pipeline.analyze("l-3", "seller-1").await.expect("first");

        let copy = Listing::draft(
            "l-4".into(),
            "seller-1".into(),
            vec![inline_image("l-4", 0)],
            ListingDetails::default(),
        );
        store.insert_listing(copy).await.expect("insert");
        let response = pipeline.analyze("l-4", "seller-1").await.expect("analyze");
        assert_eq!(response.phase, 1);
        assert_eq!(response.result.as_ref().expect("result")["verdict"], "duplicate");

        let stored = store.get_listing("l-4").await.expect("get").expect("exists");
        assert_eq!(stored.status, ListingStatus::Uploaded);
        assert!(stored.ai_analysis.is_some());
    }

    #[tokio::test]
    async fn bids_respect_price_and_count_bidders_once() {
        let (pipeline, store) = seeded("l-5").await;
        for step in ["analyze", "estimate", "generate", "deploy"] {
            let result = match step {
                "analyze" => pipeline.analyze("l-5", "seller-1").await,
                "estimate" => pipeline.estimate("l-5", "seller-1").await,
                "generate" => pipeline.generate("l-5", "seller-1").await,
                _ => pipeline.deploy("l-5", "seller-1").await,
            };
            result.expect(step);
        }

        let err = pipeline.place_bid("l-5", "b1", 74.99).await.expect_err("below");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);
        let err = pipeline.place_bid("l-5", "b1", -1.0).await.expect_err("negative");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);

        assert_eq!(pipeline.place_bid("l-5", "b1", 75.0).await.expect("at").participants, 1);
        assert_eq!(pipeline.place_bid("l-5", "b1", 90.0).await.expect("again").participants, 1);
        assert_eq!(pipeline.place_bid("l-5", "b2", 80.0).await.expect("second").participants, 2);
        let stored = store.get_listing("l-5").await.expect("get").expect("exists");
        assert_eq!(stored.participants_count, 2);
    }

    #[tokio::test]
    async fn bids_need_an_open_auction() {
        let (pipeline, store) = seeded("l-6").await;
        let err = pipeline.place_bid("l-6", "b1", 10.0).await.expect_err("not active");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);

        let mut patch = ListingPatch::advance_to(ListingStatus::AuctionActive);
        patch.end_time = Some(Utc::now() - Duration::minutes(1));
        store
            .apply_patch("l-6", PatchGuard::default(), patch)
            .await
            .expect("patch");
        let err = pipeline.place_bid("l-6", "b1", 10.0).await.expect_err("ended");
        assert_eq!(err.kind(), PipelineErrorKind::Conflict);
    }
}
