//! Auction post copywriting.
//!
//! The vision model describes the item from its photo, then the writing
//! model turns that description into a structured post. When the photo path
//! fails the post is written from the listing details alone, and when that
//! fails too a static post is assembled from what the seller typed.

use crate::authenticity::vision::string_list;
use crate::imaging;
use crate::llm::json::extract_or_repair;
use crate::llm::{LlmImage, LlmRequest, SharedModel};
use crate::metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

const SHAPE_HINT: &str = "{title, description, highlights[], estimated_value, condition_summary, \
authenticity_statement, call_to_action, hashtags[]}";

const VISION_DESCRIPTION_PROMPT: &str = r#"You are an expert art and antiques appraiser. Analyze this image and provide a detailed description of the item.

Provide a comprehensive description including:
1. Object Type: What is this item? (e.g., oil painting, pocket watch, sculpture)
2. Visual Details: Colors, textures, patterns, composition
3. Materials: What materials appear to be used?
4. Style/Period: Artistic style, era, or design period if identifiable
5. Condition: Visible wear, damage, or preservation state
6. Craftsmanship: Quality of work, notable techniques
7. Signatures/Marks: Any visible signatures, hallmarks, or stamps
8. Dimensions: Estimated size if possible
9. Notable Features: Anything unique or particularly valuable
10. Overall Assessment: Brief professional opinion on the piece

Be detailed and specific. This description will be used to create an auction listing."#;

const POST_PROMPT: &str = r#"You are an expert auction house copywriter. Generate a compelling auction announcement post based on the item description provided.

You MUST respond in this exact JSON format and nothing else:
{
  "title": "Attention-grabbing title for the auction (max 80 chars)",
  "description": "Engaging 2-3 paragraph description highlighting the item's appeal, history, and uniqueness",
  "highlights": ["Key feature 1", "Key feature 2", "Key feature 3"],
  "estimated_value": "Price range or starting bid suggestion",
  "condition_summary": "Brief condition assessment",
  "authenticity_statement": "Statement about verification/authenticity",
  "call_to_action": "Compelling call to action for bidders",
  "hashtags": ["relevant", "hashtags", "for", "social", "media"]
}

Guidelines:
- Write in a professional yet engaging tone
- Emphasize rarity, craftsmanship, provenance, or historical significance
- Be honest about condition but frame positively
- Create urgency without being pushy
- Use descriptive language that appeals to collectors
- Include relevant auction/collecting hashtags"#;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionPost {
    pub title: String,
    pub description: String,
    pub highlights: Vec<String>,
    pub estimated_value: String,
    pub condition_summary: String,
    pub authenticity_statement: String,
    pub call_to_action: String,
    pub hashtags: Vec<String>,
    pub full_post: String,
    pub engine_used: String,
}

impl AuctionPost {
    pub fn from_fields(fields: &Map<String, Value>, engine: &str) -> Self {
        let text = |key: &str, default: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let mut post = Self {
            title: text("title", "Auction Item"),
            description: text("description", ""),
            highlights: string_list(fields.get("highlights")),
            estimated_value: text("estimated_value", "Contact for estimate"),
            condition_summary: text("condition_summary", "See description"),
            authenticity_statement: text("authenticity_statement", ""),
            call_to_action: text("call_to_action", "Place your bid now!"),
            hashtags: string_list(fields.get("hashtags")),
            full_post: String::new(),
            engine_used: engine.to_string(),
        };
        post.full_post = full_post(&post);
        post
    }

    /// Built without any model from what the seller provided.
    pub fn fallback(input: &PostInput) -> Self {
        let title = input.title.as_deref().unwrap_or("Auction Item");
        let description = input.description.clone().unwrap_or_default();
        let mut hashtags = vec!["auction".to_string()];
        if let Some(category) = input.category.as_deref().filter(|c| !c.trim().is_empty()) {
            hashtags.push(category.to_lowercase().replace(' ', ""));
        }
        Self {
            title: format!("Auction: {title}"),
            full_post: format!("🔨 Auction: {title}\n\n{description}"),
            description,
            highlights: Vec::new(),
            estimated_value: starting_at(input.starting_price),
            condition_summary: "See description".into(),
            authenticity_statement: String::new(),
            call_to_action: "Place your bid now!".into(),
            hashtags,
            engine_used: "none".into(),
        }
    }
}

/// Human-readable post assembled from the structured fields.
pub fn full_post(post: &AuctionPost) -> String {
    let mut lines = vec![format!("🔨 {}", post.title), String::new()];
    lines.push(post.description.clone());
    lines.push(String::new());

    if !post.highlights.is_empty() {
        lines.push("✨ HIGHLIGHTS:".into());
        lines.extend(post.highlights.iter().map(|h| format!("  • {h}")));
        lines.push(String::new());
    }

    if !post.estimated_value.is_empty() {
        lines.push(format!("💰 Estimated Value: {}", post.estimated_value));
    }
    if !post.condition_summary.is_empty() {
        lines.push(format!("📋 Condition: {}", post.condition_summary));
    }
    lines.push(String::new());

    if !post.authenticity_statement.is_empty() {
        lines.push(format!("✅ {}", post.authenticity_statement));
        lines.push(String::new());
    }
    if !post.call_to_action.is_empty() {
        lines.push(format!("👉 {}", post.call_to_action));
        lines.push(String::new());
    }
    if !post.hashtags.is_empty() {
        lines.push(
            post.hashtags
                .iter()
                .map(|tag| format!("#{}", tag.trim_start_matches('#')))
                .collect::<Vec<_>>()
                .join(" "),
        );
    }
    lines.join("\n").trim_end().to_string()
}

fn starting_at(price: Option<f64>) -> String {
    match price {
        Some(price) => format!("Starting at {}", format_euros(price)),
        None => "Contact for estimate".into(),
    }
}

/// `1234.5` -> `€1,234.50`.
pub fn format_euros(amount: f64) -> String {
    let fixed = format!("{:.2}", amount.abs());
    let (whole, cents) = fixed.split_once('.').unwrap_or((&fixed, "00"));
    let mut grouped = String::new();
    for (i, digit) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    let sign = if amount < 0.0 { "-" } else { "" };
    format!("{sign}€{grouped}.{cents}")
}

#[derive(Debug, Clone, Default)]
pub struct PostInput {
    pub title: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub starting_price: Option<f64>,
    /// Primary listing photo.
    pub image: Option<Vec<u8>>,
    /// Stored authenticity analysis of the listing.
    pub validation: Option<Value>,
}

#[derive(Clone)]
pub struct PostGenerator {
    vision: SharedModel,
    writer: SharedModel,
}

impl PostGenerator {
    pub fn new(vision: SharedModel, writer: SharedModel) -> Self {
        Self { vision, writer }
    }

    pub async fn generate(&self, input: &PostInput) -> AuctionPost {
        if let Some(image) = &input.image {
            match self.describe_image(image.clone(), input).await {
                Some(description) => {
                    let context = combined_context(&description, input);
                    if let Some(post) = self.write(&context, input, "vision+gemini").await {
                        return post;
                    }
                }
                None => warn!(target = "auction.post", "vision_description_unavailable"),
            }
        }

        if let Some(post) = self.write(&details_context(input), input, "gemini").await {
            return post;
        }

        warn!(target = "auction.post", "post_generation_using_static_fallback");
        AuctionPost::fallback(input)
    }

    async fn describe_image(&self, image: Vec<u8>, input: &PostInput) -> Option<String> {
        let thumbnail =
            tokio::task::spawn_blocking(move || imaging::thumbnail_jpeg(&image, 1024, 90))
                .await
                .ok()?
                .ok()?;
        let prompt = format!(
            "{VISION_DESCRIPTION_PROMPT}\n\nAdditional context from seller:\n{}",
            seller_lines(input)
        );
        let request = LlmRequest::text(prompt)
            .with_image(LlmImage::jpeg(thumbnail))
            .with_temperature(0.5)
            .with_max_tokens(2000);
        match self.vision.generate(&request).await {
            Ok(text) if !text.trim().is_empty() => {
                metrics::external_call("post_vision", true);
                Some(text)
            }
            Ok(_) => None,
            Err(err) => {
                warn!(target = "auction.post", error = %err, "vision_description_failed");
                metrics::external_call("post_vision", false);
                None
            }
        }
    }

    async fn write(&self, context: &str, input: &PostInput, engine: &str) -> Option<AuctionPost> {
        let mut prompt = format!("{POST_PROMPT}\n\n{context}");
        if let Some(category) = &input.category {
            prompt.push_str(&format!("\nCategory: {category}"));
        }
        if let Some(price) = input.starting_price {
            prompt.push_str(&format!("\nStarting Bid: {}", format_euros(price)));
        }

        let raw = match self.writer.generate(&LlmRequest::text(prompt)).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target = "auction.post", engine, error = %err, "post_writer_failed");
                metrics::external_call("post_writer", false);
                return None;
            }
        };
        metrics::external_call("post_writer", true);

        match extract_or_repair(self.writer.as_ref(), &raw, SHAPE_HINT).await {
            Ok(fields) => {
                let post = AuctionPost::from_fields(&fields, engine);
                info!(target = "auction.post", engine, title = %post.title, "post_generated");
                Some(post)
            }
            Err(err) => {
                warn!(target = "auction.post", engine, error = %err, "post_json_unusable");
                None
            }
        }
    }
}

fn seller_lines(input: &PostInput) -> String {
    format!(
        "Item Name: {}\nCategory: {}\nSeller Description: {}",
        input.title.as_deref().unwrap_or("Auction Item"),
        input.category.as_deref().unwrap_or("Unspecified"),
        input.description.as_deref().unwrap_or(""),
    )
}

fn combined_context(vision_description: &str, input: &PostInput) -> String {
    let mut context = format!(
        "=== VISION ANALYSIS (AI Visual Inspection) ===\n{vision_description}\n\n=== SELLER PROVIDED INFORMATION ===\n{}\n",
        seller_lines(input)
    );
    if let Some(validation) = &input.validation {
        if let Some(report) = validation
            .pointer("/details/vision_analysis/full_report")
            .and_then(Value::as_str)
        {
            let excerpt: String = report.chars().take(300).collect();
            context.push_str(&format!("\n=== EXPERT ASSESSMENT ===\n{excerpt}"));
        }
        if validation.get("authenticity_reasoning").is_some() {
            context.push_str("\n\nAuthenticity Verified: Item has passed multi-stage validation.");
        }
    }
    context
}

fn details_context(input: &PostInput) -> String {
    let mut parts = vec![seller_lines(input)];
    if let Some(validation) = &input.validation {
        if let Some(vision) = validation.pointer("/details/vision_analysis") {
            let field = |key: &str| {
                vision
                    .get(key)
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .unwrap_or_else(|| "N/A".into())
            };
            parts.push(format!(
                "\nVision Analysis:\n  Object Type: {}\n  Estimated Period: {}\n  Authenticity Score: {}",
                field("object_type"),
                field("estimated_period"),
                field("authenticity_score"),
            ));
        }
        if let Some(reasoning) = validation
            .get("authenticity_reasoning")
            .and_then(Value::as_str)
        {
            let excerpt: String = reasoning.chars().take(500).collect();
            parts.push(format!("\nAuthenticity Assessment:\n{excerpt}"));
        }
    }
    parts.join("\n")
}
