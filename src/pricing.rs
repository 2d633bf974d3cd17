use crate::llm::json::extract_or_repair;
use crate::llm::{LlmImage, LlmRequest, SharedModel};
use crate::metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

const MAX_IMAGES: usize = 3;
const MISSING_FIELD_PRICE: f64 = 100.0;
const SHAPE_HINT: &str = "{low, median, high, starting_price, reasoning}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceRecommendation {
    pub low: f64,
    pub median: f64,
    pub high: f64,
    pub starting_price: f64,
    pub reasoning: String,
    pub engine_used: String,
}

impl PriceRecommendation {
    pub fn fallback(reason: &str) -> Self {
        Self {
            low: 50.0,
            median: 100.0,
            high: 200.0,
            starting_price: 75.0,
            reasoning: reason.to_string(),
            engine_used: "fallback".into(),
        }
    }

    /// Numeric fields accept numbers or numeric strings; anything else
    /// becomes 100.
    pub fn from_fields(fields: &Map<String, Value>, engine: &str) -> Self {
        let price = |key: &str| {
            fields
                .get(key)
                .and_then(|value| match value {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse::<f64>().ok(),
                    _ => None,
                })
                .filter(|value| value.is_finite())
                .unwrap_or(MISSING_FIELD_PRICE)
        };
        Self {
            low: price("low"),
            median: price("median"),
            high: price("high"),
            starting_price: price("starting_price"),
            reasoning: fields
                .get("reasoning")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            engine_used: engine.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PriceInput {
    pub title: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub images: Vec<Vec<u8>>,
}

#[derive(Clone)]
pub struct PriceAdvisor {
    model: SharedModel,
}

impl PriceAdvisor {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }

    pub async fn recommend(&self, input: &PriceInput) -> PriceRecommendation {
        let mut request = LlmRequest::text(price_prompt(input)).with_temperature(0.2);
        for image in input.images.iter().take(MAX_IMAGES) {
            request = request.with_image(LlmImage::jpeg(image.clone()));
        }

        let raw = match self.model.generate(&request).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target = "auction.pricing", error = %err, "price_model_failed");
                metrics::external_call("pricing", false);
                return PriceRecommendation::fallback(
                    "Pricing model unavailable. Default values applied.",
                );
            }
        };
        metrics::external_call("pricing", true);

        match extract_or_repair(self.model.as_ref(), &raw, SHAPE_HINT).await {
            Ok(fields) => {
                let recommendation = PriceRecommendation::from_fields(&fields, self.model.name());
                if !(recommendation.starting_price.is_finite() && recommendation.starting_price > 0.0) {
                    warn!(
                        target = "auction.pricing",
                        starting_price = recommendation.starting_price,
                        "price_starting_price_unusable"
                    );
                    return PriceRecommendation::fallback(
                        "Pricing model proposed an unusable starting price. Default values applied.",
                    );
                }
                info!(
                    target = "auction.pricing",
                    median = recommendation.median,
                    starting_price = recommendation.starting_price,
                    "price_recommended"
                );
                recommendation
            }
            Err(err) => {
                warn!(target = "auction.pricing", error = %err, "price_json_unusable");
                PriceRecommendation::fallback(
                    "Could not parse the pricing model response. Default values applied.",
                )
            }
        }
    }
}

fn price_prompt(input: &PriceInput) -> String {
    let images = input.images.len().min(MAX_IMAGES);
    let image_instruction = if images > 0 {
        format!("See the {images} attached product image(s) and use them in the estimate.")
    } else {
        "No image provided. Base the estimate on the title, category and description only."
            .to_string()
    };
    format!(
        r#"You are a pricing expert for a sealed-bid auction platform (art, antiques, collectibles).

Recommend a price range in euros for the product described and pictured below.

=== PRODUCT ===
Title: {title}
Category: {category}
Description: {description}

=== IMAGES ===
{image_instruction}

=== INSTRUCTIONS ===
1. Analyse the title, category and description.
2. Inspect the image(s) closely: quality, visible materials, condition, rarity, distinguishing marks.
3. Recommend a realistic price range in euros for the European market.
4. Reply ONLY with a valid JSON object, with no text before or after:

{{
  "low": <minimum price in euros (number)>,
  "median": <suggested median price in euros (number)>,
  "high": <maximum price in euros (number)>,
  "starting_price": <suggested auction starting price, between low and median>,
  "reasoning": "<short 1-3 sentence justification>"
}}

Example:
{{"low": 80, "median": 120, "high": 180, "starting_price": 90, "reasoning": "Common item, active market, fair condition visible in the image."}}"#,
        title = input.title.as_deref().unwrap_or("Not specified"),
        category = input.category.as_deref().unwrap_or("Not specified"),
        description = input.description.as_deref().unwrap_or("No description."),
    )
}
