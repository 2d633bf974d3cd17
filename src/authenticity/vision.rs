use super::round_to;
use crate::imaging;
use crate::llm::json::extract_or_repair;
use crate::llm::{LlmImage, LlmRequest, SharedModel};
use crate::metrics;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

const FAKE_THRESHOLD: f64 = 0.25;
const SUSPICIOUS_CEILING: f64 = 0.75;

const VISION_PROMPT: &str = r#"You are an expert authenticator and appraiser for auction items.
Analyze this image and provide a structured assessment.

You MUST respond in this exact JSON format and nothing else:
{
  "object_type": "specific object name",
  "estimated_period": "decade or era (e.g. 1920s-1940s)",
  "style": "artistic or design style",
  "materials": ["material1", "material2"],
  "wear_assessment": "natural | artificial | minimal | unknown",
  "wear_notes": "explanation of wear patterns observed",
  "signatures_detected": ["description of any signatures, hallmarks, poincons, stamps"],
  "suspicious_zones": ["description of zone 1", "description of zone 2"],
  "authenticity_score": 0.85,
  "authenticity_reasoning": "detailed reasoning for the score",
  "red_flags": ["flag1", "flag2"]
}

Guidelines:
- wear_assessment: 'natural' means consistent aging patterns, 'artificial' means fake aging signs
- authenticity_score: 0.0 = certainly fake, 1.0 = certainly authentic
- suspicious_zones: describe specific areas that look wrong (e.g. "bottom-left corner shows inconsistent patina")
- Be specific about materials, proportions, and construction details visible
- Flag any signs of reproduction, modern materials in old items, or inconsistent aging"#;

const SHAPE_HINT: &str = "{object_type, estimated_period, style, materials[], wear_assessment, \
signatures_detected[], suspicious_zones[], authenticity_score, authenticity_reasoning, red_flags[]}";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VisionVerdict {
    Authentic,
    Suspicious,
    LikelyFake,
}

impl VisionVerdict {
    pub fn from_score(authenticity: f64) -> Self {
        if authenticity <= FAKE_THRESHOLD {
            VisionVerdict::LikelyFake
        } else if authenticity <= SUSPICIOUS_CEILING {
            VisionVerdict::Suspicious
        } else {
            VisionVerdict::Authentic
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionReport {
    pub object_type: String,
    pub estimated_period: String,
    pub style: String,
    pub materials: Vec<String>,
    pub wear_assessment: String,
    pub signatures_detected: Vec<String>,
    pub suspicious_zones: Vec<String>,
    pub red_flags: Vec<String>,
    pub authenticity_score: f64,
    pub suspicion_score: f64,
    pub verdict: VisionVerdict,
    pub full_report: String,
    pub engine_used: String,
}

impl VisionReport {
    pub fn unavailable() -> Self {
        Self {
            object_type: "unknown".into(),
            estimated_period: "unknown".into(),
            style: "unknown".into(),
            materials: Vec::new(),
            wear_assessment: "unknown".into(),
            signatures_detected: Vec::new(),
            suspicious_zones: Vec::new(),
            red_flags: Vec::new(),
            authenticity_score: 0.5,
            suspicion_score: 0.5,
            verdict: VisionVerdict::Suspicious,
            full_report: "Vision analysis unavailable.".into(),
            engine_used: "none".into(),
        }
    }

    pub fn from_fields(fields: &Map<String, Value>, engine: &str, raw: &str) -> Self {
        let text = |key: &str| {
            fields
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        };
        let score = fields
            .get("authenticity_score")
            .and_then(|v| v.as_f64().or_else(|| v.as_str()?.trim().parse().ok()))
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);

        Self {
            object_type: text("object_type"),
            estimated_period: text("estimated_period"),
            style: text("style"),
            materials: string_list(fields.get("materials")),
            wear_assessment: text("wear_assessment"),
            signatures_detected: string_list(fields.get("signatures_detected")),
            suspicious_zones: string_list(fields.get("suspicious_zones")),
            red_flags: string_list(fields.get("red_flags")),
            authenticity_score: round_to(score, 4),
            suspicion_score: round_to(1.0 - score, 4),
            verdict: VisionVerdict::from_score(score),
            full_report: fields
                .get("authenticity_reasoning")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| raw.chars().take(500).collect()),
            engine_used: engine.to_string(),
        }
    }
}

pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

#[derive(Clone)]
pub struct VisionAnalyzer {
    model: SharedModel,
}

impl VisionAnalyzer {
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }

    pub async fn analyze(&self, bytes: Arc<[u8]>) -> VisionReport {
        let thumbnail =
            match tokio::task::spawn_blocking(move || imaging::thumbnail_jpeg(&bytes, 1024, 90))
                .await
            {
                Ok(Ok(jpeg)) => jpeg,
                _ => {
                    warn!(target = "auction.authenticity", "vision_thumbnail_failed");
                    return VisionReport::unavailable();
                }
            };

        let request = LlmRequest::text(VISION_PROMPT)
            .with_image(LlmImage::jpeg(thumbnail))
            .with_temperature(0.1)
            .with_max_tokens(2000);

        let raw = match self.model.generate(&request).await {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target = "auction.authenticity", error = %err, "vision_call_failed");
                metrics::external_call("vision", false);
                return VisionReport::unavailable();
            }
        };
        metrics::external_call("vision", true);

        match extract_or_repair(self.model.as_ref(), &raw, SHAPE_HINT).await {
            Ok(fields) => {
                let report = VisionReport::from_fields(&fields, self.model.name(), &raw);
                info!(
                    target = "auction.authenticity",
                    verdict = ?report.verdict,
                    score = report.authenticity_score,
                    "vision_analysis_complete"
                );
                report
            }
            Err(err) => {
                warn!(target = "auction.authenticity", error = %err, "vision_json_unusable");
                VisionReport::unavailable()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::tests::{detailed_rgb, encode};
    use crate::llm::LlmError;
    use crate::llm::json::tests::ScriptedModel;
    use image::ImageFormat;
    use serde_json::json;

    fn image() -> Arc<[u8]> {
        encode(&detailed_rgb(32, 32, 1), ImageFormat::Png).into()
    }

    #[test]
    fn verdict_tiers_follow_authenticity() {
        assert_eq!(VisionVerdict::from_score(0.2), VisionVerdict::LikelyFake);
        assert_eq!(VisionVerdict::from_score(0.25), VisionVerdict::LikelyFake);
        assert_eq!(VisionVerdict::from_score(0.6), VisionVerdict::Suspicious);
        assert_eq!(VisionVerdict::from_score(0.75), VisionVerdict::Suspicious);
        assert_eq!(VisionVerdict::from_score(0.9), VisionVerdict::Authentic);
    }

    #[test]
    fn fields_are_coerced() {
        let fields = json!({
            "object_type": "pocket watch",
            "materials": ["silver", 925],
            "authenticity_score": "0.8",
            "red_flags": "none visible"
        });
        let report = VisionReport::from_fields(fields.as_object().expect("obj"), "test", "raw");
        assert_eq!(report.object_type, "pocket watch");
        assert_eq!(report.materials, vec!["silver".to_string(), "925".to_string()]);
        assert_eq!(report.suspicion_score, 0.2);
        assert_eq!(report.verdict, VisionVerdict::Authentic);
        assert_eq!(report.red_flags.len(), 1);
        assert_eq!(report.style, "unknown");
        assert_eq!(report.full_report, "raw");
    }

    #[tokio::test]
    async fn model_failure_falls_back() {
        let model = Arc::new(ScriptedModel::new(vec![Err(LlmError::MissingKey("openrouter"))]));
        let report = VisionAnalyzer::new(model).analyze(image()).await;
        assert_eq!(report.full_report, "Vision analysis unavailable.");
        assert_eq!(report.authenticity_score, 0.5);
        assert_eq!(report.verdict, VisionVerdict::Suspicious);
    }

    #[tokio::test]
    async fn structured_reply_is_parsed() {
        let reply = "```json\n{\"object_type\": \"vase\", \"authenticity_score\": 0.1, \"authenticity_reasoning\": \"modern glaze\"}\n```";
        let model = Arc::new(ScriptedModel::new(vec![Ok(reply.into())]));
        let report = VisionAnalyzer::new(model).analyze(image()).await;
        assert_eq!(report.verdict, VisionVerdict::LikelyFake);
        assert_eq!(report.full_report, "modern glaze");
        assert_eq!(report.engine_used, "scripted");
    }
}
