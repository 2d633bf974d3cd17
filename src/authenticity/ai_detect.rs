use super::round_to;
use crate::config::env_string;
use crate::http::build_client_with_timeout;
use crate::metrics;
use async_trait::async_trait;
use futures_util::future::join;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub const GENERAL_MODEL: &str = "umm-maybe/AI-image-detector";
pub const SDXL_MODEL: &str = "Organika/sdxl-detector";

const AI_LABELS: [&str; 5] = ["artificial", "fake", "ai", "generated", "1"];
const REAL_LABELS: [&str; 4] = ["human", "real", "authentic", "0"];
const SUSPICIOUS_THRESHOLD: f64 = 0.45;
const AI_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AiVerdict {
    Real,
    Suspicious,
    AiGenerated,
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDetectionReport {
    pub model: String,
    pub is_ai_generated: bool,
    pub ai_probability: f64,
    pub real_probability: f64,
    pub verdict: AiVerdict,
    pub suspicion_score: f64,
    pub notes: String,
}

impl AiDetectionReport {
    fn unavailable(model: &str, reason: &str) -> Self {
        Self {
            model: model.to_string(),
            is_ai_generated: false,
            ai_probability: 0.0,
            real_probability: 0.0,
            verdict: AiVerdict::Unavailable,
            suspicion_score: 0.0,
            notes: reason.to_string(),
        }
    }

    pub fn from_labels(model: &str, labels: &[(String, f64)]) -> Self {
        let (ai, real) = split_probabilities(labels);
        let (verdict, notes) = if ai >= AI_THRESHOLD {
            (
                AiVerdict::AiGenerated,
                format!(
                    "Model is {:.1}% confident this image is AI-generated. Likely produced by Stable Diffusion, DALL-E, or similar.",
                    ai * 100.0
                ),
            )
        } else if ai >= SUSPICIOUS_THRESHOLD {
            (
                AiVerdict::Suspicious,
                format!(
                    "Image shows some AI-generation signatures ({:.1}% confidence). Recommend additional manual review or EXIF/ELA cross-check.",
                    ai * 100.0
                ),
            )
        } else {
            (
                AiVerdict::Real,
                format!(
                    "Image appears authentic ({:.1}% confidence). No strong AI-generation artifacts detected.",
                    real * 100.0
                ),
            )
        };
        Self {
            model: model.to_string(),
            is_ai_generated: verdict == AiVerdict::AiGenerated,
            ai_probability: round_to(ai, 6),
            real_probability: round_to(real, 6),
            verdict,
            suspicion_score: round_to(ai, 6),
            notes,
        }
    }
}

/// Both classifier opinions for one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiDetectionPair {
    pub general: AiDetectionReport,
    pub sdxl: AiDetectionReport,
}

impl AiDetectionPair {
    pub fn max_suspicion(&self) -> f64 {
        self.general.suspicion_score.max(self.sdxl.suspicion_score)
    }
}

/// `(ai, real)` probabilities from classifier labels. Unrecognised two-label
/// outputs are read in class-index order (`LABEL_0` real, `LABEL_1` ai), not
/// in the score order the inference API returns them in.
pub fn split_probabilities(labels: &[(String, f64)]) -> (f64, f64) {
    let mut ai = 0.0;
    let mut real = 0.0;
    for (label, score) in labels {
        let label = label.to_lowercase();
        if AI_LABELS.contains(&label.as_str()) {
            ai = *score;
        } else if REAL_LABELS.contains(&label.as_str()) {
            real = *score;
        }
    }
    if ai == 0.0 && real == 0.0 && labels.len() == 2 {
        let mut ordered: Vec<&(String, f64)> = labels.iter().collect();
        ordered.sort_by_key(|(label, _)| class_order(label));
        real = ordered[0].1;
        ai = ordered[1].1;
    }
    (ai, real)
}

fn class_order(label: &str) -> (u32, String) {
    let label = label.to_lowercase();
    let index = label
        .rsplit(['_', '-', ' '])
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(u32::MAX);
    (index, label)
}

/// Source of the two classifier opinions the AI gate is decided on.
#[async_trait]
pub trait AiDetector: Send + Sync {
    async fn detect_both(&self, bytes: Arc<[u8]>) -> AiDetectionPair;
}

pub type SharedDetector = Arc<dyn AiDetector>;

/// Hugging Face Inference API client for image classification models.
#[derive(Clone)]
pub struct AiImageDetector {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl AiImageDetector {
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: build_client_with_timeout(60),
            base_url: env_string("HF_INFERENCE_URL")
                .unwrap_or_else(|| "https://api-inference.huggingface.co/models".into()),
            token,
        }
    }

    pub fn from_env() -> Self {
        Self::new(env_string("HF_API_TOKEN"))
    }

    pub async fn classify(&self, model: &str, bytes: Arc<[u8]>) -> AiDetectionReport {
        let Some(token) = &self.token else {
            return AiDetectionReport::unavailable(model, "HF_API_TOKEN not configured.");
        };

        let response = self
            .http
            .post(format!("{}/{}", self.base_url.trim_end_matches('/'), model))
            .bearer_auth(token)
            .header("Content-Type", "application/octet-stream")
            .body(bytes.to_vec())
            .send()
            .await;

        let payload = match response {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.ok(),
            Ok(resp) => {
                warn!(target = "auction.authenticity", model, status = %resp.status(), "ai_detector_http_error");
                None
            }
            Err(err) => {
                warn!(target = "auction.authenticity", model, error = %err, "ai_detector_request_failed");
                None
            }
        };
        metrics::external_call("huggingface", payload.is_some());

        match payload.map(|value| parse_labels(&value)) {
            Some(labels) if !labels.is_empty() => AiDetectionReport::from_labels(model, &labels),
            _ => AiDetectionReport::unavailable(model, "Classifier returned no usable labels."),
        }
    }
}

#[async_trait]
impl AiDetector for AiImageDetector {
    async fn detect_both(&self, bytes: Arc<[u8]>) -> AiDetectionPair {
        let (general, sdxl) = join(
            self.classify(GENERAL_MODEL, bytes.clone()),
            self.classify(SDXL_MODEL, bytes),
        )
        .await;
        info!(
            target = "auction.authenticity",
            general = general.suspicion_score,
            sdxl = sdxl.suspicion_score,
            "ai_detection_complete"
        );
        AiDetectionPair { general, sdxl }
    }
}

/// Accepts both `[{label, score}]` and the batched `[[{label, score}]]`.
fn parse_labels(value: &Value) -> Vec<(String, f64)> {
    let list = match value.as_array() {
        Some(outer) if outer.first().is_some_and(Value::is_array) => {
            outer[0].as_array().cloned().unwrap_or_default()
        }
        Some(outer) => outer.clone(),
        None => return Vec::new(),
    };
    list.iter()
        .filter_map(|item| {
            Some((
                item.get("label")?.as_str()?.to_string(),
                item.get("score")?.as_f64()?,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, f64)]) -> Vec<(String, f64)> {
        pairs.iter().map(|(l, s)| (l.to_string(), *s)).collect()
    }

    #[test]
    fn named_labels_are_recognised() {
        assert_eq!(
            split_probabilities(&labels(&[("artificial", 0.8), ("human", 0.2)])),
            (0.8, 0.2)
        );
        assert_eq!(
            split_probabilities(&labels(&[("REAL", 0.9), ("FAKE", 0.1)])),
            (0.1, 0.9)
        );
    }

    #[test]
    fn unknown_pair_falls_back_to_position() {
        assert_eq!(
            split_probabilities(&labels(&[("LABEL_0", 0.3), ("LABEL_1", 0.7)])),
            (0.7, 0.3)
        );
    }

    #[test]
    fn score_sorted_labels_keep_class_order() {
        assert_eq!(
            split_probabilities(&labels(&[("LABEL_1", 0.8), ("LABEL_0", 0.2)])),
            (0.8, 0.2)
        );
        let report =
            AiDetectionReport::from_labels("m", &labels(&[("LABEL_1", 0.8), ("LABEL_0", 0.2)]));
        assert_eq!(report.verdict, AiVerdict::AiGenerated);
    }

    #[test]
    fn verdict_tiers() {
        let high = AiDetectionReport::from_labels("m", &labels(&[("fake", 0.9), ("real", 0.1)]));
        assert_eq!(high.verdict, AiVerdict::AiGenerated);
        assert!(high.is_ai_generated);
        let mid = AiDetectionReport::from_labels("m", &labels(&[("fake", 0.5), ("real", 0.5)]));
        assert_eq!(mid.verdict, AiVerdict::Suspicious);
        let low = AiDetectionReport::from_labels("m", &labels(&[("fake", 0.1), ("real", 0.9)]));
        assert_eq!(low.verdict, AiVerdict::Real);
        assert_eq!(low.suspicion_score, 0.1);
    }

    #[test]
    fn batched_payload_is_flattened() {
        let value = json!([[{"label": "artificial", "score": 0.6}, {"label": "human", "score": 0.4}]]);
        assert_eq!(parse_labels(&value).len(), 2);
        assert!(parse_labels(&json!({"error": "loading"})).is_empty());
    }

    #[tokio::test]
    async fn missing_token_is_unavailable() {
        let detector = AiImageDetector::new(None);
        let pair = detector.detect_both(Arc::from(&b"img"[..])).await;
        assert_eq!(pair.general.verdict, AiVerdict::Unavailable);
        assert_eq!(pair.max_suspicion(), 0.0);
    }
}
