//! Orchestrating authenticity agent.
//!
//! A fixed sequence of checks with three early exits:
//!
//! 1. perceptual duplicate of another listing's image -> `Duplicate`
//! 2. ELA / EXIF / reverse search look doctored and the reasoning model
//!    agrees -> `Manipulated`
//! 3. both AI-image classifiers are confident and the model agrees ->
//!    `AiGenerated`
//!
//! Everything that survives gets vision analysis, comparative search and a
//! final written assessment, and comes out `Validated`.

use super::ai_detect::{AiDetectionPair, AiImageDetector, SharedDetector};
use super::comparative::{ComparativeQuery, ComparativeReport, ComparativeSearcher, is_artwork};
use super::duplicate::{DuplicateChecker, DuplicateError, DuplicateReport};
use super::ela::{self, ElaReport, ElaVerdict};
use super::exif::{self, ExifReport};
use super::reverse_search::{ReverseImageSearcher, ReverseSearchReport};
use super::vision::{VisionAnalyzer, VisionReport};
use crate::config::SearchKeys;
use crate::imaging::ImagingError;
use crate::llm::{LlmRequest, Models, SharedModel};
use crate::metrics;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

const AI_GATE_THRESHOLD: f64 = 0.7;
const QUERY_REPORT_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("listing has no images")]
    NoImages,
    #[error(transparent)]
    Duplicate(#[from] DuplicateError),
    #[error(transparent)]
    Imaging(#[from] ImagingError),
    #[error("analysis task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct AgentImage {
    pub filename: String,
    pub local_path: String,
    pub bytes: Arc<[u8]>,
}

#[derive(Debug, Clone, Default)]
pub struct ItemContext {
    pub listing_id: String,
    pub category: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Proceed,
    Stop,
}

/// Whether a gate can be passed on heuristics alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    AskModel,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct GateRecord {
    pub gate: &'static str,
    pub consulted_model: bool,
    pub decision: Decision,
    pub reply: Option<String>,
}

/// Everything the agent looked at, in the order it looked.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize)]
pub struct Evidence {
    pub duplicates: Vec<DuplicateReport>,
    pub ela: Option<ElaReport>,
    pub exif: Option<ExifReport>,
    pub reverse_search: Option<ReverseSearchReport>,
    pub ai_detection: Option<AiDetectionPair>,
    pub vision_analysis: Option<VisionReport>,
    pub comparative_search: Option<ComparativeReport>,
    pub is_artwork: Option<bool>,
    pub gates: Vec<GateRecord>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum AuthenticityVerdict {
    Duplicate {
        details: Evidence,
    },
    Manipulated {
        details: Evidence,
    },
    AiGenerated {
        details: Evidence,
    },
    Validated {
        authenticity_reasoning: String,
        details: Evidence,
    },
}

impl AuthenticityVerdict {
    pub fn is_validated(&self) -> bool {
        matches!(self, AuthenticityVerdict::Validated { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthenticityVerdict::Duplicate { .. } => "duplicate",
            AuthenticityVerdict::Manipulated { .. } => "manipulated",
            AuthenticityVerdict::AiGenerated { .. } => "ai_generated",
            AuthenticityVerdict::Validated { .. } => "validated",
        }
    }

    pub fn details(&self) -> &Evidence {
        match self {
            AuthenticityVerdict::Duplicate { details }
            | AuthenticityVerdict::Manipulated { details }
            | AuthenticityVerdict::AiGenerated { details }
            | AuthenticityVerdict::Validated { details, .. } => details,
        }
    }
}

/// Local forensics on the primary image: error level analysis and EXIF.
pub trait Forensics: Send + Sync {
    fn inspect(&self, bytes: &[u8], path: &str) -> Result<(ElaReport, ExifReport), ImagingError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageForensics;

impl Forensics for ImageForensics {
    fn inspect(&self, bytes: &[u8], path: &str) -> Result<(ElaReport, ExifReport), ImagingError> {
        let ela = ela::analyze(bytes)?;
        Ok((ela, exif::analyze(bytes, path)))
    }
}

pub fn technical_gate(ela: &ElaReport, reverse: &ReverseSearchReport) -> Gate {
    let clean = ela.verdict == ElaVerdict::Clean;
    if clean && ela.suspicion_score < 0.4 {
        return Gate::Proceed;
    }
    if clean && ela.suspicion_score < 0.5 && reverse.suspicion_score < 0.8 {
        return Gate::Proceed;
    }
    Gate::AskModel
}

pub fn ai_gate(pair: &AiDetectionPair) -> Gate {
    if pair.general.suspicion_score < AI_GATE_THRESHOLD
        && pair.sdxl.suspicion_score < AI_GATE_THRESHOLD
    {
        Gate::Proceed
    } else {
        Gate::AskModel
    }
}

/// A reply stops the pipeline only when it says "stop" and never "proceed".
pub fn parse_decision(reply: &str) -> Decision {
    let lower = reply.to_lowercase();
    if lower.contains("stop") && !lower.contains("proceed") {
        Decision::Stop
    } else {
        Decision::Proceed
    }
}

#[derive(Clone)]
pub struct AuthenticityAgent {
    duplicates: DuplicateChecker,
    forensics: Arc<dyn Forensics>,
    reverse: ReverseImageSearcher,
    detector: SharedDetector,
    vision: VisionAnalyzer,
    comparative: ComparativeSearcher,
    reasoning: SharedModel,
}

impl AuthenticityAgent {
    pub fn new(
        duplicates: DuplicateChecker,
        forensics: Arc<dyn Forensics>,
        reverse: ReverseImageSearcher,
        detector: SharedDetector,
        vision: VisionAnalyzer,
        comparative: ComparativeSearcher,
        reasoning: SharedModel,
    ) -> Self {
        Self {
            duplicates,
            forensics,
            reverse,
            detector,
            vision,
            comparative,
            reasoning,
        }
    }

    pub fn from_env(models: &Models, keys: &SearchKeys) -> Self {
        Self::new(
            DuplicateChecker::from_env(),
            Arc::new(ImageForensics),
            ReverseImageSearcher::new(keys),
            Arc::new(AiImageDetector::from_env()),
            VisionAnalyzer::new(models.vision.clone()),
            ComparativeSearcher::new(keys.clone()),
            models.reasoning.clone(),
        )
    }

    /// Every image goes through the duplicate check; the remaining stages
    /// look at the primary (first) image.
    pub async fn run(
        &self,
        item: &ItemContext,
        images: &[AgentImage],
    ) -> Result<AuthenticityVerdict, AgentError> {
        let primary = images.first().ok_or(AgentError::NoImages)?;
        let mut evidence = Evidence::default();

        let started = Instant::now();
        for image in images {
            let report = self
                .duplicates
                .check_and_insert(image.bytes.clone(), &item.listing_id, &image.filename)
                .await?;
            let duplicate = report.is_duplicate;
            evidence.duplicates.push(report);
            if duplicate {
                return Ok(AuthenticityVerdict::Duplicate { details: evidence });
            }
        }
        metrics::stage_elapsed("duplicate_check", started.elapsed().as_millis());

        let started = Instant::now();
        let (ela_report, exif_report, reverse) = self.technical_signals(primary).await?;
        metrics::stage_elapsed("technical_signals", started.elapsed().as_millis());

        let gate = technical_gate(&ela_report, &reverse);
        let prompt = technical_prompt(&ela_report, &exif_report, &reverse);
        evidence.ela = Some(ela_report);
        evidence.exif = Some(exif_report);
        evidence.reverse_search = Some(reverse);
        if self.pass_gate("technical", gate, prompt, &mut evidence).await == Decision::Stop {
            return Ok(AuthenticityVerdict::Manipulated { details: evidence });
        }

        let started = Instant::now();
        let pair = self.detector.detect_both(primary.bytes.clone()).await;
        metrics::stage_elapsed("ai_detection", started.elapsed().as_millis());
        let gate = ai_gate(&pair);
        let prompt = ai_prompt(&pair);
        evidence.ai_detection = Some(pair);
        if self.pass_gate("ai_detection", gate, prompt, &mut evidence).await == Decision::Stop {
            return Ok(AuthenticityVerdict::AiGenerated { details: evidence });
        }

        let started = Instant::now();
        let vision = self.vision.analyze(primary.bytes.clone()).await;
        metrics::stage_elapsed("vision", started.elapsed().as_millis());

        let artwork = is_artwork(item.category.as_deref(), item.description.as_deref());
        let query = comparative_query(item, &vision);
        let comparative = if query.query.is_empty() {
            None
        } else {
            let started = Instant::now();
            let report = self.comparative.search(&query).await;
            metrics::stage_elapsed("comparative_search", started.elapsed().as_millis());
            Some(report)
        };
        evidence.vision_analysis = Some(vision);
        evidence.comparative_search = comparative;
        evidence.is_artwork = Some(artwork);

        let reasoning = self.final_reasoning(item, &evidence).await;
        info!(
            target = "auction.authenticity",
            listing_id = %item.listing_id,
            "authenticity_validated"
        );
        Ok(AuthenticityVerdict::Validated {
            authenticity_reasoning: reasoning,
            details: evidence,
        })
    }

    async fn technical_signals(
        &self,
        image: &AgentImage,
    ) -> Result<(ElaReport, ExifReport, ReverseSearchReport), AgentError> {
        let bytes = image.bytes.clone();
        let path = image.local_path.clone();
        let inspector = self.forensics.clone();
        let forensics = tokio::task::spawn_blocking(move || inspector.inspect(&bytes, &path));
        let (forensics, reverse) = tokio::join!(forensics, self.reverse.search(image.bytes.clone()));
        let (ela, exif) = forensics.map_err(|err| AgentError::Task(err.to_string()))??;
        Ok((ela, exif, reverse))
    }

    async fn pass_gate(
        &self,
        gate_name: &'static str,
        gate: Gate,
        prompt: String,
        evidence: &mut Evidence,
    ) -> Decision {
        if gate == Gate::Proceed {
            evidence.gates.push(GateRecord {
                gate: gate_name,
                consulted_model: false,
                decision: Decision::Proceed,
                reply: None,
            });
            return Decision::Proceed;
        }

        let (decision, reply) = match self.reasoning.generate(&LlmRequest::text(prompt)).await {
            Ok(reply) => (parse_decision(&reply), Some(reply.trim().to_string())),
            Err(err) => {
                warn!(
                    target = "auction.authenticity",
                    gate = gate_name,
                    error = %err,
                    "gate_model_failed_proceeding"
                );
                (Decision::Proceed, None)
            }
        };
        info!(
            target = "auction.authenticity",
            gate = gate_name,
            decision = ?decision,
            "gate_decided_by_model"
        );
        evidence.gates.push(GateRecord {
            gate: gate_name,
            consulted_model: true,
            decision,
            reply,
        });
        decision
    }

    async fn final_reasoning(&self, item: &ItemContext, evidence: &Evidence) -> String {
        let prompt = authenticity_prompt(item, evidence);
        match self.reasoning.generate(&LlmRequest::text(prompt)).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => fallback_summary(evidence),
            Err(err) => {
                warn!(
                    target = "auction.authenticity",
                    error = %err,
                    "final_reasoning_failed_using_summary"
                );
                fallback_summary(evidence)
            }
        }
    }
}

fn comparative_query(item: &ItemContext, vision: &VisionReport) -> ComparativeQuery {
    let mut parts: Vec<String> = [item.category.as_deref(), item.description.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if vision.engine_used != "none" && !vision.full_report.is_empty() {
        parts.push(vision.full_report.chars().take(QUERY_REPORT_CHARS).collect());
    }
    ComparativeQuery {
        query: parts.join(" ").trim().to_string(),
        object_type: Some(vision.object_type.clone()),
        period: Some(vision.estimated_period.clone()),
    }
}

fn tag<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "unknown".into())
}

fn technical_prompt(ela: &ElaReport, exif: &ExifReport, reverse: &ReverseSearchReport) -> String {
    format!(
        r#"You are an autonomous agent for image validation on an auction platform.

=== ELA ANALYSIS (Error Level Analysis) ===
VERDICT: {ela_verdict} (overall conclusion: clean/suspicious/likely_manipulated)
Suspicion score: {ela_score:.2} (0=clean, 1=highly suspicious)
Notes: {ela_notes}
IMPORTANT: If verdict is "clean" AND suspicion_score < 0.5, the notes may mention "suggests manipulation" due to high contrast. This is often a FALSE POSITIVE for legitimate photos. Do NOT stop.

=== EXIF METADATA ===
{exif_message}
Has EXIF: {has_exif}
NOTE: Missing EXIF is COMMON for screenshots, web images and converted formats. Do NOT stop for this alone.

=== REVERSE IMAGE SEARCH ===
{reverse_notes}
Found online: {found_online}
Reverse suspicion score: {reverse_score:.2}
Suspicion score is calculated from the number of matches found online, matches on suspicious domains (stock photo or e-commerce sites), and whether the image appears in active product listings.

=== YOUR DECISION ===
Reply with ONLY "stop" if: ELA verdict is "likely_manipulated" OR ELA suspicion >= 0.6 OR reverse suspicion >= 0.85.
Finding product images online (PCs, electronics, common items) is EXPECTED. Do NOT stop for reverse alone unless suspicion >= 0.85.
Reply with "proceed" if: ELA verdict is "clean" with score < 0.5, OR signals are ambiguous. When in doubt, PROCEED to AI detection."#,
        ela_verdict = tag(&ela.verdict),
        ela_score = ela.suspicion_score,
        ela_notes = ela.notes,
        exif_message = exif.message,
        has_exif = exif.has_exif,
        reverse_notes = reverse.notes,
        found_online = reverse.found_online,
        reverse_score = reverse.suspicion_score,
    )
}

fn ai_prompt(pair: &AiDetectionPair) -> String {
    format!(
        r#"AI detection results (detects if the image is AI-generated):
umm-maybe: {general_notes}, suspicion score: {general:.2}
sdxl: {sdxl_notes}, suspicion score: {sdxl:.2}
Note: SDXL is more reliable for photos; umm-maybe for artistic images.
Reply "stop" ONLY if BOTH models have suspicion_score >= 0.7 (clearly AI-generated).
Reply "proceed" if scores are low (< 0.6) or ambiguous. Real objects (antiques, decorative arts) often score mid-range. When in doubt, PROCEED."#,
        general_notes = pair.general.notes,
        general = pair.general.suspicion_score,
        sdxl_notes = pair.sdxl.notes,
        sdxl = pair.sdxl.suspicion_score,
    )
}

fn authenticity_prompt(item: &ItemContext, evidence: &Evidence) -> String {
    let vision = evidence
        .vision_analysis
        .as_ref()
        .map(|v| v.full_report.clone())
        .unwrap_or_else(|| "No vision analysis available".into());
    let (comparative_notes, comparative_matches, stolen_flags) = evidence
        .comparative_search
        .as_ref()
        .map(|c| (c.notes.clone(), c.match_count, c.stolen_art_flags.len()))
        .unwrap_or_else(|| ("No comparative results found".into(), 0, 0));
    let ela = evidence.ela.as_ref();
    let reverse = evidence.reverse_search.as_ref();
    let ai = evidence.ai_detection.as_ref();

    format!(
        r#"You are an expert art and collectibles authenticator.
Analyze the AUTHENTICITY of the item using the following evidence:

=== VISION ANALYSIS (AI Visual Inspection) ===
{vision}

=== COMPARATIVE WEB SEARCH ===
{comparative_notes}
Found matches: {comparative_matches}
Stolen-registry hits: {stolen_flags}

=== ITEM CONTEXT ===
Category: {category}
Seller Description: {description}
Is Artwork: {artwork}

=== PREVIOUS ANALYSIS RESULTS ===
- ELA (Error Level Analysis): Suspicion {ela_score:.2} - {ela_notes}
- EXIF Metadata: {exif}
- Reverse Image Search: Found online={found_online}, Suspicion={reverse_score:.2}, Avg Similarity={avg_similarity:.2}
- AI Detection: SDXL={sdxl:.2}, UMM-Maybe={general:.2}

=== YOUR TASK ===
Based on the vision analysis and web comparison results, reason about the item's authenticity:

1. Visual Assessment: What does the vision analysis reveal about quality, materials, craftsmanship, and potential red flags?
2. Market Context: Does the comparative search show this item in known collections, auction houses, or suspicious marketplaces?
3. Consistency Check: Does the seller's description match what is visually observed?
4. Risk Indicators:
   - If the item appears in a museum or major collection, it is likely fake or stolen
   - If the item appears on stock photo sites, it is suspicious
   - If visual quality doesn't match claimed provenance, there is potential fraud
5. Final Verdict:
   - Authenticity Probability (0.0 to 1.0)
   - Confidence Level (low/medium/high)
   - Key reasoning points
   - Recommended action (approve/reject/request more info)

Provide your analysis in a structured format."#,
        category = item.category.as_deref().unwrap_or("Unknown"),
        description = item
            .description
            .as_deref()
            .unwrap_or("No description provided"),
        artwork = evidence.is_artwork.unwrap_or(false),
        ela_score = ela.map(|e| e.suspicion_score).unwrap_or(0.0),
        ela_notes = ela.map(|e| e.notes.as_str()).unwrap_or("n/a"),
        exif = evidence
            .exif
            .as_ref()
            .map(|e| e.message.as_str())
            .unwrap_or("No EXIF data"),
        found_online = reverse.map(|r| r.found_online).unwrap_or(false),
        reverse_score = reverse.map(|r| r.suspicion_score).unwrap_or(0.0),
        avg_similarity = reverse.map(|r| r.avg_similarity).unwrap_or(0.0),
        sdxl = ai.map(|a| a.sdxl.suspicion_score).unwrap_or(0.0),
        general = ai.map(|a| a.general.suspicion_score).unwrap_or(0.0),
    )
}

/// Plain-text assessment used when the reasoning model cannot be reached.
pub fn fallback_summary(evidence: &Evidence) -> String {
    let mut lines = vec!["Automated summary (reasoning model unavailable).".to_string()];
    if let Some(ela) = &evidence.ela {
        lines.push(format!(
            "ELA: {} (suspicion {:.2}).",
            tag(&ela.verdict),
            ela.suspicion_score
        ));
    }
    if let Some(exif) = &evidence.exif {
        lines.push(format!("EXIF: {}.", exif.message));
    }
    if let Some(reverse) = &evidence.reverse_search {
        lines.push(format!(
            "Reverse image search: {} (suspicion {:.2}, {} matches).",
            tag(&reverse.verdict),
            reverse.suspicion_score,
            reverse.match_count
        ));
    }
    if let Some(ai) = &evidence.ai_detection {
        lines.push(format!(
            "AI detection: general {:.2}, sdxl {:.2}.",
            ai.general.suspicion_score, ai.sdxl.suspicion_score
        ));
    }
    if let Some(vision) = &evidence.vision_analysis {
        lines.push(format!(
            "Vision: {} (authenticity {:.2}).",
            tag(&vision.verdict),
            vision.authenticity_score
        ));
    }
    match &evidence.comparative_search {
        Some(comparative) => lines.push(format!(
            "Comparative search: {} (suspicion {:.2}).",
            tag(&comparative.verdict),
            comparative.suspicion_score
        )),
        None => lines.push("Comparative search: skipped.".into()),
    }
    lines.join(" ")
}
