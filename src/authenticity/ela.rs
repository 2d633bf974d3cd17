//! Error level analysis.
//!
//! The image is recompressed as JPEG at a fixed quality and compared with the
//! original. Regions pasted in from a differently compressed source stand out
//! as pockets of unusually high (or low) error.

use super::round_to;
use crate::imaging::{self, ImagingError};
use image::DynamicImage;
use serde::{Deserialize, Serialize};

const RESAVE_QUALITY: u8 = 90;
const ANOMALY_THRESHOLD: f32 = 15.0;
const SUSPICIOUS_SCORE: f64 = 0.4;
const MANIPULATED_SCORE: f64 = 0.7;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ElaVerdict {
    Clean,
    Suspicious,
    LikelyManipulated,
}

impl ElaVerdict {
    fn from_score(score: f64) -> Self {
        if score >= MANIPULATED_SCORE {
            ElaVerdict::LikelyManipulated
        } else if score >= SUSPICIOUS_SCORE {
            ElaVerdict::Suspicious
        } else {
            ElaVerdict::Clean
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElaReport {
    pub tool: String,
    pub suspicion_score: f64,
    pub mean_error: f64,
    pub max_error: f64,
    pub high_error_ratio: f64,
    pub verdict: ElaVerdict,
    pub notes: String,
}

/// Mean, max and share of pixels above the anomaly threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErrorMetrics {
    pub mean: f64,
    pub max: f64,
    pub high_ratio: f64,
}

impl ErrorMetrics {
    pub fn from_errors(errors: &[f32]) -> Self {
        if errors.is_empty() {
            return Self {
                mean: 0.0,
                max: 0.0,
                high_ratio: 0.0,
            };
        }
        let total: f64 = errors.iter().map(|e| *e as f64).sum();
        let max = errors.iter().copied().fold(0.0f32, f32::max) as f64;
        let high = errors.iter().filter(|e| **e > ANOMALY_THRESHOLD).count();
        Self {
            mean: total / errors.len() as f64,
            max,
            high_ratio: high as f64 / errors.len() as f64,
        }
    }
}

pub fn analyze(bytes: &[u8]) -> Result<ElaReport, ImagingError> {
    let original = imaging::decode(bytes)?;
    let errors = pixel_errors(&original)?;
    Ok(report(ErrorMetrics::from_errors(&errors)))
}

pub fn report(metrics: ErrorMetrics) -> ElaReport {
    let (score, notes) = score_metrics(metrics);
    ElaReport {
        tool: "ela_detector".into(),
        suspicion_score: round_to(score, 4),
        mean_error: round_to(metrics.mean, 4),
        max_error: round_to(metrics.max, 4),
        high_error_ratio: round_to(metrics.high_ratio, 6),
        verdict: ElaVerdict::from_score(score),
        notes,
    }
}

/// Suspicion score in `[0, 1]` and the explanation that goes with it.
pub fn score_metrics(metrics: ErrorMetrics) -> (f64, String) {
    let ErrorMetrics {
        mean,
        max,
        high_ratio,
    } = metrics;
    let mut score = 0.0;
    let mut notes = Vec::new();

    score += (high_ratio * 5.0).min(0.5);
    if high_ratio > 0.05 {
        notes.push(format!(
            "{:.1}% of pixels show anomalous error (threshold: {ANOMALY_THRESHOLD})",
            high_ratio * 100.0
        ));
    }

    if mean > 0.0 {
        let contrast = max / (mean + 1e-6);
        score += ((contrast - 1.0) / 30.0).min(0.3).max(0.0);
        if contrast > 10.0 {
            notes.push(format!(
                "High contrast between mean ({mean:.2}) and max ({max:.2}) error, suggests localized manipulation"
            ));
        }
    }

    if mean < 5.0 && high_ratio > 0.02 {
        score += 0.2;
        notes.push(
            "Low global error but localized hotspots, classic copy-paste or splice pattern".into(),
        );
    }

    let notes = if notes.is_empty() {
        "No strong manipulation indicators detected.".to_string()
    } else {
        notes.join(" | ")
    };
    (score.min(1.0), notes)
}

/// Per-pixel error: mean absolute RGB difference after one JPEG round trip.
fn pixel_errors(original: &DynamicImage) -> Result<Vec<f32>, ImagingError> {
    let original = original.to_rgb8();
    let resaved = imaging::decode(&imaging::encode_jpeg(
        &DynamicImage::ImageRgb8(original.clone()),
        RESAVE_QUALITY,
    )?)?
    .to_rgb8();

    Ok(original
        .pixels()
        .zip(resaved.pixels())
        .map(|(a, b)| {
            let sum: f32 = a
                .0
                .iter()
                .zip(b.0.iter())
                .map(|(x, y)| (*x as f32 - *y as f32).abs())
                .sum();
            sum / 3.0
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::tests::encode;
    use image::{ImageFormat, Rgb, RgbImage};

    /// Error map of a clean background (error 1.0) with 5% of the pixels
    /// replaced by a splice of the given error level.
    fn spliced_errors(splice_error: f32) -> Vec<f32> {
        (0..10_000)
            .map(|i| if i % 20 == 0 { splice_error } else { 1.0 })
            .collect()
    }

    #[test]
    fn score_grows_with_splice_contrast() {
        let scores: Vec<f64> = [1.0, 10.0, 20.0, 40.0]
            .into_iter()
            .map(|c| score_metrics(ErrorMetrics::from_errors(&spliced_errors(c))).0)
            .collect();

        assert!(scores.windows(2).all(|w| w[0] <= w[1]), "{scores:?}");
        assert!(scores[0] < 0.01);
        assert!((scores[1] - 0.1965).abs() < 0.01, "{scores:?}");
        assert!((scores[2] - 0.75).abs() < 1e-9, "{scores:?}");
        assert_eq!(report(ErrorMetrics::from_errors(&spliced_errors(40.0))).verdict, ElaVerdict::LikelyManipulated);
    }

    #[test]
    fn quiet_metrics_get_default_note() {
        let (score, notes) = score_metrics(ErrorMetrics {
            mean: 2.0,
            max: 3.0,
            high_ratio: 0.0,
        });
        assert!(score < SUSPICIOUS_SCORE);
        assert_eq!(notes, "No strong manipulation indicators detected.");
    }

    #[test]
    fn flat_image_is_clean_and_patch_scores_higher() {
        let flat = RgbImage::from_pixel(128, 128, Rgb([128, 128, 128]));
        let mut patched = flat.clone();
        for y in 32..80 {
            for x in 32..80 {
                let level = if (x + y) % 2 == 0 { 0 } else { 255 };
                patched.put_pixel(x, y, Rgb([level, level, level]));
            }
        }

        let flat_report = analyze(&encode(&flat, ImageFormat::Png)).expect("flat ela");
        let patched_report = analyze(&encode(&patched, ImageFormat::Png)).expect("patched ela");

        assert_eq!(flat_report.verdict, ElaVerdict::Clean);
        assert!(
            patched_report.suspicion_score > flat_report.suspicion_score,
            "{} <= {}",
            patched_report.suspicion_score,
            flat_report.suspicion_score
        );
    }

    #[test]
    fn undecodable_bytes_fail() {
        assert!(analyze(b"nope").is_err());
    }
}
