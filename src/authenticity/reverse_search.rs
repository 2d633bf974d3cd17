//! Reverse image search: host the image publicly, ask Google (via SerpAPI)
//! where else it appears, and score the matches by domain reputation and
//! visual similarity.

use super::{phash::PerceptualHash, round_to};
use crate::config::SearchKeys;
use crate::http::{build_client, build_client_with_timeout};
use crate::imaging;
use crate::metrics;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures_util::future::join_all;
use image::imageops::FilterType;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

const IMGBB_UPLOAD_URL: &str = "https://api.imgbb.com/1/upload";
const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search";
const MAX_UPLOAD_BYTES: usize = 1024 * 1024;
const MAX_COMPARE: usize = 10;
const MAX_REPORTED_MATCHES: usize = 20;
const SUSPICIOUS_SCORE: f64 = 0.4;
const STOLEN_SCORE: f64 = 0.7;

pub const SUSPICIOUS_DOMAINS: [&str; 11] = [
    "shutterstock.com",
    "gettyimages.com",
    "istockphoto.com",
    "alamy.com",
    "dreamstime.com",
    "123rf.com",
    "ebay.com",
    "amazon.com",
    "aliexpress.com",
    "taobao.com",
    "wikipedia.com",
];
const LISTING_DOMAINS: [&str; 4] = ["ebay.com", "amazon.com", "aliexpress.com", "taobao.com"];

static PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s?([\d,]+(?:\.\d{1,2})?)").expect("valid price regex"));

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReverseVerdict {
    Clean,
    Suspicious,
    Stolen,
    Unavailable,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WebMatch {
    pub title: String,
    pub url: String,
    pub source: String,
    pub thumbnail: String,
    pub engine: String,
    #[serde(default)]
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityScore {
    pub url: String,
    pub thumbnail: String,
    pub similarity: f64,
    pub domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseSearchReport {
    pub tool: String,
    pub found_online: bool,
    pub match_count: usize,
    pub suspicious_sources: Vec<WebMatch>,
    pub all_matches: Vec<WebMatch>,
    pub estimated_price: Option<f64>,
    pub suspicion_score: f64,
    pub similarity_scores: Vec<SimilarityScore>,
    pub avg_similarity: f64,
    pub verdict: ReverseVerdict,
    pub engine_used: String,
    pub notes: String,
}

impl ReverseSearchReport {
    pub fn unavailable(reason: &str) -> Self {
        Self {
            tool: "reverse_image_search".into(),
            found_online: false,
            match_count: 0,
            suspicious_sources: Vec::new(),
            all_matches: Vec::new(),
            estimated_price: None,
            suspicion_score: 0.0,
            similarity_scores: Vec::new(),
            avg_similarity: 0.0,
            verdict: ReverseVerdict::Unavailable,
            engine_used: "none".into(),
            notes: reason.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct ReverseImageSearcher {
    http: Client,
    thumbnails: Client,
    imgbb_key: Option<String>,
    serpapi_key: Option<String>,
}

impl ReverseImageSearcher {
    pub fn new(keys: &SearchKeys) -> Self {
        Self {
            http: build_client(),
            thumbnails: build_client_with_timeout(5),
            imgbb_key: keys.imgbb.clone(),
            serpapi_key: keys.serpapi.clone(),
        }
    }

    pub async fn search(&self, bytes: Arc<[u8]>) -> ReverseSearchReport {
        let (Some(imgbb_key), Some(serpapi_key)) = (&self.imgbb_key, &self.serpapi_key) else {
            return ReverseSearchReport::unavailable(
                "Reverse image search not configured (SERPAPI_KEY / IMGBB_API_KEY missing).",
            );
        };

        let upload_bytes = {
            let bytes = bytes.clone();
            match tokio::task::spawn_blocking(move || shrink_for_upload(&bytes)).await {
                Ok(Ok(prepared)) => prepared,
                Ok(Err(err)) => return ReverseSearchReport::unavailable(&err.to_string()),
                Err(err) => return ReverseSearchReport::unavailable(&err.to_string()),
            }
        };

        let Some(public_url) = self.upload_to_imgbb(imgbb_key, &upload_bytes).await else {
            return ReverseSearchReport::unavailable("Image hosting upload failed.");
        };
        let matches = dedupe(self.search_serpapi(serpapi_key, &public_url).await);
        let (similarity_scores, avg_similarity) = self.compare_thumbnails(bytes, &matches).await;
        build_report(matches, similarity_scores, avg_similarity)
    }

    async fn upload_to_imgbb(&self, key: &str, bytes: &[u8]) -> Option<String> {
        let encoded = BASE64.encode(bytes);
        let response = self
            .http
            .post(IMGBB_UPLOAD_URL)
            .form(&[("key", key), ("image", encoded.as_str())])
            .send()
            .await;
        let payload = match response {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.ok(),
            Ok(resp) => {
                warn!(target = "auction.authenticity", status = %resp.status(), "imgbb_upload_failed");
                None
            }
            Err(err) => {
                warn!(target = "auction.authenticity", error = %err, "imgbb_upload_failed");
                None
            }
        };
        metrics::external_call("imgbb", payload.is_some());
        payload?
            .pointer("/data/url")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    async fn search_serpapi(&self, key: &str, image_url: &str) -> Vec<WebMatch> {
        let response = self
            .http
            .get(SERPAPI_ENDPOINT)
            .query(&[
                ("engine", "google_reverse_image"),
                ("image_url", image_url),
                ("api_key", key),
                ("hl", "en"),
                ("gl", "us"),
            ])
            .send()
            .await;
        let data = match response {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.ok(),
            Ok(resp) => {
                warn!(target = "auction.authenticity", status = %resp.status(), "serpapi_request_failed");
                None
            }
            Err(err) => {
                warn!(target = "auction.authenticity", error = %err, "serpapi_request_failed");
                None
            }
        };
        metrics::external_call("serpapi", data.is_some());
        let matches = data.map(|data| parse_serpapi(&data)).unwrap_or_default();
        info!(target = "auction.authenticity", matches = matches.len(), "serpapi_matches");
        matches
    }

    async fn compare_thumbnails(
        &self,
        bytes: Arc<[u8]>,
        matches: &[WebMatch],
    ) -> (Vec<SimilarityScore>, f64) {
        let original = tokio::task::spawn_blocking(move || {
            imaging::decode(&bytes).map(|img| PerceptualHash::from_image(&img))
        })
        .await;
        let Ok(Ok(original)) = original else {
            warn!(target = "auction.authenticity", "source_hash_failed_skipping_similarity");
            return (Vec::new(), 0.0);
        };

        let candidates: Vec<&WebMatch> = matches
            .iter()
            .take(MAX_COMPARE)
            .filter(|m| !m.thumbnail.is_empty())
            .collect();
        let hashes = join_all(candidates.iter().map(|m| self.hash_thumbnail(&m.thumbnail))).await;

        let scores: Vec<SimilarityScore> = candidates
            .into_iter()
            .zip(hashes)
            .filter_map(|(m, hash)| {
                hash.map(|hash| SimilarityScore {
                    url: m.url.clone(),
                    thumbnail: m.thumbnail.clone(),
                    similarity: round_to(original.similarity(&hash), 4),
                    domain: if m.domain.is_empty() {
                        extract_domain(&m.url)
                    } else {
                        m.domain.clone()
                    },
                })
            })
            .collect();

        let avg = if scores.is_empty() {
            0.0
        } else {
            scores.iter().map(|s| s.similarity).sum::<f64>() / scores.len() as f64
        };
        (scores, round_to(avg, 4))
    }

    async fn hash_thumbnail(&self, url: &str) -> Option<PerceptualHash> {
        let resp = self.thumbnails.get(url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let bytes = resp.bytes().await.ok()?;
        tokio::task::spawn_blocking(move || {
            imaging::decode(&bytes)
                .ok()
                .map(|img| PerceptualHash::from_image(&img))
        })
        .await
        .ok()
        .flatten()
    }
}

/// Downscale large uploads so that the JPEG lands near 1 MB.
fn shrink_for_upload(bytes: &[u8]) -> Result<Vec<u8>, imaging::ImagingError> {
    if bytes.len() <= MAX_UPLOAD_BYTES {
        return Ok(bytes.to_vec());
    }
    let img = imaging::decode(bytes)?;
    let scale = (MAX_UPLOAD_BYTES as f64 / bytes.len() as f64).sqrt();
    let width = ((img.width() as f64 * scale) as u32).max(1);
    let height = ((img.height() as f64 * scale) as u32).max(1);
    imaging::encode_jpeg(&img.resize_exact(width, height, FilterType::Lanczos3), 85)
}

fn parse_serpapi(data: &Value) -> Vec<WebMatch> {
    let field = |item: &Value, key: &str| {
        item.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let list = |key: &str| {
        data.get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };

    let mut matches = Vec::new();
    for item in list("inline_images") {
        matches.push(WebMatch {
            title: field(&item, "title"),
            url: field(&item, "link"),
            source: field(&item, "source"),
            thumbnail: field(&item, "thumbnail"),
            engine: "serpapi".into(),
            domain: String::new(),
        });
    }
    for item in list("image_results") {
        matches.push(WebMatch {
            title: field(&item, "title"),
            url: field(&item, "link"),
            source: field(&item, "displayed_link"),
            thumbnail: field(&item, "thumbnail"),
            engine: "serpapi".into(),
            domain: String::new(),
        });
    }
    matches
}

/// Drops matches without a URL and repeated URLs, keeping first occurrences.
pub fn dedupe(matches: Vec<WebMatch>) -> Vec<WebMatch> {
    let mut seen = HashSet::new();
    matches
        .into_iter()
        .filter(|m| !m.url.is_empty() && seen.insert(m.url.clone()))
        .collect()
}

pub fn extract_domain(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.replace("www.", "")))
        .unwrap_or_default()
}

fn is_suspicious(domain: &str) -> bool {
    SUSPICIOUS_DOMAINS.iter().any(|d| domain.contains(d))
}

/// First dollar amount found in a match title.
pub fn extract_price(matches: &[WebMatch]) -> Option<f64> {
    matches.iter().find_map(|m| {
        PRICE
            .captures(&m.title)
            .and_then(|caps| caps[1].replace(',', "").parse().ok())
    })
}

pub struct MatchAssessment {
    pub suspicious_sources: Vec<WebMatch>,
    pub score: f64,
    pub verdict: ReverseVerdict,
    pub notes: String,
}

/// Combine match volume, domain reputation and visual similarity into a
/// suspicion score. Fills in each match's `domain`.
pub fn assess_matches(
    matches: &mut [WebMatch],
    similarity_scores: &[SimilarityScore],
    avg_similarity: f64,
) -> MatchAssessment {
    if matches.is_empty() {
        return MatchAssessment {
            suspicious_sources: Vec::new(),
            score: 0.0,
            verdict: ReverseVerdict::Clean,
            notes: "No matching images found on the web.".into(),
        };
    }

    for m in matches.iter_mut() {
        m.domain = extract_domain(&m.url);
    }
    let suspicious: Vec<WebMatch> = matches
        .iter()
        .filter(|m| is_suspicious(&m.domain))
        .cloned()
        .collect();

    let mut notes = Vec::new();
    let total = matches.len();
    let mut score = (total as f64 / 20.0).min(0.3);
    notes.push(format!("Found {total} matching images online."));

    if !suspicious.is_empty() {
        score += (suspicious.len() as f64 / 3.0).min(0.5);
        let domains: BTreeSet<&str> = suspicious.iter().map(|m| m.domain.as_str()).collect();
        notes.push(format!(
            "Image found on suspicious domains: {}. Possible stolen stock photo or copied listing.",
            domains.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }

    if suspicious
        .iter()
        .any(|m| LISTING_DOMAINS.iter().any(|d| m.domain.contains(d)))
    {
        score += 0.2;
        notes.push(
            "Image already used in an active product listing, possible fraudulent re-listing."
                .into(),
        );
    }

    if avg_similarity > 0.0 {
        let percent = avg_similarity * 100.0;
        if avg_similarity >= 0.95 {
            score += 0.3;
            notes.push(format!(
                "Very high visual similarity ({percent:.1}%) to online matches, likely exact or near-duplicate."
            ));
        } else if avg_similarity >= 0.85 {
            score += 0.2;
            notes.push(format!("High visual similarity ({percent:.1}%) to online matches."));
        } else if avg_similarity >= 0.70 {
            score += 0.1;
            notes.push(format!("Moderate visual similarity ({percent:.1}%) to online matches."));
        }

        let close_on_suspicious = similarity_scores
            .iter()
            .filter(|s| s.similarity >= 0.90 && is_suspicious(&s.domain))
            .count();
        if close_on_suspicious > 0 {
            score += 0.15;
            notes.push(format!(
                "{close_on_suspicious} match(es) with >90% similarity found on suspicious domains."
            ));
        }
    }

    let score = score.min(1.0);
    let verdict = if score >= STOLEN_SCORE {
        ReverseVerdict::Stolen
    } else if score >= SUSPICIOUS_SCORE {
        ReverseVerdict::Suspicious
    } else {
        ReverseVerdict::Clean
    };

    MatchAssessment {
        suspicious_sources: suspicious,
        score: round_to(score, 4),
        verdict,
        notes: notes.join(" | "),
    }
}

fn build_report(
    mut matches: Vec<WebMatch>,
    similarity_scores: Vec<SimilarityScore>,
    avg_similarity: f64,
) -> ReverseSearchReport {
    let assessment = assess_matches(&mut matches, &similarity_scores, avg_similarity);
    info!(
        target = "auction.authenticity",
        verdict = ?assessment.verdict,
        score = assessment.score,
        matches = matches.len(),
        avg_similarity,
        "reverse_search_complete"
    );
    ReverseSearchReport {
        tool: "reverse_image_search".into(),
        found_online: !matches.is_empty(),
        match_count: matches.len(),
        suspicious_sources: assessment.suspicious_sources,
        estimated_price: extract_price(&matches),
        all_matches: matches.into_iter().take(MAX_REPORTED_MATCHES).collect(),
        suspicion_score: assessment.score,
        similarity_scores,
        avg_similarity,
        verdict: assessment.verdict,
        engine_used: "serpapi".into(),
        notes: assessment.notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn web(url: &str, title: &str) -> WebMatch {
        WebMatch {
            title: title.into(),
            url: url.into(),
            engine: "serpapi".into(),
            ..WebMatch::default()
        }
    }

    #[test]
    fn domain_strips_www() {
        assert_eq!(extract_domain("https://www.ebay.com/itm/1"), "ebay.com");
        assert_eq!(extract_domain("not a url"), "");
    }

    #[test]
    fn no_matches_is_clean() {
        let assessment = assess_matches(&mut [], &[], 0.0);
        assert_eq!(assessment.score, 0.0);
        assert_eq!(assessment.verdict, ReverseVerdict::Clean);
        assert_eq!(assessment.notes, "No matching images found on the web.");
    }

    #[test]
    fn listing_site_hits_are_stolen() {
        let mut matches = vec![
            web("https://www.ebay.com/itm/1", "Vintage watch $1,250.00"),
            web("https://www.amazon.com/dp/2", "Watch"),
            web("https://blog.example.org/post", "My watch"),
        ];
        let sims = vec![SimilarityScore {
            url: "https://www.ebay.com/itm/1".into(),
            thumbnail: "t".into(),
            similarity: 0.97,
            domain: "ebay.com".into(),
        }];
        let assessment = assess_matches(&mut matches, &sims, 0.97);
        // 0.15 volume + 0.5 suspicious + 0.2 listing + 0.3 band + 0.15 close, capped
        assert_eq!(assessment.score, 1.0);
        assert_eq!(assessment.verdict, ReverseVerdict::Stolen);
        assert_eq!(assessment.suspicious_sources.len(), 2);
        assert!(assessment.notes.contains("ebay.com"));
        assert_eq!(extract_price(&matches), Some(1250.0));
    }

    #[test]
    fn neutral_matches_stay_clean() {
        let mut matches = vec![web("https://en.wikipedia.org/wiki/Watch", "Watch")];
        let assessment = assess_matches(&mut matches, &[], 0.0);
        assert_eq!(assessment.score, 0.05);
        assert_eq!(assessment.verdict, ReverseVerdict::Clean);
        assert_eq!(matches[0].domain, "en.wikipedia.org");
    }

    #[test]
    fn serpapi_payload_is_parsed_and_deduped() {
        let data = json!({
            "inline_images": [
                {"title": "A", "link": "https://a.com/1", "source": "a", "thumbnail": "https://t/1"},
                {"title": "A again", "link": "https://a.com/1", "source": "a", "thumbnail": "https://t/1"}
            ],
            "image_results": [
                {"title": "B", "link": "https://b.com/2", "displayed_link": "b.com", "thumbnail": ""},
                {"title": "no link"}
            ]
        });
        let matches = dedupe(parse_serpapi(&data));
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[1].source, "b.com");
    }

    #[tokio::test]
    async fn missing_keys_are_unavailable() {
        let searcher = ReverseImageSearcher::new(&SearchKeys::default());
        let report = searcher.search(Arc::from(&b"x"[..])).await;
        assert_eq!(report.verdict, ReverseVerdict::Unavailable);
        assert_eq!(report.suspicion_score, 0.0);
    }
}
