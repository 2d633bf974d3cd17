//! Comparative web search: museum collections, auction results and
//! stolen-art registries for the identified object.

use super::round_to;
use crate::config::SearchKeys;
use crate::http::build_client_with_timeout;
use crate::metrics;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;
use tracing::{info, warn};

const MET_ENDPOINT: &str = "https://collectionapi.metmuseum.org/public/collection/v1";
const EUROPEANA_ENDPOINT: &str = "https://api.europeana.eu/record/v2/search.json";
const HARVARD_ENDPOINT: &str = "https://api.harvardartmuseums.org/object";
const WIKIPEDIA_ENDPOINT: &str = "https://en.wikipedia.org/api/rest_v1/page/summary";
const SERPER_ENDPOINT: &str = "https://google.serper.dev/search";
const WIKIPEDIA_MAX_CHARS: usize = 800;

const ART_CATEGORIES: [&str; 6] = [
    "artwork",
    "painting",
    "sculpture",
    "drawing",
    "print",
    "photograph",
];
const ART_WORDS: [&str; 11] = [
    "artwork",
    "painting",
    "sculpture",
    "museum",
    "gallery",
    "canvas",
    "oil",
    "watercolor",
    "drawing",
    "print",
    "photograph",
];

static AUCTION_PRICE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\$£€]\s?([\d,]+(?:\.\d{1,2})?)").expect("valid auction price regex")
});

pub fn is_artwork(category: Option<&str>, description: Option<&str>) -> bool {
    let category_match = category
        .map(|c| ART_CATEGORIES.contains(&c.trim().to_lowercase().as_str()))
        .unwrap_or(false);
    let description_match = description
        .map(|d| {
            let lower = d.to_lowercase();
            ART_WORDS.iter().any(|word| lower.contains(word))
        })
        .unwrap_or(false);
    category_match || description_match
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComparativeVerdict {
    Clear,
    Flagged,
    StolenRisk,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Reference {
    pub source: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub period: Option<String>,
    pub medium: Option<String>,
    pub snippet: Option<String>,
    pub price_found: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparativeReport {
    pub museum_matches: Vec<Reference>,
    pub stolen_art_flags: Vec<Reference>,
    pub publications: Vec<Reference>,
    pub auction_comparables: Vec<Reference>,
    pub wikipedia_context: String,
    pub estimated_value: Option<f64>,
    pub match_count: usize,
    pub suspicion_score: f64,
    pub verdict: ComparativeVerdict,
    pub notes: String,
    pub sources_checked: Vec<String>,
}

/// What to look for. `query` drives the collection searches; the object type
/// and period narrow the auction and registry lookups.
#[derive(Debug, Clone)]
pub struct ComparativeQuery {
    pub query: String,
    pub object_type: Option<String>,
    pub period: Option<String>,
}

impl ComparativeQuery {
    fn subject(&self) -> &str {
        self.object_type
            .as_deref()
            .filter(|o| !o.is_empty() && *o != "unknown")
            .unwrap_or(&self.query)
    }

    fn period(&self) -> &str {
        self.period
            .as_deref()
            .filter(|p| *p != "unknown")
            .unwrap_or("")
    }
}

/// Score from registry hits and the presence of auction comparables.
pub fn assess(
    stolen: usize,
    museum_matches: usize,
    auction_comparables: usize,
) -> (f64, ComparativeVerdict, String) {
    let mut score: f64 = 0.0;
    let mut notes = Vec::new();

    if stolen > 0 {
        score += 0.6;
        notes.push(format!(
            "Possible match in stolen art registries ({stolen} results). Manual verification strongly recommended."
        ));
    }
    if museum_matches > 0 {
        notes.push(format!(
            "Found {museum_matches} similar items in museum collections, useful for authentication comparison."
        ));
    }
    if auction_comparables == 0 {
        score += 0.1;
        notes.push("No auction comparables found, market value unverifiable.".into());
    } else {
        notes.push(format!(
            "Found {auction_comparables} auction comparables for valuation reference."
        ));
    }

    let score = score.min(1.0);
    let verdict = if score >= 0.6 {
        ComparativeVerdict::StolenRisk
    } else if score >= 0.3 {
        ComparativeVerdict::Flagged
    } else {
        ComparativeVerdict::Clear
    };
    (round_to(score, 4), verdict, notes.join(" | "))
}

pub fn first_price(text: &str) -> Option<f64> {
    AUCTION_PRICE
        .captures(text)
        .and_then(|caps| caps[1].replace(',', "").parse().ok())
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

#[derive(Clone)]
pub struct ComparativeSearcher {
    http: Client,
    keys: SearchKeys,
    /// Met Museum and Wikipedia need no key; this switches them off.
    public_sources: bool,
}

impl ComparativeSearcher {
    pub fn new(keys: SearchKeys) -> Self {
        Self {
            http: build_client_with_timeout(10),
            keys,
            public_sources: true,
        }
    }

    pub fn without_public_sources(mut self) -> Self {
        self.public_sources = false;
        self
    }

    pub async fn search(&self, query: &ComparativeQuery) -> ComparativeReport {
        let subject = query.subject();
        let period = query.period();
        info!(
            target = "auction.authenticity",
            subject = %subject,
            period = %period,
            "comparative_search_started"
        );

        let (met, europeana, harvard, wikipedia, auctions, stolen, publications) = tokio::join!(
            self.search_met(&query.query),
            self.search_europeana(&query.query),
            self.search_harvard(&query.query),
            self.search_wikipedia(subject),
            self.search_auction_houses(subject, period),
            self.search_stolen_registries(subject),
            self.search_publications(subject, period),
        );

        let museum_matches: Vec<Reference> =
            met.into_iter().chain(europeana).chain(harvard).collect();
        let prices: Vec<f64> = auctions.iter().filter_map(|a| a.price_found).collect();
        let (score, verdict, notes) = assess(stolen.len(), museum_matches.len(), auctions.len());

        ComparativeReport {
            match_count: museum_matches.len() + auctions.len(),
            museum_matches,
            stolen_art_flags: stolen,
            publications,
            auction_comparables: auctions,
            wikipedia_context: wikipedia.chars().take(WIKIPEDIA_MAX_CHARS).collect(),
            estimated_value: median(&prices),
            suspicion_score: score,
            verdict,
            notes,
            sources_checked: [
                "Met Museum",
                "Europeana",
                "Harvard Art Museums",
                "Wikipedia",
                "Christie's/Sotheby's",
                "Interpol/ALR",
                "Web Publications",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }

    async fn get_json(&self, service: &'static str, request: RequestBuilder) -> Option<Value> {
        let result = match request.send().await {
            Ok(resp) if resp.status().is_success() => resp.json::<Value>().await.ok(),
            Ok(resp) => {
                warn!(target = "auction.authenticity", service, status = %resp.status(), "comparative_source_failed");
                None
            }
            Err(err) => {
                warn!(target = "auction.authenticity", service, error = %err, "comparative_source_failed");
                None
            }
        };
        metrics::external_call(service, result.is_some());
        result
    }

    async fn search_met(&self, query: &str) -> Vec<Reference> {
        if !self.public_sources {
            return Vec::new();
        }
        let Some(found) = self
            .get_json(
                "met",
                self.http
                    .get(format!("{MET_ENDPOINT}/search"))
                    .query(&[("q", query), ("hasImages", "true")]),
            )
            .await
        else {
            return Vec::new();
        };

        let ids: Vec<i64> = found
            .get("objectIDs")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_i64).take(3).collect())
            .unwrap_or_default();

        let mut results = Vec::new();
        for id in ids {
            if let Some(obj) = self
                .get_json("met", self.http.get(format!("{MET_ENDPOINT}/objects/{id}")))
                .await
            {
                results.push(Reference {
                    source: "Metropolitan Museum".into(),
                    title: str_field(&obj, "title"),
                    url: str_field(&obj, "objectURL"),
                    period: str_field(&obj, "period").or_else(|| str_field(&obj, "objectDate")),
                    medium: str_field(&obj, "medium"),
                    ..Reference::default()
                });
            }
        }
        results
    }

    async fn search_europeana(&self, query: &str) -> Vec<Reference> {
        let Some(key) = &self.keys.europeana else {
            return Vec::new();
        };
        let Some(found) = self
            .get_json(
                "europeana",
                self.http.get(EUROPEANA_ENDPOINT).query(&[
                    ("query", query),
                    ("wskey", key.as_str()),
                    ("rows", "3"),
                    ("media", "true"),
                    ("profile", "rich"),
                ]),
            )
            .await
        else {
            return Vec::new();
        };

        let first = |item: &Value, key: &str| {
            item.get(key)
                .and_then(Value::as_array)
                .and_then(|values| values.first())
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        found
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|item| Reference {
                        source: "Europeana".into(),
                        title: first(item, "title"),
                        period: first(item, "year"),
                        url: str_field(item, "id")
                            .map(|id| format!("https://www.europeana.eu/item{id}")),
                        ..Reference::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn search_harvard(&self, query: &str) -> Vec<Reference> {
        let Some(key) = &self.keys.harvard else {
            return Vec::new();
        };
        let Some(found) = self
            .get_json(
                "harvard",
                self.http.get(HARVARD_ENDPOINT).query(&[
                    ("apikey", key.as_str()),
                    ("keyword", query),
                    ("size", "3"),
                    ("fields", "title,dated,medium,url,primaryimageurl,people"),
                ]),
            )
            .await
        else {
            return Vec::new();
        };

        found
            .get("records")
            .and_then(Value::as_array)
            .map(|records| {
                records
                    .iter()
                    .map(|record| Reference {
                        source: "Harvard Art Museums".into(),
                        title: str_field(record, "title"),
                        period: str_field(record, "dated"),
                        medium: str_field(record, "medium"),
                        url: str_field(record, "url"),
                        ..Reference::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn search_wikipedia(&self, subject: &str) -> String {
        if !self.public_sources || subject.trim().is_empty() {
            return String::new();
        }
        let title = urlencoding::encode(&subject.trim().replace(' ', "_")).into_owned();
        self.get_json(
            "wikipedia",
            self.http.get(format!("{WIKIPEDIA_ENDPOINT}/{title}")),
        )
        .await
        .and_then(|page| str_field(&page, "extract"))
        .unwrap_or_default()
    }

    async fn serper(&self, query: &str, num: u32) -> Vec<Value> {
        let Some(key) = &self.keys.serper else {
            return Vec::new();
        };
        self.get_json(
            "serper",
            self.http
                .post(SERPER_ENDPOINT)
                .header("X-API-KEY", key)
                .json(&json!({"q": query, "num": num})),
        )
        .await
        .and_then(|data| data.get("organic").and_then(Value::as_array).cloned())
        .unwrap_or_default()
    }

    async fn search_auction_houses(&self, subject: &str, period: &str) -> Vec<Reference> {
        let query = format!("{subject} {period} site:christies.com OR site:sothebys.com");
        self.serper(&query, 6)
            .await
            .iter()
            .map(|result| {
                let snippet = str_field(result, "snippet").unwrap_or_default();
                Reference {
                    source: "Christie's/Sotheby's".into(),
                    title: str_field(result, "title"),
                    url: str_field(result, "link"),
                    price_found: first_price(&snippet),
                    snippet: Some(snippet),
                    ..Reference::default()
                }
            })
            .collect()
    }

    async fn search_stolen_registries(&self, subject: &str) -> Vec<Reference> {
        let query = format!("stolen {subject} site:interpol.int OR site:artloss.com");
        self.serper(&query, 4)
            .await
            .iter()
            .map(|result| Reference {
                source: "Interpol/ALR".into(),
                title: str_field(result, "title"),
                url: str_field(result, "link"),
                snippet: str_field(result, "snippet"),
                ..Reference::default()
            })
            .collect()
    }

    async fn search_publications(&self, subject: &str, period: &str) -> Vec<Reference> {
        let query = format!("\"{subject}\" \"{period}\" authentication provenance");
        self.serper(&query, 5)
            .await
            .iter()
            .map(|result| Reference {
                source: str_field(result, "displayedLink").unwrap_or_else(|| "web".into()),
                title: str_field(result, "title"),
                url: str_field(result, "link"),
                snippet: str_field(result, "snippet"),
                ..Reference::default()
            })
            .collect()
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artwork_detection() {
        assert!(is_artwork(Some("Painting"), None));
        assert!(is_artwork(None, Some("An oil on canvas landscape")));
        assert!(!is_artwork(Some("watches"), Some("Swiss pocket watch")));
        assert!(!is_artwork(None, None));
    }

    #[test]
    fn stolen_hits_dominate_score() {
        let (score, verdict, notes) = assess(2, 0, 0);
        assert_eq!(score, 0.7);
        assert_eq!(verdict, ComparativeVerdict::StolenRisk);
        assert!(notes.contains("stolen art registries"));

        let (score, verdict, _) = assess(0, 3, 0);
        assert_eq!(score, 0.1);
        assert_eq!(verdict, ComparativeVerdict::Clear);

        let (score, _, _) = assess(0, 0, 4);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn auction_prices_use_median() {
        assert_eq!(first_price("Sold for £12,500.00 in 2019"), Some(12500.0));
        assert_eq!(first_price("Estimate on request"), None);
        assert_eq!(median(&[300.0, 100.0, 200.0]), Some(200.0));
        assert_eq!(median(&[100.0, 200.0]), Some(150.0));
        assert_eq!(median(&[]), None);
    }

    #[tokio::test]
    async fn unconfigured_search_is_offline_and_clear() {
        let searcher = ComparativeSearcher::new(SearchKeys::default()).without_public_sources();
        let report = searcher
            .search(&ComparativeQuery {
                query: "bronze statue".into(),
                object_type: None,
                period: None,
            })
            .await;
        assert_eq!(report.match_count, 0);
        assert_eq!(report.verdict, ComparativeVerdict::Clear);
        assert_eq!(report.suspicion_score, 0.1);
        assert!(report.wikipedia_context.is_empty());
    }

    #[test]
    fn query_subject_prefers_object_type() {
        let query = ComparativeQuery {
            query: "watch Swiss".into(),
            object_type: Some("unknown".into()),
            period: Some("unknown".into()),
        };
        assert_eq!(query.subject(), "watch Swiss");
        assert_eq!(query.period(), "");

        let query = ComparativeQuery {
            object_type: Some("pocket watch".into()),
            ..query
        };
        assert_eq!(query.subject(), "pocket watch");
    }
}
