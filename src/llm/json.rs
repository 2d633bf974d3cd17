//! Recovering JSON objects from free-form model output.
//!
//! Models wrap JSON in markdown fences, prepend chatter, or truncate it. The
//! extraction ladder is: fenced block, whole text, first object with at most
//! one nesting level, widest `{...}` span. When all of those fail a single
//! repair call is made to the model before giving up.

use super::{LanguageModel, LlmError, LlmRequest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

static FENCED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("valid fence regex")
});
static ONE_LEVEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{[^{}]*(?:\{[^{}]*\}[^{}]*)*\}").expect("valid object regex")
});
static WIDEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid span regex"));

#[derive(Debug, Error)]
pub enum JsonExtractError {
    #[error("no json object found in model output")]
    NotFound,
    #[error("repair call failed: {0}")]
    Repair(#[from] LlmError),
}

pub fn extract_object(text: &str) -> Option<Map<String, Value>> {
    let text = text.trim();

    if let Some(found) = FENCED
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| parse_object(m.as_str()))
    {
        return Some(found);
    }

    let unfenced = strip_markdown_fence(text);
    if let Some(found) = parse_object(&unfenced) {
        return Some(found);
    }

    if let Some(found) = ONE_LEVEL
        .find_iter(&unfenced)
        .find_map(|m| parse_object(m.as_str()))
    {
        return Some(found);
    }

    WIDEST
        .find(&unfenced)
        .and_then(|m| parse_object(m.as_str()))
}

/// Extract an object, asking `model` once to repair the text when nothing
/// parseable is found.
pub async fn extract_or_repair(
    model: &dyn LanguageModel,
    raw: &str,
    shape_hint: &str,
) -> Result<Map<String, Value>, JsonExtractError> {
    if let Some(found) = extract_object(raw) {
        return Ok(found);
    }

    warn!(
        target = "auction.llm",
        model = model.name(),
        "json_extract_failed_requesting_repair"
    );
    let prompt = format!(
        "The following text was supposed to be a single JSON object of the shape {shape_hint}. \
         Return ONLY the corrected JSON object, no prose and no markdown.\n\n{raw}"
    );
    let repaired = model
        .generate(&LlmRequest::text(prompt).with_temperature(0.0))
        .await?;
    extract_object(&repaired).ok_or(JsonExtractError::NotFound)
}

fn parse_object(candidate: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}
