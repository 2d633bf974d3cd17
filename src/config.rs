use std::{env, str::FromStr};

/// Non-empty, trimmed env value.
pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_parse(key).unwrap_or(default)
}

pub fn parse_env_bool(key: &str) -> bool {
    env_string(key)
        .map(|value| parse_bool(&value))
        .unwrap_or(false)
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Keys for the web search providers used by reverse image search and
/// comparative search. Every provider is optional.
#[derive(Debug, Clone, Default)]
pub struct SearchKeys {
    pub serpapi: Option<String>,
    pub imgbb: Option<String>,
    pub serper: Option<String>,
    pub europeana: Option<String>,
    pub harvard: Option<String>,
}

impl SearchKeys {
    pub fn from_env() -> Self {
        Self {
            serpapi: env_string("SERPAPI_KEY"),
            imgbb: env_string("IMGBB_API_KEY"),
            serper: env_string("SERPER_API_KEY"),
            europeana: env_string("EUROPEANA_API_KEY"),
            harvard: env_string("HARVARD_API_KEY"),
        }
    }
}
