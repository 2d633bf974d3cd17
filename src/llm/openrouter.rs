use super::{LanguageModel, LlmError, LlmRequest};
use crate::config::env_string;
use crate::http::build_client_with_timeout;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use serde_with::skip_serializing_none;

#[derive(Debug, Clone)]
pub struct OpenRouterConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl OpenRouterConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("OPENROUTER_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            api_key: env_string("OPENROUTER_API_KEY"),
            model: env_string("OPENROUTER_VISION_MODEL")
                .unwrap_or_else(|| "mistralai/ministral-14b-2512".into()),
        }
    }
}

pub struct OpenRouterClient {
    http: Client,
    config: OpenRouterConfig,
}

impl OpenRouterClient {
    pub fn new(config: OpenRouterConfig) -> Self {
        Self {
            http: build_client_with_timeout(60),
            config,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenRouterClient {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError> {
        let key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingKey("openrouter"))?;

        let mut content = vec![json!({"type": "text", "text": request.prompt})];
        for image in &request.images {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": image.data_url()},
            }));
        }

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content,
            }],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .http
            .post(format!(
                "{}/chat/completions",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(key)
            .header("HTTP-Referer", "https://auction-platform.local")
            .header("X-Title", "Sealed Auction API")
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Http(format!("HTTP {}", response.status())));
        }

        let payload: ChatResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        payload
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| LlmError::InvalidResponse("missing content".into()))
    }
}

#[skip_serializing_none]
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}
