mod gemini;
pub mod json;
mod openrouter;

pub use gemini::{GeminiClient, GeminiConfig};
pub use openrouter::{OpenRouterClient, OpenRouterConfig};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing api key for {0}")]
    MissingKey(&'static str),
    #[error("http error: {0}")]
    Http(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct LlmImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl LlmImage {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/jpeg".into(),
            data,
        }
    }

    pub fn base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub prompt: String,
    pub images: Vec<LlmImage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl LlmRequest {
    pub fn text(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: LlmImage) -> Self {
        self.images.push(image);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A single-turn text (optionally multimodal) completion backend.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn generate(&self, request: &LlmRequest) -> Result<String, LlmError>;
}

pub type SharedModel = Arc<dyn LanguageModel>;

/// The two providers wired into the service: Gemini for reasoning, pricing
/// and copywriting, OpenRouter for vision descriptions.
#[derive(Clone)]
pub struct Models {
    pub reasoning: SharedModel,
    pub vision: SharedModel,
}

impl Models {
    pub fn from_env() -> Self {
        Self {
            reasoning: Arc::new(GeminiClient::new(GeminiConfig::from_env())),
            vision: Arc::new(OpenRouterClient::new(OpenRouterConfig::from_env())),
        }
    }
}
