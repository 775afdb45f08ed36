//! Model call parameters shared by the loop and the helpers.

use canopy_config::AppConfig;
use canopy_core::message::Message;
use canopy_core::provider::ChatRequest;

#[derive(Clone, PartialEq)]
pub struct ModelSettings {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl ModelSettings {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: String::new(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone().unwrap_or_default(),
            model: config.default_model.clone(),
            temperature: Some(config.default_temperature),
            max_tokens: Some(config.default_max_tokens),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn request(&self, messages: Vec<Message>) -> ChatRequest {
        let mut req = ChatRequest::new(&self.base_url, &self.model, messages).with_api_key(&self.api_key);
        req.temperature = self.temperature;
        req.max_tokens = self.max_tokens;
        req
    }
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &if self.api_key.is_empty() { "" } else { "***" })
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}
