use crate::client_wrapper::{ClientWrapper, Message, TokenUsage};
use crate::clients::common::CallGate;
use crate::clients::openai::OpenAIClient;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Mutex;

pub struct GeminiClient {
    client: OpenAIClient,
    pub model: String,
}

// Chat-capable Gemini models exposed through the OpenAI compatibility endpoint
pub enum Model {
    Gemini20Flash,
    Gemini20FlashLite,
    Gemini25Flash,
    Gemini25Pro,
}

pub fn model_to_string(model: Model) -> String {
    match model {
        Model::Gemini20Flash => "gemini-2.0-flash".to_string(),
        Model::Gemini20FlashLite => "gemini-2.0-flash-lite".to_string(),
        Model::Gemini25Flash => "gemini-2.5-flash".to_string(),
        Model::Gemini25Pro => "gemini-2.5-pro".to_string(),
    }
}

impl GeminiClient {
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(
            secret_key,
            model_name,
            "https://generativelanguage.googleapis.com",
        )
    }

    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// This function is used to create a GeminiClient with a custom base URL
    /// The default base URL is "<https://generativelanguage.googleapis.com>"
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        GeminiClient {
            client: OpenAIClient::new_with_base_url(
                secret_key,
                model_name,
                base_url,
                "/v1beta/openai/chat/completions",
            ),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(&self, messages: &[Message]) -> Result<Message, Box<dyn Error>> {
        let result = self.client.send_message(messages).await;
        if let Err(err) = &result {
            if log::log_enabled!(log::Level::Error) {
                log::error!("GeminiClient::send_message error: {}", err);
            }
        }
        result
    }

    /// This function is used to get the token usage for the last request, otherwise there will be no tracking for token usage available
    /// because default trait implementation of `usage_slot()` returns `None`
    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        self.client.usage_slot()
    }

    fn call_gate(&self) -> Option<&CallGate> {
        self.client.call_gate()
    }
}
