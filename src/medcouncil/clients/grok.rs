use crate::client_wrapper::{ClientWrapper, Message, TokenUsage};
use crate::clients::common::CallGate;
use crate::clients::openai::OpenAIClient;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Mutex;

/// xAI Grok client; the xAI API is OpenAI compatible so calls are delegated.
pub struct GrokClient {
    client: OpenAIClient,
    model: String,
}

pub enum Model {
    Grok4,
    Grok3,
    Grok3Mini,
    Grok3MiniFast, // cheapest tier, fine for referee summaries
}

fn model_to_string(model: Model) -> String {
    match model {
        Model::Grok4 => "grok-4".to_string(),
        Model::Grok3 => "grok-3".to_string(),
        Model::Grok3Mini => "grok-3-mini".to_string(),
        Model::Grok3MiniFast => "grok-3-mini-fast".to_string(),
    }
}

impl GrokClient {
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        GrokClient {
            client: OpenAIClient::new_with_base_url(
                secret_key,
                model_name,
                "https://api.x.ai",
                "/v1/chat/completions",
            ),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for GrokClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(&self, messages: &[Message]) -> Result<Message, Box<dyn Error>> {
        self.client.send_message(messages).await
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        self.client.usage_slot()
    }

    fn call_gate(&self) -> Option<&CallGate> {
        self.client.call_gate()
    }
}
