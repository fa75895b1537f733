//! The `OpenAIClient` struct implements `ClientWrapper` for OpenAI's Chat API,
//! capturing both the assistant response and detailed token usage (input vs output)
//! for cost tracking.
//!
//! The other providers (Claude, Gemini, Grok) expose OpenAI compatible chat endpoints, so
//! their wrappers delegate to an `OpenAIClient` pointed at a different base URL.
//!
//! # Example
//!
//! ```rust,no_run
//! use medcouncil::clients::openai::{OpenAIClient, Model};
//! use medcouncil::client_wrapper::{ClientWrapper, Message, Role};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let secret_key = std::env::var("OPENAI_API_KEY")?;
//!     let client = OpenAIClient::new_with_model_enum(&secret_key, Model::GPT41Mini);
//!
//!     let resp = client
//!         .send_message(&[
//!             Message::new(Role::System, "You are a terse clinician."),
//!             Message::new(Role::User, "Name two causes of ptosis."),
//!         ])
//!         .await?;
//!     println!("Assistant: {}", resp.content);
//!
//!     if let Some(usage) = client.get_last_usage() {
//!         println!("Tokens: {}", usage.total_tokens);
//!     }
//!     Ok(())
//! }
//! ```
use std::error::Error;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use openai_rust::chat;
use openai_rust2 as openai_rust;

use crate::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};
use crate::clients::common::{send_and_track, CallGate};

/// Model identifiers supported by OpenAI's Chat Completions API.
pub enum Model {
    /// `gpt-5` – high reasoning, medium latency.
    GPT5,
    /// `gpt-5-mini` – fast variant of GPT-5.
    GPT5Mini,
    /// `gpt-4o` – Omni model with text + image inputs.
    GPT4o,
    /// `gpt-4o-mini` – cost effective GPT-4o derivative.
    GPT4oMini,
    /// `gpt-4.1` – general availability GPT-4.1.
    GPT41,
    /// `gpt-4.1-mini` – reduced cost GPT-4.1 tier.
    GPT41Mini,
    /// `gpt-4.1-nano` – ultra low cost GPT-4.1 derivative.
    GPT41Nano,
    /// `gpt-4` – the model the original council prompts were tuned on.
    GPT4,
}

/// Convert a [`Model`] variant into the string identifier expected by the REST API.
pub fn model_to_string(model: Model) -> String {
    match model {
        Model::GPT5 => "gpt-5".to_string(),
        Model::GPT5Mini => "gpt-5-mini".to_string(),
        Model::GPT4o => "gpt-4o".to_string(),
        Model::GPT4oMini => "gpt-4o-mini".to_string(),
        Model::GPT41 => "gpt-4.1".to_string(),
        Model::GPT41Mini => "gpt-4.1-mini".to_string(),
        Model::GPT41Nano => "gpt-4.1-nano".to_string(),
        Model::GPT4 => "gpt-4".to_string(),
    }
}

/// Client wrapper for OpenAI's Chat Completions API.
///
/// The wrapper maintains the selected model identifier plus an internal [`TokenUsage`] slot so
/// callers can inspect how many tokens each request consumed.
pub struct OpenAIClient {
    /// Underlying SDK client pointing at the REST endpoint.
    client: openai_rust::Client,
    /// Model name that will be injected into each request.
    model: String,
    /// Path appended to the base URL for chat completions.
    url_path: String,
    /// Storage for the token usage returned by the most recent request.
    token_usage: Mutex<Option<TokenUsage>>,
    /// Spacing between consecutive requests on this client.
    call_gate: CallGate,
}

impl OpenAIClient {
    /// Construct a new client using the provided API key and [`Model`] variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_string(secret_key, &model_to_string(model))
    }

    /// Construct a new client using the provided API key and explicit model name.
    pub fn new_with_model_string(secret_key: &str, model_name: &str) -> Self {
        OpenAIClient {
            client: openai_rust::Client::new(secret_key),
            model: model_name.to_string(),
            url_path: "/v1/chat/completions".to_string(),
            token_usage: Mutex::new(None),
            call_gate: CallGate::default(),
        }
    }

    /// Construct a client targeting a custom OpenAI compatible base URL.
    ///
    /// `url_path` is appended to `base_url` for every chat completion request.
    pub fn new_with_base_url(
        secret_key: &str,
        model_name: &str,
        base_url: &str,
        url_path: &str,
    ) -> Self {
        OpenAIClient {
            client: openai_rust::Client::new_with_base_url(secret_key, base_url),
            model: model_name.to_string(),
            url_path: url_path.to_string(),
            token_usage: Mutex::new(None),
            call_gate: CallGate::default(),
        }
    }

    /// Replace the default half-second spacing between requests.
    pub fn with_min_call_interval(mut self, interval: Duration) -> Self {
        self.call_gate = CallGate::new(interval);
        self
    }
}

/// Convert crate messages into the wire format expected by `openai_rust`.
pub(crate) fn format_messages(messages: &[Message]) -> Vec<chat::Message> {
    let mut formatted_messages = Vec::with_capacity(messages.len());
    for msg in messages {
        formatted_messages.push(chat::Message {
            role: match msg.role {
                Role::System => "system".to_owned(),
                Role::User => "user".to_owned(),
                Role::Assistant => "assistant".to_owned(),
            },
            content: msg.content.to_string(),
        });
    }
    formatted_messages
}

#[async_trait]
impl ClientWrapper for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(&self, messages: &[Message]) -> Result<Message, Box<dyn Error>> {
        let result = send_and_track(
            &self.client,
            &self.model,
            format_messages(messages),
            Some(self.url_path.clone()),
            &self.token_usage,
        )
        .await;

        match result {
            Ok(content) => Ok(Message::new(Role::Assistant, content)),
            Err(err) => {
                if log::log_enabled!(log::Level::Error) {
                    log::error!(
                        "OpenAIClient::send_message(...) [{}]: {}",
                        self.model,
                        err
                    );
                }
                Err(err)
            }
        }
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.token_usage)
    }

    fn call_gate(&self) -> Option<&CallGate> {
        Some(&self.call_gate)
    }
}
