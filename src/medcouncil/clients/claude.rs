//! Anthropic Claude client wrapper built on the OpenAI-compatible transport.
//!
//! Use this module when you want to call Anthropic's Claude models through the same
//! [`ClientWrapper`] interface used by the rest of the crate. The wrapper delegates HTTP
//! concerns to the shared OpenAI implementation, so swapping a specialist from OpenAI to
//! Claude only requires a different constructor.
//!
//! # Example
//!
//! ```rust,no_run
//! use medcouncil::client_wrapper::{ClientWrapper, Message, Role};
//! use medcouncil::clients::claude::{ClaudeClient, Model};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("ANTHROPIC_API_KEY")?;
//!     let client = ClaudeClient::new_with_model_enum(&key, Model::ClaudeSonnet4);
//!     let reply = client
//!         .send_message(&[Message::new(Role::User, "List three causes of diplopia.")])
//!         .await?;
//!     println!("{}", reply.content);
//!     Ok(())
//! }
//! ```

use crate::client_wrapper::{ClientWrapper, Message, TokenUsage};
use crate::clients::common::CallGate;
use crate::clients::openai::OpenAIClient;
use async_trait::async_trait;
use std::error::Error;
use std::sync::Mutex;

/// Client wrapper for Anthropic's Claude API routed through the OpenAI compatible surface.
pub struct ClaudeClient {
    /// Delegated client that handles the HTTP interactions.
    delegate_client: OpenAIClient,
    /// Exposed model name.
    model: String,
}

/// Anthropic Claude models available through the compatibility layer.
pub enum Model {
    /// `claude-sonnet-4-5` – strongest model for long clinical reasoning chains.
    ClaudeSonnet45,
    /// `claude-haiku-4-5` – fastest current tier.
    ClaudeHaiku45,
    /// `claude-opus-4-1` – Opus reasoning tier.
    ClaudeOpus41,
    /// `claude-sonnet-4-20250514` – the snapshot the council defaults to.
    ClaudeSonnet4,
}

/// Convert a [`Model`] variant into its public string identifier.
fn model_to_string(model: Model) -> String {
    match model {
        Model::ClaudeSonnet45 => "claude-sonnet-4-5".to_string(),
        Model::ClaudeHaiku45 => "claude-haiku-4-5".to_string(),
        Model::ClaudeOpus41 => "claude-opus-4-1".to_string(),
        Model::ClaudeSonnet4 => "claude-sonnet-4-20250514".to_string(),
    }
}

impl ClaudeClient {
    /// Create a client from an API key and strongly typed model variant.
    pub fn new_with_model_enum(secret_key: &str, model: Model) -> Self {
        Self::new_with_model_str(secret_key, &model_to_string(model))
    }

    /// Create a client from an API key and explicit model string.
    pub fn new_with_model_str(secret_key: &str, model_name: &str) -> Self {
        Self::new_with_base_url(secret_key, model_name, "https://api.anthropic.com")
    }

    /// Create a client pointing at a custom Claude-compatible base URL.
    pub fn new_with_base_url(secret_key: &str, model_name: &str, base_url: &str) -> Self {
        ClaudeClient {
            // we reuse the OpenAIClient for Claude and delegate the calls to it
            delegate_client: OpenAIClient::new_with_base_url(
                secret_key,
                model_name,
                base_url,
                "/v1/chat/completions",
            ),
            model: model_name.to_string(),
        }
    }
}

#[async_trait]
impl ClientWrapper for ClaudeClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(&self, messages: &[Message]) -> Result<Message, Box<dyn Error>> {
        self.delegate_client.send_message(messages).await
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        self.delegate_client.usage_slot()
    }

    fn call_gate(&self) -> Option<&CallGate> {
        self.delegate_client.call_gate()
    }
}
