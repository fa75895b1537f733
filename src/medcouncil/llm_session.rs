//! The `llm_session` module manages a conversational session with an LLM,
//! handling message history, context pruning, and token accounting.
//!
//! Referees and the intake interviewer keep an `LLMSession` because they need to
//! remember what they said in earlier rounds; specialists do not.
//!
//! **Key features:**
//! - **Automatic context trimming**: the oldest messages are dropped once the provider
//!   reports more than `max_tokens` for a request.
//! - **Token tracking**: accumulates input and output tokens across calls.
//! - **Resettable memory**: [`LLMSession::clear_history`] forgets the conversation while
//!   keeping the system prompt and token totals.
//! - **Retries**: every call goes through [`send_with_retry`].
//!
//! ## Quickstart
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use medcouncil::client_wrapper::Role;
//! use medcouncil::clients::openai::{Model, OpenAIClient};
//! use medcouncil::LLMSession;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = OpenAIClient::new_with_model_enum("YOUR_OPENAI_KEY", Model::GPT41Nano);
//! let mut session = LLMSession::new(
//!     Arc::new(client),
//!     "You are an impartial diagnosis referee.".into(),
//!     8_192,
//! );
//!
//! let reply = session.send_message(Role::User, "Review these opinions...".into()).await?;
//! println!("Referee: {}", reply.content);
//! println!("Tokens so far: {}", session.token_usage().total_tokens);
//! # Ok(())
//! # }
//! ```

use crate::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};
use crate::clients::common::{send_with_retry, RetryPolicy};
use std::error::Error;
use std::sync::Arc;

/// A conversation session with an LLM, including:
///
/// - `client`: the `ClientWrapper` doing the calls.
/// - `system_prompt`: the context-steering system message, sent first on every call.
/// - `conversation_history`: user & assistant messages (excluding the system prompt).
/// - `max_tokens`: configured context window size.
/// - `total_input_tokens` / `total_output_tokens`: sums over every call so far.
pub struct LLMSession {
    client: Arc<dyn ClientWrapper>,
    system_prompt: Message,
    conversation_history: Vec<Message>,
    max_tokens: usize,
    total_input_tokens: usize,
    total_output_tokens: usize,
    retry: RetryPolicy,
}

impl LLMSession {
    /// Creates a new `LLMSession` with the given client and system prompt.
    pub fn new(client: Arc<dyn ClientWrapper>, system_prompt: String, max_tokens: usize) -> Self {
        LLMSession {
            client,
            system_prompt: Message::new(Role::System, system_prompt),
            conversation_history: Vec::new(),
            max_tokens,
            total_input_tokens: 0,
            total_output_tokens: 0,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sends a message, receives the assistant's reply, and:
    /// 1. Sends the system prompt followed by the whole history
    /// 2. Pulls real token usage via `client.get_last_usage()`
    /// 3. Prunes oldest messages if the request exceeded `max_tokens`
    /// 4. Appends the reply to the history
    ///
    /// On failure the outgoing message is removed again so the history never holds an
    /// unanswered turn.
    pub async fn send_message(
        &mut self,
        role: Role,
        content: String,
    ) -> Result<Message, Box<dyn Error + Send + Sync>> {
        self.conversation_history.push(Message::new(role, content));

        let mut request = Vec::with_capacity(self.conversation_history.len() + 1);
        request.push(self.system_prompt.clone());
        request.extend(self.conversation_history.iter().cloned());

        let response = match send_with_retry(self.client.as_ref(), &request, &self.retry).await {
            Ok(response) => response,
            Err(err) => {
                self.conversation_history.pop();
                return Err(err);
            }
        };

        if let Some(usage) = self.client.get_last_usage() {
            self.total_input_tokens += usage.input_tokens;
            self.total_output_tokens += usage.output_tokens;

            if usage.total_tokens > self.max_tokens {
                // How many tokens we're over by
                let mut excess = usage.total_tokens - self.max_tokens;

                // Remove the oldest messages until we've cleared at least `excess` tokens
                while excess > 0 && !self.conversation_history.is_empty() {
                    let msg = self.conversation_history.remove(0);
                    excess = excess.saturating_sub(estimate_message_token_count(&msg));
                }
                log::debug!(
                    "{}: trimmed history to {} message(s)",
                    self.client.model_name(),
                    self.conversation_history.len()
                );
            }
        }

        self.conversation_history.push(response.clone());
        Ok(response)
    }

    /// Sets a new system prompt for the session.
    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = Message::new(Role::System, prompt);
    }

    pub fn system_prompt(&self) -> &Message {
        &self.system_prompt
    }

    /// Forget the conversation. The system prompt and token totals are kept.
    pub fn clear_history(&mut self) {
        self.conversation_history.clear();
    }

    pub fn history(&self) -> &[Message] {
        &self.conversation_history
    }

    pub fn client(&self) -> &Arc<dyn ClientWrapper> {
        &self.client
    }

    /// Returns the cumulative token usage statistics
    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            input_tokens: self.total_input_tokens,
            output_tokens: self.total_output_tokens,
            total_tokens: self.total_input_tokens + self.total_output_tokens,
        }
    }

    pub fn get_max_tokens(&self) -> usize {
        self.max_tokens
    }
}

/// Estimates the number of tokens in a string.
/// Uses an approximate formula: one token per 4 characters.
fn estimate_token_count(text: &str) -> usize {
    (text.len() / 4).max(1)
}

/// Estimates the number of tokens in a Message, including role annotations.
fn estimate_message_token_count(message: &Message) -> usize {
    // Assuming the role adds some fixed number of tokens, e.g., 1 token
    let role_token_count = 1;
    let content_token_count = estimate_token_count(&message.content);
    role_token_count + content_token_count
}
