use crate::client_wrapper::{ClientWrapper, Message, TokenUsage};
use openai_rust::chat;
use openai_rust2 as openai_rust;
use std::error::Error;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Spacing the concrete provider clients keep between consecutive requests.
pub const DEFAULT_MIN_CALL_INTERVAL: Duration = Duration::from_millis(500);

/// Send a chat request, record its usage, and return the assistant's content.
pub async fn send_and_track(
    api: &openai_rust::Client,
    model: &str,
    formatted_msgs: Vec<chat::Message>,
    url_path: Option<String>,
    usage_slot: &Mutex<Option<TokenUsage>>,
) -> Result<String, Box<dyn Error>> {
    let chat_arguments = chat::ChatArguments::new(model, formatted_msgs);

    let response = api.create_chat(chat_arguments, url_path).await;

    match response {
        Ok(response) => {
            let usage = TokenUsage {
                input_tokens: response.usage.prompt_tokens as usize,
                output_tokens: response.usage.completion_tokens as usize,
                total_tokens: response.usage.total_tokens as usize,
            };

            // Store it for get_last_usage()
            if let Ok(mut slot) = usage_slot.lock() {
                *slot = Some(usage);
            }

            match response.choices.first() {
                Some(choice) => Ok(choice.message.content.clone()),
                None => Err("LLM response contained no choices".into()),
            }
        }
        Err(err) => {
            log::error!(
                "medcouncil::clients::common::send_and_track(...): API Error: {}",
                err
            );
            Err(err.into())
        }
    }
}

/// Bounded retry with exponential backoff for a single LLM call.
///
/// Provider APIs throttle and fail transiently; the debate loop would rather
/// wait a couple of seconds than lose a specialist's turn.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Values below 1 behave as 1.
    pub max_attempts: usize,
    /// Delay before the second attempt; doubled after every further failure.
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(0),
        }
    }

    /// Backoff to wait after the given (1-based) failed attempt.
    pub fn backoff_after(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        self.initial_backoff * 2u32.pow(exponent)
    }
}

/// Enforces a minimum interval between the starts of consecutive calls on one client.
///
/// Concurrent callers queue on the gate, so a client shared by two debate groups
/// still sends its requests at least `min_interval` apart.
#[derive(Debug)]
pub struct CallGate {
    min_interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl CallGate {
    pub fn new(min_interval: Duration) -> Self {
        CallGate {
            min_interval,
            last_call: tokio::sync::Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the interval since the previous call has elapsed, then claim the slot.
    pub async fn wait_turn(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                log::debug!("rate limiting: waiting until {:?}", ready_at);
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

impl Default for CallGate {
    fn default() -> Self {
        CallGate::new(DEFAULT_MIN_CALL_INTERVAL)
    }
}

/// Call `client.send_message` until it succeeds or the policy's attempts run out.
///
/// Every attempt first passes the client's [`CallGate`], when it has one.
/// The returned error carries the message of the last failure.
pub async fn send_with_retry(
    client: &dyn ClientWrapper,
    messages: &[Message],
    policy: &RetryPolicy,
) -> Result<Message, Box<dyn Error + Send + Sync>> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        if let Some(gate) = client.call_gate() {
            gate.wait_turn().await;
        }
        match client.send_message(messages).await {
            Ok(message) => return Ok(message),
            Err(err) => {
                last_error = err.to_string();
            }
        }

        if attempt < attempts {
            let wait = policy.backoff_after(attempt);
            log::warn!(
                "{} failed (attempt {}/{}): {}; retrying in {:?}",
                client.model_name(),
                attempt,
                attempts,
                last_error,
                wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    Err(format!(
        "{} failed after {} attempt(s): {}",
        client.model_name(),
        attempts,
        last_error
    )
    .into())
}
