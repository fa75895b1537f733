//! Configuration for a medcouncil debate.
//!
//! Provides [`CouncilConfig`] for the round loop and [`ProviderKeys`] for the LLM
//! providers a council may call. Users construct these manually; no file parsing
//! dependencies are required. Every value is validated before a debate starts so a
//! misconfiguration surfaces as a [`ConfigError`] instead of a stalled session.
//!
//! # Example
//!
//! ```rust
//! use medcouncil::config::CouncilConfig;
//! use medcouncil::repetition::DetectorConfig;
//!
//! let config = CouncilConfig {
//!     max_rounds: 20,
//!     detector: DetectorConfig::new(5, 0.8, 3).unwrap(),
//!     ..CouncilConfig::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use crate::clients::common::RetryPolicy;
use crate::medcouncil::repetition::DetectorConfig;
use crate::medcouncil::roster::{Language, Provider};
use std::env;
use std::error::Error;
use std::fmt;

/// Errors raised when a detector, policy, or council is configured with values that
/// would make the debate loop meaningless.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `max_history` must retain at least one utterance.
    ZeroMaxHistory,
    /// `min_keywords` must be at least one.
    ZeroMinKeywords,
    /// The similarity threshold must be a finite number in `(0, 1]`.
    SimilarityThresholdOutOfRange(f64),
    /// A stagnation window of zero rounds would fire on every round.
    ZeroStagnationThreshold,
    /// The debate needs at least one round.
    ZeroMaxRounds,
    /// Referees must be reset on a positive period.
    ZeroRefereeResetPeriod,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroMaxHistory => write!(f, "max_history must be greater than 0"),
            ConfigError::ZeroMinKeywords => write!(f, "min_keywords must be greater than 0"),
            ConfigError::SimilarityThresholdOutOfRange(value) => write!(
                f,
                "similarity_threshold must be in (0, 1], got {}",
                value
            ),
            ConfigError::ZeroStagnationThreshold => {
                write!(f, "stagnation threshold must be greater than 0")
            }
            ConfigError::ZeroMaxRounds => write!(f, "max_rounds must be greater than 0"),
            ConfigError::ZeroRefereeResetPeriod => {
                write!(f, "referee_reset_period must be greater than 0")
            }
        }
    }
}

impl Error for ConfigError {}

/// Settings for one [`DiagnosisDebate`](crate::debate::DiagnosisDebate) session.
#[derive(Debug, Clone)]
pub struct CouncilConfig {
    /// Absolute ceiling on the number of rounds, independent of stagnation.
    pub max_rounds: u32,
    /// Repetition detector settings applied to every specialist.
    pub detector: DetectorConfig,
    /// Consecutive unchanged rounds before the stagnation policy intervenes.
    pub stagnation_threshold: usize,
    /// Referees are reset every `referee_reset_period` rounds after their
    /// initialization round.
    pub referee_reset_period: u32,
    /// Language every persona answers in.
    pub language: Language,
    /// Run the cross-counter stage between the referee check and the final judgment.
    pub cross_examination: bool,
    /// Maximum characters of each opinion quoted to the referee.
    pub transcript_excerpt_chars: usize,
    /// Retry behaviour for every LLM call made by the council.
    pub retry: RetryPolicy,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        CouncilConfig {
            max_rounds: 100,
            detector: DetectorConfig::default(),
            stagnation_threshold: 10,
            referee_reset_period: 5,
            language: Language::English,
            cross_examination: true,
            transcript_excerpt_chars: 800,
            retry: RetryPolicy::default(),
        }
    }
}

impl CouncilConfig {
    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_rounds == 0 {
            return Err(ConfigError::ZeroMaxRounds);
        }
        if self.stagnation_threshold == 0 {
            return Err(ConfigError::ZeroStagnationThreshold);
        }
        if self.referee_reset_period == 0 {
            return Err(ConfigError::ZeroRefereeResetPeriod);
        }
        self.detector.validate()
    }
}

/// API keys for the providers a council can draw doctors and referees from.
///
/// A provider without a key is simply unavailable.
#[derive(Clone, Default)]
pub struct ProviderKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
    pub gemini: Option<String>,
    pub xai: Option<String>,
}

impl fmt::Debug for ProviderKeys {
    // keys never end up in logs
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderKeys")
            .field("anthropic", &self.anthropic.is_some())
            .field("openai", &self.openai.is_some())
            .field("gemini", &self.gemini.is_some())
            .field("xai", &self.xai.is_some())
            .finish()
    }
}

impl ProviderKeys {
    /// Read keys from the process environment.
    ///
    /// `GEMINI_API_KEY` falls back to `GOOGLE_API_KEY` and `XAI_API_KEY` falls back to
    /// `GROK_API_KEY`. Empty values count as missing.
    pub fn from_env() -> Self {
        ProviderKeys {
            anthropic: read_key(&["ANTHROPIC_API_KEY"]),
            openai: read_key(&["OPENAI_API_KEY"]),
            gemini: read_key(&["GEMINI_API_KEY", "GOOGLE_API_KEY"]),
            xai: read_key(&["XAI_API_KEY", "GROK_API_KEY"]),
        }
    }

    /// The key configured for `provider`, if any.
    pub fn key_for(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::Claude => self.anthropic.as_deref(),
            Provider::Gpt => self.openai.as_deref(),
            Provider::Gemini => self.gemini.as_deref(),
            Provider::Grok => self.xai.as_deref(),
        }
    }

    /// Providers with a key, in the fixed order Claude, GPT, Gemini, Grok.
    pub fn available_providers(&self) -> Vec<Provider> {
        Provider::all()
            .iter()
            .copied()
            .filter(|provider| self.key_for(*provider).is_some())
            .collect()
    }
}

fn read_key(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    })
}
