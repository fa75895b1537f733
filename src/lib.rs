//! # MedCouncil
//!
//! MedCouncil convenes a council of LLM-backed specialist doctors from several providers
//! (Anthropic Claude, OpenAI, Google Gemini, xAI Grok), lets them debate a patient case
//! under the eye of two alternating referees, and reports either a consensus diagnosis,
//! two co-equal parallel opinions, or the opinions standing when the round limit is hit.
//!
//! The crate is layered bottom-up:
//!
//! * [`ClientWrapper`] and [`clients`]: one trait, four OpenAI-compatible providers, with
//!   retry and token accounting in [`clients::common`].
//! * [`LLMSession`]: a rolling conversation with context trimming; referees and the
//!   intake interviewer keep one.
//! * [`repetition`]: keyword-set Jaccard similarity against a bounded per-speaker history,
//!   used to catch doctors who restate their earlier answers.
//! * [`stagnation`]: counts rounds whose set of distinct opinions did not change and
//!   decides whether to end the debate or ask for a neutral perspective.
//! * [`consensus`]: reads consensus verdicts and diagnosis lines out of free text.
//! * [`roster`], [`patient`], [`intake`]: who debates, about whom.
//! * [`debate`]: the round loop tying everything together, observable through [`event`].
//!
//! ## Detecting repetition
//!
//! ```rust
//! use medcouncil::repetition::{DetectorConfig, RepetitionDetector};
//!
//! let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());
//! let text = "Myasthenia gravis explains fluctuating ptosis and diplopia";
//!
//! assert!(!detector.check(text, "Dr. Kim", 1).is_repetition);
//! let verdict = detector.check(text, "Dr. Kim", 2);
//! assert!(verdict.is_repetition);
//! assert_eq!(verdict.matched_round, Some(1));
//! ```
//!
//! ## Running a debate
//!
//! ```rust,no_run
//! use medcouncil::config::{CouncilConfig, ProviderKeys};
//! use medcouncil::debate::DiagnosisDebate;
//! use medcouncil::patient::PatientCase;
//! use medcouncil::roster::ProviderPool;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     medcouncil::init_logger();
//!     let pool = ProviderPool::from_keys(&ProviderKeys::from_env());
//!     let debate = DiagnosisDebate::new(CouncilConfig::default(), pool)?;
//!     let report = debate.run(&PatientCase::sample()).await?;
//!     println!("{:?} after {} rounds", report.outcome, report.rounds);
//!     Ok(())
//! }
//! ```

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding MedCouncil opt in to `RUST_LOG` driven diagnostics with this;
/// the library itself only emits through the `log` facade.
///
/// ```rust
/// medcouncil::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `medcouncil` module.
pub mod medcouncil;

pub use medcouncil::client_wrapper;
pub use medcouncil::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};
pub use medcouncil::clients;
pub use medcouncil::config;
pub use medcouncil::consensus;
pub use medcouncil::debate;
pub use medcouncil::debate::{DebateOutcome, DiagnosisDebate, DiagnosisReport};
pub use medcouncil::event;
pub use medcouncil::event::{DebateEvent, EventHandler};
pub use medcouncil::intake;
pub use medcouncil::llm_session::LLMSession;
pub use medcouncil::patient;
pub use medcouncil::repetition;
pub use medcouncil::roster;
pub use medcouncil::stagnation;
