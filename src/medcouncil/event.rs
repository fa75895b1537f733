//! Debate event system.
//!
//! Provides a callback-based observability layer for [`DiagnosisDebate`] runs.
//! Implement [`EventHandler`] to receive real-time notifications about:
//!
//! - **Run lifecycle**: start and end of a debate, with the final outcome
//! - **Round boundaries**: which referee presides, which referees were reset
//! - **Speaker turns**: every successful or failed LLM call, per stage
//! - **Control decisions**: repetition flags, consensus verdicts, stagnation checks,
//!   and interventions
//!
//! The single method has a default no-op implementation, so you only override what
//! you care about. Register a handler with
//! [`DiagnosisDebate::with_event_handler`](crate::debate::DiagnosisDebate::with_event_handler).
//!
//! # Example
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use medcouncil::event::{DebateEvent, EventHandler};
//!
//! struct ConsoleHandler;
//!
//! #[async_trait]
//! impl EventHandler for ConsoleHandler {
//!     async fn on_debate_event(&self, event: &DebateEvent) {
//!         match event {
//!             DebateEvent::RoundStarted { round, active_referee } => {
//!                 println!("round {} refereed by {}", round, active_referee);
//!             }
//!             DebateEvent::SpeakerFailed { speaker, error, .. } => {
//!                 eprintln!("{} failed: {}", speaker, error);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```
//!
//! [`DiagnosisDebate`]: crate::debate::DiagnosisDebate

use crate::client_wrapper::TokenUsage;
use crate::medcouncil::consensus::ConsensusVerdict;
use crate::medcouncil::debate::{DebateOutcome, DebateStage};
use crate::medcouncil::stagnation::{RoundEvaluation, StagnationAction};
use async_trait::async_trait;

/// Events emitted by a [`DiagnosisDebate`](crate::debate::DiagnosisDebate) run.
///
/// # Event Flow (one round)
///
/// ```text
/// RoundStarted
///   └─ RefereeReset (0..n)
///   └─ StageStarted { Opinion }
///       ├─ SpeakerResponded / SpeakerFailed (per doctor turn)
///       └─ RepetitionDetected (per flagged turn)
///   └─ StageStarted { RefereeCheck } → SpeakerResponded → ConsensusChecked
///   └─ StageStarted { CrossCounter } → SpeakerResponded ...
///   └─ StageStarted { FinalJudgment } → SpeakerResponded → ConsensusChecked
///   └─ StagnationChecked
///   └─ InterventionFired (when the policy fires)
/// RoundCompleted
/// ```
#[derive(Debug, Clone)]
pub enum DebateEvent {
    /// Fired once the roster is built, before round 1.
    RunStarted {
        session_id: String,
        specialties: Vec<String>,
        doctors: usize,
        groups: usize,
        max_rounds: u32,
    },
    RoundStarted {
        round: u32,
        active_referee: String,
    },
    /// A referee's memory was wiped at the start of `round`.
    RefereeReset {
        round: u32,
        referee: String,
    },
    StageStarted {
        round: u32,
        stage: DebateStage,
    },
    SpeakerResponded {
        round: u32,
        stage: DebateStage,
        speaker: String,
        model: String,
        /// `None` if the provider did not report usage.
        tokens_used: Option<TokenUsage>,
        response_length: usize,
    },
    /// An LLM call failed after all retries. The debate continues without the turn.
    SpeakerFailed {
        round: u32,
        stage: DebateStage,
        speaker: String,
        error: String,
    },
    RepetitionDetected {
        round: u32,
        speaker: String,
        score: f64,
        matched_round: Option<u32>,
    },
    ConsensusChecked {
        round: u32,
        stage: DebateStage,
        verdict: ConsensusVerdict,
    },
    StagnationChecked {
        round: u32,
        evaluation: RoundEvaluation,
    },
    InterventionFired {
        round: u32,
        action: StagnationAction,
        distinct_opinions: Vec<String>,
    },
    RoundCompleted {
        round: u32,
        distinct_opinions: usize,
    },
    RunCompleted {
        session_id: String,
        outcome: DebateOutcome,
        rounds: u32,
        total_tokens: usize,
    },
}

/// Receives [`DebateEvent`]s. Shared as `Arc<dyn EventHandler>`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_debate_event(&self, _event: &DebateEvent) {}
}
