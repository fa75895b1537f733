//! Round-over-round stagnation tracking.
//!
//! After every round the orchestrator tallies the diagnoses its specialists hold
//! ([`OpinionTally`]) and feeds the distinct labels to a [`StagnationPolicy`]. When the
//! same set of opinions survives `threshold` consecutive rounds the policy fires once
//! and picks an intervention:
//!
//! | distinct opinions | action                                   |
//! |-------------------|------------------------------------------|
//! | 2                 | [`StagnationAction::TerminateParallel`]  |
//! | 3 or more         | [`StagnationAction::InjectPerspective`]  |
//! | 1                 | [`StagnationAction::None`] (passthrough) |
//!
//! Firing resets the counter, so at most one intervention happens per window.

use crate::medcouncil::config::ConfigError;
use crate::medcouncil::consensus::canonical_label;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// What the orchestrator should do about a stalled debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagnationAction {
    None,
    /// End the debate and report both opinions side by side.
    TerminateParallel,
    /// Add a neutral viewpoint and keep debating.
    InjectPerspective,
}

/// Result of [`StagnationPolicy::evaluate_round`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundEvaluation {
    pub fired: bool,
    pub action: StagnationAction,
    /// Counter value after this round (zero right after firing).
    pub consecutive_unchanged_rounds: usize,
    pub distinct_opinions: usize,
}

/// Counts consecutive rounds with an unchanged opinion set.
///
/// The first non-empty round opens the window and counts as one unchanged round, so a
/// set that never changes fires on round `threshold`. A changed set restarts the count
/// at zero. An empty set (every specialist failed to answer) clears the window.
#[derive(Debug, Clone)]
pub struct StagnationPolicy {
    threshold: usize,
    consecutive_unchanged_rounds: usize,
    previous: Option<BTreeSet<String>>,
}

impl StagnationPolicy {
    pub fn new(threshold: usize) -> Result<Self, ConfigError> {
        if threshold == 0 {
            return Err(ConfigError::ZeroStagnationThreshold);
        }
        Ok(StagnationPolicy {
            threshold,
            consecutive_unchanged_rounds: 0,
            previous: None,
        })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn consecutive_unchanged_rounds(&self) -> usize {
        self.consecutive_unchanged_rounds
    }

    /// Update the counter with this round's distinct opinion labels.
    pub fn evaluate_round<I, S>(&mut self, distinct_opinions: I) -> RoundEvaluation
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let current: BTreeSet<String> = distinct_opinions.into_iter().map(Into::into).collect();

        if current.is_empty() {
            self.previous = None;
            self.consecutive_unchanged_rounds = 0;
            return RoundEvaluation {
                fired: false,
                action: StagnationAction::None,
                consecutive_unchanged_rounds: 0,
                distinct_opinions: 0,
            };
        }

        match &self.previous {
            None => self.consecutive_unchanged_rounds = 1,
            Some(previous) if *previous == current => self.consecutive_unchanged_rounds += 1,
            Some(_) => self.consecutive_unchanged_rounds = 0,
        }
        let distinct = current.len();
        self.previous = Some(current);

        if self.consecutive_unchanged_rounds < self.threshold {
            return RoundEvaluation {
                fired: false,
                action: StagnationAction::None,
                consecutive_unchanged_rounds: self.consecutive_unchanged_rounds,
                distinct_opinions: distinct,
            };
        }

        self.consecutive_unchanged_rounds = 0;
        let action = match distinct {
            1 => {
                log::warn!(
                    "stagnation window elapsed on a single unanimous opinion; consensus check should have ended the debate"
                );
                StagnationAction::None
            }
            2 => StagnationAction::TerminateParallel,
            _ => StagnationAction::InjectPerspective,
        };
        log::info!(
            "stagnation: {} distinct opinion(s) unchanged for {} rounds, action {:?}",
            distinct,
            self.threshold,
            action
        );

        RoundEvaluation {
            fired: true,
            action,
            consecutive_unchanged_rounds: 0,
            distinct_opinions: distinct,
        }
    }
}

/// Diagnosis label to the specialists holding it, rebuilt every round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OpinionTally {
    holders: BTreeMap<String, Vec<String>>,
}

impl OpinionTally {
    pub fn new() -> Self {
        OpinionTally::default()
    }

    /// Record that `holder` holds `diagnosis`. Labels are canonicalized first; a label
    /// that canonicalizes to nothing is ignored.
    pub fn record(&mut self, holder: &str, diagnosis: &str) {
        let label = canonical_label(diagnosis);
        if label.is_empty() {
            return;
        }
        let holders = self.holders.entry(label).or_insert_with(Vec::new);
        if !holders.iter().any(|h| h == holder) {
            holders.push(holder.to_string());
        }
    }

    pub fn distinct_labels(&self) -> BTreeSet<String> {
        self.holders.keys().cloned().collect()
    }

    pub fn holders_of(&self, label: &str) -> &[String] {
        self.holders
            .get(&canonical_label(label))
            .map(|holders| holders.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.holders.iter()
    }
}
