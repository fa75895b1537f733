//! The refereed diagnosis debate.
//!
//! [`DiagnosisDebate`] convenes a roster for a [`PatientCase`] and runs bounded rounds
//! until the referee declares consensus, the stagnation policy ends the debate with
//! parallel opinions, or the round ceiling is reached.
//!
//! # Round structure
//!
//! ```text
//! 1. reset due referees, pick the active referee (referees[round % 2])
//! 2. Opinion         every group concurrently: doctor 1, then doctor 2 (who sees doctor 1)
//! 3. repetition      all opinion turns checked against the pre-round history
//! 4. Referee check   consensus here ends the debate immediately
//! 5. Cross-counter   every doctor that spoke rebuts the others (optional)
//! 6. Final judgment  the active referee decides on consensus
//! 7. stagnation      tally -> policy -> terminate in parallel or inject a perspective
//! ```
//!
//! Failed LLM calls are logged and reported as [`DebateEvent::SpeakerFailed`]; the
//! round continues without that turn. A failed referee call counts as no consensus.
//!
//! # Example
//!
//! ```rust,no_run
//! use medcouncil::config::{CouncilConfig, ProviderKeys};
//! use medcouncil::debate::DiagnosisDebate;
//! use medcouncil::patient::PatientCase;
//! use medcouncil::roster::ProviderPool;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ProviderPool::from_keys(&ProviderKeys::from_env());
//! let debate = DiagnosisDebate::new(CouncilConfig::default(), pool)?;
//! let report = debate.run(&PatientCase::sample()).await?;
//! println!("{}", report.to_json_pretty()?);
//! # Ok(())
//! # }
//! ```

use crate::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};
use crate::clients::common::{send_with_retry, RetryPolicy};
use crate::medcouncil::config::{ConfigError, CouncilConfig};
use crate::medcouncil::consensus::{parse_consensus, ConsensusVerdict, DiagnosisOpinion, VerdictSource};
use crate::medcouncil::event::{DebateEvent, EventHandler};
use crate::medcouncil::patient::{PatientCase, PatientError};
use crate::medcouncil::repetition::RepetitionDetector;
use crate::medcouncil::roster::{
    active_referee_index, build_doctor_pool, build_referees, circular_groups, Doctor, Language,
    Provider, ProviderPool, Referee, RosterError,
};
use crate::medcouncil::stagnation::{OpinionTally, StagnationAction, StagnationPolicy};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Speaker name used for injected perspectives.
pub const CONSULTANT_NAME: &str = "Independent Consultant";

/// Marker prepended to referee feedback when that referee had just been reset.
pub const RESET_TAG: &str = "[RESET_FRESH_VOICE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStage {
    Opinion,
    RefereeCheck,
    CrossCounter,
    FinalJudgment,
    /// A neutral perspective requested by the stagnation policy.
    Intervention,
}

/// How a debate ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DebateOutcome {
    /// The referee declared consensus.
    Consensus { diagnosis: Option<String> },
    /// Two opinions survived the stagnation window and are reported as co-equal.
    ParallelOpinions { opinions: Vec<String> },
    MaxRoundsReached,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub round: u32,
    pub stage: DebateStage,
    pub speaker: String,
    pub model: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterventionRecord {
    pub round: u32,
    pub action: StagnationAction,
    pub distinct_opinions: Vec<String>,
    /// The injected perspective, when one was requested and obtained.
    pub perspective: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefereeResetRecord {
    pub round: u32,
    pub referee: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoctorSummary {
    pub name: String,
    pub specialty: String,
    pub provider: Provider,
    pub model: String,
}

/// Everything a finished debate produced.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisReport {
    pub session_id: String,
    pub outcome: DebateOutcome,
    pub rounds: u32,
    pub language: Language,
    pub specialties: Vec<String>,
    pub doctors: Vec<DoctorSummary>,
    /// Latest opinion of every doctor that ever answered.
    pub final_opinions: Vec<DiagnosisOpinion>,
    pub final_tally: OpinionTally,
    pub repetitions_detected: usize,
    pub interventions: Vec<InterventionRecord>,
    pub referee_resets: Vec<RefereeResetRecord>,
    pub transcript: Vec<TranscriptEntry>,
    pub total_tokens: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DiagnosisReport {
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug)]
pub enum DebateError {
    Config(ConfigError),
    Roster(RosterError),
    Patient(PatientError),
    /// The intake interview could not produce a usable case.
    Intake(String),
}

impl fmt::Display for DebateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebateError::Config(err) => write!(f, "Configuration error: {}", err),
            DebateError::Roster(err) => write!(f, "Roster error: {}", err),
            DebateError::Patient(err) => write!(f, "{}", err),
            DebateError::Intake(msg) => write!(f, "Intake failed: {}", msg),
        }
    }
}

impl Error for DebateError {}

impl From<ConfigError> for DebateError {
    fn from(err: ConfigError) -> Self {
        DebateError::Config(err)
    }
}

impl From<RosterError> for DebateError {
    fn from(err: RosterError) -> Self {
        DebateError::Roster(err)
    }
}

impl From<PatientError> for DebateError {
    fn from(err: PatientError) -> Self {
        DebateError::Patient(err)
    }
}

/// A successful LLM turn.
struct Turn {
    speaker: String,
    model: String,
    text: String,
    usage: Option<TokenUsage>,
}

struct FailedTurn {
    speaker: String,
    error: String,
}

type TurnResult = Result<Turn, FailedTurn>;

struct Roster {
    doctors: Vec<Doctor>,
    referees: Vec<Referee>,
    groups: Vec<(usize, usize)>,
}

struct PreviousFeedback {
    round: u32,
    referee: String,
    text: String,
    was_reset: bool,
}

/// Mutable state of one run.
struct RunState {
    detector: RepetitionDetector,
    policy: StagnationPolicy,
    transcript: Vec<TranscriptEntry>,
    /// Tokens reported by every successful call.
    tokens: usize,
    repetitions: usize,
    interventions: Vec<InterventionRecord>,
    referee_resets: Vec<RefereeResetRecord>,
    previous_feedback: Option<PreviousFeedback>,
    /// Doctors whose opinion last round repeated an earlier one.
    flagged: HashSet<String>,
    perspective: Option<String>,
    opinions: BTreeMap<String, DiagnosisOpinion>,
    last_distinct: usize,
}

impl RunState {
    fn new(config: &CouncilConfig) -> Result<Self, ConfigError> {
        Ok(RunState {
            detector: RepetitionDetector::with_default_table(config.detector.clone()),
            policy: StagnationPolicy::new(config.stagnation_threshold)?,
            transcript: Vec::new(),
            tokens: 0,
            repetitions: 0,
            interventions: Vec::new(),
            referee_resets: Vec::new(),
            previous_feedback: None,
            flagged: HashSet::new(),
            perspective: None,
            opinions: BTreeMap::new(),
            last_distinct: 0,
        })
    }

    fn push_transcript(&mut self, round: u32, stage: DebateStage, turn: &Turn) {
        if let Some(usage) = &turn.usage {
            self.tokens += usage.total_tokens;
        }
        self.transcript.push(TranscriptEntry {
            round,
            stage,
            speaker: turn.speaker.clone(),
            model: turn.model.clone(),
            text: turn.text.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Fold a round's opinions into the standing ones. A reply without a diagnosis never
    /// replaces a doctor's earlier stated diagnosis.
    fn merge_opinions(&mut self, round_opinions: &BTreeMap<String, DiagnosisOpinion>) {
        for (speaker, opinion) in round_opinions {
            let keeps_earlier = opinion.diagnosis.is_none()
                && self
                    .opinions
                    .get(speaker)
                    .map_or(false, |earlier| earlier.diagnosis.is_some());
            if !keeps_earlier {
                self.opinions.insert(speaker.clone(), opinion.clone());
            }
        }
    }

    fn feedback_block(&self) -> String {
        let feedback = match &self.previous_feedback {
            Some(feedback) => feedback,
            None => return String::new(),
        };
        let reset_tag = if feedback.was_reset {
            format!(
                "\n{} This referee was reset: fresh perspective with no historical bias.",
                RESET_TAG
            )
        } else {
            String::new()
        };
        format!(
            "Previous round ({}) referee feedback (from {}):{}\n{}\n\n\
             Please consider the above feedback and provide a more accurate diagnosis this round.\n",
            feedback.round, feedback.referee, reset_tag, feedback.text
        )
    }
}

/// Runs refereed diagnosis debates with one configuration and provider pool.
pub struct DiagnosisDebate {
    config: CouncilConfig,
    pool: ProviderPool,
    event_handler: Option<Arc<dyn EventHandler>>,
}

impl DiagnosisDebate {
    /// Validate `config` and make sure at least one provider is available.
    pub fn new(config: CouncilConfig, pool: ProviderPool) -> Result<Self, DebateError> {
        config.validate()?;
        if pool.is_empty() {
            return Err(RosterError::NoProviders.into());
        }
        log::info!(
            "available providers: {:?}, language: {}",
            pool.providers(),
            config.language.display_name()
        );
        Ok(DiagnosisDebate {
            config,
            pool,
            event_handler: None,
        })
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    async fn emit(&self, event: DebateEvent) {
        if let Some(handler) = &self.event_handler {
            handler.on_debate_event(&event).await;
        }
    }

    /// Convene a roster for `case` and debate until an outcome is reached.
    pub async fn run(&self, case: &PatientCase) -> Result<DiagnosisReport, DebateError> {
        case.validate()?;
        let started_at = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let language = self.config.language;

        let specialties = case.select_specialties(language);
        log::info!("selected specialties: {}", specialties.join(", "));

        let doctors = build_doctor_pool(&specialties, &self.pool, language)?;
        let referees = build_referees(&self.pool, language, &self.config.retry)?;
        let groups = circular_groups(&doctors)?;
        let mut roster = Roster {
            doctors,
            referees,
            groups,
        };
        let context = case.context(language);
        let mut state = RunState::new(&self.config)?;

        self.emit(DebateEvent::RunStarted {
            session_id: session_id.clone(),
            specialties: specialties.clone(),
            doctors: roster.doctors.len(),
            groups: roster.groups.len(),
            max_rounds: self.config.max_rounds,
        })
        .await;

        let mut outcome = DebateOutcome::MaxRoundsReached;
        let mut rounds = 0;
        for round in 1..=self.config.max_rounds {
            rounds = round;
            let finished = self.play_round(round, &mut roster, &context, &mut state).await;
            self.emit(DebateEvent::RoundCompleted {
                round,
                distinct_opinions: state.last_distinct,
            })
            .await;
            if let Some(finished) = finished {
                outcome = finished;
                break;
            }
        }
        if outcome == DebateOutcome::MaxRoundsReached {
            log::info!("max rounds reached, reporting current opinions");
        }

        let total_tokens = state.tokens;
        for referee in &roster.referees {
            log::debug!("{} used {} tokens", referee.name, referee.token_usage().total_tokens);
        }

        self.emit(DebateEvent::RunCompleted {
            session_id: session_id.clone(),
            outcome: outcome.clone(),
            rounds,
            total_tokens,
        })
        .await;

        let mut final_tally = OpinionTally::new();
        for (speaker, opinion) in &state.opinions {
            if let Some(diagnosis) = &opinion.diagnosis {
                final_tally.record(speaker, diagnosis);
            }
        }

        Ok(DiagnosisReport {
            session_id,
            outcome,
            rounds,
            language,
            specialties,
            doctors: roster
                .doctors
                .iter()
                .map(|doctor| DoctorSummary {
                    name: doctor.name.clone(),
                    specialty: doctor.specialty.clone(),
                    provider: doctor.provider,
                    model: doctor.model_name().to_string(),
                })
                .collect(),
            final_opinions: state.opinions.values().cloned().collect(),
            final_tally,
            repetitions_detected: state.repetitions,
            interventions: state.interventions,
            referee_resets: state.referee_resets,
            transcript: state.transcript,
            total_tokens,
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn play_round(
        &self,
        round: u32,
        roster: &mut Roster,
        context: &str,
        state: &mut RunState,
    ) -> Option<DebateOutcome> {
        let period = self.config.referee_reset_period;
        let mut reset_this_round = vec![false; roster.referees.len()];
        for (idx, referee) in roster.referees.iter_mut().enumerate() {
            if referee.should_reset(round, period) {
                referee.reset();
                reset_this_round[idx] = true;
                state.referee_resets.push(RefereeResetRecord {
                    round,
                    referee: referee.name.clone(),
                });
            }
        }

        let active = active_referee_index(round, roster.referees.len());
        log::info!("round {}: active referee {:?}", round, roster.referees[active]);
        self.emit(DebateEvent::RoundStarted {
            round,
            active_referee: roster.referees[active].name.clone(),
        })
        .await;
        for (idx, was_reset) in reset_this_round.iter().enumerate() {
            if *was_reset {
                self.emit(DebateEvent::RefereeReset {
                    round,
                    referee: roster.referees[idx].name.clone(),
                })
                .await;
            }
        }

        // Opinion
        self.emit(DebateEvent::StageStarted {
            round,
            stage: DebateStage::Opinion,
        })
        .await;
        let feedback = state.feedback_block();
        let perspective = state.perspective.take();
        let group_results = {
            let doctors = &roster.doctors;
            let flagged = &state.flagged;
            join_all(roster.groups.iter().map(|&(a, b)| {
                self.group_opinions(
                    &doctors[a],
                    &doctors[b],
                    context,
                    &feedback,
                    perspective.as_deref(),
                    flagged,
                )
            }))
            .await
        };

        let mut round_turns = Vec::new();
        for (first, second) in group_results {
            for result in vec![first, second] {
                if let Some(turn) = self.settle_turn(round, DebateStage::Opinion, result, state).await {
                    round_turns.push(turn);
                }
            }
        }

        let pairs: Vec<(&str, &str)> = round_turns
            .iter()
            .map(|turn| (turn.speaker.as_str(), turn.text.as_str()))
            .collect();
        let verdicts = state.detector.check_round(round, &pairs);
        let mut flagged = HashSet::new();
        for (turn, verdict) in round_turns.iter().zip(verdicts) {
            if verdict.is_repetition {
                state.repetitions += 1;
                flagged.insert(turn.speaker.clone());
                log::info!(
                    "round {}: {} repeated round {:?} (score {:.2})",
                    round,
                    turn.speaker,
                    verdict.matched_round,
                    verdict.score
                );
                self.emit(DebateEvent::RepetitionDetected {
                    round,
                    speaker: turn.speaker.clone(),
                    score: verdict.score,
                    matched_round: verdict.matched_round,
                })
                .await;
            }
        }
        state.flagged = flagged;

        let mut round_opinions: BTreeMap<String, DiagnosisOpinion> = BTreeMap::new();
        for turn in &round_turns {
            let parsed = DiagnosisOpinion::parse(&turn.speaker, &turn.text);
            if parsed.diagnosis.is_some() || !round_opinions.contains_key(&turn.speaker) {
                round_opinions.insert(turn.speaker.clone(), parsed);
            }
        }

        if round_turns.is_empty() {
            log::warn!("round {}: no doctor answered, skipping referee stages", round);
            let evaluation = state.policy.evaluate_round(Vec::<String>::new());
            state.last_distinct = 0;
            self.emit(DebateEvent::StagnationChecked { round, evaluation })
                .await;
            return None;
        }

        // Referee check
        let was_reset = reset_this_round[active];
        let question = self.referee_check_question(context, &round_turns, was_reset);
        let check = self
            .ask_referee(&mut roster.referees[active], round, DebateStage::RefereeCheck, question, state)
            .await;
        let verdict = self
            .settle_verdict(round, DebateStage::RefereeCheck, check.as_deref())
            .await;
        if let Some(text) = check {
            state.previous_feedback = Some(PreviousFeedback {
                round,
                referee: roster.referees[active].name.clone(),
                text,
                was_reset,
            });
        }
        if verdict.reached {
            return Some(self.conclude(state, round_opinions, verdict));
        }

        if !self.config.cross_examination {
            return self
                .check_stagnation(round, roster, context, state, round_opinions)
                .await;
        }

        // Cross-counter
        self.emit(DebateEvent::StageStarted {
            round,
            stage: DebateStage::CrossCounter,
        })
        .await;
        let referee_feedback = state
            .previous_feedback
            .as_ref()
            .filter(|feedback| feedback.round == round)
            .map(|feedback| excerpt(&feedback.text, self.config.transcript_excerpt_chars))
            .unwrap_or_default();
        let speakers: Vec<&Doctor> = roster
            .doctors
            .iter()
            .filter(|doctor| round_opinions.contains_key(&doctor.name))
            .collect();
        let questions: Vec<String> = speakers
            .iter()
            .map(|doctor| cross_counter_question(doctor, &round_opinions, &referee_feedback))
            .collect();
        let rebuttal_results = join_all(
            speakers
                .iter()
                .zip(questions)
                .map(|(doctor, question)| consult(doctor, context, question, &self.config.retry)),
        )
        .await;

        let mut rebuttals = Vec::new();
        for result in rebuttal_results {
            if let Some(turn) = self
                .settle_turn(round, DebateStage::CrossCounter, result, state)
                .await
            {
                let revised = DiagnosisOpinion::parse(&turn.speaker, &turn.text);
                if revised.diagnosis.is_some() {
                    round_opinions.insert(turn.speaker.clone(), revised);
                }
                rebuttals.push(turn);
            }
        }

        // Final judgment
        let question = self.final_judgment_question(round, &round_opinions, &rebuttals);
        let judgment = self
            .ask_referee(&mut roster.referees[active], round, DebateStage::FinalJudgment, question, state)
            .await;
        let verdict = self
            .settle_verdict(round, DebateStage::FinalJudgment, judgment.as_deref())
            .await;
        if verdict.reached {
            return Some(self.conclude(state, round_opinions, verdict));
        }

        self.check_stagnation(round, roster, context, state, round_opinions)
            .await
    }

    /// Tally the round, run the stagnation policy, and act on its decision.
    async fn check_stagnation(
        &self,
        round: u32,
        roster: &Roster,
        context: &str,
        state: &mut RunState,
        round_opinions: BTreeMap<String, DiagnosisOpinion>,
    ) -> Option<DebateOutcome> {
        let mut tally = OpinionTally::new();
        for (speaker, opinion) in &round_opinions {
            if let Some(diagnosis) = &opinion.diagnosis {
                tally.record(speaker, diagnosis);
            }
        }
        let labels: Vec<String> = tally.distinct_labels().into_iter().collect();
        state.last_distinct = labels.len();
        state.merge_opinions(&round_opinions);

        let evaluation = state.policy.evaluate_round(labels.iter().cloned());
        self.emit(DebateEvent::StagnationChecked {
            round,
            evaluation: evaluation.clone(),
        })
        .await;
        if !evaluation.fired {
            return None;
        }

        self.emit(DebateEvent::InterventionFired {
            round,
            action: evaluation.action,
            distinct_opinions: labels.clone(),
        })
        .await;

        match evaluation.action {
            StagnationAction::TerminateParallel => {
                state.interventions.push(InterventionRecord {
                    round,
                    action: evaluation.action,
                    distinct_opinions: labels.clone(),
                    perspective: None,
                });
                Some(DebateOutcome::ParallelOpinions { opinions: labels })
            }
            StagnationAction::InjectPerspective => {
                let client = Arc::clone(roster.referees[active_referee_index(round, roster.referees.len())].client());
                let perspective = self
                    .neutral_perspective(client, round, context, &round_opinions, state)
                    .await;
                state.interventions.push(InterventionRecord {
                    round,
                    action: evaluation.action,
                    distinct_opinions: labels,
                    perspective: perspective.clone(),
                });
                state.perspective = perspective;
                None
            }
            StagnationAction::None => {
                state.interventions.push(InterventionRecord {
                    round,
                    action: evaluation.action,
                    distinct_opinions: labels,
                    perspective: None,
                });
                None
            }
        }
    }

    fn conclude(
        &self,
        state: &mut RunState,
        round_opinions: BTreeMap<String, DiagnosisOpinion>,
        verdict: ConsensusVerdict,
    ) -> DebateOutcome {
        let mut tally = OpinionTally::new();
        for (speaker, opinion) in &round_opinions {
            if let Some(diagnosis) = &opinion.diagnosis {
                tally.record(speaker, diagnosis);
            }
        }
        state.last_distinct = tally.len();
        state.merge_opinions(&round_opinions);

        let diagnosis = verdict.diagnosis.or_else(|| {
            tally
                .iter()
                .max_by(|a, b| a.1.len().cmp(&b.1.len()).then(b.0.cmp(a.0)))
                .map(|(label, _)| label.clone())
        });
        log::info!("consensus reached: {:?}", diagnosis);
        DebateOutcome::Consensus { diagnosis }
    }

    /// Doctor 1 answers first; doctor 2 sees doctor 1's opinion.
    async fn group_opinions(
        &self,
        first: &Doctor,
        second: &Doctor,
        context: &str,
        feedback: &str,
        perspective: Option<&str>,
        flagged: &HashSet<String>,
    ) -> (TurnResult, TurnResult) {
        let preamble = |doctor: &Doctor| {
            let mut text = feedback.to_string();
            if flagged.contains(&doctor.name) {
                text.push_str(REPETITION_NUDGE);
            }
            if let Some(perspective) = perspective {
                text.push_str(&format!(
                    "\nA neutral consultant added this perspective after the debate stalled:\n{}\n\
                     Address it explicitly.\n",
                    perspective
                ));
            }
            text
        };

        let question = format!(
            "{}\nAnalyze this patient's symptoms and give your most likely diagnosis.\n\
             You will discuss the case with Dr. {}, so state your evidence clearly.\n\n{}",
            preamble(first),
            second.name,
            ANSWER_FORMAT
        );
        let first_result = consult(first, context, question, &self.config.retry).await;

        let shared = match &first_result {
            Ok(turn) => format!(
                "Dr. {} provided this opinion:\n\n{}\n\n\
                 As an independent doctor, give your own opinion. You may agree or disagree with Dr. {}.\n\n",
                first.name, turn.text, first.name
            ),
            Err(_) => String::new(),
        };
        let question = format!(
            "{}\n{}Analyze this patient's symptoms and give your most likely diagnosis.\n\n{}",
            preamble(second),
            shared,
            ANSWER_FORMAT
        );
        let second_result = consult(second, context, question, &self.config.retry).await;

        (first_result, second_result)
    }

    /// Record a turn in the transcript and emit the matching event.
    async fn settle_turn(
        &self,
        round: u32,
        stage: DebateStage,
        result: TurnResult,
        state: &mut RunState,
    ) -> Option<Turn> {
        match result {
            Ok(turn) => {
                state.push_transcript(round, stage, &turn);
                self.emit(DebateEvent::SpeakerResponded {
                    round,
                    stage,
                    speaker: turn.speaker.clone(),
                    model: turn.model.clone(),
                    tokens_used: turn.usage.clone(),
                    response_length: turn.text.len(),
                })
                .await;
                Some(turn)
            }
            Err(failed) => {
                log::warn!(
                    "round {} {:?}: {} failed: {}",
                    round,
                    stage,
                    failed.speaker,
                    failed.error
                );
                self.emit(DebateEvent::SpeakerFailed {
                    round,
                    stage,
                    speaker: failed.speaker,
                    error: failed.error,
                })
                .await;
                None
            }
        }
    }

    async fn ask_referee(
        &self,
        referee: &mut Referee,
        round: u32,
        stage: DebateStage,
        question: String,
        state: &mut RunState,
    ) -> Option<String> {
        self.emit(DebateEvent::StageStarted { round, stage }).await;
        let result = match referee.evaluate(question).await {
            Ok(text) => Ok(Turn {
                speaker: referee.name.clone(),
                model: referee.model_name().to_string(),
                text,
                usage: referee.client().get_last_usage(),
            }),
            Err(err) => Err(FailedTurn {
                speaker: referee.name.clone(),
                error: err.to_string(),
            }),
        };
        self.settle_turn(round, stage, result, state)
            .await
            .map(|turn| turn.text)
    }

    async fn settle_verdict(
        &self,
        round: u32,
        stage: DebateStage,
        reply: Option<&str>,
    ) -> ConsensusVerdict {
        let verdict = match reply {
            Some(text) => parse_consensus(text),
            None => ConsensusVerdict {
                reached: false,
                source: VerdictSource::Undetermined,
                diagnosis: None,
            },
        };
        self.emit(DebateEvent::ConsensusChecked {
            round,
            stage,
            verdict: verdict.clone(),
        })
        .await;
        verdict
    }

    /// Ask an uninvolved consultant, on the active referee's provider, for a third view.
    async fn neutral_perspective(
        &self,
        client: Arc<dyn ClientWrapper>,
        round: u32,
        context: &str,
        opinions: &BTreeMap<String, DiagnosisOpinion>,
        state: &mut RunState,
    ) -> Option<String> {
        let current: Vec<String> = opinions
            .values()
            .filter_map(|opinion| {
                opinion
                    .diagnosis
                    .as_ref()
                    .map(|diagnosis| format!("- Dr. {}: {}", opinion.speaker, diagnosis))
            })
            .collect();
        let messages = [
            Message::new(
                Role::System,
                format!(
                    "You are an independent consultant physician who has not taken part in this debate.\n\
                     Offer a perspective nobody has raised yet: blind spots of the current opinions and overlooked possibilities.\n\n{}",
                    self.config.language.response_instruction()
                ),
            ),
            Message::new(
                Role::User,
                format!(
                    "{}\nCurrent opinions:\n{}\n\nProvide a neutral third perspective.",
                    context,
                    current.join("\n")
                ),
            ),
        ];

        let result = match send_with_retry(client.as_ref(), &messages, &self.config.retry).await {
            Ok(reply) => Ok(Turn {
                speaker: CONSULTANT_NAME.to_string(),
                model: client.model_name().to_string(),
                text: reply.content.to_string(),
                usage: client.get_last_usage(),
            }),
            Err(err) => Err(FailedTurn {
                speaker: CONSULTANT_NAME.to_string(),
                error: err.to_string(),
            }),
        };
        self.settle_turn(round, DebateStage::Intervention, result, state)
            .await
            .map(|turn| turn.text)
    }

    fn referee_check_question(&self, context: &str, turns: &[Turn], was_reset: bool) -> String {
        let reset_instruction = if was_reset {
            "IMPORTANT: You have been reset to remove accumulated bias. Earlier rounds were cleared on purpose.\n\
             Judge only the evidence of the current round and do not penalize the lack of earlier context.\n\n"
        } else {
            ""
        };
        let opinions: Vec<String> = turns
            .iter()
            .map(|turn| {
                format!(
                    "Dr. {} ({}):\n{}",
                    turn.speaker,
                    turn.model,
                    excerpt(&turn.text, self.config.transcript_excerpt_chars)
                )
            })
            .collect();
        format!(
            "{}Review the diagnostic opinions of this round:\n\n{}\n\n\
             Your tasks:\n1. Identify medically unsupported claims\n2. Detect hallucinations\n\
             3. Point out missed differential diagnoses\n\
             4. Check whether any symptom could be caused by the patient's medications or their interactions\n\n\
             Patient context:\n{}\n\
             At the end, output EXACTLY one JSON line and nothing after it:\n\
             {{\"consensus_reached\": true, \"diagnosis\": \"<agreed diagnosis>\"}} if consensus IS reached\n\
             {{\"consensus_reached\": false}} if consensus is NOT reached",
            reset_instruction,
            opinions.join("\n\n"),
            context
        )
    }

    fn final_judgment_question(
        &self,
        round: u32,
        opinions: &BTreeMap<String, DiagnosisOpinion>,
        rebuttals: &[Turn],
    ) -> String {
        let current: Vec<String> = opinions
            .values()
            .map(|opinion| {
                format!(
                    "- Dr. {}: {} (confidence {:.2})",
                    opinion.speaker,
                    opinion.diagnosis.as_deref().unwrap_or("no diagnosis stated"),
                    opinion.confidence
                )
            })
            .collect();
        let rebuttals: Vec<String> = rebuttals
            .iter()
            .map(|turn| {
                format!(
                    "Dr. {}:\n{}",
                    turn.speaker,
                    excerpt(&turn.text, self.config.transcript_excerpt_chars)
                )
            })
            .collect();
        format!(
            "Synthesize round {} of the debate and make the final judgment.\n\n\
             Current opinions:\n{}\n\nRebuttals:\n{}\n\n\
             Consensus requires every specialist to hold the same or a closely equivalent diagnosis with consistent evidence.\n\
             Two or more different diagnoses mean no consensus.\n\n\
             End with EXACTLY one JSON line:\n\
             {{\"consensus_reached\": true, \"diagnosis\": \"<agreed diagnosis>\"}} or {{\"consensus_reached\": false}}",
            round,
            current.join("\n"),
            rebuttals.join("\n\n")
        )
    }
}

const ANSWER_FORMAT: &str = "Answer with these lines:\n\
Diagnosis: <single most likely diagnosis>\n\
Confidence: <number between 0 and 1>\n\
Reasoning: <medical evidence>";

const REPETITION_NUDGE: &str = "\nNote: your previous answer closely repeated one of your earlier answers. \
Bring new evidence, reconsider the differential, or explain what would change your mind.\n";

fn cross_counter_question(
    doctor: &Doctor,
    opinions: &BTreeMap<String, DiagnosisOpinion>,
    referee_feedback: &str,
) -> String {
    let own = opinions
        .get(&doctor.name)
        .and_then(|opinion| opinion.diagnosis.as_deref())
        .unwrap_or("none stated");
    let others: Vec<String> = opinions
        .values()
        .filter(|opinion| opinion.speaker != doctor.name)
        .map(|opinion| {
            format!(
                "- Dr. {}: {}",
                opinion.speaker,
                opinion.diagnosis.as_deref().unwrap_or("no diagnosis stated")
            )
        })
        .collect();
    format!(
        "Your current opinion: {}\n\nOther opinions this round:\n{}\n\nReferee feedback:\n{}\n\n\
         Cross-examine the other opinions: rebut what is unsupported and concede what is convincing.\n\
         Finish with updated lines.\n{}",
        own,
        others.join("\n"),
        referee_feedback,
        ANSWER_FORMAT
    )
}

async fn consult(doctor: &Doctor, context: &str, question: String, retry: &RetryPolicy) -> TurnResult {
    match doctor.think(context, &question, retry).await {
        Ok((text, usage)) => Ok(Turn {
            speaker: doctor.name.clone(),
            model: doctor.model_name().to_string(),
            text,
            usage,
        }),
        Err(err) => Err(FailedTurn {
            speaker: doctor.name.clone(),
            error: err.to_string(),
        }),
    }
}

/// First `max_chars` characters of `text`, with `...` when something was cut.
fn excerpt(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
