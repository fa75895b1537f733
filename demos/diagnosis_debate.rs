//! Diagnosis Debate Example
//!
//! Runs a full refereed debate over a patient case and prints the JSON report.
//!
//! Usage:
//!
//! ```text
//! cargo run --example diagnosis_debate                  # built-in sample case
//! cargo run --example diagnosis_debate -- case.json     # case from a file
//! cargo run --example diagnosis_debate -- --interview   # interview the patient first
//! ```
//!
//! Provider keys are read from ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY and
//! XAI_API_KEY. Set MEDCOUNCIL_LANGUAGE (en, ko, es, ja, zh, fr, de) to change the
//! language of the debate.

use async_trait::async_trait;
use medcouncil::config::{CouncilConfig, ProviderKeys};
use medcouncil::debate::DiagnosisDebate;
use medcouncil::event::{DebateEvent, EventHandler};
use medcouncil::intake::{IntakeInterview, IntakeStep};
use medcouncil::patient::PatientCase;
use medcouncil::roster::{Language, ProviderPool};
use std::io::{self, Write};
use std::sync::Arc;

struct ConsoleHandler;

#[async_trait]
impl EventHandler for ConsoleHandler {
    async fn on_debate_event(&self, event: &DebateEvent) {
        match event {
            DebateEvent::RunStarted {
                specialties,
                doctors,
                groups,
                ..
            } => println!(
                "Council: {} doctors in {} groups ({})",
                doctors,
                groups,
                specialties.join(", ")
            ),
            DebateEvent::RoundStarted {
                round,
                active_referee,
            } => println!("\n=== Round {} (referee: {}) ===", round, active_referee),
            DebateEvent::RefereeReset { referee, .. } => println!("  {} was reset", referee),
            DebateEvent::SpeakerResponded {
                stage,
                speaker,
                model,
                response_length,
                ..
            } => println!("  [{:?}] {} ({}): {} chars", stage, speaker, model, response_length),
            DebateEvent::SpeakerFailed { speaker, error, .. } => {
                eprintln!("  {} failed: {}", speaker, error)
            }
            DebateEvent::RepetitionDetected {
                speaker,
                score,
                matched_round,
                ..
            } => println!(
                "  {} repeated round {:?} (similarity {:.2})",
                speaker, matched_round, score
            ),
            DebateEvent::InterventionFired {
                action,
                distinct_opinions,
                ..
            } => println!("  stagnation: {:?} over {:?}", action, distinct_opinions),
            DebateEvent::RunCompleted {
                outcome,
                rounds,
                total_tokens,
                ..
            } => println!(
                "\nFinished after {} round(s), {} tokens: {:?}",
                rounds, total_tokens, outcome
            ),
            _ => {}
        }
    }
}

async fn interview(pool: &ProviderPool, language: Language) -> Result<PatientCase, Box<dyn std::error::Error>> {
    let provider = pool.providers()[0];
    let client = pool
        .create(provider)
        .ok_or("no client for the first provider")?;
    let mut interview = IntakeInterview::new(client.clone(), language);

    println!("[Intake] {}", interview.start().await.map_err(|e| e.to_string())?);
    while !interview.is_complete() {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().read_line(&mut line)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match interview.answer(line).await.map_err(|e| e.to_string())? {
            IntakeStep::Question(question) => println!("[Intake] {}", question),
            IntakeStep::Complete => println!("[Intake] Interview complete, convening the council."),
        }
    }
    Ok(interview.extract_case(client.as_ref()).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    medcouncil::init_logger();

    let language = std::env::var("MEDCOUNCIL_LANGUAGE")
        .ok()
        .and_then(|code| Language::from_code(&code))
        .unwrap_or_default();
    let config = CouncilConfig {
        language,
        max_rounds: 10,
        ..CouncilConfig::default()
    };

    let pool = ProviderPool::from_keys(&ProviderKeys::from_env());
    if pool.is_empty() {
        eprintln!("Set at least one of ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY, XAI_API_KEY");
        return Ok(());
    }

    let case = match std::env::args().nth(1) {
        Some(arg) if arg == "--interview" => interview(&pool, language).await?,
        Some(path) => PatientCase::from_json_file(path)?,
        None => PatientCase::sample(),
    };

    let debate = DiagnosisDebate::new(config, pool)?.with_event_handler(Arc::new(ConsoleHandler));
    let report = debate.run(&case).await?;
    println!("{}", report.to_json_pretty()?);
    Ok(())
}
