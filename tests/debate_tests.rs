use async_trait::async_trait;
use medcouncil::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};
use medcouncil::clients::common::RetryPolicy;
use medcouncil::config::{ConfigError, CouncilConfig};
use medcouncil::debate::{
    DebateError, DebateOutcome, DebateStage, DiagnosisDebate, CONSULTANT_NAME, RESET_TAG,
};
use medcouncil::event::{DebateEvent, EventHandler};
use medcouncil::patient::PatientCase;
use medcouncil::roster::{ClientFactory, Language, Provider, ProviderPool, RosterError};
use medcouncil::stagnation::StagnationAction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const TOKENS_PER_CALL: usize = 10;

#[derive(Clone, Debug)]
struct Call {
    system: String,
    user: String,
}

impl Call {
    fn is_consultant(&self) -> bool {
        self.system.contains("independent consultant")
    }

    fn is_referee(&self) -> bool {
        !self.is_consultant() && self.system.contains("referee")
    }

    fn is_doctor(&self) -> bool {
        !self.is_consultant() && !self.is_referee()
    }
}

type Responder = Arc<dyn Fn(&Call) -> Result<String, String> + Send + Sync>;

struct ScriptedClient {
    model: String,
    responder: Responder,
    calls: Arc<Mutex<Vec<Call>>>,
    usage: Mutex<Option<TokenUsage>>,
}

#[async_trait]
impl ClientWrapper for ScriptedClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn send_message(&self, messages: &[Message]) -> Result<Message, Box<dyn std::error::Error>> {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.to_string())
            .unwrap_or_default();
        let user = messages
            .last()
            .map(|m| m.content.to_string())
            .unwrap_or_default();
        let call = Call { system, user };
        self.calls.lock().unwrap().push(call.clone());

        match (self.responder)(&call) {
            Ok(text) => {
                *self.usage.lock().unwrap() = Some(TokenUsage {
                    input_tokens: 6,
                    output_tokens: 4,
                    total_tokens: TOKENS_PER_CALL,
                });
                Ok(Message::new(Role::Assistant, text))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn usage_slot(&self) -> Option<&Mutex<Option<TokenUsage>>> {
        Some(&self.usage)
    }
}

fn scripted_pool(providers: &[Provider], responder: Responder) -> (ProviderPool, Arc<Mutex<Vec<Call>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut pool = ProviderPool::new();
    for provider in providers {
        let responder = responder.clone();
        let calls = calls.clone();
        let model = format!("mock-{}", provider);
        let factory: ClientFactory = Arc::new(move || {
            Arc::new(ScriptedClient {
                model: model.clone(),
                responder: responder.clone(),
                calls: calls.clone(),
                usage: Mutex::new(None),
            }) as Arc<dyn ClientWrapper>
        });
        pool = pool.with_provider(*provider, factory);
    }
    (pool, calls)
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DebateEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<DebateEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn on_debate_event(&self, event: &DebateEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

fn silent_responder() -> Responder {
    Arc::new(|_: &Call| Ok(String::new()))
}

fn opinion(diagnosis: &str) -> String {
    format!(
        "Diagnosis: {}\nConfidence: 0.8\nReasoning: fatigable ptosis with diplopia worse in the evening",
        diagnosis
    )
}

/// Neurology and Ophthalmology hold one diagnosis, everybody else another.
fn split_opinion(call: &Call) -> String {
    if call.system.contains("Neurology") || call.system.contains("Ophthalmology") {
        opinion("Myasthenia gravis")
    } else {
        opinion("Thyroid eye disease")
    }
}

fn test_config() -> CouncilConfig {
    CouncilConfig {
        max_rounds: 5,
        retry: RetryPolicy::no_retry(),
        ..CouncilConfig::default()
    }
}

#[tokio::test]
async fn test_consensus_at_referee_check_ends_round_one() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("Well supported.\n{\"consensus_reached\": true, \"diagnosis\": \"Myasthenia gravis\"}".to_string())
        } else {
            Ok(opinion("Myasthenia gravis"))
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Claude], responder);
    let recorder = Arc::new(Recorder::default());
    let debate = DiagnosisDebate::new(test_config(), pool)
        .unwrap()
        .with_event_handler(recorder.clone());

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(
        report.outcome,
        DebateOutcome::Consensus {
            diagnosis: Some("Myasthenia gravis".to_string())
        }
    );
    assert_eq!(report.rounds, 1);
    assert_eq!(report.doctors.len(), 10);
    assert_eq!(report.final_opinions.len(), 10);
    assert_eq!(report.final_tally.len(), 1);

    // 10 groups of two, then a single referee check
    let opinions = report
        .transcript
        .iter()
        .filter(|entry| entry.stage == DebateStage::Opinion)
        .count();
    assert_eq!(opinions, 20);
    assert!(report
        .transcript
        .iter()
        .all(|entry| entry.stage != DebateStage::CrossCounter));
    assert_eq!(report.transcript.len(), 21);
    assert_eq!(calls.lock().unwrap().len(), 21);
    assert_eq!(report.total_tokens, TOKENS_PER_CALL * report.transcript.len());

    let events = recorder.events();
    assert!(matches!(events.first(), Some(DebateEvent::RunStarted { doctors: 10, .. })));
    assert!(matches!(events.last(), Some(DebateEvent::RunCompleted { rounds: 1, .. })));
    assert!(events.iter().any(|event| matches!(
        event,
        DebateEvent::ConsensusChecked { stage: DebateStage::RefereeCheck, verdict, .. } if verdict.reached
    )));
}

#[tokio::test]
async fn test_second_doctor_sees_first_opinion() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("{\"consensus_reached\": true}".to_string())
        } else {
            Ok(opinion("Myasthenia gravis"))
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Claude, Provider::Gpt], responder);
    let debate = DiagnosisDebate::new(test_config(), pool).unwrap();

    let report = debate.run(&PatientCase::sample()).await.unwrap();
    // no diagnosis in the verdict, so the most held label is reported
    assert_eq!(
        report.outcome,
        DebateOutcome::Consensus {
            diagnosis: Some("myasthenia gravis".to_string())
        }
    );

    let calls = calls.lock().unwrap();
    let shared = calls
        .iter()
        .filter(|call| call.is_doctor() && call.user.contains("provided this opinion"))
        .count();
    assert_eq!(shared, 10);
    assert!(calls
        .iter()
        .filter(|call| call.is_doctor())
        .all(|call| call.user.contains("Patient Information")));
}

#[tokio::test]
async fn test_two_stagnant_opinions_end_in_parallel() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("Two camps remain.\n{\"consensus_reached\": false}".to_string())
        } else {
            Ok(split_opinion(call))
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Claude, Provider::Gpt], responder);
    let config = CouncilConfig {
        stagnation_threshold: 3,
        ..test_config()
    };
    let recorder = Arc::new(Recorder::default());
    let debate = DiagnosisDebate::new(config, pool)
        .unwrap()
        .with_event_handler(recorder.clone());

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(report.rounds, 3);
    assert_eq!(
        report.outcome,
        DebateOutcome::ParallelOpinions {
            opinions: vec![
                "myasthenia gravis".to_string(),
                "thyroid eye disease".to_string()
            ]
        }
    );
    assert_eq!(report.interventions.len(), 1);
    assert_eq!(report.interventions[0].round, 3);
    assert_eq!(report.interventions[0].action, StagnationAction::TerminateParallel);

    // every doctor restates its answer from round 2 on; rebuttals are not checked
    assert_eq!(report.repetitions_detected, 40);
    let calls = calls.lock().unwrap();
    assert!(calls
        .iter()
        .any(|call| call.is_doctor() && call.user.contains("closely repeated")));

    // cross-counter and final judgment ran every round
    let cross = report
        .transcript
        .iter()
        .filter(|entry| entry.stage == DebateStage::CrossCounter)
        .count();
    assert_eq!(cross, 30);
    let judgments = report
        .transcript
        .iter()
        .filter(|entry| entry.stage == DebateStage::FinalJudgment)
        .count();
    assert_eq!(judgments, 3);

    let events = recorder.events();
    let fired: Vec<&DebateEvent> = events
        .iter()
        .filter(|event| matches!(event, DebateEvent::InterventionFired { .. }))
        .collect();
    assert_eq!(fired.len(), 1);
}

#[tokio::test]
async fn test_undecided_reply_keeps_earlier_diagnosis() {
    let doctor_calls = Arc::new(AtomicUsize::new(0));
    let counter = doctor_calls.clone();
    let responder: Responder = Arc::new(move |call: &Call| {
        if call.is_referee() {
            return Ok("No agreement yet.\n{\"consensus_reached\": false}".to_string());
        }
        // round 1 has 20 opinion turns; afterwards every doctor hedges
        if counter.fetch_add(1, Ordering::SeqCst) < 20 {
            Ok(opinion("Myasthenia gravis"))
        } else {
            Ok("I need more tests before committing to anything.".to_string())
        }
    });
    let (pool, _calls) = scripted_pool(&[Provider::Claude], responder);
    let config = CouncilConfig {
        max_rounds: 2,
        cross_examination: false,
        ..test_config()
    };
    let debate = DiagnosisDebate::new(config, pool).unwrap();

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(report.outcome, DebateOutcome::MaxRoundsReached);
    assert_eq!(report.rounds, 2);
    assert_eq!(doctor_calls.load(Ordering::SeqCst), 40);
    assert_eq!(report.final_opinions.len(), 10);
    assert!(report
        .final_opinions
        .iter()
        .all(|opinion| opinion.diagnosis.as_deref() == Some("Myasthenia gravis")));
    assert_eq!(report.final_tally.len(), 1);
    assert_eq!(report.final_tally.holders_of("myasthenia gravis").len(), 10);
}

#[tokio::test]
async fn test_round_ceiling_reports_max_rounds() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("No consensus yet.".to_string())
        } else {
            Ok(split_opinion(call))
        }
    });
    let (pool, _calls) = scripted_pool(&[Provider::Gemini], responder);
    let config = CouncilConfig {
        max_rounds: 2,
        cross_examination: false,
        ..test_config()
    };
    let recorder = Arc::new(Recorder::default());
    let debate = DiagnosisDebate::new(config, pool)
        .unwrap()
        .with_event_handler(recorder.clone());

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(report.outcome, DebateOutcome::MaxRoundsReached);
    assert_eq!(report.rounds, 2);
    assert!(report.interventions.is_empty());
    assert_eq!(report.final_tally.len(), 2);

    let completed = recorder
        .events()
        .iter()
        .filter(|event| matches!(event, DebateEvent::RoundCompleted { distinct_opinions: 2, .. }))
        .count();
    assert_eq!(completed, 2);
}

#[tokio::test]
async fn test_three_opinions_inject_a_neutral_perspective() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_consultant() {
            Ok("Consider Lambert-Eaton syndrome and check for a thymoma.".to_string())
        } else if call.is_referee() {
            Ok("{\"consensus_reached\": false}".to_string())
        } else if call.system.contains("Neurology") {
            Ok(opinion("Myasthenia gravis"))
        } else if call.system.contains("Internal Medicine") {
            Ok(opinion("Hypothyroidism"))
        } else {
            Ok(opinion("Chronic progressive external ophthalmoplegia"))
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Grok], responder);
    let config = CouncilConfig {
        max_rounds: 3,
        stagnation_threshold: 2,
        cross_examination: false,
        ..test_config()
    };
    let debate = DiagnosisDebate::new(config, pool).unwrap();

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(report.outcome, DebateOutcome::MaxRoundsReached);
    assert_eq!(report.interventions.len(), 1);
    let intervention = &report.interventions[0];
    assert_eq!(intervention.round, 2);
    assert_eq!(intervention.action, StagnationAction::InjectPerspective);
    assert_eq!(intervention.distinct_opinions.len(), 3);
    assert_eq!(
        intervention.perspective.as_deref(),
        Some("Consider Lambert-Eaton syndrome and check for a thymoma.")
    );

    assert!(report
        .transcript
        .iter()
        .any(|entry| entry.stage == DebateStage::Intervention && entry.speaker == CONSULTANT_NAME));

    let calls = calls.lock().unwrap();
    let informed = calls
        .iter()
        .filter(|call| call.is_doctor() && call.user.contains("Lambert-Eaton"))
        .count();
    // only round 3 carries the perspective: 10 groups of two
    assert_eq!(informed, 20);
}

#[tokio::test]
async fn test_failed_speakers_are_skipped() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("{\"consensus_reached\": true, \"diagnosis\": \"Myasthenia gravis\"}".to_string())
        } else if call.system.contains("Orthopedics") {
            Err("rate limited".to_string())
        } else {
            Ok(opinion("Myasthenia gravis"))
        }
    });
    let (pool, _calls) = scripted_pool(&[Provider::Claude], responder);
    let recorder = Arc::new(Recorder::default());
    let debate = DiagnosisDebate::new(test_config(), pool)
        .unwrap()
        .with_event_handler(recorder.clone());

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert!(matches!(report.outcome, DebateOutcome::Consensus { .. }));
    assert_eq!(report.final_opinions.len(), 8);
    assert!(report
        .final_opinions
        .iter()
        .all(|opinion| !opinion.speaker.contains("Or")));

    let failures: Vec<DebateEvent> = recorder
        .events()
        .into_iter()
        .filter(|event| matches!(event, DebateEvent::SpeakerFailed { .. }))
        .collect();
    // two orthopedists, each sitting in two groups
    assert_eq!(failures.len(), 4);
    if let DebateEvent::SpeakerFailed { error, stage, .. } = &failures[0] {
        assert!(error.contains("rate limited"));
        assert_eq!(*stage, DebateStage::Opinion);
    }
}

#[tokio::test]
async fn test_silent_round_skips_the_referee() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("{\"consensus_reached\": true}".to_string())
        } else {
            Err("provider down".to_string())
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Claude], responder);
    let config = CouncilConfig {
        max_rounds: 2,
        ..test_config()
    };
    let debate = DiagnosisDebate::new(config, pool).unwrap();

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(report.outcome, DebateOutcome::MaxRoundsReached);
    assert!(report.transcript.is_empty());
    assert_eq!(report.total_tokens, 0);
    assert!(calls.lock().unwrap().iter().all(|call| !call.is_referee()));
}

#[tokio::test]
async fn test_referees_reset_on_staggered_schedule() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("{\"consensus_reached\": false}".to_string())
        } else {
            Ok(split_opinion(call))
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Claude, Provider::Gpt], responder);
    let config = CouncilConfig {
        max_rounds: 8,
        cross_examination: false,
        ..test_config()
    };
    let debate = DiagnosisDebate::new(config, pool).unwrap();

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    let resets: Vec<(u32, &str)> = report
        .referee_resets
        .iter()
        .map(|reset| (reset.round, reset.referee.as_str()))
        .collect();
    assert_eq!(
        resets,
        vec![(2, "Referee B"), (5, "Referee A"), (7, "Referee B")]
    );

    let calls = calls.lock().unwrap();
    // round 7 is refereed by B right after its reset
    assert_eq!(
        calls
            .iter()
            .filter(|call| call.is_referee() && call.user.contains("You have been reset"))
            .count(),
        1
    );
    // and round 8 doctors are told the feedback came from a fresh voice
    assert_eq!(
        calls
            .iter()
            .filter(|call| call.is_doctor() && call.user.contains(RESET_TAG))
            .count(),
        20
    );
}

#[tokio::test]
async fn test_korean_debate_reads_korean_verdicts() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("모든 전문의의 의견이 일치합니다.\n합의 도달: 중증근무력증".to_string())
        } else {
            Ok("진단명: 중증근무력증\n확신도: 0.9\n근거: 저녁에 악화되는 안검하수".to_string())
        }
    });
    let (pool, calls) = scripted_pool(&[Provider::Claude], responder);
    let config = CouncilConfig {
        language: Language::Korean,
        ..test_config()
    };
    let debate = DiagnosisDebate::new(config, pool).unwrap();

    let report = debate.run(&PatientCase::sample()).await.unwrap();

    assert_eq!(
        report.outcome,
        DebateOutcome::Consensus {
            diagnosis: Some("중증근무력증".to_string())
        }
    );
    assert_eq!(report.specialties[0], "신경과");
    assert!(calls
        .lock()
        .unwrap()
        .iter()
        .filter(|call| call.is_doctor())
        .all(|call| call.user.contains("환자 정보")));
}

#[test]
fn test_construction_errors() {
    let (pool, _) = scripted_pool(&[], silent_responder());
    assert!(matches!(
        DiagnosisDebate::new(CouncilConfig::default(), pool),
        Err(DebateError::Roster(RosterError::NoProviders))
    ));

    let (pool, _) = scripted_pool(&[Provider::Gpt], silent_responder());
    let config = CouncilConfig {
        max_rounds: 0,
        ..CouncilConfig::default()
    };
    assert!(matches!(
        DiagnosisDebate::new(config, pool),
        Err(DebateError::Config(ConfigError::ZeroMaxRounds))
    ));
}

#[tokio::test]
async fn test_invalid_case_is_rejected_before_any_call() {
    let (pool, calls) = scripted_pool(&[Provider::Gpt], silent_responder());
    let debate = DiagnosisDebate::new(test_config(), pool).unwrap();
    let case = PatientCase {
        chief_complaints: Vec::new(),
        ..PatientCase::sample()
    };

    assert!(matches!(debate.run(&case).await, Err(DebateError::Patient(_))));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_report_serializes_to_json() {
    let responder: Responder = Arc::new(|call: &Call| {
        if call.is_referee() {
            Ok("{\"consensus_reached\": true, \"diagnosis\": \"Myasthenia gravis\"}".to_string())
        } else {
            Ok(opinion("Myasthenia gravis"))
        }
    });
    let (pool, _) = scripted_pool(&[Provider::Claude], responder);
    let debate = DiagnosisDebate::new(test_config(), pool).unwrap();
    let report = debate.run(&PatientCase::sample()).await.unwrap();

    let json: serde_json::Value = serde_json::from_str(&report.to_json_pretty().unwrap()).unwrap();
    assert_eq!(json["outcome"]["kind"], "consensus");
    assert_eq!(json["outcome"]["diagnosis"], "Myasthenia gravis");
    assert_eq!(json["language"], "en");
    assert_eq!(json["transcript"][0]["stage"], "opinion");
}
