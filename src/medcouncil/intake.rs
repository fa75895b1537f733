//! Conversational intake: a diagnostician interviews the patient one question at a time
//! and the transcript is turned into a [`PatientCase`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use medcouncil::clients::claude::{ClaudeClient, Model};
//! use medcouncil::intake::{IntakeInterview, IntakeStep};
//! use medcouncil::roster::Language;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let client = Arc::new(ClaudeClient::new_with_model_enum("KEY", Model::ClaudeSonnet4));
//! let mut interview = IntakeInterview::new(client.clone(), Language::English);
//! println!("{}", interview.start().await?);
//! loop {
//!     let reply = String::from("I am 45 and I see double in the evening.");
//!     match interview.answer(&reply).await? {
//!         IntakeStep::Question(question) => println!("{}", question),
//!         IntakeStep::Complete => break,
//!     }
//! }
//! let case = interview.extract_case(client.as_ref()).await?;
//! # Ok(())
//! # }
//! ```

use crate::client_wrapper::{ClientWrapper, Message, Role};
use crate::clients::common::{send_with_retry, RetryPolicy};
use crate::medcouncil::debate::DebateError;
use crate::medcouncil::llm_session::LLMSession;
use crate::medcouncil::patient::PatientCase;
use crate::medcouncil::roster::Language;
use serde_json::Value;
use std::error::Error;
use std::sync::Arc;

/// Phrases the interviewer uses to end the interview.
pub const COMPLETION_MARKERS: &[&str] = &["INTAKE COMPLETE", "문진 완료"];

const INTAKE_CONTEXT_TOKENS: usize = 16_384;

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeStep {
    /// The next question for the patient.
    Question(String),
    /// The interviewer has enough information.
    Complete,
}

pub struct IntakeInterview {
    session: LLMSession,
    language: Language,
    transcript: Vec<(Role, String)>,
    complete: bool,
}

impl IntakeInterview {
    pub fn new(client: Arc<dyn ClientWrapper>, language: Language) -> Self {
        IntakeInterview {
            session: LLMSession::new(client, interviewer_prompt(language), INTAKE_CONTEXT_TOKENS),
            language,
            transcript: Vec::new(),
            complete: false,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.session = self.session.with_retry_policy(retry);
        self
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Question/answer pairs so far, interviewer turns as `Role::Assistant`.
    pub fn transcript(&self) -> &[(Role, String)] {
        &self.transcript
    }

    /// Ask the opening question.
    pub async fn start(&mut self) -> Result<String, Box<dyn Error + Send + Sync>> {
        let opening = match self.language {
            Language::Korean => "환자가 방문했습니다. 첫 문진 질문을 시작하세요.",
            _ => "A patient has arrived. Ask your first intake question.",
        };
        let reply = self.session.send_message(Role::User, opening.to_string()).await?;
        let question = reply.content.to_string();
        self.transcript.push((Role::Assistant, question.clone()));
        Ok(question)
    }

    /// Record the patient's reply and get the next step.
    pub async fn answer(&mut self, reply: &str) -> Result<IntakeStep, Box<dyn Error + Send + Sync>> {
        if self.complete {
            return Ok(IntakeStep::Complete);
        }
        self.transcript.push((Role::User, reply.to_string()));
        let response = self.session.send_message(Role::User, reply.to_string()).await?;
        let text = response.content.to_string();

        if COMPLETION_MARKERS.iter().any(|marker| text.contains(marker)) {
            log::info!("intake complete after {} answer(s)", self.answer_count());
            self.complete = true;
            return Ok(IntakeStep::Complete);
        }
        self.transcript.push((Role::Assistant, text.clone()));
        Ok(IntakeStep::Question(text))
    }

    fn answer_count(&self) -> usize {
        self.transcript
            .iter()
            .filter(|(role, _)| *role == Role::User)
            .count()
    }

    /// Ask `client` to extract a structured case from the interview.
    pub async fn extract_case(&self, client: &dyn ClientWrapper) -> Result<PatientCase, DebateError> {
        let conversation: Vec<String> = self
            .transcript
            .iter()
            .map(|(role, text)| match role {
                Role::User => format!("Patient: {}", text),
                _ => format!("Interviewer: {}", text),
            })
            .collect();
        let messages = [
            Message::new(Role::System, EXTRACTION_PROMPT),
            Message::new(Role::User, conversation.join("\n\n")),
        ];
        let reply = send_with_retry(client, &messages, &RetryPolicy::default())
            .await
            .map_err(|err| DebateError::Intake(err.to_string()))?;
        case_from_extraction(&reply.content)
    }
}

/// Build a case from the extraction reply: the JSON object between the first `{` and
/// the last `}`. Symptoms become chief complaints; chronic conditions and family
/// history become the history line.
pub fn case_from_extraction(reply: &str) -> Result<PatientCase, DebateError> {
    let json = match (reply.find('{'), reply.rfind('}')) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Err(DebateError::Intake("no JSON object in extraction reply".to_string())),
    };
    let value: Value =
        serde_json::from_str(json).map_err(|err| DebateError::Intake(err.to_string()))?;

    let age = match value.get("age") {
        Some(Value::Number(n)) => n.as_u64().map(|n| n as u32),
        Some(Value::String(s)) => s
            .trim()
            .trim_end_matches(|c: char| !c.is_ascii_digit())
            .parse()
            .ok(),
        _ => None,
    }
    .ok_or_else(|| DebateError::Intake("patient age is missing".to_string()))?;

    let gender = value
        .get("gender")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let mut history = Vec::new();
    let chronic = string_list(&value, "chronic_conditions");
    if !chronic.is_empty() {
        history.push(format!("Chronic conditions: {}", chronic.join(", ")));
    }
    let family = string_list(&value, "family_history");
    if !family.is_empty() {
        history.push(format!("Family history: {}", family.join(", ")));
    }

    let case = PatientCase {
        age,
        gender,
        chief_complaints: string_list(&value, "symptoms"),
        history: history.join(". "),
        current_medications: string_list(&value, "medications"),
        allergies: string_list(&value, "allergies"),
    };
    case.validate()?;
    Ok(case)
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn interviewer_prompt(language: Language) -> String {
    match language {
        Language::Korean => format!(
            "당신은 진단의학과 전문의입니다. 정확한 진단을 위한 문진을 수행합니다.\n\n\
             규칙:\n1. 질문은 한 번에 하나씩만 합니다\n2. 나이와 성별을 반드시 확인합니다\n\
             3. 만성 질환과 복용 중인 약을 확인합니다\n4. 필요하면 가족력을 확인합니다\n\
             5. 증상을 구체적으로 파악합니다\n\n\
             충분한 정보를 얻었다면 \"{}\"라고 명확히 표시하세요.",
            COMPLETION_MARKERS[1]
        ),
        _ => format!(
            "You are a diagnostic medicine specialist conducting a patient intake interview.\n\n\
             Rules:\n1. Ask exactly one question at a time\n2. Always confirm age and gender\n\
             3. Ask about chronic conditions and current medications\n\
             4. Ask about family history when relevant\n5. Pin the symptoms down precisely\n\n\
             When you have enough information, say \"{}\" clearly.\n\n{}",
            COMPLETION_MARKERS[0],
            language.response_instruction()
        ),
    }
}

const EXTRACTION_PROMPT: &str = "Extract the patient information from this intake interview as JSON.\n\
Reply with exactly this shape:\n\
{\n  \"age\": number or null,\n  \"gender\": string or null,\n  \"chronic_conditions\": [..],\n  \
\"medications\": [..],\n  \"allergies\": [..],\n  \"family_history\": [..],\n  \"symptoms\": [..]\n}";
