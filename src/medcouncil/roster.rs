//! Who takes part in a debate: specialist [`Doctor`]s, alternating [`Referee`]s, and the
//! provider clients behind them.
//!
//! Doctors are spread across every available provider so that no two members of a
//! discussion group share the same model whenever that can be avoided. Two referees
//! alternate by round and are reset on staggered schedules so that neither carries
//! bias from too many earlier rounds:
//!
//! ```text
//! Referee A (init 0): reset at rounds 5, 10, 15, ...
//! Referee B (init 2): reset at rounds 2, 7, 12, ...
//! active referee for round r: referees[r % 2]
//! ```

use crate::client_wrapper::{ClientWrapper, Message, Role, TokenUsage};
use crate::clients::claude::{self, ClaudeClient};
use crate::clients::common::{send_with_retry, RetryPolicy};
use crate::clients::gemini::{self, GeminiClient};
use crate::clients::grok::{self, GrokClient};
use crate::clients::openai::{self, OpenAIClient};
use crate::medcouncil::config::ProviderKeys;
use crate::medcouncil::llm_session::LLMSession;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// Context window given to referee sessions.
pub const REFEREE_CONTEXT_TOKENS: usize = 32_768;

/// LLM vendors a doctor or referee can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Gpt,
    Gemini,
    Grok,
}

impl Provider {
    pub fn all() -> &'static [Provider] {
        &[Provider::Claude, Provider::Gpt, Provider::Gemini, Provider::Grok]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Gpt => "gpt",
            Provider::Gemini => "gemini",
            Provider::Grok => "grok",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response language of every persona in a debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ko")]
    Korean,
    #[serde(rename = "es")]
    Spanish,
    #[serde(rename = "ja")]
    Japanese,
    #[serde(rename = "zh")]
    Chinese,
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "de")]
    German,
}

impl Language {
    /// Parse an ISO 639-1 code such as `"ko"`.
    pub fn from_code(code: &str) -> Option<Language> {
        match code.trim().to_ascii_lowercase().as_str() {
            "en" => Some(Language::English),
            "ko" => Some(Language::Korean),
            "es" => Some(Language::Spanish),
            "ja" => Some(Language::Japanese),
            "zh" => Some(Language::Chinese),
            "fr" => Some(Language::French),
            "de" => Some(Language::German),
            _ => None,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Korean => "ko",
            Language::Spanish => "es",
            Language::Japanese => "ja",
            Language::Chinese => "zh",
            Language::French => "fr",
            Language::German => "de",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Language::English => "English",
            Language::Korean => "한국어 (Korean)",
            Language::Spanish => "Español (Spanish)",
            Language::Japanese => "日本語 (Japanese)",
            Language::Chinese => "中文 (Chinese)",
            Language::French => "Français (French)",
            Language::German => "Deutsch (German)",
        }
    }

    /// Instruction appended to every persona prompt.
    pub fn response_instruction(self) -> &'static str {
        match self {
            Language::English => "Respond in English.",
            Language::Korean => "한국어로 응답하세요.",
            Language::Spanish => "Responde en español.",
            Language::Japanese => "日本語で回答してください。",
            Language::Chinese => "请用中文回答。",
            Language::French => "Répondez en français.",
            Language::German => "Antworten Sie auf Deutsch.",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Language::English
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RosterError {
    /// Groups need at least two doctors.
    NotEnoughDoctors(usize),
    /// The provider pool is empty.
    NoProviders,
    NoSpecialties,
}

impl fmt::Display for RosterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RosterError::NotEnoughDoctors(n) => write!(
                f,
                "At least 2 doctors are required to form groups, but only {} available",
                n
            ),
            RosterError::NoProviders => write!(f, "No LLM providers available"),
            RosterError::NoSpecialties => write!(f, "No specialties selected"),
        }
    }
}

impl Error for RosterError {}

/// Creates a fresh client for one doctor or referee.
pub type ClientFactory = Arc<dyn Fn() -> Arc<dyn ClientWrapper> + Send + Sync>;

/// The providers a council may use, in the order doctors are assigned to them.
#[derive(Clone, Default)]
pub struct ProviderPool {
    entries: Vec<(Provider, ClientFactory)>,
}

impl ProviderPool {
    pub fn new() -> Self {
        ProviderPool::default()
    }

    /// Add (or replace) the factory for `provider`.
    pub fn with_provider(mut self, provider: Provider, factory: ClientFactory) -> Self {
        match self.entries.iter_mut().find(|(p, _)| *p == provider) {
            Some(entry) => entry.1 = factory,
            None => self.entries.push((provider, factory)),
        }
        self
    }

    /// One provider per configured key, using each vendor's default debate model.
    pub fn from_keys(keys: &ProviderKeys) -> Self {
        let mut pool = ProviderPool::new();
        for provider in keys.available_providers() {
            let key = match keys.key_for(provider) {
                Some(key) => key.to_string(),
                None => continue,
            };
            let factory: ClientFactory = match provider {
                Provider::Claude => Arc::new(move || {
                    Arc::new(ClaudeClient::new_with_model_enum(
                        &key,
                        claude::Model::ClaudeSonnet4,
                    )) as Arc<dyn ClientWrapper>
                }),
                Provider::Gpt => Arc::new(move || {
                    Arc::new(OpenAIClient::new_with_model_enum(&key, openai::Model::GPT4))
                        as Arc<dyn ClientWrapper>
                }),
                Provider::Gemini => Arc::new(move || {
                    Arc::new(GeminiClient::new_with_model_enum(
                        &key,
                        gemini::Model::Gemini20Flash,
                    )) as Arc<dyn ClientWrapper>
                }),
                Provider::Grok => Arc::new(move || {
                    Arc::new(GrokClient::new_with_model_enum(&key, grok::Model::Grok4))
                        as Arc<dyn ClientWrapper>
                }),
            };
            pool = pool.with_provider(provider, factory);
        }
        pool
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.entries.iter().map(|(p, _)| *p).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A new client for `provider`, if it is in the pool.
    pub fn create(&self, provider: Provider) -> Option<Arc<dyn ClientWrapper>> {
        self.entries
            .iter()
            .find(|(p, _)| *p == provider)
            .map(|(_, factory)| factory())
    }

    /// Provider for the `index`-th assignment, cycling through the pool.
    fn nth_cyclic(&self, index: usize) -> Option<&(Provider, ClientFactory)> {
        if self.entries.is_empty() {
            None
        } else {
            self.entries.get(index % self.entries.len())
        }
    }
}

/// An independent specialist. Doctors keep no conversation state: everything they need
/// for a turn is in the prompt, so one doctor can serve two groups in the same round.
#[derive(Clone)]
pub struct Doctor {
    pub name: String,
    pub specialty: String,
    pub years_experience: u32,
    pub personality_traits: Vec<String>,
    pub provider: Provider,
    pub language: Language,
    client: Arc<dyn ClientWrapper>,
}

impl fmt::Debug for Doctor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Dr. {} ({}, {})",
            self.name,
            self.specialty,
            self.client.model_name()
        )
    }
}

impl Doctor {
    pub fn new(
        name: impl Into<String>,
        specialty: impl Into<String>,
        provider: Provider,
        client: Arc<dyn ClientWrapper>,
        language: Language,
    ) -> Self {
        Doctor {
            name: name.into(),
            specialty: specialty.into(),
            years_experience: 10,
            personality_traits: Vec::new(),
            provider,
            language,
            client,
        }
    }

    pub fn with_experience(mut self, years: u32) -> Self {
        self.years_experience = years;
        self
    }

    pub fn with_personality(mut self, traits: Vec<String>) -> Self {
        self.personality_traits = traits;
        self
    }

    pub fn model_name(&self) -> &str {
        self.client.model_name()
    }

    pub fn persona_prompt(&self) -> String {
        let traits = self.personality_traits.join(", ");
        match self.language {
            Language::Korean => format!(
                "당신은 {} {} 전문의입니다.\n경력: {}년\n성격: {}\n\n\
                 당신은 자신만의 의견을 가진 독립적인 의사입니다. 다른 의사와 의견이 달라도 괜찮습니다.\n\
                 항상 의학적 근거로 판단하되 자신의 관점을 유지하세요.\n\n{}",
                self.name,
                self.specialty,
                self.years_experience,
                traits,
                self.language.response_instruction()
            ),
            _ => format!(
                "You are Dr. {}, a {} specialist.\nExperience: {} years\nPersonality: {}\n\n\
                 You are an independent doctor with your own opinions and may disagree with colleagues.\n\
                 Base every judgment on medical evidence while keeping your own perspective.\n\n{}",
                self.name,
                self.specialty,
                self.years_experience,
                traits,
                self.language.response_instruction()
            ),
        }
    }

    /// Form an opinion on `question` about the case in `context`.
    ///
    /// Returns the reply text and the usage reported for the call.
    pub async fn think(
        &self,
        context: &str,
        question: &str,
        retry: &RetryPolicy,
    ) -> Result<(String, Option<TokenUsage>), Box<dyn Error + Send + Sync>> {
        let messages = [
            Message::new(Role::System, self.persona_prompt()),
            Message::new(Role::User, format!("{}\n\n{}", context, question)),
        ];
        let reply = send_with_retry(self.client.as_ref(), &messages, retry).await?;
        Ok((reply.content.to_string(), self.client.get_last_usage()))
    }
}

/// An impartial judge with its own memory of the rounds it refereed.
pub struct Referee {
    pub name: String,
    pub provider: Provider,
    /// Round the reset schedule is anchored to.
    pub initialization_round: u32,
    pub language: Language,
    session: LLMSession,
    resets: usize,
}

impl fmt::Debug for Referee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, init at round {})",
            self.name,
            self.session.client().model_name(),
            self.initialization_round
        )
    }
}

impl Referee {
    pub fn new(
        name: impl Into<String>,
        provider: Provider,
        client: Arc<dyn ClientWrapper>,
        initialization_round: u32,
        language: Language,
    ) -> Self {
        let name = name.into();
        let persona = referee_persona(&name, language);
        Referee {
            name,
            provider,
            initialization_round,
            language,
            session: LLMSession::new(client, persona, REFEREE_CONTEXT_TOKENS),
            resets: 0,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.session = self.session.with_retry_policy(retry);
        self
    }

    /// Never at round 0; otherwise every `period` rounds counted from the
    /// initialization round, including the initialization round itself.
    pub fn should_reset(&self, round: u32, period: u32) -> bool {
        round != 0
            && period != 0
            && round >= self.initialization_round
            && (round - self.initialization_round) % period == 0
    }

    /// Wipe the referee's memory of earlier rounds.
    pub fn reset(&mut self) {
        log::info!("resetting {} (contamination prevention)", self.name);
        self.session.clear_history();
        self.resets += 1;
    }

    pub fn resets(&self) -> usize {
        self.resets
    }

    /// Number of messages the referee currently remembers.
    pub fn memory_len(&self) -> usize {
        self.session.history().len()
    }

    pub fn client(&self) -> &Arc<dyn ClientWrapper> {
        self.session.client()
    }

    pub fn model_name(&self) -> &str {
        self.session.client().model_name()
    }

    pub fn token_usage(&self) -> TokenUsage {
        self.session.token_usage()
    }

    /// Ask the referee something; the exchange becomes part of its memory.
    pub async fn evaluate(&mut self, question: String) -> Result<String, Box<dyn Error + Send + Sync>> {
        let reply = self.session.send_message(Role::User, question).await?;
        Ok(reply.content.to_string())
    }
}

fn referee_persona(name: &str, language: Language) -> String {
    match language {
        Language::Korean => format!(
            "당신은 {}, 공정한 의료 진단 심판(referee)입니다.\n경력: 30년 진단의학\n\n\
             역할:\n1. 의학적 근거가 부족한 주장 지적\n2. 환각(존재하지 않는 약물, 치료법 등) 탐지\n\
             3. 놓친 감별 진단 제시\n4. 복용 약물의 부작용과 상호작용이 증상을 설명하는지 확인\n\n\
             목표는 토론의 승리가 아니라 정확한 진단입니다.\n\n{}",
            name,
            language.response_instruction()
        ),
        _ => format!(
            "You are {}, an impartial medical diagnosis referee.\nExperience: 30 years in diagnostic medicine\n\n\
             Your role:\n1. Identify medically unsupported claims\n\
             2. Detect hallucinations (non-existent drugs, treatments, etc.)\n\
             3. Point out missed differential diagnoses\n\
             4. Check whether side effects or interactions of the patient's medications explain the symptoms\n\n\
             Your goal is an accurate diagnosis, not winning debates.\n\n{}",
            name,
            language.response_instruction()
        ),
    }
}

const SURNAMES_EN: &[&str] = &[
    "Kim", "Lee", "Park", "Choi", "Jung", "Kang", "Cho", "Yoon", "Jang", "Lim",
];
const SURNAMES_KO: &[&str] = &["김", "이", "박", "최", "정", "강", "조", "윤", "장", "임"];

const PERSONALITIES_EN: &[&[&str]] = &[
    &["cautious", "analytical", "systematic"],
    &["proactive", "innovative", "challenging"],
    &["empathetic", "meticulous", "patient-centered"],
    &["logical", "objective", "evidence-based"],
    &["experienced", "intuitive", "insightful"],
    &["conservative", "safety-first", "principled"],
    &["collaborative", "communicative", "team player"],
    &["independent", "self-directed", "decisive"],
];
const PERSONALITIES_KO: &[&[&str]] = &[
    &["신중한", "분석적", "체계적"],
    &["적극적", "혁신적", "도전적"],
    &["공감적", "세심한", "환자중심"],
    &["논리적", "객관적", "근거중심"],
    &["경험적", "직관적", "통찰력있는"],
    &["보수적", "안전제일", "원칙주의"],
    &["협업적", "소통중시", "팀플레이어"],
    &["독립적", "자기주도적", "결단력있는"],
];

/// Two doctors per specialty, assigned to providers round-robin.
///
/// Names, experience and personalities are derived from the doctor's position so the
/// same inputs always produce the same roster.
pub fn build_doctor_pool(
    specialties: &[String],
    pool: &ProviderPool,
    language: Language,
) -> Result<Vec<Doctor>, RosterError> {
    if pool.is_empty() {
        return Err(RosterError::NoProviders);
    }
    if specialties.is_empty() {
        return Err(RosterError::NoSpecialties);
    }

    let (surnames, personalities) = match language {
        Language::Korean => (SURNAMES_KO, PERSONALITIES_KO),
        _ => (SURNAMES_EN, PERSONALITIES_EN),
    };

    let mut doctors = Vec::with_capacity(specialties.len() * 2);
    let mut used_names = HashSet::new();

    for specialty in specialties {
        let prefix: String = specialty.chars().take(2).collect();
        for seat in 1..=2u32 {
            let index = doctors.len();
            let (provider, factory) = match pool.nth_cyclic(index) {
                Some(entry) => entry,
                None => return Err(RosterError::NoProviders),
            };

            let surname = surnames[index % surnames.len()];
            let mut name = match language {
                Language::Korean => format!("{}{}{}", surname, prefix, seat),
                _ => format!("{} {}{}", surname, prefix, seat),
            };
            if used_names.contains(&name) {
                name = format!("{}_{}", name, used_names.len());
            }
            used_names.insert(name.clone());

            let traits = personalities[(index * 3) % personalities.len()]
                .iter()
                .map(|t| t.to_string())
                .collect();

            doctors.push(
                Doctor::new(name, specialty.as_str(), *provider, factory(), language)
                    .with_experience(7 + ((index as u32 * 7) % 19))
                    .with_personality(traits),
            );
        }
    }

    log::info!("created {} independent doctors", doctors.len());
    for doctor in &doctors {
        log::debug!("  - {:?}", doctor);
    }
    Ok(doctors)
}

/// Referee A on the first provider (init round 0) and referee B on the second
/// provider, or the first again when only one is available (init round 2).
pub fn build_referees(
    pool: &ProviderPool,
    language: Language,
    retry: &RetryPolicy,
) -> Result<Vec<Referee>, RosterError> {
    let providers = pool.providers();
    let provider_a = *providers.first().ok_or(RosterError::NoProviders)?;
    let provider_b = *providers.get(1).unwrap_or(&provider_a);

    let (name_a, name_b) = match language {
        Language::Korean => ("심판 A", "심판 B"),
        _ => ("Referee A", "Referee B"),
    };

    let mut referees = Vec::with_capacity(2);
    for (name, provider, init) in [(name_a, provider_a, 0), (name_b, provider_b, 2)].iter() {
        let client = pool.create(*provider).ok_or(RosterError::NoProviders)?;
        referees.push(
            Referee::new(*name, *provider, client, *init, language).with_retry_policy(retry.clone()),
        );
    }

    for referee in &referees {
        log::info!("referee: {:?}", referee);
    }
    Ok(referees)
}

/// Index of the referee presiding over `round`.
pub fn active_referee_index(round: u32, referee_count: usize) -> usize {
    if referee_count == 0 {
        0
    } else {
        round as usize % referee_count
    }
}

/// Pair every doctor with the nearest following doctor on a different provider
/// (or simply the next doctor when everyone shares one provider). Duplicate pairs are
/// dropped, so the result may hold fewer groups than doctors.
///
/// Groups are returned as index pairs into `doctors`.
pub fn circular_groups(doctors: &[Doctor]) -> Result<Vec<(usize, usize)>, RosterError> {
    let n = doctors.len();
    if n < 2 {
        return Err(RosterError::NotEnoughDoctors(n));
    }

    let mut groups = Vec::with_capacity(n);
    let mut used_pairs = HashSet::new();

    for i in 0..n {
        let partner = (1..n)
            .map(|offset| (i + offset) % n)
            .find(|&j| doctors[j].provider != doctors[i].provider)
            .unwrap_or((i + 1) % n);

        let pair = (i.min(partner), i.max(partner));
        if used_pairs.insert(pair) {
            groups.push((i, partner));
        }
    }

    for (idx, (a, b)) in groups.iter().enumerate() {
        let same = doctors[*a].provider == doctors[*b].provider;
        log::debug!(
            "group {}: {} ({}) + {} ({}){}",
            idx + 1,
            doctors[*a].name,
            doctors[*a].model_name(),
            doctors[*b].name,
            doctors[*b].model_name(),
            if same { " [same provider]" } else { "" }
        );
    }
    Ok(groups)
}
