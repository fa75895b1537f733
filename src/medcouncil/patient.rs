//! The patient case under discussion and the specialties it calls for.

use crate::medcouncil::roster::Language;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs;
use std::path::Path;

/// Upper bound on the number of specialties a case pulls in.
pub const MAX_SPECIALTIES: usize = 6;

#[derive(Debug)]
pub enum PatientError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    /// The case parsed but is unusable (e.g. no complaints at all).
    Invalid(String),
}

impl fmt::Display for PatientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatientError::Io(err) => write!(f, "Failed to read patient case: {}", err),
            PatientError::Parse(err) => write!(f, "Invalid patient case JSON: {}", err),
            PatientError::Invalid(msg) => write!(f, "Invalid patient case: {}", msg),
        }
    }
}

impl Error for PatientError {}

impl From<std::io::Error> for PatientError {
    fn from(err: std::io::Error) -> Self {
        PatientError::Io(err)
    }
}

impl From<serde_json::Error> for PatientError {
    fn from(err: serde_json::Error) -> Self {
        PatientError::Parse(err)
    }
}

/// Everything the council knows about the patient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientCase {
    pub age: u32,
    pub gender: String,
    pub chief_complaints: Vec<String>,
    #[serde(default)]
    pub history: String,
    #[serde(default)]
    pub current_medications: Vec<String>,
    #[serde(default)]
    pub allergies: Vec<String>,
}

impl PatientCase {
    /// Parse a case from a JSON document.
    ///
    /// ```rust
    /// use medcouncil::patient::PatientCase;
    ///
    /// let case = PatientCase::from_json_str(
    ///     r#"{"age": 45, "gender": "female", "chief_complaints": ["double vision"]}"#,
    /// ).unwrap();
    /// assert!(case.current_medications.is_empty());
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, PatientError> {
        let case: PatientCase = serde_json::from_str(json)?;
        case.validate()?;
        Ok(case)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, PatientError> {
        let raw = fs::read_to_string(path.as_ref())?;
        log::debug!("loaded patient case from {}", path.as_ref().display());
        PatientCase::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), PatientError> {
        if self.chief_complaints.iter().all(|c| c.trim().is_empty()) {
            return Err(PatientError::Invalid(
                "at least one chief complaint is required".to_string(),
            ));
        }
        Ok(())
    }

    /// A worked example case used by the demo when no file is given.
    pub fn sample() -> Self {
        PatientCase {
            age: 45,
            gender: "female".to_string(),
            chief_complaints: vec![
                "double vision".to_string(),
                "drooping eyelids worse in the evening".to_string(),
                "muscle fatigue after exertion".to_string(),
            ],
            history: "Symptoms started three months ago and fluctuate during the day. \
                      Hypertension for five years."
                .to_string(),
            current_medications: vec!["amlodipine 5mg".to_string()],
            allergies: Vec::new(),
        }
    }

    /// Render the case as the context block every prompt starts with.
    pub fn context(&self, language: Language) -> String {
        let join_or = |items: &[String], none: &str| {
            if items.is_empty() {
                none.to_string()
            } else {
                items.join(", ")
            }
        };
        match language {
            Language::Korean => format!(
                "환자 정보:\n- 나이/성별: {}세 {}\n- 주 증상: {}\n- 병력: {}\n- 현재 복용 약물: {}\n- 알레르기: {}\n",
                self.age,
                self.gender,
                self.chief_complaints.join(", "),
                self.history,
                join_or(&self.current_medications, "없음"),
                join_or(&self.allergies, "없음"),
            ),
            _ => format!(
                "Patient Information:\n- Age/Gender: {} years old, {}\n- Chief Complaints: {}\n- Medical History: {}\n- Current Medications: {}\n- Known Allergies: {}\n",
                self.age,
                self.gender,
                self.chief_complaints.join(", "),
                self.history,
                join_or(&self.current_medications, "None"),
                join_or(&self.allergies, "None"),
            ),
        }
    }

    /// Specialties to convene for this case.
    ///
    /// Starts from a base set, adds a specialty for every symptom family mentioned in
    /// the complaints or history (English and Korean keywords), keeps the first
    /// occurrence of each, and caps the list at [`MAX_SPECIALTIES`].
    pub fn select_specialties(&self, language: Language) -> Vec<String> {
        let korean = language == Language::Korean;
        let name = |rule: &SpecialtyRule| if korean { rule.ko } else { rule.en };

        let mut selected: Vec<&str> = BASE_SPECIALTIES
            .iter()
            .map(|(en, ko)| if korean { *ko } else { *en })
            .collect();

        let mut symptoms = self.chief_complaints.join(" ");
        symptoms.push(' ');
        symptoms.push_str(&self.history);
        let symptoms = symptoms.to_lowercase();

        for rule in SPECIALTY_RULES {
            let mentioned = rule
                .keywords_en
                .iter()
                .chain(rule.keywords_ko.iter())
                .any(|kw| symptoms.contains(kw));
            if mentioned {
                selected.push(name(rule));
            }
        }

        let mut unique: Vec<String> = Vec::with_capacity(selected.len());
        for specialty in selected {
            if !unique.iter().any(|s| s == specialty) {
                unique.push(specialty.to_string());
            }
        }
        unique.truncate(MAX_SPECIALTIES);
        unique
    }
}

struct SpecialtyRule {
    en: &'static str,
    ko: &'static str,
    keywords_en: &'static [&'static str],
    keywords_ko: &'static [&'static str],
}

const BASE_SPECIALTIES: &[(&str, &str)] = &[
    ("Neurology", "신경과"),
    ("Internal Medicine", "내과"),
    ("Orthopedics", "정형외과"),
    ("Rheumatology", "류마티스내과"),
];

const SPECIALTY_RULES: &[SpecialtyRule] = &[
    SpecialtyRule {
        en: "Ophthalmology",
        ko: "안과",
        keywords_en: &["eye", "vision", "double vision", "eyelid", "ptosis", "visual"],
        keywords_ko: &["눈", "시력", "복시", "안검"],
    },
    SpecialtyRule {
        en: "Dermatology",
        ko: "피부과",
        keywords_en: &["skin", "rash", "itch", "dermat"],
        keywords_ko: &["피부", "발진", "가려움"],
    },
    SpecialtyRule {
        en: "Cardiology",
        ko: "심장내과",
        keywords_en: &["heart", "chest pain", "palpitation", "cardiac", "chest"],
        keywords_ko: &["심장", "가슴", "흉통", "두근"],
    },
    SpecialtyRule {
        en: "Pulmonology",
        ko: "호흡기내과",
        keywords_en: &["breath", "cough", "respiratory", "lung", "asthma"],
        keywords_ko: &["호흡", "기침", "숨"],
    },
    SpecialtyRule {
        en: "Gastroenterology",
        ko: "소화내과",
        keywords_en: &["stomach", "liver", "abdominal", "digestion", "nausea", "bowel"],
        keywords_ko: &["위", "간", "복통", "소화", "간장"],
    },
    SpecialtyRule {
        en: "Neurology",
        ko: "신경과",
        keywords_en: &["headache", "migraine", "head pain"],
        keywords_ko: &["두통", "두장"],
    },
    SpecialtyRule {
        en: "Rheumatology",
        ko: "류마티스내과",
        keywords_en: &["muscle", "fatigue", "weakness", "myalgia"],
        keywords_ko: &["근육통", "피로", "근육"],
    },
];
