//! Reading structured verdicts out of free-form model replies.
//!
//! Referees are asked to finish with a one-line JSON object such as
//! `{"consensus_reached": true}` and specialists to answer with `Diagnosis:` /
//! `Confidence:` / `Reasoning:` lines. Models do not always comply, so every parser here
//! degrades gracefully: JSON first, then phrase matching, then a safe default.

use serde::Serialize;
use serde_json::Value;

const CONSENSUS_KEY: &str = "consensus_reached";

const NEGATIVE_PHRASES_EN: &[&str] = &[
    "not reached",
    "not yet reached",
    "not achieved",
    "no consensus",
    "has not been reached",
    "consensus is not",
];
const NEGATIVE_PHRASES_KO: &[&str] = &["도달하지 못", "합의되지 않", "합의 안", "아직 합의", "미도달"];
const POSITIVE_PHRASES_EN: &[&str] = &[
    "consensus reached",
    "consensus achieved",
    "consensus has been reached",
    "reached consensus",
];
const POSITIVE_PHRASES_KO: &[&str] = &["합의에 도달", "합의가 달성", "합의 도달"];

/// Where a [`ConsensusVerdict`] was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    /// A `consensus_reached` object inside a fenced ```json block.
    FencedJson,
    /// A `consensus_reached` object anywhere in the reply.
    InlineJson,
    NegativePhrase,
    PositivePhrase,
    /// Nothing recognizable; treated as no consensus.
    Undetermined,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsensusVerdict {
    pub reached: bool,
    pub source: VerdictSource,
    /// The agreed diagnosis when the reply names one (`"diagnosis"` JSON field or a
    /// `Consensus reached: <diagnosis>` line).
    pub diagnosis: Option<String>,
}

/// Decide whether a referee reply declares consensus.
///
/// Negative phrases are checked before positive ones because "consensus has not been
/// reached" contains "consensus ... reached".
pub fn parse_consensus(text: &str) -> ConsensusVerdict {
    let (scope, fenced) = match fenced_json_block(text) {
        Some(block) => (block, true),
        None => (text, false),
    };

    if let Some((reached, diagnosis)) = find_consensus_object(scope) {
        return ConsensusVerdict {
            reached,
            source: if fenced {
                VerdictSource::FencedJson
            } else {
                VerdictSource::InlineJson
            },
            diagnosis,
        };
    }

    let lowered = text.to_lowercase();
    let negative = NEGATIVE_PHRASES_EN.iter().any(|p| lowered.contains(p))
        || NEGATIVE_PHRASES_KO.iter().any(|p| text.contains(p));
    if negative {
        return ConsensusVerdict {
            reached: false,
            source: VerdictSource::NegativePhrase,
            diagnosis: None,
        };
    }

    let positive = POSITIVE_PHRASES_EN.iter().any(|p| lowered.contains(p))
        || POSITIVE_PHRASES_KO.iter().any(|p| text.contains(p));
    if positive {
        return ConsensusVerdict {
            reached: true,
            source: VerdictSource::PositivePhrase,
            diagnosis: agreed_diagnosis_line(text),
        };
    }

    ConsensusVerdict {
        reached: false,
        source: VerdictSource::Undetermined,
        diagnosis: None,
    }
}

/// Contents of the first ```json fenced block, if it is closed.
fn fenced_json_block(text: &str) -> Option<&str> {
    let lowered = text.to_ascii_lowercase();
    let start = lowered.find("```json")? + "```json".len();
    let end = start + lowered[start..].find("```")?;
    Some(text[start..end].trim())
}

/// Find `{ ... "consensus_reached": true|false ... }` with no nested closing brace
/// before the key, and read the boolean (plus an optional `diagnosis` field).
fn find_consensus_object(scope: &str) -> Option<(bool, Option<String>)> {
    // ASCII lowering keeps byte offsets aligned with `scope`
    let lowered = scope.to_ascii_lowercase();
    let mut search_from = 0;

    while let Some(found) = lowered[search_from..].find(CONSENSUS_KEY) {
        let key_at = search_from + found;
        search_from = key_at + CONSENSUS_KEY.len();

        let open = match lowered[..key_at].rfind('{') {
            Some(open) if !lowered[open..key_at].contains('}') => open,
            _ => continue,
        };

        let after_key = lowered[search_from..]
            .trim_start_matches(|c: char| c == '"' || c == '\'')
            .trim_start();
        let value = match after_key.strip_prefix(':') {
            Some(rest) => rest.trim_start(),
            None => continue,
        };
        let literal = if value.starts_with("true") {
            true
        } else if value.starts_with("false") {
            false
        } else {
            continue;
        };

        let close = match lowered[search_from..].find('}') {
            Some(offset) => search_from + offset,
            None => continue,
        };

        let object = &scope[open..=close];
        return Some(match serde_json::from_str::<Value>(object) {
            Ok(parsed) => {
                let reached = parsed
                    .get(CONSENSUS_KEY)
                    .and_then(Value::as_bool)
                    .unwrap_or(literal);
                let diagnosis = parsed
                    .get("diagnosis")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string);
                (reached, diagnosis)
            }
            Err(err) => {
                log::debug!("consensus object is not strict JSON ({}), using literal", err);
                (literal, None)
            }
        });
    }
    None
}

fn agreed_diagnosis_line(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        labelled_value(line, &["consensus reached:", "합의 도달:"])
            .map(|value| value.trim_matches(|c: char| c == '[' || c == ']').trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// If `line` starts with one of `labels` (ASCII case-insensitive, ignoring leading
/// markdown bullets and emphasis), return the text after the label.
fn labelled_value<'a>(line: &'a str, labels: &[&str]) -> Option<&'a str> {
    let cleaned = line.trim_start_matches(|c: char| c == '*' || c == '-' || c == '#' || c.is_whitespace());
    labels.iter().find_map(|label| {
        let head = cleaned.get(..label.len())?;
        if head.eq_ignore_ascii_case(label) {
            Some(cleaned[label.len()..].trim_start_matches('*').trim())
        } else {
            None
        }
    })
}

/// Normalize a diagnosis label for tallying: trimmed, lower-cased, internal whitespace
/// collapsed, wrapping quotes/emphasis and trailing punctuation removed.
///
/// ```rust
/// use medcouncil::consensus::canonical_label;
///
/// assert_eq!(canonical_label("  **Myasthenia   Gravis**. "), "myasthenia gravis");
/// ```
pub fn canonical_label(label: &str) -> String {
    let collapsed = label
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_matches(|c: char| c == '*' || c == '"' || c == '\'' || c == '`')
        .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?' | '*' | '"' | '\''))
        .trim()
        .to_string()
}

/// A specialist's structured answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosisOpinion {
    pub speaker: String,
    /// `None` when the reply names no diagnosis or an explicit "unknown".
    pub diagnosis: Option<String>,
    /// In `[0, 1]`; 0.5 when the reply gives none.
    pub confidence: f64,
    pub reasoning: String,
}

impl DiagnosisOpinion {
    pub const DEFAULT_CONFIDENCE: f64 = 0.5;

    /// Read `Diagnosis:`/`진단명:`, `Confidence:`/`확신도:` and `Reasoning:`/`근거:`
    /// fields out of a reply. The reasoning runs to the end of the reply; without a
    /// reasoning label the whole reply is used.
    pub fn parse(speaker: &str, text: &str) -> Self {
        let mut diagnosis = None;
        let mut confidence = None;
        let mut reasoning = None;

        let lines: Vec<&str> = text.lines().collect();
        for (idx, line) in lines.iter().enumerate() {
            if diagnosis.is_none() {
                if let Some(value) = labelled_value(line, &["diagnosis:", "진단명:"]) {
                    diagnosis = Some(value.to_string());
                    continue;
                }
            }
            if confidence.is_none() {
                if let Some(value) = labelled_value(line, &["confidence:", "확신도:"]) {
                    confidence = parse_confidence(value);
                    continue;
                }
            }
            if reasoning.is_none() {
                if let Some(value) = labelled_value(line, &["reasoning:", "근거:"]) {
                    let mut body = vec![value];
                    body.extend(lines[idx + 1..].iter().copied());
                    reasoning = Some(body.join("\n").trim().to_string());
                    break;
                }
            }
        }

        let diagnosis = diagnosis.filter(|d| {
            let label = canonical_label(d);
            !label.is_empty() && label != "unknown" && label != "진단 미상"
        });

        DiagnosisOpinion {
            speaker: speaker.to_string(),
            diagnosis,
            confidence: confidence.unwrap_or(Self::DEFAULT_CONFIDENCE),
            reasoning: reasoning.unwrap_or_else(|| text.trim().to_string()),
        }
    }

    /// Canonical tally label of the diagnosis, if any.
    pub fn label(&self) -> Option<String> {
        self.diagnosis.as_deref().map(canonical_label)
    }
}

/// Leading number of `value`. Both `85%` and a bare `85` read as 0.85, since anything
/// above 1 can only be a percentage. Clamped to `[0, 1]`.
fn parse_confidence(value: &str) -> Option<f64> {
    let number: String = value
        .trim()
        .chars()
        .take_while(|c: &char| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parsed: f64 = number.parse().ok()?;
    let percent_sign = value.trim()[number.len()..].trim_start().starts_with('%');
    if percent_sign || parsed > 1.0 {
        parsed /= 100.0;
    }
    Some(parsed.max(0.0).min(1.0))
}
