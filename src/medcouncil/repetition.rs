//! Keyword-set repetition detection for debate turns.
//!
//! A [`RepetitionDetector`] keeps a bounded, per-speaker history of [`Utterance`]s and
//! decides whether a new turn is a near restatement of an earlier one by comparing
//! keyword sets with Jaccard similarity.
//!
//! Keyword extraction is driven by a [`NormalizationTable`]: the minimum token length,
//! the suffixes stripped from the end of each token (so `"infections"` and
//! `"infection"` collapse, or a Korean noun with and without its case particle), and
//! the stop words that never count. Tables are plain data, so new languages do not
//! touch the similarity algorithm.
//!
//! # Example
//!
//! ```rust
//! use medcouncil::repetition::{DetectorConfig, RepetitionDetector};
//!
//! let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());
//!
//! let first = detector.check("Myasthenia gravis explains the fatigable ptosis", "dr-kim", 1);
//! assert!(!first.is_repetition);
//!
//! let second = detector.check("Fatigable ptosis explains myasthenia gravis", "dr-kim", 2);
//! assert!(second.is_repetition);
//! assert_eq!(second.matched_round, Some(1));
//! ```

use crate::medcouncil::config::ConfigError;
use lazy_static::lazy_static;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Normalized keywords of one utterance.
pub type KeywordSet = BTreeSet<String>;

lazy_static! {
    static ref MULTILINGUAL_TABLE: Arc<NormalizationTable> =
        Arc::new(NormalizationTable::multilingual());
}

/// Language data used to turn raw text into comparable keywords.
#[derive(Debug, Clone)]
pub struct NormalizationTable {
    /// Sorted longest first so the first match is the longest one.
    suffixes: Vec<String>,
    stop_words: HashSet<String>,
    min_token_chars: usize,
    /// Hangul tokens carry more meaning per character than Latin ones.
    min_hangul_token_chars: usize,
}

impl NormalizationTable {
    /// Build a table from arbitrary suffix and stop word lists.
    ///
    /// Tokens shorter than `min_token_chars` (in Unicode scalar values) are discarded,
    /// whatever script they are written in.
    pub fn new<S, W>(suffixes: S, stop_words: W, min_token_chars: usize) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        let mut suffixes: Vec<String> = suffixes
            .into_iter()
            .map(|s| s.into().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        suffixes.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()).then(a.cmp(b)));
        suffixes.dedup();

        NormalizationTable {
            suffixes,
            stop_words: stop_words
                .into_iter()
                .map(|w| w.into().to_lowercase())
                .collect(),
            min_token_chars,
            min_hangul_token_chars: min_token_chars,
        }
    }

    /// Use a different minimum length for tokens containing Hangul.
    pub fn with_hangul_min_chars(mut self, min_chars: usize) -> Self {
        self.min_hangul_token_chars = min_chars;
        self
    }

    /// English derivational and plural suffixes plus common connectives.
    pub fn english() -> Self {
        NormalizationTable::new(ENGLISH_SUFFIXES.iter().copied(), ENGLISH_STOP_WORDS.iter().copied(), 4)
    }

    /// Korean verb endings, copulas, and case particles plus common connectives.
    pub fn korean() -> Self {
        NormalizationTable::new(KOREAN_SUFFIXES.iter().copied(), KOREAN_STOP_WORDS.iter().copied(), 2)
    }

    /// English and Korean data merged; the minimum length depends on the token's script.
    pub fn multilingual() -> Self {
        NormalizationTable::new(
            ENGLISH_SUFFIXES.iter().chain(KOREAN_SUFFIXES.iter()).copied(),
            ENGLISH_STOP_WORDS
                .iter()
                .chain(KOREAN_STOP_WORDS.iter())
                .copied(),
            4,
        )
        .with_hangul_min_chars(2)
    }

    /// Shared instance of [`NormalizationTable::multilingual`].
    pub fn shared_multilingual() -> Arc<NormalizationTable> {
        Arc::clone(&MULTILINGUAL_TABLE)
    }

    fn min_chars_for(&self, token: &str) -> usize {
        if token.chars().any(is_hangul) {
            self.min_hangul_token_chars
        } else {
            self.min_token_chars
        }
    }

    /// Normalize one raw token, or `None` when it does not count as a keyword.
    pub fn normalize_token(&self, raw: &str) -> Option<String> {
        let lowered = raw.to_lowercase();
        let min_chars = self.min_chars_for(&lowered);
        if lowered.chars().count() < min_chars {
            return None;
        }

        let mut keyword = lowered.clone();
        if let Some(suffix) = self.suffixes.iter().find(|s| lowered.ends_with(s.as_str())) {
            let stem = &lowered[..lowered.len() - suffix.len()];
            let stem = stem.trim_end_matches(|c: char| c == '-' || c == '\'');
            if stem.chars().count() >= min_chars {
                keyword = stem.to_string();
            }
        }

        if self.stop_words.contains(&lowered) || self.stop_words.contains(&keyword) {
            return None;
        }
        Some(keyword)
    }

    /// Distinct normalized keywords of `text`, ignoring `min_keywords`.
    pub fn keywords(&self, text: &str) -> KeywordSet {
        tokenize(text)
            .filter_map(|token| self.normalize_token(token))
            .collect()
    }
}

impl Default for NormalizationTable {
    fn default() -> Self {
        NormalizationTable::multilingual()
    }
}

const ENGLISH_SUFFIXES: &[&str] = &[
    "ness", "ment", "like", "ical", "ally", "ing", "al", "ly", "ed", "s",
];

const ENGLISH_STOP_WORDS: &[&str] = &[
    "about", "after", "also", "because", "been", "being", "both", "could", "does", "each",
    "from", "have", "however", "into", "just", "more", "most", "much", "only", "other",
    "should", "some", "such", "than", "that", "their", "them", "then", "there",
    "therefore", "these", "they", "this", "those", "very", "were", "what", "when",
    "where", "which", "while", "will", "with", "would", "your",
];

const KOREAN_SUFFIXES: &[&str] = &[
    "입니다", "습니다", "합니다", "됩니다", "이다", "였다", "이었다", "한다", "된다", "하는",
    "했다", "으로", "에서", "에게", "까지", "부터", "적인", "적으로", "은", "는", "이",
    "가", "을", "를", "의", "에", "로", "와", "과", "도", "만",
];

const KOREAN_STOP_WORDS: &[&str] = &[
    "그리고", "그러나", "하지만", "또한", "때문", "따라서", "그래서", "있습니다", "있는",
    "같은", "이러한", "그런", "경우", "가능성", "생각",
];

fn is_hangul(c: char) -> bool {
    matches!(c, '\u{AC00}'..='\u{D7A3}' | '\u{1100}'..='\u{11FF}' | '\u{3130}'..='\u{318F}')
}

/// Split on anything that is not alphanumeric, keeping intra-word `-` and `'`.
fn tokenize(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '-' || c == '\''))
        .map(|token| token.trim_matches(|c: char| c == '-' || c == '\''))
        .filter(|token| !token.is_empty())
}

/// Jaccard similarity `|a ∩ b| / |a ∪ b|`; two empty sets score `0.0`.
pub fn jaccard(a: &KeywordSet, b: &KeywordSet) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Validated detector settings.
///
/// Fields are read through accessors so an instance can only be obtained from
/// [`DetectorConfig::new`] or [`Default`].
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    max_history: usize,
    similarity_threshold: f64,
    min_keywords: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            max_history: 10,
            similarity_threshold: 0.85,
            min_keywords: 2,
        }
    }
}

impl DetectorConfig {
    pub fn new(
        max_history: usize,
        similarity_threshold: f64,
        min_keywords: usize,
    ) -> Result<Self, ConfigError> {
        let config = DetectorConfig {
            max_history,
            similarity_threshold,
            min_keywords,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_history == 0 {
            return Err(ConfigError::ZeroMaxHistory);
        }
        if self.min_keywords == 0 {
            return Err(ConfigError::ZeroMinKeywords);
        }
        let t = self.similarity_threshold;
        if !t.is_finite() || t <= 0.0 || t > 1.0 {
            return Err(ConfigError::SimilarityThresholdOutOfRange(t));
        }
        Ok(())
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    pub fn min_keywords(&self) -> usize {
        self.min_keywords
    }
}

/// One recorded turn. Its keyword set is computed once when the turn is checked.
#[derive(Debug, Clone)]
pub struct Utterance {
    speaker_id: String,
    round_number: u32,
    raw_text: String,
    keyword_set: KeywordSet,
}

impl Utterance {
    pub fn speaker_id(&self) -> &str {
        &self.speaker_id
    }

    pub fn round_number(&self) -> u32 {
        self.round_number
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn keyword_set(&self) -> &KeywordSet {
        &self.keyword_set
    }
}

/// Outcome of comparing one turn against its speaker's history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarityVerdict {
    pub is_repetition: bool,
    /// Best Jaccard score found, in `[0, 1]`.
    pub score: f64,
    /// Round of the matched record; only set when `is_repetition` is true.
    pub matched_round: Option<u32>,
}

impl SimilarityVerdict {
    fn not_comparable() -> Self {
        SimilarityVerdict {
            is_repetition: false,
            score: 0.0,
            matched_round: None,
        }
    }
}

/// Flags turns that restate a speaker's earlier turns.
///
/// The configuration is fixed for the detector's lifetime. To change it, build a new
/// detector with [`RepetitionDetector::with_config`].
#[derive(Debug, Clone)]
pub struct RepetitionDetector {
    config: DetectorConfig,
    table: Arc<NormalizationTable>,
    histories: HashMap<String, VecDeque<Utterance>>,
}

impl RepetitionDetector {
    pub fn new(config: DetectorConfig, table: Arc<NormalizationTable>) -> Self {
        RepetitionDetector {
            config,
            table,
            histories: HashMap::new(),
        }
    }

    /// Detector backed by the shared English + Korean table.
    pub fn with_default_table(config: DetectorConfig) -> Self {
        RepetitionDetector::new(config, NormalizationTable::shared_multilingual())
    }

    /// A fresh detector with `config` and the same normalization table; history is
    /// not carried over.
    pub fn with_config(&self, config: DetectorConfig) -> Self {
        RepetitionDetector::new(config, Arc::clone(&self.table))
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Keywords of `text`, or an empty set when fewer than `min_keywords` survive.
    pub fn extract_keywords(&self, text: &str) -> KeywordSet {
        let keywords = self.table.keywords(text);
        if keywords.len() < self.config.min_keywords {
            KeywordSet::new()
        } else {
            keywords
        }
    }

    /// Compare `text` with the history of `tracking_key`, then record it.
    ///
    /// Texts with too few keywords are neither compared nor recorded.
    pub fn check(&mut self, text: &str, tracking_key: &str, round_number: u32) -> SimilarityVerdict {
        let keywords = self.extract_keywords(text);
        if keywords.is_empty() {
            return SimilarityVerdict::not_comparable();
        }
        let verdict = self.compare(&keywords, tracking_key);
        self.record(tracking_key, round_number, text, keywords);
        verdict
    }

    /// Check every turn of one round against the history as it stood before the round.
    ///
    /// Turns are `(tracking_key, text)` pairs. All comparisons happen first, then all
    /// comparable turns are recorded in order, so no turn of the round can match another
    /// turn of the same round.
    pub fn check_round(&mut self, round_number: u32, turns: &[(&str, &str)]) -> Vec<SimilarityVerdict> {
        let mut pending = Vec::with_capacity(turns.len());
        let mut verdicts = Vec::with_capacity(turns.len());

        for (tracking_key, text) in turns {
            let keywords = self.extract_keywords(text);
            if keywords.is_empty() {
                verdicts.push(SimilarityVerdict::not_comparable());
                continue;
            }
            verdicts.push(self.compare(&keywords, tracking_key));
            pending.push((*tracking_key, *text, keywords));
        }

        for (tracking_key, text, keywords) in pending {
            self.record(tracking_key, round_number, text, keywords);
        }
        verdicts
    }

    /// Recorded utterances of `tracking_key`, oldest first.
    pub fn history<'a>(&'a self, tracking_key: &str) -> impl Iterator<Item = &'a Utterance> + 'a {
        self.histories
            .get(tracking_key)
            .into_iter()
            .flat_map(|history| history.iter())
    }

    pub fn history_len(&self, tracking_key: &str) -> usize {
        self.histories.get(tracking_key).map_or(0, VecDeque::len)
    }

    fn compare(&self, keywords: &KeywordSet, tracking_key: &str) -> SimilarityVerdict {
        let history = match self.histories.get(tracking_key) {
            Some(history) => history,
            None => return SimilarityVerdict::not_comparable(),
        };

        let mut best_score = 0.0;
        let mut best_round = None;
        // newest first; a later tie never replaces the more recent match
        for previous in history.iter().rev() {
            let score = jaccard(keywords, &previous.keyword_set);
            if best_round.is_none() || score > best_score {
                best_score = score;
                best_round = Some(previous.round_number);
            }
        }

        if best_score >= self.config.similarity_threshold {
            SimilarityVerdict {
                is_repetition: true,
                score: best_score,
                matched_round: best_round,
            }
        } else {
            SimilarityVerdict {
                is_repetition: false,
                score: best_score,
                matched_round: None,
            }
        }
    }

    fn record(&mut self, tracking_key: &str, round_number: u32, text: &str, keywords: KeywordSet) {
        let max_history = self.config.max_history;
        let history = self
            .histories
            .entry(tracking_key.to_string())
            .or_insert_with(|| VecDeque::with_capacity(max_history));
        while history.len() >= max_history {
            if history.pop_front().is_none() {
                break;
            }
        }
        history.push_back(Utterance {
            speaker_id: tracking_key.to_string(),
            round_number,
            raw_text: text.to_string(),
            keyword_set: keywords,
        });
    }
}
