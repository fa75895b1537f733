use medcouncil::config::ConfigError;
use medcouncil::repetition::{
    jaccard, DetectorConfig, KeywordSet, NormalizationTable, RepetitionDetector,
};
use std::sync::Arc;

fn copula_table() -> Arc<NormalizationTable> {
    Arc::new(NormalizationTable::new(
        vec!["-is", "-confirmed"],
        Vec::<&str>::new(),
        4,
    ))
}

#[test]
fn test_copula_endings_collapse_to_the_same_keyword() {
    let config = DetectorConfig::new(10, 0.85, 2).unwrap();
    let mut detector = RepetitionDetector::new(config, copula_table());

    let first = detector.check("infection-is pneumonia", "dr-lee", 3);
    assert!(!first.is_repetition);
    assert_eq!(first.matched_round, None);

    let second = detector.check("infection-confirmed pneumonia", "dr-lee", 4);
    assert!(second.is_repetition);
    assert_eq!(second.matched_round, Some(3));
    assert!((second.score - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_oldest_record_is_evicted_past_max_history() {
    let config = DetectorConfig::new(3, 0.85, 2).unwrap();
    let mut detector = RepetitionDetector::with_default_table(config);

    let texts = [
        "pneumonia fever cough sputum",
        "myasthenia gravis ptosis diplopia",
        "thyroid goiter tremor palpitations",
        "lupus arthritis malar photosensitivity",
    ];
    for (idx, text) in texts.iter().enumerate() {
        detector.check(text, "dr-park", idx as u32 + 1);
    }

    assert_eq!(detector.history_len("dr-park"), 3);
    let rounds: Vec<u32> = detector
        .history("dr-park")
        .map(|utterance| utterance.round_number())
        .collect();
    assert_eq!(rounds, vec![2, 3, 4]);

    // the round-1 text no longer matches anything
    let verdict = detector.check(texts[0], "dr-park", 5);
    assert!(!verdict.is_repetition);
    assert_eq!(verdict.matched_round, None);
}

#[test]
fn test_histories_are_scoped_per_speaker() {
    let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());
    let text = "Myasthenia gravis explains fluctuating ptosis and diplopia";

    assert!(!detector.check(text, "dr-kim", 1).is_repetition);
    assert!(!detector.check(text, "dr-choi", 1).is_repetition);
    assert!(detector.check(text, "dr-kim", 2).is_repetition);
    assert_eq!(detector.history_len("dr-kim"), 2);
    assert_eq!(detector.history_len("dr-choi"), 1);
    assert_eq!(detector.history_len("dr-nobody"), 0);
}

#[test]
fn test_texts_below_min_keywords_are_not_compared_or_recorded() {
    let config = DetectorConfig::new(10, 0.5, 3).unwrap();
    let mut detector = RepetitionDetector::with_default_table(config);

    let verdict = detector.check("pneumonia again", "dr-jung", 1);
    assert!(!verdict.is_repetition);
    assert_eq!(verdict.score, 0.0);
    assert_eq!(detector.history_len("dr-jung"), 0);
    assert!(detector.extract_keywords("pneumonia again").is_empty());
}

#[test]
fn test_best_match_prefers_the_most_recent_round_on_ties() {
    let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());
    let text = "sarcoidosis granuloma lymphadenopathy";

    detector.check(text, "dr-kang", 1);
    detector.check("completely different pathology overall", "dr-kang", 2);
    detector.check(text, "dr-kang", 3);

    let verdict = detector.check(text, "dr-kang", 4);
    assert!(verdict.is_repetition);
    assert_eq!(verdict.matched_round, Some(3));
}

#[test]
fn test_check_round_compares_against_pre_round_history() {
    let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());
    let text = "Lambert-Eaton syndrome with proximal weakness";

    // a doctor sitting in two groups answers twice in the same round
    let verdicts = detector.check_round(1, &[("dr-yoon", text), ("dr-yoon", text)]);
    assert!(verdicts.iter().all(|v| !v.is_repetition));
    assert_eq!(detector.history_len("dr-yoon"), 2);

    let verdicts = detector.check_round(2, &[("dr-yoon", text)]);
    assert!(verdicts[0].is_repetition);
    assert_eq!(verdicts[0].matched_round, Some(1));
}

#[test]
fn test_below_threshold_reports_score_without_match() {
    let config = DetectorConfig::new(10, 0.9, 2).unwrap();
    let mut detector = RepetitionDetector::with_default_table(config);

    detector.check("pneumonia fever cough", "dr-lim", 1);
    let verdict = detector.check("pneumonia fever rash", "dr-lim", 2);
    assert!(!verdict.is_repetition);
    assert_eq!(verdict.matched_round, None);
    assert!((verdict.score - 0.5).abs() < 1e-9);
}

#[test]
fn test_disjoint_turns_score_zero() {
    let config = DetectorConfig::new(10, 0.85, 2).unwrap();
    let mut detector = RepetitionDetector::with_default_table(config);

    detector.check("pneumonia fever cough", "dr-lim", 1);
    let verdict = detector.check("lupus arthritis rash", "dr-lim", 2);
    assert!(!verdict.is_repetition);
    assert_eq!(verdict.matched_round, None);
    assert_eq!(verdict.score, 0.0);
    assert_eq!(detector.history_len("dr-lim"), 2);
}

#[test]
fn test_jaccard_is_symmetric() {
    let a: KeywordSet = ["ptosis", "diplopia", "fatigue"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let b: KeywordSet = ["ptosis", "dysphagia"].iter().map(|s| s.to_string()).collect();

    assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
    assert!((jaccard(&a, &b) - 0.25).abs() < 1e-9);
    assert_eq!(jaccard(&a, &a), 1.0);
}

#[test]
fn test_korean_turns_with_different_endings_repeat() {
    let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());

    detector.check("중증근무력증으로 안검하수가 발생합니다", "김신경1", 1);
    let verdict = detector.check("중증근무력증이 안검하수를 발생합니다", "김신경1", 2);
    assert!(verdict.is_repetition, "score was {}", verdict.score);
}

#[test]
fn test_default_detector_config() {
    let config = DetectorConfig::default();
    assert_eq!(config.max_history(), 10);
    assert_eq!(config.similarity_threshold(), 0.85);
    assert_eq!(config.min_keywords(), 2);
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_detector_configs_are_rejected() {
    assert_eq!(
        DetectorConfig::new(0, 0.85, 2).unwrap_err(),
        ConfigError::ZeroMaxHistory
    );
    assert_eq!(
        DetectorConfig::new(10, 0.85, 0).unwrap_err(),
        ConfigError::ZeroMinKeywords
    );
    assert!(matches!(
        DetectorConfig::new(10, 0.0, 2),
        Err(ConfigError::SimilarityThresholdOutOfRange(_))
    ));
    assert!(matches!(
        DetectorConfig::new(10, 1.5, 2),
        Err(ConfigError::SimilarityThresholdOutOfRange(_))
    ));
    assert!(DetectorConfig::new(10, 1.0, 2).is_ok());
}

#[test]
fn test_with_config_starts_with_empty_history() {
    let mut detector = RepetitionDetector::with_default_table(DetectorConfig::default());
    detector.check("pneumonia fever cough", "dr-cho", 1);

    let stricter = detector.with_config(DetectorConfig::new(5, 0.95, 2).unwrap());
    assert_eq!(stricter.history_len("dr-cho"), 0);
    assert_eq!(stricter.config().max_history(), 5);
    assert_eq!(detector.history_len("dr-cho"), 1);
}
