//! Score Normalizer
//!
//! Turns the raw attribute-score map returned by the toxicity classifier into
//! a fixed-shape [`ViolationAssessment`]: every attribute present, the
//! thresholds in effect recorded alongside, and the violated set derived.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// The six classifier-scored toxicity dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Toxicity,
    SevereToxicity,
    IdentityAttack,
    Insult,
    Profanity,
    Threat,
}

impl Attribute {
    pub const ALL: [Attribute; 6] = [
        Attribute::Toxicity,
        Attribute::SevereToxicity,
        Attribute::IdentityAttack,
        Attribute::Insult,
        Attribute::Profanity,
        Attribute::Threat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Attribute::Toxicity => "toxicity",
            Attribute::SevereToxicity => "severe_toxicity",
            Attribute::IdentityAttack => "identity_attack",
            Attribute::Insult => "insult",
            Attribute::Profanity => "profanity",
            Attribute::Threat => "threat",
        }
    }

    /// Attribute name as the Perspective API spells it.
    pub fn api_name(&self) -> &'static str {
        match self {
            Attribute::Toxicity => "TOXICITY",
            Attribute::SevereToxicity => "SEVERE_TOXICITY",
            Attribute::IdentityAttack => "IDENTITY_ATTACK",
            Attribute::Insult => "INSULT",
            Attribute::Profanity => "PROFANITY",
            Attribute::Threat => "THREAT",
        }
    }

    /// Lenient key lookup: `TOXICITY`, `severe_toxicity` and `severeToxicity`
    /// all resolve.
    pub fn from_key(key: &str) -> Option<Attribute> {
        let folded: String = key
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        Attribute::ALL
            .into_iter()
            .find(|a| a.as_str().replace('_', "") == folded)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attribute entry in a classifier response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AttributeScore {
    pub value: f64,
}

/// Classifier output keyed by attribute name. Unknown keys are ignored and
/// missing attributes count as 0.
pub type RawScores = HashMap<String, AttributeScore>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub toxicity: f64,
    pub severe_toxicity: f64,
    pub identity_attack: f64,
    pub insult: f64,
    pub profanity: f64,
    pub threat: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            toxicity: 0.7,
            severe_toxicity: 0.8,
            identity_attack: 0.7,
            insult: 0.7,
            profanity: 0.7,
            threat: 0.7,
        }
    }
}

impl Thresholds {
    pub fn get(&self, attribute: Attribute) -> f64 {
        match attribute {
            Attribute::Toxicity => self.toxicity,
            Attribute::SevereToxicity => self.severe_toxicity,
            Attribute::IdentityAttack => self.identity_attack,
            Attribute::Insult => self.insult,
            Attribute::Profanity => self.profanity,
            Attribute::Threat => self.threat,
        }
    }

    fn slot(&mut self, attribute: Attribute) -> &mut f64 {
        match attribute {
            Attribute::Toxicity => &mut self.toxicity,
            Attribute::SevereToxicity => &mut self.severe_toxicity,
            Attribute::IdentityAttack => &mut self.identity_attack,
            Attribute::Insult => &mut self.insult,
            Attribute::Profanity => &mut self.profanity,
            Attribute::Threat => &mut self.threat,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for attribute in Attribute::ALL {
            let value = self.get(attribute);
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::InvalidThreshold { attribute, value });
            }
        }
        Ok(())
    }

    /// Apply per-call overrides on top of these thresholds.
    pub fn with_overrides(
        &self,
        overrides: &ThresholdOverrides,
    ) -> Result<Thresholds, ValidationError> {
        let mut merged = *self;
        for attribute in Attribute::ALL {
            if let Some(value) = overrides.get(attribute) {
                *merged.slot(attribute) = value;
            }
        }
        merged.validate()?;
        Ok(merged)
    }

    pub fn as_map(&self) -> BTreeMap<Attribute, f64> {
        Attribute::ALL.into_iter().map(|a| (a, self.get(a))).collect()
    }
}

/// Per-call threshold overrides. Accepts both camelCase (as the HTTP API
/// documents them) and snake_case keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdOverrides {
    pub toxicity: Option<f64>,
    #[serde(alias = "severe_toxicity")]
    pub severe_toxicity: Option<f64>,
    #[serde(alias = "identity_attack")]
    pub identity_attack: Option<f64>,
    pub insult: Option<f64>,
    pub profanity: Option<f64>,
    pub threat: Option<f64>,
}

impl ThresholdOverrides {
    pub fn get(&self, attribute: Attribute) -> Option<f64> {
        match attribute {
            Attribute::Toxicity => self.toxicity,
            Attribute::SevereToxicity => self.severe_toxicity,
            Attribute::IdentityAttack => self.identity_attack,
            Attribute::Insult => self.insult,
            Attribute::Profanity => self.profanity,
            Attribute::Threat => self.threat,
        }
    }
}

/// Fixed-shape result of scoring one text. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationAssessment {
    pub scores: BTreeMap<Attribute, f64>,
    pub thresholds: BTreeMap<Attribute, f64>,
    pub violated_attributes: BTreeSet<Attribute>,
    pub max_score: f64,
    pub is_toxic: bool,
    /// The classifier could not be consulted; "not toxic" here means
    /// "not evaluated", not "confirmed safe".
    pub degraded: bool,
}

impl ViolationAssessment {
    /// Human-readable summary of the violated attributes.
    pub fn reason(&self) -> String {
        if self.degraded {
            "No scores available".to_string()
        } else if self.violated_attributes.is_empty() {
            "Content is safe".to_string()
        } else {
            let names: Vec<&str> = self.violated_attributes.iter().map(|a| a.as_str()).collect();
            format!("Violated: {}", names.join(", "))
        }
    }

    /// `max_score` as a 0-100 percentage.
    pub fn confidence(&self) -> u8 {
        (self.max_score * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn score(&self, attribute: Attribute) -> f64 {
        self.scores.get(&attribute).copied().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoreNormalizer {
    thresholds: Thresholds,
}

impl ScoreNormalizer {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Thresholds in effect for a call with the given overrides.
    pub fn effective_thresholds(
        &self,
        overrides: Option<&ThresholdOverrides>,
    ) -> Result<Thresholds, ValidationError> {
        match overrides {
            Some(o) => self.thresholds.with_overrides(o),
            None => Ok(self.thresholds),
        }
    }

    /// Pure transform from classifier output to an assessment. `None` means
    /// the classifier was unavailable and yields a degraded, non-toxic result.
    pub fn normalize(
        &self,
        raw: Option<&RawScores>,
        overrides: Option<&ThresholdOverrides>,
    ) -> Result<ViolationAssessment, ValidationError> {
        let thresholds = self.effective_thresholds(overrides)?;

        let Some(raw) = raw else {
            return Ok(Self::degraded(&thresholds));
        };

        let mut scores: BTreeMap<Attribute, f64> =
            Attribute::ALL.into_iter().map(|a| (a, 0.0)).collect();
        for (key, score) in raw {
            let Some(attribute) = Attribute::from_key(key) else {
                log::debug!("Ignoring unknown classifier attribute: {key}");
                continue;
            };
            if !(0.0..=1.0).contains(&score.value) {
                return Err(ValidationError::InvalidScore {
                    attribute,
                    value: score.value,
                });
            }
            scores.insert(attribute, score.value);
        }

        Ok(Self::assess(scores, &thresholds))
    }

    /// Re-apply a different set of thresholds to an existing score vector.
    pub fn reassess(
        assessment: &ViolationAssessment,
        thresholds: &Thresholds,
    ) -> ViolationAssessment {
        if assessment.degraded {
            return Self::degraded(thresholds);
        }
        Self::assess(assessment.scores.clone(), thresholds)
    }

    fn assess(scores: BTreeMap<Attribute, f64>, thresholds: &Thresholds) -> ViolationAssessment {
        let violated_attributes: BTreeSet<Attribute> = scores
            .iter()
            .filter(|(attribute, value)| **value > thresholds.get(**attribute))
            .map(|(attribute, _)| *attribute)
            .collect();
        let max_score = scores.values().copied().fold(0.0, f64::max);

        ViolationAssessment {
            is_toxic: !violated_attributes.is_empty(),
            scores,
            thresholds: thresholds.as_map(),
            violated_attributes,
            max_score,
            degraded: false,
        }
    }

    /// Placeholder assessment for content that could not be scored.
    pub fn degraded(thresholds: &Thresholds) -> ViolationAssessment {
        ViolationAssessment {
            scores: Attribute::ALL.into_iter().map(|a| (a, 0.0)).collect(),
            thresholds: thresholds.as_map(),
            violated_attributes: BTreeSet::new(),
            max_score: 0.0,
            is_toxic: false,
            degraded: true,
        }
    }
}

#[cfg(test)]
pub(crate) fn raw_scores(entries: &[(&str, f64)]) -> RawScores {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), AttributeScore { value: *v }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_below_threshold_is_clean() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[
            ("toxicity", 0.69),
            ("severe_toxicity", 0.8),
            ("insult", 0.1),
            ("threat", 0.7),
        ]);

        let assessment = normalizer.normalize(Some(&raw), None).unwrap();
        assert!(!assessment.is_toxic);
        assert!(assessment.violated_attributes.is_empty());
        assert_eq!(assessment.max_score, 0.8);
        assert_eq!(assessment.reason(), "Content is safe");
    }

    #[test]
    fn test_violated_set_matches_thresholds() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[
            ("TOXICITY", 0.95),
            ("SEVERE_TOXICITY", 0.1),
            ("INSULT", 0.71),
        ]);

        let assessment = normalizer.normalize(Some(&raw), None).unwrap();
        assert!(assessment.is_toxic);
        assert_eq!(
            assessment.violated_attributes,
            BTreeSet::from([Attribute::Toxicity, Attribute::Insult])
        );
        assert_eq!(assessment.reason(), "Violated: toxicity, insult");
        assert_eq!(assessment.confidence(), 95);
    }

    #[test]
    fn test_missing_attributes_score_zero() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[("profanity", 0.3), ("sexually_explicit", 0.99)]);

        let assessment = normalizer.normalize(Some(&raw), None).unwrap();
        assert_eq!(assessment.scores.len(), 6);
        assert_eq!(assessment.score(Attribute::Threat), 0.0);
        // unknown attributes are ignored entirely
        assert_eq!(assessment.max_score, 0.3);
    }

    #[test]
    fn test_empty_scores_max_is_zero() {
        let normalizer = ScoreNormalizer::default();
        let assessment = normalizer.normalize(Some(&RawScores::new()), None).unwrap();
        assert_eq!(assessment.max_score, 0.0);
        assert!(!assessment.is_toxic);
        assert!(!assessment.degraded);
    }

    #[test]
    fn test_absent_scores_are_degraded() {
        let normalizer = ScoreNormalizer::default();
        let assessment = normalizer.normalize(None, None).unwrap();
        assert!(assessment.degraded);
        assert!(!assessment.is_toxic);
        assert_eq!(assessment.max_score, 0.0);
    }

    #[test]
    fn test_threshold_overrides() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[("profanity", 0.45)]);
        let overrides = ThresholdOverrides {
            profanity: Some(0.4),
            ..Default::default()
        };

        let assessment = normalizer.normalize(Some(&raw), Some(&overrides)).unwrap();
        assert!(assessment.is_toxic);
        assert_eq!(assessment.thresholds[&Attribute::Profanity], 0.4);
        assert_eq!(assessment.thresholds[&Attribute::Toxicity], 0.7);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[("toxicity", 1.5)]);
        assert!(matches!(
            normalizer.normalize(Some(&raw), None),
            Err(ValidationError::InvalidScore { attribute: Attribute::Toxicity, .. })
        ));

        let overrides = ThresholdOverrides {
            threat: Some(-0.1),
            ..Default::default()
        };
        assert!(matches!(
            normalizer.normalize(Some(&RawScores::new()), Some(&overrides)),
            Err(ValidationError::InvalidThreshold { attribute: Attribute::Threat, .. })
        ));
    }

    #[test]
    fn test_normalize_is_pure() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[("toxicity", 0.75), ("insult", 0.9)]);
        let first = normalizer.normalize(Some(&raw), None).unwrap();
        let second = normalizer.normalize(Some(&raw), None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_raising_a_score_is_monotonic() {
        let normalizer = ScoreNormalizer::default();
        let base = [
            ("toxicity", 0.2),
            ("severe_toxicity", 0.5),
            ("identity_attack", 0.72),
            ("insult", 0.0),
            ("profanity", 0.69),
            ("threat", 0.3),
        ];

        for target in 0..base.len() {
            let mut previous: Option<ViolationAssessment> = None;
            for step in 0..=20 {
                let mut entries = base;
                entries[target].1 = (entries[target].1 + step as f64 * 0.05).min(1.0);
                let current = normalizer.normalize(Some(&raw_scores(&entries)), None).unwrap();

                if let Some(prev) = &previous {
                    assert!(current.max_score >= prev.max_score);
                    assert!(prev.violated_attributes.is_subset(&current.violated_attributes));
                }
                previous = Some(current);
            }
        }
    }

    #[test]
    fn test_reassess_with_new_thresholds() {
        let normalizer = ScoreNormalizer::default();
        let raw = raw_scores(&[("insult", 0.55)]);
        let assessment = normalizer.normalize(Some(&raw), None).unwrap();
        assert!(!assessment.is_toxic);

        let strict = Thresholds {
            insult: 0.5,
            ..Thresholds::default()
        };
        let reassessed = ScoreNormalizer::reassess(&assessment, &strict);
        assert!(reassessed.is_toxic);
        assert_eq!(reassessed.scores, assessment.scores);
    }

    #[test]
    fn test_attribute_key_variants() {
        assert_eq!(Attribute::from_key("SEVERE_TOXICITY"), Some(Attribute::SevereToxicity));
        assert_eq!(Attribute::from_key("severeToxicity"), Some(Attribute::SevereToxicity));
        assert_eq!(Attribute::from_key("identity_attack"), Some(Attribute::IdentityAttack));
        assert_eq!(Attribute::from_key("flirtation"), None);
    }
}
