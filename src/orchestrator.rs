//! Moderation Orchestrator
//!
//! Runs one message through classify -> normalize -> evaluate -> apply. The
//! classifier is the only fallible dependency and it fails open: any
//! timeout, network or response error becomes an `allow` decision tagged
//! `degraded` and never touches warning state.

use crate::assessment::{ScoreNormalizer, ThresholdOverrides, Thresholds, ViolationAssessment};
use crate::classifier::Classifier;
use crate::config::Config;
use crate::dedup::{DeduplicationCache, Fingerprint};
use crate::error::{BatchItemError, ClassifierError, ModerationError, ValidationError};
use crate::policy::{ModerationDecision, PolicyEvaluator};
use crate::statistics::{StatEvent, StatisticsCollector};
use crate::warnings::{AppliedDecision, WarningState, WarningStore};
use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const UNAVAILABLE_REASON: &str = "moderation service unavailable";
pub const MUTED_REASON: &str = "user under active timeout";
const EMPTY_REASON: &str = "empty text";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub classifier_timeout: Duration,
    pub languages: Vec<String>,
    pub max_text_length: usize,
    pub batch_concurrency: usize,
    pub batch_max_items: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            classifier_timeout: Duration::from_secs(config.classifier.timeout_seconds),
            languages: config.classifier.languages.clone(),
            max_text_length: config.limits.max_text_length,
            batch_concurrency: config.batch.default_concurrency,
            batch_max_items: config.batch.max_items,
        }
    }
}

/// Per-call knobs. Anything unset falls back to the configured defaults.
#[derive(Debug, Clone, Default)]
pub struct EvaluationOptions {
    pub thresholds: Option<ThresholdOverrides>,
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Evaluation {
    pub assessment: ViolationAssessment,
    pub decision: ModerationDecision,
    /// Warning state after the decision was applied; `None` for stateless calls.
    pub state: Option<WarningState>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl BatchItem {
    pub fn stateless(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_id: None,
        }
    }
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub index: usize,
    pub result: Result<Evaluation, BatchItemError>,
}

pub struct ModerationOrchestrator {
    classifier: Arc<dyn Classifier>,
    normalizer: ScoreNormalizer,
    evaluator: PolicyEvaluator,
    store: Arc<WarningStore>,
    cache: Option<Arc<DeduplicationCache>>,
    statistics: Option<Arc<StatisticsCollector>>,
    settings: OrchestratorSettings,
}

impl ModerationOrchestrator {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        normalizer: ScoreNormalizer,
        evaluator: PolicyEvaluator,
        store: Arc<WarningStore>,
    ) -> Self {
        Self {
            classifier,
            normalizer,
            evaluator,
            store,
            cache: None,
            statistics: None,
            settings: OrchestratorSettings::default(),
        }
    }

    /// Wire an orchestrator from configuration. The store is passed in
    /// because loading it may require I/O.
    pub fn from_config(
        config: &Config,
        classifier: Arc<dyn Classifier>,
        store: Arc<WarningStore>,
    ) -> Self {
        let cache = config
            .cache
            .enabled
            .then(|| Arc::new(DeduplicationCache::new(Duration::from_secs(config.cache.ttl_seconds))));

        Self {
            cache,
            settings: OrchestratorSettings::from_config(config),
            ..Self::new(
                classifier,
                ScoreNormalizer::new(config.thresholds),
                PolicyEvaluator::new(config.policy.clone()),
                store,
            )
        }
    }

    pub fn with_statistics(mut self, statistics: Arc<StatisticsCollector>) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn store(&self) -> &Arc<WarningStore> {
        &self.store
    }

    pub fn cache(&self) -> Option<&Arc<DeduplicationCache>> {
        self.cache.as_ref()
    }

    pub fn statistics(&self) -> Option<&Arc<StatisticsCollector>> {
        self.statistics.as_ref()
    }

    pub fn normalizer(&self) -> &ScoreNormalizer {
        &self.normalizer
    }

    pub fn evaluator(&self) -> &PolicyEvaluator {
        &self.evaluator
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn classifier_configured(&self) -> bool {
        self.classifier.is_configured()
    }

    /// Stateful evaluation of one chat message from `user_id`.
    pub async fn evaluate_message(
        &self,
        text: &str,
        user_id: &str,
        options: &EvaluationOptions,
    ) -> Result<ModerationDecision, ModerationError> {
        let evaluation = self.evaluate_detailed(text, Some(user_id), options).await?;
        Ok(evaluation.decision)
    }

    /// Stateless evaluation: the decision is computed against a user with no
    /// warnings and nothing is recorded.
    pub async fn preview(
        &self,
        text: &str,
        options: &EvaluationOptions,
    ) -> Result<Evaluation, ValidationError> {
        self.evaluate_detailed(text, None, options).await
    }

    /// Full pipeline. Only invalid per-call thresholds fail; every other
    /// problem yields a degraded `allow`.
    pub async fn evaluate_detailed(
        &self,
        text: &str,
        user_id: Option<&str>,
        options: &EvaluationOptions,
    ) -> Result<Evaluation, ValidationError> {
        let started = Instant::now();
        let thresholds = self
            .normalizer
            .effective_thresholds(options.thresholds.as_ref())?;

        let Some(text) = self.prepare_text(text) else {
            let count = self.current_count(user_id).await;
            return Ok(self.finish(
                started,
                Evaluation {
                    assessment: ScoreNormalizer::degraded(&thresholds),
                    decision: ModerationDecision::degraded(EMPTY_REASON, count),
                    state: None,
                },
            ));
        };

        if let Some(user_id) = user_id {
            let state = self.store.get(user_id).await;
            let now = Utc::now();
            if state.is_muted(now) {
                log::debug!("Skipping evaluation for muted user {user_id}");
                let count = state.effective_count(now, self.store.reset_window());
                let decision = ModerationDecision {
                    degraded: false,
                    ..ModerationDecision::degraded(MUTED_REASON, count)
                };
                return Ok(self.finish(
                    started,
                    Evaluation {
                        assessment: ScoreNormalizer::degraded(&thresholds),
                        decision,
                        state: Some(state),
                    },
                ));
            }
        }

        let languages = options
            .languages
            .as_deref()
            .unwrap_or(self.settings.languages.as_slice());
        let assessment = self.assess(text, &thresholds, languages).await;

        let evaluation = if assessment.degraded {
            let count = self.current_count(user_id).await;
            Evaluation {
                decision: ModerationDecision::degraded(UNAVAILABLE_REASON, count),
                assessment,
                state: None,
            }
        } else if let Some(user_id) = user_id {
            let AppliedDecision {
                decision,
                state,
                persist_error,
            } = self
                .store
                .evaluate_and_apply(user_id, |state| self.evaluator.evaluate(&assessment, state))
                .await;
            if let Some(e) = persist_error {
                log::warn!("Decision for {user_id} stands despite persistence failure: {e}");
            }
            log::info!(
                "user={} action={} severity={} warnings={} text=\"{}\"",
                user_id,
                decision.action,
                decision.severity.as_str(),
                decision.warning_count_after,
                preview_text(text)
            );
            Evaluation {
                assessment,
                decision,
                state: Some(state),
            }
        } else {
            let decision = self
                .evaluator
                .evaluate(&assessment, &WarningState::new(""));
            Evaluation {
                assessment,
                decision,
                state: None,
            }
        };

        Ok(self.finish(started, evaluation))
    }

    /// Evaluate up to `batch_max_items` texts, at most `concurrency` at a
    /// time. Output order matches input order and a bad item never fails
    /// its siblings.
    pub async fn evaluate_batch(
        &self,
        items: Vec<BatchItem>,
        concurrency: Option<usize>,
        options: &EvaluationOptions,
    ) -> Result<Vec<BatchOutcome>, ValidationError> {
        if items.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if items.len() > self.settings.batch_max_items {
            return Err(ValidationError::BatchTooLarge {
                len: items.len(),
                max: self.settings.batch_max_items,
            });
        }
        self.normalizer
            .effective_thresholds(options.thresholds.as_ref())?;

        let chunk_size = concurrency
            .unwrap_or(self.settings.batch_concurrency)
            .clamp(1, self.settings.batch_max_items);
        let total = items.len();
        let mut outcomes = Vec::with_capacity(total);

        for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
            let base = chunk_index * chunk_size;
            let results = join_all(
                chunk
                    .iter()
                    .enumerate()
                    .map(|(offset, item)| self.evaluate_item(base + offset, item, options)),
            )
            .await;
            outcomes.extend(results);
        }

        if let Some(statistics) = &self.statistics {
            statistics.record_event(StatEvent::BatchProcessed { items: total });
        }
        Ok(outcomes)
    }

    /// Administrative reset to the zero-state, waiting until it is durable.
    /// The in-memory reset always happens; an error means it was not written.
    pub async fn clear_warnings(&self, user_id: &str) -> Result<WarningState, ModerationError> {
        self.store.clear(user_id).await?;
        self.store.flush().await?;
        log::info!("Warnings for {user_id} cleared");
        Ok(self.store.get(user_id).await)
    }

    /// Administrative ban, outside the automatic escalation ladder.
    pub async fn ban_user(&self, user_id: &str, reason: &str) -> AppliedDecision {
        log::warn!("Banning user {user_id}: {reason}");
        let applied = self
            .store
            .apply_atomic(user_id, ModerationDecision::ban(reason))
            .await;
        if let Some(statistics) = &self.statistics {
            statistics.record_event(StatEvent::Evaluated {
                action: applied.decision.action,
                degraded: false,
                processing_time_ms: 0,
            });
        }
        applied
    }

    async fn evaluate_item(
        &self,
        index: usize,
        item: &BatchItem,
        options: &EvaluationOptions,
    ) -> BatchOutcome {
        if item.text.trim().is_empty() {
            return BatchOutcome {
                index,
                result: Err(BatchItemError {
                    index,
                    source: ValidationError::EmptyText,
                }),
            };
        }
        let result = self
            .evaluate_detailed(&item.text, item.user_id.as_deref(), options)
            .await
            .map_err(|source| BatchItemError { index, source });
        BatchOutcome { index, result }
    }

    /// Classifier result for `text`, shared through the dedup cache when one
    /// is configured. Degraded on any classifier failure.
    async fn assess(
        &self,
        text: &str,
        thresholds: &Thresholds,
        languages: &[String],
    ) -> ViolationAssessment {
        let result = match &self.cache {
            Some(cache) => {
                let key = Fingerprint::scoped(text, &languages.join(","));
                let mut computed = false;
                let result = cache
                    .get_or_compute(&key, || {
                        computed = true;
                        self.classify_and_normalize(text, thresholds, languages)
                    })
                    .await;
                self.record(if computed {
                    StatEvent::CacheMiss
                } else {
                    StatEvent::CacheHit
                });
                // a cached vector may have been scored under other thresholds
                result.map(|cached| {
                    if cached.thresholds == thresholds.as_map() {
                        cached
                    } else {
                        ScoreNormalizer::reassess(&cached, thresholds)
                    }
                })
            }
            None => self.classify_and_normalize(text, thresholds, languages).await,
        };

        result.unwrap_or_else(|e| {
            log::warn!("Classifier failed, failing open: {e}");
            self.record(StatEvent::ClassifierFailure);
            ScoreNormalizer::degraded(thresholds)
        })
    }

    async fn classify_and_normalize(
        &self,
        text: &str,
        thresholds: &Thresholds,
        languages: &[String],
    ) -> Result<ViolationAssessment, ClassifierError> {
        let timeout = self.settings.classifier_timeout;
        let raw = match tokio::time::timeout(timeout, self.classifier.classify(text, languages)).await
        {
            Ok(result) => result?,
            Err(_) => return Err(ClassifierError::Timeout(timeout)),
        };
        ScoreNormalizer::new(*thresholds)
            .normalize(Some(&raw), None)
            .map_err(|e| ClassifierError::BadResponse {
                status: None,
                message: e.to_string(),
            })
    }

    /// Trimmed text capped at `max_text_length` characters, or `None` when
    /// nothing is left to classify.
    fn prepare_text<'a>(&self, text: &'a str) -> Option<&'a str> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        match trimmed.char_indices().nth(self.settings.max_text_length) {
            Some((idx, _)) => {
                log::debug!(
                    "Truncating text to {} characters",
                    self.settings.max_text_length
                );
                Some(&trimmed[..idx])
            }
            None => Some(trimmed),
        }
    }

    async fn current_count(&self, user_id: Option<&str>) -> u32 {
        match user_id {
            Some(user_id) => self.store.effective_count(user_id).await,
            None => 0,
        }
    }

    fn finish(&self, started: Instant, evaluation: Evaluation) -> Evaluation {
        self.record(StatEvent::Evaluated {
            action: evaluation.decision.action,
            degraded: evaluation.decision.degraded,
            processing_time_ms: started.elapsed().as_millis() as u64,
        });
        evaluation
    }

    fn record(&self, event: StatEvent) {
        if let Some(statistics) = &self.statistics {
            statistics.record_event(event);
        }
    }
}

fn preview_text(text: &str) -> String {
    let mut preview: String = text.chars().take(50).collect();
    if text.chars().nth(50).is_some() {
        preview.push_str("...");
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::fakes::ScriptedClassifier;
    use crate::policy::{Action, PolicyConfig, Severity};

    const NASTY: &str = "you are a worthless idiot";

    fn orchestrator(classifier: Arc<ScriptedClassifier>, cached: bool) -> ModerationOrchestrator {
        let mut config = Config::default();
        config.cache.enabled = cached;
        let store = Arc::new(WarningStore::new(chrono::Duration::hours(24)));
        ModerationOrchestrator::from_config(&config, classifier, store)
    }

    fn nasty_classifier() -> ScriptedClassifier {
        ScriptedClassifier::new().with_scores(
            NASTY,
            &[("TOXICITY", 0.95), ("SEVERE_TOXICITY", 0.1), ("INSULT", 0.2)],
        )
    }

    #[tokio::test]
    async fn test_escalation_scenario() {
        let classifier = Arc::new(nasty_classifier());
        let orchestrator = orchestrator(classifier.clone(), true);
        let options = EvaluationOptions::default();

        let first = orchestrator
            .evaluate_detailed(NASTY, Some("u1"), &options)
            .await
            .unwrap();
        assert!(first.assessment.is_toxic);
        assert_eq!(first.decision.severity, Severity::High);
        assert_eq!(first.decision.action, Action::BlockWarn);
        assert_eq!(first.decision.warning_count_after, 1);

        let second = orchestrator
            .evaluate_message(NASTY, "u1", &options)
            .await
            .unwrap();
        assert_eq!(second.action, Action::BlockTimeout);
        assert_eq!(second.warning_count_after, 0);
        assert_eq!(second.timeout_seconds, Some(600));

        // the second identical text reused the classification but was still counted
        assert_eq!(classifier.calls(), 1);
        assert!(orchestrator.store().get("u1").await.muted_until.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifier_timeout_fails_open() {
        let classifier = Arc::new(nasty_classifier().with_delay(Duration::from_secs(30)));
        let orchestrator = orchestrator(classifier, false);
        orchestrator
            .store()
            .apply_atomic(
                "u1",
                ModerationDecision {
                    action: Action::BlockWarn,
                    ..ModerationDecision::degraded("seed", 0)
                },
            )
            .await;

        let decision = orchestrator
            .evaluate_message(NASTY, "u1", &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(decision.action, Action::Allow);
        assert!(decision.degraded);
        assert_eq!(decision.reason, UNAVAILABLE_REASON);
        assert_eq!(decision.warning_count_after, 1);
        assert_eq!(orchestrator.store().get("u1").await.warning_count, 1);
    }

    #[tokio::test]
    async fn test_classifier_error_does_not_touch_state() {
        let classifier = Arc::new(
            ScriptedClassifier::new()
                .with_error(NASTY, ClassifierError::Network("connection refused".into())),
        );
        let orchestrator = orchestrator(classifier.clone(), true);
        let now = Utc::now();
        orchestrator
            .store()
            .apply_atomic_at(
                "u1",
                ModerationDecision {
                    action: Action::BlockWarn,
                    ..ModerationDecision::degraded("seed", 0)
                },
                now,
            )
            .await;

        for _ in 0..2 {
            let decision = orchestrator
                .evaluate_message(NASTY, "u1", &EvaluationOptions::default())
                .await
                .unwrap();
            assert_eq!(decision.action, Action::Allow);
            assert!(decision.degraded);
            assert_eq!(decision.warning_count_after, 1);
        }
        // failures are never cached
        assert_eq!(classifier.calls(), 2);
        assert_eq!(orchestrator.store().get("u1").await.warning_count, 1);
    }

    #[tokio::test]
    async fn test_empty_text_skips_classifier() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let orchestrator = orchestrator(classifier.clone(), true);

        let evaluation = orchestrator
            .preview("   \n ", &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(evaluation.decision.action, Action::Allow);
        assert!(evaluation.decision.degraded);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_long_text_is_truncated() {
        let classifier = Arc::new(ScriptedClassifier::new());
        let orchestrator = orchestrator(classifier.clone(), false);
        let text = "é".repeat(3500);

        orchestrator
            .preview(&text, &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(classifier.seen()[0].chars().count(), 3000);
    }

    #[tokio::test]
    async fn test_invalid_overrides_are_rejected_before_classifying() {
        let classifier = Arc::new(nasty_classifier());
        let orchestrator = orchestrator(classifier.clone(), true);
        let options = EvaluationOptions {
            thresholds: Some(ThresholdOverrides {
                insult: Some(1.5),
                ..Default::default()
            }),
            languages: None,
        };

        let result = orchestrator.evaluate_message(NASTY, "u1", &options).await;
        assert!(matches!(
            result,
            Err(ModerationError::Validation(ValidationError::InvalidThreshold { .. }))
        ));
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_is_rethresholded() {
        let classifier = Arc::new(ScriptedClassifier::new().with_scores("meh", &[("INSULT", 0.75)]));
        let orchestrator = orchestrator(classifier.clone(), true);

        let strict = orchestrator
            .preview("meh", &EvaluationOptions::default())
            .await
            .unwrap();
        assert!(strict.assessment.is_toxic);

        let lenient = orchestrator
            .preview(
                "MEH",
                &EvaluationOptions {
                    thresholds: Some(ThresholdOverrides {
                        insult: Some(0.9),
                        ..Default::default()
                    }),
                    languages: None,
                },
            )
            .await
            .unwrap();
        assert!(!lenient.assessment.is_toxic);
        assert_eq!(lenient.decision.action, Action::Allow);
        assert_eq!(classifier.calls(), 1);
    }

    #[tokio::test]
    async fn test_muted_user_is_not_reevaluated() {
        let classifier = Arc::new(nasty_classifier());
        let orchestrator = orchestrator(classifier.clone(), false);
        orchestrator
            .store()
            .set_mute("u1", Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();

        let decision = orchestrator
            .evaluate_message(NASTY, "u1", &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(decision.action, Action::Allow);
        assert_eq!(decision.reason, MUTED_REASON);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_muted_user_reports_count_after_reset_window() {
        let classifier = Arc::new(nasty_classifier());
        let orchestrator = orchestrator(classifier.clone(), false);
        let long_ago = Utc::now() - chrono::Duration::hours(30);
        for _ in 0..2 {
            let warn = ModerationDecision {
                action: Action::BlockWarn,
                ..ModerationDecision::degraded("test", 0)
            };
            orchestrator.store().apply_atomic_at("u1", warn, long_ago).await;
        }
        let muted = orchestrator
            .store()
            .set_mute("u1", Utc::now() + chrono::Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(muted.warning_count, 2);

        let decision = orchestrator
            .evaluate_message(NASTY, "u1", &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(decision.reason, MUTED_REASON);
        assert_eq!(decision.warning_count_after, 0);
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test]
    async fn test_clear_warnings_reports_unwritable_store() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let persistence = Arc::new(crate::warnings::JsonFilePersistence::new(
            blocker.join("users.json"),
        ));
        let store = Arc::new(
            WarningStore::with_persistence(chrono::Duration::hours(24), persistence)
                .await
                .unwrap(),
        );
        let orchestrator =
            ModerationOrchestrator::from_config(&Config::default(), Arc::new(nasty_classifier()), store);

        orchestrator
            .evaluate_message(NASTY, "u1", &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(orchestrator.current_count(Some("u1")).await, 1);

        let result = orchestrator.clear_warnings("u1").await;
        assert!(matches!(result, Err(ModerationError::Persistence(_))));
        assert_eq!(orchestrator.store().get("u1").await, WarningState::new("u1"));
    }

    #[tokio::test]
    async fn test_clear_warnings_resets_state() {
        let classifier = Arc::new(nasty_classifier());
        let orchestrator = orchestrator(classifier, false);
        let options = EvaluationOptions::default();
        orchestrator.evaluate_message(NASTY, "u1", &options).await.unwrap();

        let cleared = orchestrator.clear_warnings("u1").await.unwrap();
        assert_eq!(cleared, WarningState::new("u1"));
        let decision = orchestrator.evaluate_message(NASTY, "u1", &options).await.unwrap();
        assert_eq!(decision.warning_count_after, 1);
    }

    #[tokio::test]
    async fn test_escalate_to_ban_override() {
        let classifier = Arc::new(nasty_classifier());
        let mut config = Config::default();
        config.policy = PolicyConfig {
            escalate_to_ban: true,
            ..PolicyConfig::default()
        };
        let store = Arc::new(WarningStore::new(chrono::Duration::hours(24)));
        let orchestrator = ModerationOrchestrator::from_config(&config, classifier, store);

        let options = EvaluationOptions::default();
        orchestrator.evaluate_message(NASTY, "u1", &options).await.unwrap();
        let decision = orchestrator.evaluate_message(NASTY, "u1", &options).await.unwrap();
        assert_eq!(decision.action, Action::BlockBan);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_preserves_order_and_bounds_concurrency() {
        let mut classifier = ScriptedClassifier::new().with_delay(Duration::from_millis(100));
        for i in 0..7 {
            let score = if i % 2 == 0 { 0.95 } else { 0.1 };
            classifier = classifier.with_scores(&format!("text {i}"), &[("TOXICITY", score)]);
        }
        let classifier = Arc::new(classifier);
        let orchestrator = orchestrator(classifier.clone(), false);

        let items = (0..7).map(|i| BatchItem::stateless(format!("text {i}"))).collect();
        let outcomes = orchestrator
            .evaluate_batch(items, Some(3), &EvaluationOptions::default())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 7);
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.index, i);
            let evaluation = outcome.result.as_ref().unwrap();
            assert_eq!(evaluation.assessment.is_toxic, i % 2 == 0);
        }
        assert_eq!(classifier.calls(), 7);
        assert!(classifier.max_in_flight() <= 3);
        assert_eq!(
            classifier.seen(),
            (0..7).map(|i| format!("text {i}")).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn test_batch_isolates_bad_items() {
        let classifier = Arc::new(
            nasty_classifier().with_error("boom", ClassifierError::Timeout(Duration::from_secs(10))),
        );
        let orchestrator = orchestrator(classifier, false);
        let items = vec![
            BatchItem::stateless(NASTY),
            BatchItem::stateless("  "),
            BatchItem::stateless("boom"),
        ];

        let outcomes = orchestrator
            .evaluate_batch(items, None, &EvaluationOptions::default())
            .await
            .unwrap();
        assert_eq!(
            outcomes[0].result.as_ref().unwrap().decision.action,
            Action::BlockWarn
        );
        assert_eq!(
            outcomes[1].result.as_ref().unwrap_err().source,
            ValidationError::EmptyText
        );
        let degraded = &outcomes[2].result.as_ref().unwrap().decision;
        assert!(degraded.degraded);
        assert_eq!(degraded.action, Action::Allow);
    }

    #[tokio::test]
    async fn test_batch_limits() {
        let orchestrator = orchestrator(Arc::new(ScriptedClassifier::new()), false);
        let options = EvaluationOptions::default();

        let empty = orchestrator.evaluate_batch(Vec::new(), None, &options).await;
        assert!(matches!(empty, Err(ValidationError::EmptyBatch)));

        let items = (0..51).map(|i| BatchItem::stateless(format!("t{i}"))).collect();
        let too_many = orchestrator.evaluate_batch(items, None, &options).await;
        assert!(matches!(
            too_many,
            Err(ValidationError::BatchTooLarge { len: 51, max: 50 })
        ));
    }

    #[tokio::test]
    async fn test_ban_user() {
        let orchestrator = orchestrator(Arc::new(ScriptedClassifier::new()), false);
        let applied = orchestrator.ban_user("u9", "raid").await;
        assert_eq!(applied.decision.action, Action::BlockBan);
        assert_eq!(applied.state.warning_count, 0);
        assert!(applied.state.last_violation_at.is_some());
    }
}
