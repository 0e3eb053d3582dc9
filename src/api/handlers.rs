use super::{envelope, ApiError, ApiResult, AppState, Envelope, ENDPOINTS};
use crate::assessment::{Attribute, ThresholdOverrides};
use crate::config::Config;
use crate::error::ValidationError;
use crate::orchestrator::{BatchItem, EvaluationOptions};
use crate::policy::{Action, ModerationDecision, Severity};
use crate::statistics::ModerationStats;
use crate::warnings::WarningState;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{Method, Uri};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerateRequest {
    pub text: Option<String>,
    #[serde(default)]
    pub thresholds: Option<ThresholdOverrides>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub text: Option<String>,
    #[serde(default)]
    pub thresholds: Option<ThresholdOverrides>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub include_scores: bool,
    /// When present the evaluation counts against this user's warnings.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A batch entry is either a bare string or `{text, userId}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Text(String),
    Item(BatchItem),
}

impl From<BatchEntry> for BatchItem {
    fn from(entry: BatchEntry) -> Self {
        match entry {
            BatchEntry::Text(text) => BatchItem::stateless(text),
            BatchEntry::Item(item) => item,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub texts: Vec<BatchEntry>,
    #[serde(default)]
    pub thresholds: Option<ThresholdOverrides>,
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub classifier_configured: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub method: &'static str,
    pub path: &'static str,
    pub description: &'static str,
    pub requires_api_key: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    pub endpoints: Vec<EndpointInfo>,
    pub rate_limit: String,
    pub authentication: String,
    pub max_text_length: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerateResponse {
    pub text: String,
    pub is_toxic: bool,
    pub action: Action,
    pub severity: Severity,
    pub reason: String,
    pub confidence: u8,
    pub violations: Vec<Attribute>,
    pub degraded: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub is_toxic: bool,
    pub confidence: u8,
    pub max_score: f64,
    pub violations: Vec<Attribute>,
    pub reason: String,
    pub degraded: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisMetadata {
    pub text_length: usize,
    pub thresholds: BTreeMap<Attribute, f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeResponse {
    pub text: String,
    pub analysis: AnalysisSummary,
    pub recommendation: ModerationDecision,
    pub metadata: AnalysisMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<BTreeMap<Attribute, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning_state: Option<WarningState>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub index: usize,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_toxic: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ModerationDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub toxic: usize,
    pub safe: usize,
    pub degraded: usize,
    pub errors: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub results: Vec<BatchResult>,
    pub summary: BatchSummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsConfiguration {
    pub thresholds: BTreeMap<Attribute, f64>,
    pub escalation_limit: u32,
    pub reset_window_hours: u64,
    pub rate_limit: String,
    pub max_text_length: usize,
    pub max_batch_size: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub ttl_seconds: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub classifier_configured: bool,
    pub attributes: Vec<&'static str>,
    pub users_with_warnings: usize,
    pub configuration: StatsConfiguration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moderation: Option<ModerationStats>,
}

pub async fn health(State(state): State<AppState>) -> Json<Envelope<HealthResponse>> {
    envelope(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        classifier_configured: state.orchestrator.classifier_configured(),
        timestamp: Utc::now(),
    })
}

pub async fn info(State(state): State<AppState>) -> Json<Envelope<InfoResponse>> {
    envelope(InfoResponse {
        name: "ModBot API",
        version: env!("CARGO_PKG_VERSION"),
        description: env!("CARGO_PKG_DESCRIPTION"),
        endpoints: ENDPOINTS
            .iter()
            .map(|&(method, path, description, protected)| EndpointInfo {
                method,
                path,
                description,
                requires_api_key: protected,
            })
            .collect(),
        rate_limit: state.rate_limit_description.clone(),
        authentication: format!(
            "API key ({} header or {} query parameter) required for protected endpoints",
            super::API_KEY_HEADER,
            super::API_KEY_QUERY
        ),
        max_text_length: state.max_text_length,
    })
}

pub async fn moderate(
    State(state): State<AppState>,
    payload: Result<Json<ModerateRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<ModerateResponse>>> {
    let Json(request) = payload?;
    let text = required_text(request.text, state.max_text_length)?;
    let options = EvaluationOptions {
        thresholds: request.thresholds,
        languages: request.languages,
    };

    let evaluation = state.orchestrator.preview(&text, &options).await?;
    let decision = evaluation.decision;
    Ok(envelope(ModerateResponse {
        text: preview(&text, 100),
        is_toxic: evaluation.assessment.is_toxic,
        action: decision.action,
        severity: decision.severity,
        reason: decision.reason,
        confidence: decision.confidence,
        violations: decision.violations,
        degraded: decision.degraded,
        timestamp: Utc::now(),
    }))
}

pub async fn analyze(
    State(state): State<AppState>,
    payload: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<AnalyzeResponse>>> {
    let Json(request) = payload?;
    let text = required_text(request.text, state.max_text_length)?;
    let options = EvaluationOptions {
        thresholds: request.thresholds,
        languages: request.languages,
    };

    let evaluation = state
        .orchestrator
        .evaluate_detailed(&text, request.user_id.as_deref(), &options)
        .await?;
    let assessment = evaluation.assessment;
    let decision = evaluation.decision;

    Ok(envelope(AnalyzeResponse {
        text: preview(&text, 200),
        analysis: AnalysisSummary {
            is_toxic: assessment.is_toxic,
            confidence: assessment.confidence(),
            max_score: assessment.max_score,
            violations: assessment.violated_attributes.iter().copied().collect(),
            reason: assessment.reason(),
            degraded: assessment.degraded,
        },
        recommendation: decision,
        metadata: AnalysisMetadata {
            text_length: text.chars().count(),
            thresholds: assessment.thresholds.clone(),
            timestamp: Utc::now(),
        },
        scores: request.include_scores.then(|| assessment.scores.clone()),
        warning_state: evaluation.state,
    }))
}

pub async fn batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> ApiResult<Json<Envelope<BatchResponse>>> {
    let started = Instant::now();
    let Json(request) = payload?;
    let options = EvaluationOptions {
        thresholds: request.thresholds,
        languages: request.languages,
    };
    let items: Vec<BatchItem> = request.texts.into_iter().map(BatchItem::from).collect();
    let previews: Vec<String> = items.iter().map(|item| preview(&item.text, 50)).collect();

    let outcomes = state
        .orchestrator
        .evaluate_batch(items, request.max_concurrent, &options)
        .await?;

    let mut summary = BatchSummary {
        total: outcomes.len(),
        ..Default::default()
    };
    let results = outcomes
        .into_iter()
        .map(|outcome| {
            let text = previews.get(outcome.index).cloned().unwrap_or_default();
            match outcome.result {
                Ok(evaluation) => {
                    if evaluation.decision.degraded {
                        summary.degraded += 1;
                    } else if evaluation.assessment.is_toxic {
                        summary.toxic += 1;
                    } else {
                        summary.safe += 1;
                    }
                    BatchResult {
                        index: outcome.index,
                        text,
                        is_toxic: Some(evaluation.assessment.is_toxic),
                        decision: Some(evaluation.decision),
                        error: None,
                    }
                }
                Err(e) => {
                    summary.errors += 1;
                    BatchResult {
                        index: outcome.index,
                        text,
                        is_toxic: None,
                        decision: None,
                        error: Some(e.source.to_string()),
                    }
                }
            }
        })
        .collect();
    summary.processing_time_ms = started.elapsed().as_millis() as u64;

    Ok(envelope(BatchResponse { results, summary }))
}

pub async fn stats(State(state): State<AppState>) -> Json<Envelope<StatsResponse>> {
    let orchestrator = &state.orchestrator;
    let policy = orchestrator.evaluator().config();

    let cache = match orchestrator.cache() {
        Some(cache) => {
            let counters = cache.counters().await;
            Some(CacheStats {
                entries: counters.entries,
                ttl_seconds: cache.ttl().as_secs(),
                hits: counters.hits,
                misses: counters.misses,
                hit_rate: counters.hit_rate(),
            })
        }
        None => None,
    };
    let moderation = match orchestrator.statistics() {
        Some(collector) => collector.snapshot().await,
        None => None,
    };

    envelope(StatsResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.uptime_seconds(),
        classifier_configured: orchestrator.classifier_configured(),
        attributes: Config::attribute_names(),
        users_with_warnings: orchestrator.store().users_with_warnings().await,
        configuration: StatsConfiguration {
            thresholds: orchestrator.normalizer().thresholds().as_map(),
            escalation_limit: policy.escalation_limit,
            reset_window_hours: policy.reset_window_hours,
            rate_limit: state.rate_limit_description.clone(),
            max_text_length: state.max_text_length,
            max_batch_size: orchestrator.settings().batch_max_items,
        },
        cache,
        moderation,
    })
}

pub async fn get_warnings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Json<Envelope<WarningState>> {
    let store = state.orchestrator.store();
    let mut warning_state = store.get(&user_id).await;
    warning_state.warning_count = warning_state.effective_count(Utc::now(), store.reset_window());
    envelope(warning_state)
}

pub async fn clear_warnings(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Envelope<WarningState>>> {
    let cleared = state.orchestrator.clear_warnings(&user_id).await?;
    Ok(envelope(cleared))
}

pub async fn not_found(method: Method, uri: Uri) -> ApiError {
    ApiError::NotFound {
        method: method.to_string(),
        path: uri.path().to_string(),
    }
}

fn required_text(text: Option<String>, max_length: usize) -> Result<String, ValidationError> {
    let text = text.unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyText);
    }
    let len = text.chars().count();
    if len > max_length {
        return Err(ValidationError::TextTooLong {
            len,
            max: max_length,
        });
    }
    Ok(text)
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().nth(max_chars).is_some() {
        out.push_str("...");
    }
    out
}
