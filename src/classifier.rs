use crate::assessment::{Attribute, AttributeScore, RawScores};
use crate::config::ClassifierConfig;
use crate::error::ClassifierError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Remote text-toxicity scorer. Implementations return raw per-attribute
/// scores; thresholds and policy are applied by the caller.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str, languages: &[String]) -> Result<RawScores, ClassifierError>;

    /// Whether the classifier has what it needs (credentials, endpoint) to be
    /// called at all.
    fn is_configured(&self) -> bool {
        true
    }
}

/// Google Perspective `comments:analyze` client.
pub struct PerspectiveClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    #[serde(default)]
    attribute_scores: HashMap<String, AttributeEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttributeEntry {
    summary_score: Option<AttributeScore>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl PerspectiveClient {
    pub fn new(config: &ClassifierConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("modbot/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let endpoint = Url::parse(&config.endpoint)?;
        let api_key = config.api_key.clone().filter(|k| !k.trim().is_empty());

        if api_key.is_none() {
            log::warn!("Classifier API key not configured; every evaluation will fail open");
        }

        Ok(Self {
            client,
            endpoint,
            api_key,
            timeout,
        })
    }

    fn request_url(&self, api_key: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("key", api_key);
        url
    }

    fn request_body(text: &str, languages: &[String]) -> serde_json::Value {
        let requested: serde_json::Map<String, serde_json::Value> = Attribute::ALL
            .iter()
            .map(|a| (a.api_name().to_string(), json!({})))
            .collect();
        json!({
            "requestedAttributes": requested,
            "languages": languages,
            "comment": { "text": text },
        })
    }
}

#[async_trait]
impl Classifier for PerspectiveClient {
    async fn classify(&self, text: &str, languages: &[String]) -> Result<RawScores, ClassifierError> {
        let Some(api_key) = &self.api_key else {
            return Err(ClassifierError::BadResponse {
                status: None,
                message: "classifier API key not configured".to_string(),
            });
        };

        let response = self
            .client
            .post(self.request_url(api_key))
            .json(&Self::request_body(text, languages))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.timeout)
                } else {
                    ClassifierError::from(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .await
                .ok()
                .and_then(|body| body.error)
                .and_then(|error| error.message)
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(ClassifierError::BadResponse {
                status: Some(status.as_u16()),
                message,
            });
        }

        let body: AnalyzeResponse = response.json().await?;
        Ok(body
            .attribute_scores
            .into_iter()
            .filter_map(|(name, entry)| entry.summary_score.map(|score| (name, score)))
            .collect())
    }

    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}
