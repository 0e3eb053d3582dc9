use crate::assessment::{Attribute, Thresholds};
use crate::policy::PolicyConfig;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_API_KEY: &str = "modbot-api-key-change-me";
pub const PERSPECTIVE_ENDPOINT: &str =
    "https://commentanalyzer.googleapis.com/v1alpha1/comments:analyze";

pub const MAX_RESET_WINDOW_HOURS: u64 = 24 * 365 * 10;
/// Longest timeout chat platforms accept (28 days).
pub const MAX_TIMEOUT_SECONDS: u64 = 28 * 24 * 60 * 60;
pub const MAX_CACHE_TTL_SECONDS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub classifier: ClassifierConfig,
    pub thresholds: Thresholds,
    pub policy: PolicyConfig,
    pub cache: CacheConfig,
    pub batch: BatchConfig,
    pub limits: LimitsConfig,
    pub storage: StorageConfig,
    pub statistics: StatisticsConfig,
    pub screening: ScreeningConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub api_key: String,
    pub rate_limit: RateLimitConfig,
    pub max_body_bytes: usize,
    /// Take the caller address from `X-Forwarded-For`. Only safe behind a
    /// reverse proxy that overwrites the header.
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            api_key: DEFAULT_API_KEY.to_string(),
            rate_limit: RateLimitConfig::default(),
            max_body_bytes: 1024 * 1024,
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    pub languages: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            endpoint: PERSPECTIVE_ENDPOINT.to_string(),
            api_key: None,
            timeout_seconds: 10,
            languages: vec!["pt".to_string(), "en".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 300,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub default_concurrency: usize,
    pub max_items: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            max_items: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_text_length: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_text_length: 3000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding per-user warning state. In-memory only when unset.
    pub warnings_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsConfig {
    pub enabled: bool,
    pub path: Option<String>,
    pub flush_interval_seconds: u64,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            flush_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    /// Empty means every channel is monitored.
    pub monitored_channels: Vec<String>,
    pub immune_users: Vec<String>,
    pub owner_id: Option<String>,
    pub ignored_patterns: Vec<String>,
    pub min_length: usize,
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            monitored_channels: Vec::new(),
            immune_users: Vec::new(),
            owner_id: None,
            ignored_patterns: vec![r"(?i)^!mod".to_string(), r"^/\w+".to_string()],
            min_length: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Secrets and the two global threshold knobs may come from the
    /// environment, taking precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("MODBOT_API_KEY").filter(|v| !v.is_empty()) {
            self.server.api_key = key;
        }
        if let Some(key) = lookup("PERSPECTIVE_API_KEY").filter(|v| !v.is_empty()) {
            self.classifier.api_key = Some(key);
        }
        let threshold = |name: &str| {
            lookup(name).and_then(|v| match v.parse::<f64>() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    log::warn!("Ignoring non-numeric {name}={v}");
                    None
                }
            })
        };
        if let Some(value) = threshold("TOXICITY_THRESHOLD") {
            // applies to every attribute except severe_toxicity
            self.thresholds = Thresholds {
                severe_toxicity: self.thresholds.severe_toxicity,
                toxicity: value,
                identity_attack: value,
                insult: value,
                profanity: value,
                threat: value,
            };
        }
        if let Some(value) = threshold("SEVERE_TOXICITY_THRESHOLD") {
            self.thresholds.severe_toxicity = value;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.batch.default_concurrency == 0 || self.batch.max_items == 0 {
            bail!("batch.default_concurrency and batch.max_items must be positive");
        }
        if self.server.rate_limit.requests == 0 || self.server.rate_limit.window_seconds == 0 {
            bail!("server.rate_limit values must be positive");
        }
        if self.limits.max_text_length == 0 {
            bail!("limits.max_text_length must be positive");
        }
        if self.classifier.timeout_seconds == 0 {
            bail!("classifier.timeout_seconds must be positive");
        }
        if self.policy.reset_window_hours > MAX_RESET_WINDOW_HOURS {
            bail!(
                "policy.reset_window_hours must be at most {MAX_RESET_WINDOW_HOURS}, got {}",
                self.policy.reset_window_hours
            );
        }
        if self.policy.timeout_seconds > MAX_TIMEOUT_SECONDS {
            bail!(
                "policy.timeout_seconds must be at most {MAX_TIMEOUT_SECONDS}, got {}",
                self.policy.timeout_seconds
            );
        }
        if self.cache.ttl_seconds > MAX_CACHE_TTL_SECONDS {
            bail!(
                "cache.ttl_seconds must be at most {MAX_CACHE_TTL_SECONDS}, got {}",
                self.cache.ttl_seconds
            );
        }
        url::Url::parse(&self.classifier.endpoint)
            .with_context(|| format!("Invalid classifier endpoint: {}", self.classifier.endpoint))?;
        self.server
            .bind_address
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind_address))?;
        for pattern in &self.screening.ignored_patterns {
            Regex::new(pattern)
                .with_context(|| format!("Invalid ignored pattern: {pattern}"))?;
        }
        Ok(())
    }

    pub fn uses_default_api_key(&self) -> bool {
        self.server.api_key == DEFAULT_API_KEY
    }

    /// Attribute names as reported by `/stats`.
    pub fn attribute_names() -> Vec<&'static str> {
        Attribute::ALL.iter().map(|a| a.api_name()).collect()
    }
}
