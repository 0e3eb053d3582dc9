pub mod api;
pub mod assessment;
pub mod classifier;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod policy;
pub mod screening;
pub mod statistics;
pub mod warnings;

pub use assessment::{Attribute, ScoreNormalizer, ThresholdOverrides, Thresholds, ViolationAssessment};
pub use classifier::{Classifier, PerspectiveClient};
pub use config::Config;
pub use dedup::{DeduplicationCache, Fingerprint};
pub use error::{ClassifierError, ModerationError, ValidationError};
pub use orchestrator::{EvaluationOptions, ModerationOrchestrator};
pub use policy::{Action, ModerationDecision, PolicyEvaluator, Severity};
pub use statistics::{StatEvent, StatisticsCollector};
pub use warnings::{WarningState, WarningStore};
