//! Policy Evaluator
//!
//! Maps an assessment plus the user's current warning state to a moderation
//! decision. The escalation ladder is a pure function of its two inputs and
//! the policy configuration.

use crate::assessment::{Attribute, ViolationAssessment};
use crate::warnings::WarningState;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    AllowFlagged,
    BlockWarn,
    BlockTimeout,
    BlockBan,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Allow,
        Action::AllowFlagged,
        Action::BlockWarn,
        Action::BlockTimeout,
        Action::BlockBan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::AllowFlagged => "allow_flagged",
            Action::BlockWarn => "block_warn",
            Action::BlockTimeout => "block_timeout",
            Action::BlockBan => "block_ban",
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Action::BlockWarn | Action::BlockTimeout | Action::BlockBan
        )
    }

    /// Warning count after this action is applied to `count`. Escalation
    /// spends the accumulated warnings.
    pub fn apply_to_count(&self, count: u32) -> u32 {
        match self {
            Action::Allow | Action::AllowFlagged => count,
            Action::BlockWarn => count.saturating_add(1),
            Action::BlockTimeout | Action::BlockBan => 0,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
}

impl Severity {
    /// Fixed cut points over `max_score`. Non-toxic content has no severity.
    pub fn from_assessment(assessment: &ViolationAssessment) -> Severity {
        if !assessment.is_toxic {
            return Severity::None;
        }
        match assessment.max_score {
            s if s > 0.9 => Severity::High,
            s if s > 0.7 => Severity::Medium,
            s if s > 0.0 => Severity::Low,
            _ => Severity::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Prior warnings at which a medium-severity violation escalates.
    pub escalation_limit: u32,
    /// Timeout length attached to `block_timeout` decisions.
    pub timeout_seconds: u64,
    /// Hours without a violation after which warnings are forgotten.
    pub reset_window_hours: u64,
    /// Administrative override: the top of the automatic ladder becomes a
    /// ban instead of a timeout.
    pub escalate_to_ban: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            escalation_limit: 2,
            timeout_seconds: 600,
            reset_window_hours: 24,
            escalate_to_ban: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationDecision {
    pub action: Action,
    pub severity: Severity,
    pub warning_count_after: u32,
    pub reason: String,
    pub degraded: bool,
    pub violations: Vec<Attribute>,
    pub confidence: u8,
    /// Set for `block_timeout`; how long the platform should silence the user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ModerationDecision {
    /// Fail-open decision used whenever the content could not be evaluated.
    pub fn degraded(reason: impl Into<String>, warning_count: u32) -> Self {
        Self {
            action: Action::Allow,
            severity: Severity::None,
            warning_count_after: warning_count,
            reason: reason.into(),
            degraded: true,
            violations: Vec::new(),
            confidence: 0,
            timeout_seconds: None,
        }
    }

    /// Administrative ban, outside the automatic ladder.
    pub fn ban(reason: impl Into<String>) -> Self {
        Self {
            action: Action::BlockBan,
            severity: Severity::High,
            warning_count_after: 0,
            reason: reason.into(),
            degraded: false,
            violations: Vec::new(),
            confidence: 0,
            timeout_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyEvaluator {
    config: PolicyConfig,
}

impl PolicyEvaluator {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Decide the action for one assessment. `state` must already reflect
    /// any inactivity reset; active mutes are not considered here.
    pub fn evaluate(
        &self,
        assessment: &ViolationAssessment,
        state: &WarningState,
    ) -> ModerationDecision {
        let severity = Severity::from_assessment(assessment);
        let action = self.determine_action(assessment, severity, state.warning_count);
        let warning_count_after = action.apply_to_count(state.warning_count);

        ModerationDecision {
            action,
            severity,
            warning_count_after,
            reason: self.build_reason(assessment, action, state.warning_count),
            degraded: assessment.degraded,
            violations: assessment.violated_attributes.iter().copied().collect(),
            confidence: assessment.confidence(),
            timeout_seconds: (action == Action::BlockTimeout).then_some(self.config.timeout_seconds),
        }
    }

    /// First matching row of the escalation table wins.
    fn determine_action(
        &self,
        assessment: &ViolationAssessment,
        severity: Severity,
        warning_count: u32,
    ) -> Action {
        if !assessment.is_toxic {
            return Action::Allow;
        }
        match severity {
            Severity::None | Severity::Low => Action::AllowFlagged,
            Severity::Medium if warning_count < self.config.escalation_limit => Action::BlockWarn,
            Severity::Medium => self.top_rung(),
            Severity::High if warning_count == 0 => Action::BlockWarn,
            Severity::High => self.top_rung(),
        }
    }

    fn top_rung(&self) -> Action {
        if self.config.escalate_to_ban {
            Action::BlockBan
        } else {
            Action::BlockTimeout
        }
    }

    fn build_reason(
        &self,
        assessment: &ViolationAssessment,
        action: Action,
        warning_count: u32,
    ) -> String {
        let base = assessment.reason();
        match action {
            Action::BlockTimeout | Action::BlockBan => format!(
                "{base} (escalated after {warning_count} prior warning{})",
                if warning_count == 1 { "" } else { "s" }
            ),
            _ => base,
        }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }
}
