use crate::error::PlatformError;
use crate::policy::{Action, ModerationDecision};
use async_trait::async_trait;
use serde::Serialize;

/// Where the moderated message came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageContext {
    pub user_id: String,
    pub channel_id: Option<String>,
    pub message_id: Option<String>,
}

impl MessageContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

/// Side effects a chat platform must provide to enact decisions. Each call
/// may fail independently; none of them feed back into the decision.
#[async_trait]
pub trait PlatformActions: Send + Sync {
    async fn delete_message(&self, ctx: &MessageContext) -> Result<(), PlatformError>;
    async fn timeout_user(&self, ctx: &MessageContext, duration_seconds: u64)
        -> Result<(), PlatformError>;
    async fn notify_user(&self, ctx: &MessageContext, message: &str) -> Result<(), PlatformError>;
    async fn post_log(
        &self,
        ctx: &MessageContext,
        decision: &ModerationDecision,
    ) -> Result<(), PlatformError>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "error")]
pub enum StepOutcome {
    Skipped,
    Done,
    Failed(String),
}

impl StepOutcome {
    fn from_result(result: Result<(), PlatformError>) -> Self {
        match result {
            Ok(()) => StepOutcome::Done,
            Err(e) => StepOutcome::Failed(e.to_string()),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnactmentReport {
    pub deleted: StepOutcome,
    pub notified: StepOutcome,
    pub timed_out: StepOutcome,
    pub logged: StepOutcome,
}

impl EnactmentReport {
    fn skipped() -> Self {
        Self {
            deleted: StepOutcome::Skipped,
            notified: StepOutcome::Skipped,
            timed_out: StepOutcome::Skipped,
            logged: StepOutcome::Skipped,
        }
    }

    pub fn failures(&self) -> Vec<&'static str> {
        [
            ("delete", &self.deleted),
            ("notify", &self.notified),
            ("timeout", &self.timed_out),
            ("log", &self.logged),
        ]
        .into_iter()
        .filter(|(_, outcome)| outcome.is_failed())
        .map(|(step, _)| step)
        .collect()
    }
}

/// Carry out `decision` on the platform: delete the message for blocking
/// actions, tell the user, apply a timeout, then post a moderation log.
/// Every step runs even if an earlier one failed.
pub async fn enact(
    platform: &dyn PlatformActions,
    decision: &ModerationDecision,
    ctx: &MessageContext,
    escalation_limit: u32,
) -> EnactmentReport {
    let mut report = EnactmentReport::skipped();
    if decision.action == Action::Allow {
        return report;
    }

    if decision.action.is_blocking() {
        report.deleted = match platform.delete_message(ctx).await {
            // already gone counts as deleted
            Err(PlatformError::NotFound) => {
                log::debug!("Message from {} was already deleted", ctx.user_id);
                StepOutcome::Done
            }
            other => StepOutcome::from_result(other),
        };
    }

    if let Some(message) = notification_text(decision, escalation_limit) {
        report.notified = StepOutcome::from_result(platform.notify_user(ctx, &message).await);
    }

    if let (Action::BlockTimeout, Some(seconds)) = (decision.action, decision.timeout_seconds) {
        report.timed_out = StepOutcome::from_result(platform.timeout_user(ctx, seconds).await);
    }

    report.logged = StepOutcome::from_result(platform.post_log(ctx, decision).await);

    let failures = report.failures();
    if !failures.is_empty() {
        log::warn!(
            "Enacting {} for {} partially failed: {}",
            decision.action,
            ctx.user_id,
            failures.join(", ")
        );
    }
    report
}

fn notification_text(decision: &ModerationDecision, escalation_limit: u32) -> Option<String> {
    match decision.action {
        Action::Allow | Action::AllowFlagged => None,
        Action::BlockWarn => Some(format!(
            "Your message was removed for inappropriate content. Warnings: {}/{}",
            decision.warning_count_after, escalation_limit
        )),
        Action::BlockTimeout => Some(format!(
            "You have been timed out for {} minutes after repeated violations.",
            decision.timeout_seconds.unwrap_or(0) / 60
        )),
        Action::BlockBan => Some(format!("You have been banned: {}", decision.reason)),
    }
}

/// Platform adapter that only writes what it would do to the log. Used by
/// the CLI and wherever no chat platform is attached.
#[derive(Debug, Default)]
pub struct LoggingPlatform;

#[async_trait]
impl PlatformActions for LoggingPlatform {
    async fn delete_message(&self, ctx: &MessageContext) -> Result<(), PlatformError> {
        log::info!(
            "[platform] delete message {:?} from {}",
            ctx.message_id,
            ctx.user_id
        );
        Ok(())
    }

    async fn timeout_user(
        &self,
        ctx: &MessageContext,
        duration_seconds: u64,
    ) -> Result<(), PlatformError> {
        log::info!("[platform] timeout {} for {duration_seconds}s", ctx.user_id);
        Ok(())
    }

    async fn notify_user(&self, ctx: &MessageContext, message: &str) -> Result<(), PlatformError> {
        log::info!("[platform] notify {}: {message}", ctx.user_id);
        Ok(())
    }

    async fn post_log(
        &self,
        ctx: &MessageContext,
        decision: &ModerationDecision,
    ) -> Result<(), PlatformError> {
        log::info!(
            "[platform] log channel={:?} user={} action={} reason={}",
            ctx.channel_id,
            ctx.user_id,
            decision.action,
            decision.reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Severity;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPlatform {
        calls: Mutex<Vec<String>>,
        delete_error: Option<PlatformError>,
        notify_error: Option<PlatformError>,
    }

    impl RecordingPlatform {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn push(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl PlatformActions for RecordingPlatform {
        async fn delete_message(&self, _: &MessageContext) -> Result<(), PlatformError> {
            self.push("delete".to_string());
            self.delete_error.clone().map_or(Ok(()), Err)
        }

        async fn timeout_user(&self, _: &MessageContext, seconds: u64) -> Result<(), PlatformError> {
            self.push(format!("timeout {seconds}"));
            Ok(())
        }

        async fn notify_user(&self, _: &MessageContext, message: &str) -> Result<(), PlatformError> {
            self.push(format!("notify {message}"));
            self.notify_error.clone().map_or(Ok(()), Err)
        }

        async fn post_log(
            &self,
            _: &MessageContext,
            decision: &ModerationDecision,
        ) -> Result<(), PlatformError> {
            self.push(format!("log {}", decision.action));
            Ok(())
        }
    }

    fn decision(action: Action, count: u32) -> ModerationDecision {
        ModerationDecision {
            action,
            severity: Severity::High,
            warning_count_after: count,
            reason: "Violated: toxicity".to_string(),
            degraded: false,
            violations: Vec::new(),
            confidence: 95,
            timeout_seconds: (action == Action::BlockTimeout).then_some(600),
        }
    }

    #[tokio::test]
    async fn test_warn_deletes_notifies_and_logs() {
        let platform = RecordingPlatform::default();
        let report = enact(
            &platform,
            &decision(Action::BlockWarn, 1),
            &MessageContext::new("u1"),
            2,
        )
        .await;

        assert_eq!(
            platform.calls(),
            vec![
                "delete".to_string(),
                "notify Your message was removed for inappropriate content. Warnings: 1/2"
                    .to_string(),
                "log block_warn".to_string(),
            ]
        );
        assert_eq!(report.timed_out, StepOutcome::Skipped);
        assert!(report.failures().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_order() {
        let platform = RecordingPlatform::default();
        enact(
            &platform,
            &decision(Action::BlockTimeout, 0),
            &MessageContext::new("u1"),
            2,
        )
        .await;

        let calls = platform.calls();
        assert_eq!(calls[0], "delete");
        assert!(calls[1].starts_with("notify You have been timed out for 10 minutes"));
        assert_eq!(calls[2], "timeout 600");
        assert_eq!(calls[3], "log block_timeout");
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_later_steps() {
        let platform = RecordingPlatform {
            delete_error: Some(PlatformError::PermissionDenied("MANAGE_MESSAGES".into())),
            notify_error: Some(PlatformError::Failed("DMs closed".into())),
            ..Default::default()
        };
        let report = enact(
            &platform,
            &decision(Action::BlockWarn, 1),
            &MessageContext::new("u1"),
            2,
        )
        .await;

        assert_eq!(report.failures(), vec!["delete", "notify"]);
        assert_eq!(report.logged, StepOutcome::Done);
    }

    #[tokio::test]
    async fn test_already_deleted_counts_as_done() {
        let platform = RecordingPlatform {
            delete_error: Some(PlatformError::NotFound),
            ..Default::default()
        };
        let report = enact(
            &platform,
            &decision(Action::BlockWarn, 1),
            &MessageContext::new("u1"),
            2,
        )
        .await;
        assert_eq!(report.deleted, StepOutcome::Done);
    }

    #[tokio::test]
    async fn test_allow_does_nothing_and_flagged_only_logs() {
        let platform = RecordingPlatform::default();
        let ctx = MessageContext::new("u1");

        let report = enact(&platform, &decision(Action::Allow, 0), &ctx, 2).await;
        assert_eq!(report, EnactmentReport::skipped());
        assert!(platform.calls().is_empty());

        enact(&platform, &decision(Action::AllowFlagged, 0), &ctx, 2).await;
        assert_eq!(platform.calls(), vec!["log allow_flagged".to_string()]);
    }
}
