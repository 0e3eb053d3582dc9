use crate::orchestrator::ModerationOrchestrator;
use crate::screening::{InboundMessage, MessageScreen};
use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

pub const COMMAND_PREFIX: &str = "!mod";

lazy_static! {
    static ref MENTION: Regex = Regex::new(r"^<@!?(\d+)>$").unwrap();
    static ref RAW_ID: Regex = Regex::new(r"^[A-Za-z0-9_.-]+$").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    Warnings(String),
    ClearWarnings(String),
    Unmute(String),
    Ban { user_id: String, reason: Option<String> },
    Status,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    Unknown(String),
    #[error("usage: !mod {0} <user>")]
    MissingUser(&'static str),
    #[error("not a valid user: {0}")]
    InvalidUser(String),
}

impl AdminCommand {
    /// Parse a chat line. `Ok(None)` when the line is not addressed to us.
    pub fn parse(input: &str) -> Result<Option<AdminCommand>, CommandError> {
        let mut parts = input.split_whitespace();
        match parts.next() {
            Some(prefix) if prefix.eq_ignore_ascii_case(COMMAND_PREFIX) => {}
            _ => return Ok(None),
        }

        let Some(name) = parts.next() else {
            return Ok(Some(AdminCommand::Help));
        };
        let name = name.to_lowercase();
        let command = match name.as_str() {
            "warnings" => AdminCommand::Warnings(user_arg(parts.next(), "warnings")?),
            "clearwarnings" => AdminCommand::ClearWarnings(user_arg(parts.next(), "clearwarnings")?),
            "unmute" => AdminCommand::Unmute(user_arg(parts.next(), "unmute")?),
            "ban" => {
                let user_id = user_arg(parts.next(), "ban")?;
                let reason: Vec<&str> = parts.collect();
                AdminCommand::Ban {
                    user_id,
                    reason: (!reason.is_empty()).then(|| reason.join(" ")),
                }
            }
            "status" => AdminCommand::Status,
            "help" => AdminCommand::Help,
            _ => return Err(CommandError::Unknown(name)),
        };
        Ok(Some(command))
    }

    /// Run the command and produce the reply text.
    pub async fn execute(&self, orchestrator: &ModerationOrchestrator) -> String {
        let store = orchestrator.store();
        match self {
            AdminCommand::Warnings(user_id) => {
                let state = store.get(user_id).await;
                let count = store.effective_count(user_id).await;
                let mut reply = format!(
                    "User <@{user_id}> has {count}/{} warnings.",
                    orchestrator.evaluator().config().escalation_limit
                );
                if let Some(until) = state.muted_until.filter(|_| state.is_muted(chrono::Utc::now())) {
                    reply.push_str(&format!(" Timed out until {}.", until.to_rfc3339()));
                }
                reply
            }
            AdminCommand::ClearWarnings(user_id) => match orchestrator.clear_warnings(user_id).await {
                Ok(_) => format!("Warnings for <@{user_id}> cleared."),
                Err(e) => format!("Warnings for <@{user_id}> cleared in memory only: {e}"),
            },
            AdminCommand::Unmute(user_id) => match store.clear_mute(user_id).await {
                Ok(_) => format!("Timeout for <@{user_id}> lifted."),
                Err(e) => format!("Timeout for <@{user_id}> lifted in memory only: {e}"),
            },
            AdminCommand::Ban { user_id, reason } => {
                let reason = reason.as_deref().unwrap_or("banned by administrator");
                let applied = orchestrator.ban_user(user_id, reason).await;
                format!("User <@{user_id}> banned ({}).", applied.decision.reason)
            }
            AdminCommand::Status => status_report(orchestrator).await,
            AdminCommand::Help => help_text(),
        }
    }
}

/// Owner-only command entry point for chat adapters. Returns the reply, or
/// `None` when the message is not a command the author may run.
pub async fn handle_message(
    message: &InboundMessage,
    screen: &MessageScreen,
    orchestrator: &ModerationOrchestrator,
) -> Option<String> {
    let command = match AdminCommand::parse(&message.content) {
        Ok(Some(command)) => command,
        Ok(None) => return None,
        Err(e) if screen.is_owner(&message.author_id) => return Some(e.to_string()),
        Err(_) => return None,
    };
    if !screen.is_owner(&message.author_id) {
        log::warn!(
            "Ignoring admin command from non-owner {}",
            message.author_id
        );
        return None;
    }
    log::info!("Admin command from {}: {:?}", message.author_id, command);
    Some(command.execute(orchestrator).await)
}

fn user_arg(arg: Option<&str>, command: &'static str) -> Result<String, CommandError> {
    let arg = arg.ok_or(CommandError::MissingUser(command))?;
    if let Some(caps) = MENTION.captures(arg) {
        return Ok(caps[1].to_string());
    }
    if RAW_ID.is_match(arg) {
        Ok(arg.to_string())
    } else {
        Err(CommandError::InvalidUser(arg.to_string()))
    }
}

async fn status_report(orchestrator: &ModerationOrchestrator) -> String {
    let policy = orchestrator.evaluator().config();
    let mut lines = vec![
        format!(
            "Classifier: {}",
            if orchestrator.classifier_configured() {
                "configured"
            } else {
                "NOT configured (failing open)"
            }
        ),
        format!(
            "Users with warnings: {}",
            orchestrator.store().users_with_warnings().await
        ),
        format!(
            "Escalation: timeout after {} warnings, {} minutes, reset after {}h",
            policy.escalation_limit,
            policy.timeout_seconds / 60,
            policy.reset_window_hours
        ),
    ];
    if let Some(cache) = orchestrator.cache() {
        let counters = cache.counters().await;
        lines.push(format!(
            "Cache: {} entries, {:.0}% hit rate",
            counters.entries,
            counters.hit_rate() * 100.0
        ));
    }
    if let Some(stats) = match orchestrator.statistics() {
        Some(collector) => collector.snapshot().await,
        None => None,
    } {
        lines.push(format!(
            "Evaluated: {} ({} blocked, {} degraded)",
            stats.total_evaluations,
            stats.blocked(),
            stats.degraded
        ));
    }
    lines.join("\n")
}

fn help_text() -> String {
    [
        "Owner commands:",
        "!mod warnings <user>      show a user's warnings",
        "!mod clearwarnings <user> reset a user's warnings",
        "!mod unmute <user>        lift an active timeout",
        "!mod ban <user> [reason]  ban a user",
        "!mod status               show bot status",
        "!mod help                 show this help",
    ]
    .join("\n")
}
