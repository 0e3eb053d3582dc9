use crate::config::ScreeningConfig;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::HashSet;

/// Chat message as delivered by a platform adapter.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub author_id: String,
    pub author_is_bot: bool,
    pub channel_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenOutcome {
    /// Send the message through moderation.
    Evaluate,
    Skip(SkipReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    BotAuthor,
    UnmonitoredChannel,
    Owner,
    ImmuneUser,
    TooShort,
    Command,
    IgnoredPattern(String),
}

impl SkipReason {
    pub fn describe(&self) -> String {
        match self {
            SkipReason::BotAuthor => "author is a bot".to_string(),
            SkipReason::UnmonitoredChannel => "channel is not monitored".to_string(),
            SkipReason::Owner => "author is the owner".to_string(),
            SkipReason::ImmuneUser => "author is immune".to_string(),
            SkipReason::TooShort => "message too short".to_string(),
            SkipReason::Command => "message is a command".to_string(),
            SkipReason::IgnoredPattern(p) => format!("message matches ignored pattern {p}"),
        }
    }
}

/// Cheap pre-filter deciding which chat messages are worth classifying.
pub struct MessageScreen {
    monitored_channels: HashSet<String>,
    immune_users: HashSet<String>,
    owner_id: Option<String>,
    ignored_patterns: Vec<Regex>,
    min_length: usize,
}

impl MessageScreen {
    pub fn new(config: &ScreeningConfig) -> Result<Self> {
        let ignored_patterns = config
            .ignored_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid ignored pattern: {p}")))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            monitored_channels: config.monitored_channels.iter().cloned().collect(),
            immune_users: config.immune_users.iter().cloned().collect(),
            owner_id: config.owner_id.clone(),
            ignored_patterns,
            min_length: config.min_length,
        })
    }

    pub fn screen(&self, message: &InboundMessage) -> ScreenOutcome {
        match self.skip_reason(message) {
            Some(reason) => {
                log::debug!(
                    "Skipping message from {}: {}",
                    message.author_id,
                    reason.describe()
                );
                ScreenOutcome::Skip(reason)
            }
            None => ScreenOutcome::Evaluate,
        }
    }

    fn skip_reason(&self, message: &InboundMessage) -> Option<SkipReason> {
        if message.author_is_bot {
            return Some(SkipReason::BotAuthor);
        }
        if !self.monitored_channels.is_empty()
            && !self.monitored_channels.contains(&message.channel_id)
        {
            return Some(SkipReason::UnmonitoredChannel);
        }
        if self.owner_id.as_deref() == Some(message.author_id.as_str()) {
            return Some(SkipReason::Owner);
        }
        if self.immune_users.contains(&message.author_id) {
            return Some(SkipReason::ImmuneUser);
        }

        let content = message.content.trim();
        if content.chars().count() < self.min_length {
            return Some(SkipReason::TooShort);
        }
        if content.starts_with('!') || content.starts_with('/') {
            return Some(SkipReason::Command);
        }
        self.ignored_patterns
            .iter()
            .find(|re| re.is_match(content))
            .map(|re| SkipReason::IgnoredPattern(re.as_str().to_string()))
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id.as_deref() == Some(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn screen() -> MessageScreen {
        MessageScreen::new(&ScreeningConfig {
            monitored_channels: vec!["general".to_string()],
            immune_users: vec!["trusted".to_string()],
            owner_id: Some("owner".to_string()),
            ignored_patterns: vec![r"(?i)^gg\b".to_string()],
            min_length: 3,
        })
        .unwrap()
    }

    fn message(author: &str, channel: &str, content: &str) -> InboundMessage {
        InboundMessage {
            author_id: author.to_string(),
            author_is_bot: false,
            channel_id: channel.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_regular_message_is_evaluated() {
        assert_eq!(
            screen().screen(&message("u1", "general", "you are terrible")),
            ScreenOutcome::Evaluate
        );
    }

    #[test]
    fn test_skip_reasons() {
        let screen = screen();
        let bot = InboundMessage {
            author_is_bot: true,
            ..message("b1", "general", "beep boop")
        };
        let cases = [
            (bot, SkipReason::BotAuthor),
            (message("u1", "random", "hello there"), SkipReason::UnmonitoredChannel),
            (message("owner", "general", "hello there"), SkipReason::Owner),
            (message("trusted", "general", "hello there"), SkipReason::ImmuneUser),
            (message("u1", "general", "  ok  "), SkipReason::TooShort),
            (message("u1", "general", "!mod status"), SkipReason::Command),
            (message("u1", "general", "/roll d20"), SkipReason::Command),
            (
                message("u1", "general", "GG everyone"),
                SkipReason::IgnoredPattern(r"(?i)^gg\b".to_string()),
            ),
        ];

        for (msg, expected) in cases {
            assert_eq!(screen.screen(&msg), ScreenOutcome::Skip(expected));
        }
    }

    #[test]
    fn test_empty_channel_list_monitors_everything() {
        let screen = MessageScreen::new(&ScreeningConfig::default()).unwrap();
        assert_eq!(
            screen.screen(&message("u1", "anywhere", "some message")),
            ScreenOutcome::Evaluate
        );
        assert!(!screen.is_owner("u1"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let config = ScreeningConfig {
            ignored_patterns: vec!["(".to_string()],
            ..ScreeningConfig::default()
        };
        assert!(MessageScreen::new(&config).is_err());
    }
}
