use crate::policy::Action;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationStats {
    pub total_evaluations: u64,
    pub allowed: u64,
    pub flagged: u64,
    pub warned: u64,
    pub timed_out: u64,
    pub banned: u64,
    pub degraded: u64,
    pub classifier_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub batches: u64,
    pub batch_items: u64,
    pub rejected_unauthorized: u64,
    pub rejected_rate_limited: u64,
    pub total_processing_time_ms: u64,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ModerationStats {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            total_evaluations: 0,
            allowed: 0,
            flagged: 0,
            warned: 0,
            timed_out: 0,
            banned: 0,
            degraded: 0,
            classifier_failures: 0,
            cache_hits: 0,
            cache_misses: 0,
            batches: 0,
            batch_items: 0,
            rejected_unauthorized: 0,
            rejected_rate_limited: 0,
            total_processing_time_ms: 0,
            start_time: now,
            last_updated: now,
        }
    }

    pub fn blocked(&self) -> u64 {
        self.warned + self.timed_out + self.banned
    }

    pub fn average_processing_time_ms(&self) -> f64 {
        if self.total_evaluations == 0 {
            0.0
        } else {
            self.total_processing_time_ms as f64 / self.total_evaluations as f64
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

impl Default for ModerationStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Unauthorized,
    RateLimited,
}

#[derive(Debug, Clone)]
pub enum StatEvent {
    Evaluated {
        action: Action,
        degraded: bool,
        processing_time_ms: u64,
    },
    ClassifierFailure,
    CacheHit,
    CacheMiss,
    BatchProcessed {
        items: usize,
    },
    RequestRejected(RejectReason),
}

enum Message {
    Event(StatEvent),
    Snapshot(oneshot::Sender<ModerationStats>),
    Flush(oneshot::Sender<()>),
}

/// Event-driven counters. Recording never blocks; a single worker task owns
/// the aggregate and optionally flushes it to a JSON snapshot file.
pub struct StatisticsCollector {
    sender: mpsc::UnboundedSender<Message>,
    _handle: tokio::task::JoinHandle<()>,
}

impl StatisticsCollector {
    pub fn new(path: Option<PathBuf>, flush_interval_seconds: u64) -> Result<Self> {
        let initial = match &path {
            Some(path) => Self::load_snapshot(path)?,
            None => ModerationStats::new(),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let flush_every = Duration::from_secs(flush_interval_seconds.max(1));
        let handle = tokio::spawn(async move {
            Self::stats_worker(initial, path, receiver, flush_every).await;
        });

        Ok(Self {
            sender,
            _handle: handle,
        })
    }

    /// Collector without a snapshot file.
    pub fn in_memory() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            Self::stats_worker(ModerationStats::new(), None, receiver, Duration::from_secs(60))
                .await;
        });
        Self {
            sender,
            _handle: handle,
        }
    }

    pub fn record_event(&self, event: StatEvent) {
        if self.sender.send(Message::Event(event)).is_err() {
            log::warn!("Failed to send statistics event: worker stopped");
        }
    }

    /// Current aggregate, including every event recorded before the call.
    pub async fn snapshot(&self) -> Option<ModerationStats> {
        let (reply, response) = oneshot::channel();
        self.sender.send(Message::Snapshot(reply)).ok()?;
        response.await.ok()
    }

    /// Write the snapshot file now (no-op without a path).
    pub async fn flush(&self) {
        let (reply, response) = oneshot::channel();
        if self.sender.send(Message::Flush(reply)).is_ok() {
            let _ = response.await;
        }
    }

    fn load_snapshot(path: &Path) -> Result<ModerationStats> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create stats directory: {}", parent.display())
                })?;
            }
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse stats snapshot: {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ModerationStats::new()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read stats snapshot: {}", path.display())),
        }
    }

    async fn stats_worker(
        mut stats: ModerationStats,
        path: Option<PathBuf>,
        mut receiver: mpsc::UnboundedReceiver<Message>,
        flush_every: Duration,
    ) {
        let mut flush_timer = interval(flush_every);
        let mut dirty = false;

        loop {
            tokio::select! {
                message = receiver.recv() => {
                    match message {
                        Some(Message::Event(event)) => {
                            Self::process_event(event, &mut stats);
                            dirty = true;
                        }
                        Some(Message::Snapshot(reply)) => {
                            let _ = reply.send(stats.clone());
                        }
                        Some(Message::Flush(reply)) => {
                            Self::flush_to_file(path.as_deref(), &stats).await;
                            dirty = false;
                            let _ = reply.send(());
                        }
                        None => {
                            // Channel closed, flush and exit
                            if dirty {
                                Self::flush_to_file(path.as_deref(), &stats).await;
                            }
                            break;
                        }
                    }
                }
                _ = flush_timer.tick() => {
                    if dirty {
                        Self::flush_to_file(path.as_deref(), &stats).await;
                        dirty = false;
                    }
                }
            }
        }
    }

    fn process_event(event: StatEvent, stats: &mut ModerationStats) {
        stats.last_updated = Utc::now();

        match event {
            StatEvent::Evaluated {
                action,
                degraded,
                processing_time_ms,
            } => {
                stats.total_evaluations += 1;
                stats.total_processing_time_ms += processing_time_ms;
                if degraded {
                    stats.degraded += 1;
                }
                match action {
                    Action::Allow => stats.allowed += 1,
                    Action::AllowFlagged => stats.flagged += 1,
                    Action::BlockWarn => stats.warned += 1,
                    Action::BlockTimeout => stats.timed_out += 1,
                    Action::BlockBan => stats.banned += 1,
                }
            }
            StatEvent::ClassifierFailure => stats.classifier_failures += 1,
            StatEvent::CacheHit => stats.cache_hits += 1,
            StatEvent::CacheMiss => stats.cache_misses += 1,
            StatEvent::BatchProcessed { items } => {
                stats.batches += 1;
                stats.batch_items += items as u64;
            }
            StatEvent::RequestRejected(RejectReason::Unauthorized) => {
                stats.rejected_unauthorized += 1
            }
            StatEvent::RequestRejected(RejectReason::RateLimited) => {
                stats.rejected_rate_limited += 1
            }
        }
    }

    async fn flush_to_file(path: Option<&Path>, stats: &ModerationStats) {
        let Some(path) = path else {
            return;
        };
        let bytes = match serde_json::to_vec_pretty(stats) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("Failed to serialize statistics: {e}");
                return;
            }
        };
        if let Err(e) = tokio::fs::write(path, bytes).await {
            log::error!("Failed to flush statistics to {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluated(action: Action, degraded: bool, ms: u64) -> StatEvent {
        StatEvent::Evaluated {
            action,
            degraded,
            processing_time_ms: ms,
        }
    }

    #[tokio::test]
    async fn test_events_are_aggregated() {
        let collector = StatisticsCollector::in_memory();
        collector.record_event(evaluated(Action::Allow, true, 10));
        collector.record_event(evaluated(Action::BlockWarn, false, 20));
        collector.record_event(evaluated(Action::BlockTimeout, false, 30));
        collector.record_event(StatEvent::ClassifierFailure);
        collector.record_event(StatEvent::CacheHit);
        collector.record_event(StatEvent::CacheMiss);
        collector.record_event(StatEvent::BatchProcessed { items: 7 });
        collector.record_event(StatEvent::RequestRejected(RejectReason::RateLimited));

        let stats = collector.snapshot().await.unwrap();
        assert_eq!(stats.total_evaluations, 3);
        assert_eq!(stats.allowed, 1);
        assert_eq!(stats.degraded, 1);
        assert_eq!(stats.blocked(), 2);
        assert_eq!(stats.classifier_failures, 1);
        assert_eq!(stats.cache_hit_rate(), 0.5);
        assert_eq!(stats.batch_items, 7);
        assert_eq!(stats.rejected_rate_limited, 1);
        assert_eq!(stats.average_processing_time_ms(), 20.0);
    }

    #[tokio::test]
    async fn test_snapshot_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats").join("modbot.json");

        let collector = StatisticsCollector::new(Some(path.clone()), 60).unwrap();
        collector.record_event(evaluated(Action::BlockBan, false, 5));
        collector.flush().await;
        assert!(path.exists());

        let reloaded = StatisticsCollector::new(Some(path), 60).unwrap();
        let stats = reloaded.snapshot().await.unwrap();
        assert_eq!(stats.banned, 1);
        assert_eq!(stats.total_evaluations, 1);
    }
}
