//! Warning Store
//!
//! Sole owner of per-user [`WarningState`]. Every mutation for a user runs
//! under that user's own lock, so concurrent violations from one user are
//! linearized while different users never wait on each other. The outer map
//! lock is only held long enough to find or create a user's slot, and the
//! user's lock is released before the new state is handed to persistence.

use crate::error::PersistenceError;
use crate::policy::ModerationDecision;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarningState {
    pub user_id: String,
    pub warning_count: u32,
    pub last_violation_at: Option<DateTime<Utc>>,
    pub muted_until: Option<DateTime<Utc>>,
}

impl WarningState {
    /// Zero-state; equivalent to a user with no record.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            warning_count: 0,
            last_violation_at: None,
            muted_until: None,
        }
    }

    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.muted_until.is_some_and(|until| until > now)
    }

    /// True when the last violation is older than `reset_window`.
    pub fn is_expired(&self, now: DateTime<Utc>, reset_window: Duration) -> bool {
        self.last_violation_at
            .is_some_and(|last| now - last > reset_window)
    }

    /// Count the policy should see right now.
    pub fn effective_count(&self, now: DateTime<Utc>, reset_window: Duration) -> u32 {
        if self.is_expired(now, reset_window) {
            0
        } else {
            self.warning_count
        }
    }
}

/// Result of one atomic update. The in-memory state has been written even
/// when `persist_error` is set.
#[derive(Debug)]
pub struct AppliedDecision {
    pub decision: ModerationDecision,
    pub state: WarningState,
    pub persist_error: Option<PersistenceError>,
}

/// Durable backing for warning state. Implementations only store bytes; what
/// the state means is decided by [`WarningStore`].
#[async_trait]
pub trait WarningPersistence: Send + Sync {
    async fn load_all(&self) -> Result<HashMap<String, WarningState>, PersistenceError>;
    async fn persist(&self, user_id: &str, state: &WarningState) -> Result<(), PersistenceError>;

    /// Wait until every accepted write is durable.
    async fn flush(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

enum WriteRequest {
    Seed(HashMap<String, WarningState>),
    Upsert(String, WarningState),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Whole map serialized to one JSON file, rewritten via temp file + rename.
///
/// A single writer task owns the file. `persist` only queues the new state,
/// so callers never wait on disk I/O; bursts of queued updates collapse into
/// one rewrite. Write failures are logged and retried on the next write or
/// [`flush`](WarningPersistence::flush).
pub struct JsonFilePersistence {
    path: PathBuf,
    sender: mpsc::UnboundedSender<WriteRequest>,
    _handle: JoinHandle<()>,
}

impl JsonFilePersistence {
    /// Must be called inside a Tokio runtime; spawns the writer task.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(Self::writer(path.clone(), receiver));
        Self {
            path,
            sender,
            _handle: handle,
        }
    }

    async fn writer(path: PathBuf, mut receiver: mpsc::UnboundedReceiver<WriteRequest>) {
        let mut snapshot: HashMap<String, WarningState> = HashMap::new();
        let mut dirty = false;

        while let Some(first) = receiver.recv().await {
            let mut flushes = Vec::new();
            let mut next = Some(first);
            while let Some(request) = next {
                match request {
                    WriteRequest::Seed(states) => snapshot = states,
                    WriteRequest::Upsert(user_id, state) => {
                        snapshot.insert(user_id, state);
                        dirty = true;
                    }
                    WriteRequest::Flush(reply) => flushes.push(reply),
                }
                next = receiver.try_recv().ok();
            }

            let mut outcome = Ok(());
            if dirty {
                match Self::write_snapshot(&path, &snapshot).await {
                    Ok(()) => dirty = false,
                    Err(e) => {
                        log::error!("Failed to write warning state to {}: {e}", path.display());
                        outcome = Err(e.to_string());
                    }
                }
            }
            for reply in flushes {
                let _ = reply.send(outcome.clone());
            }
        }
    }

    async fn write_snapshot(
        path: &Path,
        snapshot: &HashMap<String, WarningState>,
    ) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    fn send(&self, request: WriteRequest) -> Result<(), PersistenceError> {
        self.sender
            .send(request)
            .map_err(|_| PersistenceError::WriterStopped)
    }
}

#[async_trait]
impl WarningPersistence for JsonFilePersistence {
    async fn load_all(&self) -> Result<HashMap<String, WarningState>, PersistenceError> {
        let states: HashMap<String, WarningState> = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        self.send(WriteRequest::Seed(states.clone()))?;
        Ok(states)
    }

    async fn persist(&self, user_id: &str, state: &WarningState) -> Result<(), PersistenceError> {
        self.send(WriteRequest::Upsert(user_id.to_string(), state.clone()))
    }

    async fn flush(&self) -> Result<(), PersistenceError> {
        let (reply, response) = oneshot::channel();
        self.send(WriteRequest::Flush(reply))?;
        response
            .await
            .map_err(|_| PersistenceError::WriterStopped)?
            .map_err(PersistenceError::WriteFailed)
    }
}

/// In-memory persistence, mainly for tests and embedding.
#[derive(Default)]
pub struct MemoryPersistence {
    states: Mutex<HashMap<String, WarningState>>,
}

impl MemoryPersistence {
    pub fn with_states(states: impl IntoIterator<Item = WarningState>) -> Self {
        Self {
            states: Mutex::new(
                states
                    .into_iter()
                    .map(|s| (s.user_id.clone(), s))
                    .collect(),
            ),
        }
    }

    pub async fn get(&self, user_id: &str) -> Option<WarningState> {
        self.states.lock().await.get(user_id).cloned()
    }
}

#[async_trait]
impl WarningPersistence for MemoryPersistence {
    async fn load_all(&self) -> Result<HashMap<String, WarningState>, PersistenceError> {
        Ok(self.states.lock().await.clone())
    }

    async fn persist(&self, user_id: &str, state: &WarningState) -> Result<(), PersistenceError> {
        self.states
            .lock()
            .await
            .insert(user_id.to_string(), state.clone());
        Ok(())
    }
}

type Slot = Arc<Mutex<WarningState>>;

pub struct WarningStore {
    users: RwLock<HashMap<String, Slot>>,
    reset_window: Duration,
    persistence: Option<Arc<dyn WarningPersistence>>,
}

impl WarningStore {
    pub fn new(reset_window: Duration) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            reset_window,
            persistence: None,
        }
    }

    /// Store backed by `persistence`, pre-populated from everything it holds.
    pub async fn with_persistence(
        reset_window: Duration,
        persistence: Arc<dyn WarningPersistence>,
    ) -> Result<Self, PersistenceError> {
        let states = persistence.load_all().await?;
        log::info!("Loaded warning state for {} users", states.len());

        let users = states
            .into_iter()
            .map(|(user_id, state)| (user_id, Arc::new(Mutex::new(state))))
            .collect();

        Ok(Self {
            users: RwLock::new(users),
            reset_window,
            persistence: Some(persistence),
        })
    }

    pub fn reset_window(&self) -> Duration {
        self.reset_window
    }

    /// Stored state, or the zero-state for unknown users. Never fails.
    pub async fn get(&self, user_id: &str) -> WarningState {
        let slot = self.users.read().await.get(user_id).cloned();
        match slot {
            Some(slot) => slot.lock().await.clone(),
            None => WarningState::new(user_id),
        }
    }

    /// Warning count after the inactivity reset is taken into account.
    pub async fn effective_count(&self, user_id: &str) -> u32 {
        self.get(user_id)
            .await
            .effective_count(Utc::now(), self.reset_window)
    }

    /// Number of users currently holding at least one warning.
    pub async fn users_with_warnings(&self) -> usize {
        let slots: Vec<Slot> = self.users.read().await.values().cloned().collect();
        let now = Utc::now();
        let mut count = 0;
        for slot in slots {
            if slot.lock().await.effective_count(now, self.reset_window) > 0 {
                count += 1;
            }
        }
        count
    }

    /// Apply an already computed decision. The count change is derived from
    /// the decision's action against the state current at lock time, so
    /// concurrent decisions for one user are each counted.
    pub async fn apply_atomic(&self, user_id: &str, decision: ModerationDecision) -> AppliedDecision {
        self.apply_atomic_at(user_id, decision, Utc::now()).await
    }

    pub async fn apply_atomic_at(
        &self,
        user_id: &str,
        decision: ModerationDecision,
        now: DateTime<Utc>,
    ) -> AppliedDecision {
        self.evaluate_and_apply_at(user_id, now, move |_| decision)
            .await
    }

    /// Evaluate and apply as one unit: `evaluate` sees the user's state (with
    /// any inactivity reset already applied) under the user's lock.
    pub async fn evaluate_and_apply<F>(&self, user_id: &str, evaluate: F) -> AppliedDecision
    where
        F: FnOnce(&WarningState) -> ModerationDecision,
    {
        self.evaluate_and_apply_at(user_id, Utc::now(), evaluate)
            .await
    }

    pub async fn evaluate_and_apply_at<F>(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        evaluate: F,
    ) -> AppliedDecision
    where
        F: FnOnce(&WarningState) -> ModerationDecision,
    {
        let slot = self.slot(user_id).await;
        let (decision, state, changed) = {
            let mut state = slot.lock().await;
            let before = state.clone();

            if state.is_expired(now, self.reset_window) {
                log::debug!(
                    "Warnings for {user_id} expired (last violation {:?}), resetting",
                    state.last_violation_at
                );
                state.warning_count = 0;
            }

            let mut decision = evaluate(&state);
            state.warning_count = decision.action.apply_to_count(state.warning_count);
            if decision.action.is_blocking() {
                state.last_violation_at = Some(now);
            }
            if let Some(seconds) = decision.timeout_seconds {
                state.muted_until = mute_deadline(now, seconds);
            }
            decision.warning_count_after = state.warning_count;
            let changed = *state != before;
            (decision, state.clone(), changed)
        };

        let persist_error = if changed {
            self.persist(user_id, &state).await.err()
        } else {
            None
        };

        AppliedDecision {
            decision,
            state,
            persist_error,
        }
    }

    /// Administrative reset to the zero-state. The in-memory reset always
    /// happens; the error only reports a failed durable write.
    pub async fn clear(&self, user_id: &str) -> Result<(), PersistenceError> {
        self.update(user_id, |state| {
            *state = WarningState::new(user_id);
        })
        .await
        .map(|_| ())
    }

    pub async fn set_mute(
        &self,
        user_id: &str,
        until: DateTime<Utc>,
    ) -> Result<WarningState, PersistenceError> {
        self.update(user_id, |state| state.muted_until = Some(until))
            .await
    }

    pub async fn clear_mute(&self, user_id: &str) -> Result<WarningState, PersistenceError> {
        self.update(user_id, |state| state.muted_until = None).await
    }

    async fn update<F>(&self, user_id: &str, mutate: F) -> Result<WarningState, PersistenceError>
    where
        F: FnOnce(&mut WarningState),
    {
        let slot = self.slot(user_id).await;
        let state = {
            let mut state = slot.lock().await;
            mutate(&mut state);
            state.clone()
        };
        self.persist(user_id, &state).await?;
        Ok(state)
    }

    /// Wait for the persistence backend to make every accepted write durable.
    pub async fn flush(&self) -> Result<(), PersistenceError> {
        match &self.persistence {
            Some(persistence) => persistence.flush().await,
            None => Ok(()),
        }
    }

    async fn slot(&self, user_id: &str) -> Slot {
        if let Some(slot) = self.users.read().await.get(user_id) {
            return slot.clone();
        }
        self.users
            .write()
            .await
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(WarningState::new(user_id))))
            .clone()
    }

    async fn persist(&self, user_id: &str, state: &WarningState) -> Result<(), PersistenceError> {
        let Some(persistence) = &self.persistence else {
            return Ok(());
        };
        persistence.persist(user_id, state).await.map_err(|e| {
            log::error!("Failed to persist warning state for {user_id}: {e}");
            e
        })
    }
}

/// `now + seconds`, or `None` when the deadline is not representable.
fn mute_deadline(now: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let deadline = i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|timeout| now.checked_add_signed(timeout));
    if deadline.is_none() {
        log::warn!("Timeout of {seconds}s is out of range, not muting");
    }
    deadline
}
