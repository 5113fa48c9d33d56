//! Device notification platform seam.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lifeline_core::db::unix_timestamp;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{FiredTrigger, PendingTrigger, PermissionStatus, TriggerContent, TriggerError, TriggerId};

/// Local notification scheduling as offered by the host OS.
#[async_trait]
pub trait NotificationPlatform: Send + Sync {
    async fn permission(&self) -> PermissionStatus;

    /// Ask the user for permission. Returns the resulting status.
    async fn request_permission(&self) -> PermissionStatus;

    /// Schedule a notification at `at` (unix seconds).
    async fn schedule_at(&self, at: i64, content: TriggerContent) -> Result<TriggerId, TriggerError>;

    /// Cancel one notification. Unknown ids are ignored.
    async fn cancel(&self, id: &TriggerId) -> Result<(), TriggerError>;

    async fn cancel_all(&self) -> Result<(), TriggerError>;

    async fn list_pending(&self) -> Result<Vec<PendingTrigger>, TriggerError>;
}

#[derive(Debug)]
struct MemoryState {
    pending: BTreeMap<TriggerId, PendingTrigger>,
    permission: PermissionStatus,
    /// What `request_permission` answers with.
    answer: PermissionStatus,
    permission_requests: usize,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<(), TriggerError> {
        if self.unavailable {
            Err(TriggerError::Platform("notification service unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

/// Platform that only records what it was asked to do.
#[derive(Clone)]
pub struct MemoryPlatform {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryPlatform {
    /// A platform that grants permission when asked.
    pub fn new() -> Self {
        Self::with_permission(PermissionStatus::NotDetermined, PermissionStatus::Granted)
    }

    pub fn with_permission(current: PermissionStatus, answer: PermissionStatus) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                pending: BTreeMap::new(),
                permission: current,
                answer,
                permission_requests: 0,
                unavailable: false,
            })),
        }
    }

    pub fn permission_requests(&self) -> usize {
        self.lock().permission_requests
    }

    /// While unavailable, scheduling and cancelling fail with
    /// [`TriggerError::Platform`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Remove and return every trigger due at or before `now`, as if the OS
    /// had delivered them.
    pub fn fire_due(&self, now: i64) -> Vec<FiredTrigger> {
        let mut state = self.lock();
        let due: Vec<TriggerId> = state
            .pending
            .values()
            .filter(|p| p.at <= now)
            .map(|p| p.id.clone())
            .collect();
        due.into_iter()
            .filter_map(|id| state.pending.remove(&id))
            .map(|p| FiredTrigger {
                id: p.id,
                content: p.content,
                fired_at: now,
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationPlatform for MemoryPlatform {
    async fn permission(&self) -> PermissionStatus {
        self.lock().permission
    }

    async fn request_permission(&self) -> PermissionStatus {
        let mut state = self.lock();
        state.permission_requests += 1;
        state.permission = state.answer;
        state.permission
    }

    async fn schedule_at(&self, at: i64, content: TriggerContent) -> Result<TriggerId, TriggerError> {
        let mut state = self.lock();
        state.check_available()?;
        if state.permission != PermissionStatus::Granted {
            return Err(TriggerError::PermissionDenied);
        }
        let id = TriggerId::generate();
        state.pending.insert(
            id.clone(),
            PendingTrigger {
                id: id.clone(),
                at,
                content,
            },
        );
        Ok(id)
    }

    async fn cancel(&self, id: &TriggerId) -> Result<(), TriggerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.pending.remove(id);
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), TriggerError> {
        let mut state = self.lock();
        state.check_available()?;
        state.pending.clear();
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingTrigger>, TriggerError> {
        Ok(self.lock().pending.values().cloned().collect())
    }
}

type TaskMap = HashMap<TriggerId, (PendingTrigger, JoinHandle<()>)>;

/// Platform backed by tokio timers: one sleeping task per trigger, fired
/// triggers arrive on an mpsc channel.
///
/// Must be created inside a tokio runtime.
pub struct TokioPlatform {
    tasks: Arc<Mutex<TaskMap>>,
    fired_tx: mpsc::UnboundedSender<FiredTrigger>,
}

impl TokioPlatform {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FiredTrigger>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        (
            Self {
                tasks: Arc::new(Mutex::new(HashMap::new())),
                fired_tx,
            },
            fired_rx,
        )
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, TaskMap> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl NotificationPlatform for TokioPlatform {
    async fn permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn request_permission(&self) -> PermissionStatus {
        PermissionStatus::Granted
    }

    async fn schedule_at(&self, at: i64, content: TriggerContent) -> Result<TriggerId, TriggerError> {
        let id = TriggerId::generate();
        let delay = u64::try_from(at.saturating_sub(unix_timestamp())).unwrap_or(0);
        let pending = PendingTrigger {
            id: id.clone(),
            at,
            content: content.clone(),
        };

        let tasks = Arc::clone(&self.tasks);
        let fired_tx = self.fired_tx.clone();
        let task_id = id.clone();
        // Hold the map lock until the handle is inserted so a zero-delay
        // task cannot remove its entry before it exists.
        let mut map = self.tasks();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);
            debug!(trigger_id = %task_id, check_in_id = %content.check_in_id, "Trigger fired");
            let fired = FiredTrigger {
                id: task_id,
                content,
                fired_at: unix_timestamp(),
            };
            if fired_tx.send(fired).is_err() {
                warn!("Trigger receiver dropped, fired trigger lost");
            }
        });
        map.insert(id.clone(), (pending, handle));
        Ok(id)
    }

    async fn cancel(&self, id: &TriggerId) -> Result<(), TriggerError> {
        if let Some((_, handle)) = self.tasks().remove(id) {
            handle.abort();
        }
        Ok(())
    }

    async fn cancel_all(&self) -> Result<(), TriggerError> {
        for (_, (_, handle)) in self.tasks().drain() {
            handle.abort();
        }
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<PendingTrigger>, TriggerError> {
        let mut pending: Vec<_> = self.tasks().values().map(|(p, _)| p.clone()).collect();
        pending.sort_by_key(|p| p.at);
        Ok(pending)
    }
}

impl Drop for TokioPlatform {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.tasks().drain() {
            handle.abort();
        }
    }
}
