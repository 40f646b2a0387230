//! # Transfer Registry
//!
//! Tracks the in-flight transfers of one proxy, keyed by URL. Requests for a
//! URL that already has a transfer join it instead of starting another one,
//! and every joined caller observes the same terminal outcome.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use url::Url;

use crate::config::TransferConfig;
use crate::error::{FileProxyError, Result, TransferError};
use crate::pin::{PinGuard, PinSet};
use crate::transfer::{CompletionSink, TaskId, TransferEngine, TransferEvent, TransferRequest};

/// Lifecycle of a transfer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Registered, waiting for its earliest begin date
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Succeeded | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }
}

/// Terminal outcome of a transfer, shared by all callers that joined it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The payload was installed at this path
    Installed(PathBuf),
    Failed(TransferError),
    Cancelled,
}

impl TransferOutcome {
    pub fn status(&self) -> TransferStatus {
        match self {
            TransferOutcome::Installed(_) => TransferStatus::Succeeded,
            TransferOutcome::Failed(_) => TransferStatus::Failed,
            TransferOutcome::Cancelled => TransferStatus::Cancelled,
        }
    }

    pub fn installed_path(&self) -> Option<&Path> {
        match self {
            TransferOutcome::Installed(path) => Some(path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum TaskState {
    Pending,
    Running,
    Finished(TransferOutcome),
}

impl TaskState {
    fn is_finished(&self) -> bool {
        matches!(self, TaskState::Finished(_))
    }
}

/// One transfer known to the registry.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: TaskId,
    pub url: Url,
    /// Final location of the installed file
    pub target: PathBuf,
    /// Where the engine writes the payload
    pub partial: PathBuf,
    pub config: TransferConfig,
}

/// A caller's view of a transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    task: Arc<TransferTask>,
    state: watch::Receiver<TaskState>,
}

impl TransferHandle {
    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    pub fn url(&self) -> &Url {
        &self.task.url
    }

    pub fn target(&self) -> &Path {
        &self.task.target
    }

    pub fn status(&self) -> TransferStatus {
        match &*self.state.borrow() {
            TaskState::Pending => TransferStatus::Pending,
            TaskState::Running => TransferStatus::Running,
            TaskState::Finished(outcome) => outcome.status(),
        }
    }

    /// The outcome, if the transfer has finished.
    pub fn outcome(&self) -> Option<TransferOutcome> {
        match &*self.state.borrow() {
            TaskState::Finished(outcome) => Some(outcome.clone()),
            _ => None,
        }
    }

    /// Waits for the transfer to finish. A transfer abandoned by its proxy
    /// counts as cancelled.
    pub async fn wait(&self) -> TransferOutcome {
        let mut state = self.state.clone();
        let result = state.wait_for(TaskState::is_finished).await;
        match result.as_deref() {
            Ok(TaskState::Finished(outcome)) => outcome.clone(),
            _ => TransferOutcome::Cancelled,
        }
    }
}

/// Result of [`TransferRegistry::start_or_join`].
#[derive(Debug)]
pub enum StartOrJoin {
    /// A new transfer was started
    Started(TransferHandle),
    /// An existing transfer for the URL was joined
    Joined(TransferHandle),
    /// The file was installed while the caller was looking it up
    Installed,
}

impl StartOrJoin {
    pub fn handle(self) -> Option<TransferHandle> {
        match self {
            StartOrJoin::Started(handle) | StartOrJoin::Joined(handle) => Some(handle),
            StartOrJoin::Installed => None,
        }
    }
}

struct Entry {
    task: Arc<TransferTask>,
    state: watch::Sender<TaskState>,
    // The partial payload is not evicted while the task is registered
    _partial_pin: PinGuard,
}

impl Entry {
    fn handle(&self) -> TransferHandle {
        TransferHandle {
            task: Arc::clone(&self.task),
            state: self.state.subscribe(),
        }
    }
}

struct RegistryState {
    tasks: HashMap<Url, Entry>,
    accepting: bool,
    next_id: u64,
}

pub struct TransferRegistry {
    identifier: String,
    engine: Arc<dyn TransferEngine>,
    events: mpsc::UnboundedSender<TransferEvent>,
    pins: PinSet,
    state: Mutex<RegistryState>,
}

impl TransferRegistry {
    pub(crate) fn new(
        identifier: impl Into<String>,
        engine: Arc<dyn TransferEngine>,
        events: mpsc::UnboundedSender<TransferEvent>,
        pins: PinSet,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            engine,
            events,
            pins,
            state: Mutex::new(RegistryState {
                tasks: HashMap::new(),
                accepting: true,
                next_id: 1,
            }),
        }
    }

    /// Joins the transfer for `url` or starts a new one.
    ///
    /// Before starting, `target` is checked again under the registry lock: a
    /// transfer that completed after the caller's lookup has installed it by
    /// then.
    pub fn start_or_join(
        &self,
        url: &Url,
        target: PathBuf,
        destination_hint: PathBuf,
        config: TransferConfig,
    ) -> Result<StartOrJoin> {
        let mut state = self.state.lock();

        if let Some(entry) = state.tasks.get(url) {
            debug!(url = %url, task = %entry.task.id, "Joining transfer");
            return Ok(StartOrJoin::Joined(entry.handle()));
        }

        if !state.accepting {
            return Err(FileProxyError::Invalidated(self.identifier.clone()));
        }

        if target.is_file() {
            return Ok(StartOrJoin::Installed);
        }

        let id = TaskId(state.next_id);
        state.next_id += 1;

        let deferred = config.delay_until_begin(Utc::now()).is_some();
        let task = Arc::new(TransferTask {
            id,
            url: url.clone(),
            target,
            partial: destination_hint.clone(),
            config: config.clone(),
        });
        let initial = if deferred {
            TaskState::Pending
        } else {
            TaskState::Running
        };
        let (state_tx, _) = watch::channel(initial);
        let entry = Entry {
            task: Arc::clone(&task),
            state: state_tx,
            _partial_pin: self.pins.pin(&destination_hint),
        };
        let handle = entry.handle();
        state.tasks.insert(url.clone(), entry);

        let request = TransferRequest {
            task_id: id,
            url: url.clone(),
            destination_hint,
            config,
        };
        let sink = CompletionSink::new(id, url.clone(), self.events.clone());
        self.engine.begin(request, sink);

        info!(url = %url, task = %id, deferred, "Started transfer");
        Ok(StartOrJoin::Started(handle))
    }

    /// The transfer currently registered for `url`.
    pub fn handle(&self, url: &Url) -> Option<TransferHandle> {
        self.state.lock().tasks.get(url).map(Entry::handle)
    }

    /// The task an engine event refers to, if it is still registered.
    pub(crate) fn task(&self, task_id: TaskId, url: &Url) -> Option<Arc<TransferTask>> {
        let state = self.state.lock();
        match state.tasks.get(url) {
            Some(entry) if entry.task.id == task_id => Some(Arc::clone(&entry.task)),
            _ => None,
        }
    }

    /// Moves a pending task to running. Returns false for unknown ids and
    /// tasks already running or finished.
    pub fn mark_running(&self, task_id: TaskId, url: &Url) -> bool {
        let state = self.state.lock();
        match state.tasks.get(url) {
            Some(entry) if entry.task.id == task_id => entry.state.send_if_modified(|current| {
                if matches!(current, TaskState::Pending) {
                    *current = TaskState::Running;
                    true
                } else {
                    false
                }
            }),
            _ => false,
        }
    }

    /// Records the terminal outcome of a task, notifies every joined caller and
    /// removes the task.
    ///
    /// Returns true when the registry no longer accepts transfers and this was
    /// the last one.
    pub fn on_completion(&self, task_id: TaskId, url: &Url, outcome: TransferOutcome) -> bool {
        let mut state = self.state.lock();
        let entry = match state.tasks.get(url) {
            Some(entry) if entry.task.id == task_id => state.tasks.remove(url),
            _ => None,
        };
        let Some(entry) = entry else {
            debug!(url = %url, task = %task_id, "Ignoring completion of unknown transfer");
            return false;
        };

        debug!(url = %url, task = %task_id, status = ?outcome.status(), "Transfer finished");
        entry.state.send_replace(TaskState::Finished(outcome));

        !state.accepting && state.tasks.is_empty()
    }

    /// Stops accepting transfers. Unless `finishing`, every registered
    /// transfer is cancelled.
    ///
    /// Returns true when no transfers remain.
    pub fn cancel_all(&self, finishing: bool) -> bool {
        let mut state = self.state.lock();
        state.accepting = false;

        if !finishing {
            for entry in state.tasks.values() {
                debug!(url = %entry.task.url, task = %entry.task.id, "Cancelling transfer");
                self.engine.cancel(entry.task.id);
            }
        }
        self.engine.invalidate(finishing);

        info!(
            proxy = %self.identifier,
            finishing,
            remaining = state.tasks.len(),
            "Stopped accepting transfers"
        );
        state.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_accepting(&self) -> bool {
        self.state.lock().accepting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubEngine;
    use crate::transfer::TransferUpdate;

    fn registry() -> (
        TransferRegistry,
        Arc<StubEngine>,
        mpsc::UnboundedReceiver<TransferEvent>,
    ) {
        let engine = Arc::new(StubEngine::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = TransferRegistry::new("test", engine.clone(), tx, PinSet::new());
        (registry, engine, rx)
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn start(registry: &TransferRegistry, u: &Url) -> StartOrJoin {
        registry
            .start_or_join(
                u,
                PathBuf::from("/nonexistent/target"),
                PathBuf::from("/nonexistent/partial"),
                TransferConfig::default(),
            )
            .unwrap()
    }

    #[test]
    fn test_duplicate_requests_are_joined() {
        let (registry, engine, _rx) = registry();
        let u = url("https://x/a");

        let first = start(&registry, &u);
        let second = start(&registry, &u);
        assert!(matches!(first, StartOrJoin::Started(_)));
        assert!(matches!(second, StartOrJoin::Joined(_)));
        assert_eq!(engine.begin_count(), 1);
        assert_eq!(registry.len(), 1);

        let (a, b) = (first.handle().unwrap(), second.handle().unwrap());
        assert_eq!(a.task_id(), b.task_id());
        assert_eq!(a.status(), TransferStatus::Running);
    }

    #[test]
    fn test_deferred_transfer_is_pending() {
        let (registry, _engine, _rx) = registry();
        let u = url("https://x/later");
        let config =
            TransferConfig::new().with_earliest_begin(Utc::now() + chrono::Duration::hours(1));
        let handle = registry
            .start_or_join(&u, PathBuf::from("/nope"), PathBuf::from("/nope.part"), config)
            .unwrap()
            .handle()
            .unwrap();
        assert_eq!(handle.status(), TransferStatus::Pending);

        assert!(registry.mark_running(handle.task_id(), &u));
        assert_eq!(handle.status(), TransferStatus::Running);
        assert!(!registry.mark_running(handle.task_id(), &u));
        assert!(!registry.mark_running(TaskId(999), &u));
    }

    #[test]
    fn test_partial_is_pinned_while_registered() {
        let engine = Arc::new(StubEngine::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let pins = PinSet::new();
        let registry = TransferRegistry::new("test", engine, tx, pins.clone());
        let u = url("https://x/a");
        let partial = PathBuf::from("/nonexistent/a.part");

        let handle = registry
            .start_or_join(
                &u,
                PathBuf::from("/nonexistent/a"),
                partial.clone(),
                TransferConfig::default(),
            )
            .unwrap()
            .handle()
            .unwrap();
        assert!(pins.is_pinned(&partial));

        registry.on_completion(handle.task_id(), &u, TransferOutcome::Cancelled);
        assert!(!pins.is_pinned(&partial));
    }

    #[tokio::test]
    async fn test_completion_notifies_all_joined_callers() {
        let (registry, _engine, _rx) = registry();
        let u = url("https://x/a");
        let a = start(&registry, &u).handle().unwrap();
        let b = start(&registry, &u).handle().unwrap();

        let outcome = TransferOutcome::Failed(TransferError::Http(503));
        assert!(!registry.on_completion(a.task_id(), &u, outcome.clone()));

        assert_eq!(a.wait().await, outcome);
        assert_eq!(b.wait().await, outcome);
        assert_eq!(b.status(), TransferStatus::Failed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_completion_is_ignored() {
        let (registry, _engine, _rx) = registry();
        let u = url("https://x/a");
        let handle = start(&registry, &u).handle().unwrap();

        registry.on_completion(TaskId(999), &u, TransferOutcome::Cancelled);
        assert_eq!(registry.len(), 1);
        assert!(handle.outcome().is_none());

        registry.on_completion(handle.task_id(), &u, TransferOutcome::Cancelled);
        registry.on_completion(
            handle.task_id(),
            &u,
            TransferOutcome::Failed(TransferError::Http(500)),
        );
        assert_eq!(handle.outcome(), Some(TransferOutcome::Cancelled));
    }

    #[test]
    fn test_retry_after_failure_starts_new_task() {
        let (registry, engine, _rx) = registry();
        let u = url("https://x/a");
        let first = start(&registry, &u).handle().unwrap();
        registry.on_completion(first.task_id(), &u, TransferOutcome::Cancelled);

        let second = start(&registry, &u);
        assert!(matches!(second, StartOrJoin::Started(_)));
        assert_ne!(second.handle().unwrap().task_id(), first.task_id());
        assert_eq!(engine.begin_count(), 2);
    }

    #[test]
    fn test_installed_target_is_not_transferred() {
        let (registry, engine, _rx) = registry();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a");
        std::fs::write(&target, b"done").unwrap();

        let result = registry
            .start_or_join(
                &url("https://x/a"),
                target,
                dir.path().join("a.part"),
                TransferConfig::default(),
            )
            .unwrap();
        assert!(matches!(result, StartOrJoin::Installed));
        assert_eq!(engine.begin_count(), 0);
    }

    #[test]
    fn test_cancel_all_cancels_and_rejects() {
        let (registry, engine, mut rx) = registry();
        let u = url("https://x/a");
        let handle = start(&registry, &u).handle().unwrap();

        assert!(!registry.cancel_all(false));
        assert!(!registry.is_accepting());
        assert_eq!(engine.invalidated(), Some(false));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.task_id, handle.task_id());
        assert_eq!(
            event.update,
            TransferUpdate::Finished(crate::transfer::EngineOutcome::Cancelled)
        );

        // Joining an existing transfer is still possible, new ones are refused
        assert!(matches!(start(&registry, &u), StartOrJoin::Joined(_)));
        let err = registry
            .start_or_join(
                &url("https://x/b"),
                PathBuf::from("/nope"),
                PathBuf::from("/nope.part"),
                TransferConfig::default(),
            )
            .unwrap_err();
        assert!(matches!(err, FileProxyError::Invalidated(_)));

        assert!(registry.on_completion(handle.task_id(), &u, TransferOutcome::Cancelled));
    }

    #[test]
    fn test_cancel_all_finishing_lets_transfers_run() {
        let (registry, engine, mut rx) = registry();
        start(&registry, &url("https://x/a"));

        assert!(!registry.cancel_all(true));
        assert_eq!(engine.invalidated(), Some(true));
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.pending_count(), 1);
    }

    #[test]
    fn test_cancel_all_when_idle_is_drained() {
        let (registry, _engine, _rx) = registry();
        assert!(registry.cancel_all(true));
    }
}
