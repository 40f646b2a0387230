//! Test doubles shared by the unit tests of this crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::delegate::{FileProxyDelegate, TransferFinished};
use crate::transfer::{CompletionSink, EngineOutcome, TaskId, TransferEngine, TransferRequest};

#[inline]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// An engine that never touches the network. Transfers stay pending until a
/// test completes them.
#[derive(Default)]
pub struct StubEngine {
    begun: AtomicUsize,
    pending: Mutex<HashMap<Url, (TransferRequest, CompletionSink)>>,
    invalidated: Mutex<Option<bool>>,
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_count(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn invalidated(&self) -> Option<bool> {
        *self.invalidated.lock()
    }

    pub fn request(&self, url: &str) -> Option<TransferRequest> {
        let url = Url::parse(url).ok()?;
        self.pending.lock().get(&url).map(|(request, _)| request.clone())
    }

    fn take(&self, url: &str) -> Option<(TransferRequest, CompletionSink)> {
        let url = Url::parse(url).ok()?;
        self.pending.lock().remove(&url)
    }

    /// Reports that the transfer has started moving bytes.
    pub fn start(&self, url: &str) -> bool {
        let Ok(url) = Url::parse(url) else {
            return false;
        };
        match self.pending.lock().get(&url) {
            Some((_, sink)) => {
                sink.started();
                true
            }
            None => false,
        }
    }

    /// Writes part of a payload to the destination hint, leaving the
    /// transfer running.
    pub fn write_partial(&self, url: &str, bytes: &[u8]) -> Option<PathBuf> {
        let destination = self.request(url)?.destination_hint;
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&destination, bytes).unwrap();
        Some(destination)
    }

    /// Writes `payload` to the destination hint and reports success.
    pub fn succeed(&self, url: &str, payload: &[u8]) -> bool {
        let Some((request, sink)) = self.take(url) else {
            return false;
        };
        let destination = request.destination_hint;
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&destination, payload).unwrap();
        sink.complete(EngineOutcome::Success(destination));
        true
    }

    /// Reports `outcome` without writing anything.
    pub fn finish(&self, url: &str, outcome: EngineOutcome) -> bool {
        match self.take(url) {
            Some((_, sink)) => {
                sink.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Drops the sink without completing it.
    pub fn abandon(&self, url: &str) -> bool {
        self.take(url).is_some()
    }
}

impl TransferEngine for StubEngine {
    fn begin(&self, request: TransferRequest, sink: CompletionSink) {
        self.begun.fetch_add(1, Ordering::SeqCst);
        self.pending
            .lock()
            .insert(request.url.clone(), (request, sink));
    }

    fn cancel(&self, task_id: TaskId) {
        let mut pending = self.pending.lock();
        let url = pending
            .iter()
            .find(|(_, (request, _))| request.task_id == task_id)
            .map(|(url, _)| url.clone());
        if let Some((_, sink)) = url.and_then(|url| pending.remove(&url)) {
            sink.complete(EngineOutcome::Cancelled);
        }
    }

    fn invalidate(&self, finishing: bool) {
        *self.invalidated.lock() = Some(finishing);
    }
}

#[derive(Debug)]
pub enum Notification {
    Finished(TransferFinished),
    Evicted(Vec<PathBuf>),
}

/// Forwards every delegate callback into a channel.
pub struct RecordingDelegate {
    tx: mpsc::UnboundedSender<Notification>,
}

impl RecordingDelegate {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FileProxyDelegate for RecordingDelegate {
    fn transfer_finished(&self, event: &TransferFinished) {
        let _ = self.tx.send(Notification::Finished(event.clone()));
    }

    fn eviction_finished(&self, deleted: &[PathBuf]) {
        let _ = self.tx.send(Notification::Evicted(deleted.to_vec()));
    }
}
