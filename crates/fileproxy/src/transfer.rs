//! # Transfer Engine Interface
//!
//! The proxy does not move bytes itself. A [`TransferEngine`] performs the
//! downloads in the background and reports each one exactly once through the
//! [`CompletionSink`] it was handed when the transfer began.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use crate::config::TransferConfig;

/// Identifies one transfer for the lifetime of a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Everything an engine needs to start a transfer.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub task_id: TaskId,
    pub url: Url,
    /// Where the payload should be written. A file already at this path is a
    /// partial payload from an earlier attempt and may be resumed.
    pub destination_hint: PathBuf,
    pub config: TransferConfig,
}

/// How a transfer ended, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOutcome {
    /// The complete payload is at the given path
    Success(PathBuf),
    /// The server answered with a non-success status
    HttpFailure(u16),
    TransportFailure(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransferUpdate {
    /// The engine began moving bytes
    Started,
    Finished(EngineOutcome),
}

#[derive(Debug)]
pub(crate) struct TransferEvent {
    pub task_id: TaskId,
    pub url: Url,
    pub update: TransferUpdate,
}

/// Reports the end of one transfer back to its proxy.
///
/// Completing consumes the sink, so a transfer can be reported only once. A
/// sink dropped without completing reports a transport failure.
#[derive(Debug)]
pub struct CompletionSink {
    task_id: TaskId,
    url: Url,
    tx: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl CompletionSink {
    pub(crate) fn new(
        task_id: TaskId,
        url: Url,
        tx: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        Self {
            task_id,
            url,
            tx: Some(tx),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Reports that the transfer is now running. A transfer deferred until
    /// its earliest begin date stays pending until this is called.
    pub fn started(&self) {
        if let Some(tx) = &self.tx {
            self.send(tx, TransferUpdate::Started);
        }
    }

    pub fn complete(mut self, outcome: EngineOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: EngineOutcome) {
        if let Some(tx) = self.tx.take() {
            self.send(&tx, TransferUpdate::Finished(outcome));
        }
    }

    fn send(&self, tx: &mpsc::UnboundedSender<TransferEvent>, update: TransferUpdate) {
        let event = TransferEvent {
            task_id: self.task_id,
            url: self.url.clone(),
            update,
        };
        if tx.send(event).is_err() {
            debug!(task = %self.task_id, url = %self.url, "Proxy gone, dropping transfer event");
        }
    }
}

impl Drop for CompletionSink {
    fn drop(&mut self) {
        if self.tx.is_some() {
            warn!(
                task = %self.task_id,
                url = %self.url,
                "Transfer ended without reporting completion"
            );
            self.finish(EngineOutcome::TransportFailure(
                "transfer ended without reporting completion".to_string(),
            ));
        }
    }
}

/// Performs background transfers on behalf of a proxy.
///
/// `begin` and `cancel` are called while the proxy holds its registry lock:
/// they must return promptly and must not call back into the proxy.
pub trait TransferEngine: Send + Sync + 'static {
    /// Starts a transfer. The engine owns `sink` and completes it once the
    /// transfer ends, whether it succeeded, failed or was cancelled.
    fn begin(&self, request: TransferRequest, sink: CompletionSink);

    /// Cancels a running transfer. Its sink should be completed with
    /// [`EngineOutcome::Cancelled`]. Unknown ids are ignored.
    fn cancel(&self, task_id: TaskId);

    /// The proxy is shutting down. When `finishing` is false, the engine
    /// should stop all transfers.
    fn invalidate(&self, finishing: bool) {
        let _ = finishing;
    }
}
