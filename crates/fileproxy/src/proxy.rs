//! # File Proxy
//!
//! Resolves remote URLs to local copies. A URL whose file is installed
//! resolves to a `file://` URL; any other URL resolves to itself while a
//! background transfer fetches it. Completed payloads are installed by
//! rename, after which the storage area is brought back within its byte
//! budget. Delegate callbacks run on a separate dispatch task, in the order
//! the events happened.

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::fs;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::builder::FileProxyBuilder;
use crate::config::{FileProxyConfig, TransferConfig};
use crate::delegate::{FileProxyDelegate, TransferFinished};
use crate::error::{FileProxyError, Result, TransferError};
use crate::eviction::{self, EvictionReport};
use crate::locator::FileLocator;
use crate::pin::{PinGuard, PinSet};
use crate::registry::{
    StartOrJoin, TransferHandle, TransferOutcome, TransferRegistry, TransferTask,
};
use crate::transfer::{EngineOutcome, TransferEngine, TransferEvent, TransferUpdate};

/// Called once, after invalidation, when no transfers remain.
pub type BackgroundCompletionHandler = Box<dyn FnOnce() + Send + 'static>;

/// Where to read a resource from.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// The installed local copy
    Local(Url),
    /// The original URL, with the transfer fetching it
    Remote { url: Url, transfer: TransferHandle },
}

impl Resolution {
    pub fn url(&self) -> &Url {
        match self {
            Resolution::Local(url) | Resolution::Remote { url, .. } => url,
        }
    }

    pub fn into_url(self) -> Url {
        match self {
            Resolution::Local(url) | Resolution::Remote { url, .. } => url,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Resolution::Local(_))
    }

    pub fn transfer(&self) -> Option<&TransferHandle> {
        match self {
            Resolution::Remote { transfer, .. } => Some(transfer),
            Resolution::Local(_) => None,
        }
    }
}

/// An installed file opened for reading. It is not evicted while this
/// handle is alive.
#[derive(Debug)]
pub struct CachedFile {
    file: fs::File,
    path: PathBuf,
    _pin: PinGuard,
}

impl CachedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }
}

impl Deref for CachedFile {
    type Target = fs::File;

    fn deref(&self) -> &Self::Target {
        &self.file
    }
}

impl DerefMut for CachedFile {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.file
    }
}

/// Work for the dispatch task. The delegate is resolved when the event is
/// queued.
enum Dispatch {
    Finished(Arc<dyn FileProxyDelegate>, TransferFinished),
    Evicted(Arc<dyn FileProxyDelegate>, Vec<PathBuf>),
    Completed(BackgroundCompletionHandler),
}

#[derive(Default)]
struct ProxyState {
    delegate: Option<Weak<dyn FileProxyDelegate>>,
    background_completion_handler: Option<BackgroundCompletionHandler>,
    invalidated: bool,
}

struct Inner {
    config: FileProxyConfig,
    locator: FileLocator,
    registry: TransferRegistry,
    pins: PinSet,
    state: Mutex<ProxyState>,
    dispatch: mpsc::UnboundedSender<Dispatch>,
    shutdown: CancellationToken,
}

/// A transparent, size-bounded file cache in front of a transfer engine.
///
/// Cloning yields another handle to the same proxy.
#[derive(Clone)]
pub struct FileProxy {
    inner: Arc<Inner>,
}

impl FileProxy {
    /// Creates the proxy's storage area and starts its event and dispatch
    /// tasks. Must be called within a tokio runtime.
    pub async fn new(mut config: FileProxyConfig, engine: Arc<dyn TransferEngine>) -> Result<Self> {
        config.validate()?;
        config.root_dir = std::path::absolute(&config.root_dir)
            .map_err(|e| FileProxyError::fs(&config.root_dir, e))?;

        let locator = FileLocator::new(&config.root_dir, &config.identifier)?;
        let staging = locator.staging_directory();
        fs::create_dir_all(&staging)
            .await
            .map_err(|e| FileProxyError::fs(&staging, e))?;

        let pins = PinSet::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry =
            TransferRegistry::new(config.identifier.clone(), engine, events_tx, pins.clone());
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            config,
            locator,
            registry,
            pins,
            state: Mutex::new(ProxyState::default()),
            dispatch: dispatch_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(run_dispatch(dispatch_rx));
        tokio::spawn(run_events(
            Arc::downgrade(&inner),
            events_rx,
            inner.shutdown.clone(),
        ));

        info!(
            proxy = %inner.config.identifier,
            dir = ?inner.locator.directory(),
            max_bytes = inner.config.max_bytes,
            "File proxy ready"
        );

        Ok(Self { inner })
    }

    pub fn builder() -> FileProxyBuilder {
        FileProxyBuilder::new()
    }

    pub fn identifier(&self) -> &str {
        &self.inner.config.identifier
    }

    pub fn max_bytes(&self) -> u64 {
        self.inner.config.max_bytes
    }

    pub fn storage_dir(&self) -> &Path {
        self.inner.locator.directory()
    }

    pub fn locator(&self) -> &FileLocator {
        &self.inner.locator
    }

    /// Sets the delegate. Only a weak reference is kept.
    pub fn set_delegate<D: FileProxyDelegate + 'static>(&self, delegate: &Arc<D>) {
        let weak: Weak<D> = Arc::downgrade(delegate);
        self.set_delegate_weak(Some(weak));
    }

    pub fn clear_delegate(&self) {
        self.set_delegate_weak(None);
    }

    pub(crate) fn set_delegate_weak(&self, delegate: Option<Weak<dyn FileProxyDelegate>>) {
        self.inner.state.lock().delegate = delegate;
    }

    /// Sets the handler called once invalidation has finished.
    pub fn set_background_completion_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.inner.state.lock().background_completion_handler = Some(Box::new(handler));
    }

    pub fn clear_background_completion_handler(&self) {
        self.inner.state.lock().background_completion_handler = None;
    }

    pub fn is_invalidated(&self) -> bool {
        self.inner.state.lock().invalidated
    }

    /// Returns the local URL of `url` if it is installed. Otherwise starts or
    /// joins a background transfer and returns `url` itself.
    pub fn url_for(&self, url: &Url, config: Option<TransferConfig>) -> Result<Url> {
        self.resolve(url, config).map(Resolution::into_url)
    }

    /// Like [`FileProxy::url_for`], also handing out the transfer when the
    /// file is not installed yet.
    ///
    /// `file://` URLs resolve to themselves if the file exists.
    pub fn resolve(&self, url: &Url, config: Option<TransferConfig>) -> Result<Resolution> {
        if self.is_invalidated() {
            return Err(FileProxyError::Invalidated(self.identifier().to_string()));
        }
        if url.scheme() == "file" {
            return resolve_file_url(url);
        }

        let target = self.inner.locator.locate(url)?;
        match std::fs::metadata(&target) {
            Ok(metadata) if metadata.is_file() => {
                debug!(url = %url, path = ?target, "Cache hit");
                return Ok(Resolution::Local(file_url(&target)?));
            }
            Ok(_) => {
                return Err(FileProxyError::fs(
                    &target,
                    io::Error::other("not a regular file"),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(FileProxyError::fs(&target, e)),
        }

        let config = config.unwrap_or_default();
        if let Some(expected) = config.expected_bytes_to_receive {
            if expected > self.max_bytes() {
                return Err(FileProxyError::MaxBytesExceeded(self.max_bytes()));
            }
        }

        let partial = self.inner.locator.partial_path(url)?;
        match self
            .inner
            .registry
            .start_or_join(url, target.clone(), partial, config)?
        {
            StartOrJoin::Started(transfer) | StartOrJoin::Joined(transfer) => {
                Ok(Resolution::Remote {
                    url: url.clone(),
                    transfer,
                })
            }
            StartOrJoin::Installed => Ok(Resolution::Local(file_url(&target)?)),
        }
    }

    /// The transfer in flight for `url`, if any.
    pub fn transfer(&self, url: &Url) -> Option<TransferHandle> {
        self.inner.registry.handle(url)
    }

    /// Opens the installed copy of `url`, which may also be a `file://` URL
    /// returned by this proxy.
    pub async fn open(&self, url: &Url) -> Result<CachedFile> {
        let path = if url.scheme() == "file" {
            url.to_file_path()
                .map_err(|_| FileProxyError::InvalidUrl(url.to_string()))?
        } else {
            self.inner.locator.locate(url)?
        };

        let pin = self.inner.pins.pin(&path);
        match fs::File::open(&path).await {
            Ok(file) => Ok(CachedFile {
                file,
                path,
                _pin: pin,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(FileProxyError::TargetRequired(url.to_string()))
            }
            Err(e) => Err(FileProxyError::fs(&path, e)),
        }
    }

    /// Deletes the installed copy of `url`. A missing file is an error.
    pub async fn remove_item(&self, url: &Url) -> Result<()> {
        let target = self.inner.locator.locate(url)?;
        fs::remove_file(&target)
            .await
            .map_err(|e| FileProxyError::fs(&target, e))?;
        info!(url = %url, path = ?target, "Removed item");
        Ok(())
    }

    /// Runs an eviction pass now, returning the deleted files.
    pub async fn enforce_budget(&self) -> Result<Vec<PathBuf>> {
        Ok(self.inner.evict().await?.deleted)
    }

    /// Bytes currently held by installed files and partial payloads.
    pub async fn storage_size(&self) -> Result<u64> {
        let dir = self.storage_dir().to_path_buf();
        let scan_dir = dir.clone();
        tokio::task::spawn_blocking(move || eviction::storage_size(&scan_dir))
            .await
            .map_err(|e| FileProxyError::fs(&dir, io::Error::other(e)))?
            .map_err(|e| FileProxyError::fs(&dir, e))
    }

    /// Stops accepting transfers. With `finishing`, transfers in flight run
    /// to completion; otherwise they are cancelled. Once none remain, the
    /// background completion handler is called and the delegate released.
    pub fn invalidate(&self, finishing: bool) {
        {
            let mut state = self.inner.state.lock();
            if state.invalidated {
                debug!(proxy = %self.identifier(), "Proxy already invalidated");
                return;
            }
            state.invalidated = true;
        }

        info!(proxy = %self.identifier(), finishing, "Invalidating proxy");
        if self.inner.registry.cancel_all(finishing) {
            self.inner.finish_invalidation();
        }
    }
}

impl Inner {
    async fn handle_event(&self, event: TransferEvent) {
        let engine_outcome = match event.update {
            TransferUpdate::Started => {
                if self.registry.mark_running(event.task_id, &event.url) {
                    debug!(task = %event.task_id, url = %event.url, "Transfer running");
                }
                return;
            }
            TransferUpdate::Finished(outcome) => outcome,
        };

        let Some(task) = self.registry.task(event.task_id, &event.url) else {
            debug!(task = %event.task_id, url = %event.url, "Ignoring stale transfer event");
            return;
        };

        let (outcome, install_pin) = match engine_outcome {
            EngineOutcome::Success(payload) => self.install(&task, &payload).await,
            EngineOutcome::HttpFailure(status) => {
                // Whatever was written is not part of the resource
                discard(&task.partial).await;
                (TransferOutcome::Failed(TransferError::Http(status)), None)
            }
            EngineOutcome::TransportFailure(message) => {
                (TransferOutcome::Failed(TransferError::Transport(message)), None)
            }
            EngineOutcome::Cancelled => (TransferOutcome::Cancelled, None),
        };

        match &outcome {
            TransferOutcome::Installed(path) => {
                info!(url = %task.url, path = ?path, "Installed file")
            }
            TransferOutcome::Failed(e) => warn!(url = %task.url, error = %e, "Transfer failed"),
            TransferOutcome::Cancelled => info!(url = %task.url, "Transfer cancelled"),
        }

        let drained = self
            .registry
            .on_completion(task.id, &task.url, outcome.clone());

        if let Some(delegate) = self.delegate() {
            let event = TransferFinished {
                url: task.url.clone(),
                outcome,
            };
            self.dispatch(Dispatch::Finished(delegate, event));
        }

        // The new file stays pinned until this pass is over
        if let Some(pin) = install_pin {
            match self.evict().await {
                Ok(report) => {
                    if let Some(delegate) = self.delegate() {
                        self.dispatch(Dispatch::Evicted(delegate, report.deleted));
                    }
                }
                Err(e) => warn!(error = %e, "Eviction failed"),
            }
            drop(pin);
        }

        if drained {
            self.finish_invalidation();
        }
    }

    /// Moves a completed payload into place. On success, returns the pin
    /// protecting the new file from eviction.
    async fn install(
        &self,
        task: &TransferTask,
        payload: &Path,
    ) -> (TransferOutcome, Option<PinGuard>) {
        let max_bytes = self.config.max_bytes;
        let pin = self.pins.pin(&task.target);

        let size = match fs::metadata(payload).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                return (
                    TransferOutcome::Failed(TransferError::FileSystem(format!(
                        "cannot stat payload {}: {e}",
                        payload.display()
                    ))),
                    None,
                );
            }
        };

        if size > max_bytes {
            discard(payload).await;
            return (
                TransferOutcome::Failed(TransferError::MaxBytesExceeded { size, max_bytes }),
                None,
            );
        }

        let (staged, _staged_pin) = match self.stage(task, payload).await {
            Ok(staged) => staged,
            Err(e) => {
                discard(payload).await;
                return (TransferOutcome::Failed(TransferError::FileSystem(e.to_string())), None);
            }
        };

        if let Err(e) = fs::rename(&staged, &task.target).await {
            warn!(from = ?staged, to = ?task.target, error = %e, "Failed to install payload");
            discard(&staged).await;
            return (TransferOutcome::Failed(TransferError::FileSystem(e.to_string())), None);
        }

        debug!(path = ?task.target, size, "Payload renamed into place");
        (TransferOutcome::Installed(task.target.clone()), Some(pin))
    }

    /// Payloads outside the staging directory may be on another file system;
    /// they are copied in first so installing stays a rename. The staged file
    /// is pinned until the returned guard is dropped.
    async fn stage(
        &self,
        task: &TransferTask,
        payload: &Path,
    ) -> io::Result<(PathBuf, PinGuard)> {
        let staging = self.locator.staging_directory();
        if payload.starts_with(&staging) {
            return Ok((payload.to_path_buf(), self.pins.pin(payload)));
        }

        let mut name = task
            .target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".install");
        let staged = staging.join(name);
        let pin = self.pins.pin(&staged);

        fs::create_dir_all(&staging).await?;
        if let Err(e) = fs::copy(payload, &staged).await {
            discard(&staged).await;
            return Err(e);
        }
        discard(payload).await;
        Ok((staged, pin))
    }

    async fn evict(&self) -> Result<EvictionReport> {
        let dir = self.locator.directory().to_path_buf();
        let scan_dir = dir.clone();
        let pins = self.pins.clone();
        let max_bytes = self.config.max_bytes;

        tokio::task::spawn_blocking(move || eviction::enforce(&scan_dir, max_bytes, &pins))
            .await
            .map_err(|e| FileProxyError::fs(&dir, io::Error::other(e)))?
            .map_err(|e| FileProxyError::fs(&dir, e))
    }

    fn delegate(&self) -> Option<Arc<dyn FileProxyDelegate>> {
        self.state.lock().delegate.as_ref().and_then(Weak::upgrade)
    }

    fn dispatch(&self, dispatch: Dispatch) {
        if let Err(mpsc::error::SendError(dispatch)) = self.dispatch.send(dispatch) {
            debug!(proxy = %self.config.identifier, "Dispatch task gone");
            // The handler is owed exactly one call
            if let Dispatch::Completed(handler) = dispatch {
                handler();
            }
        }
    }

    fn finish_invalidation(&self) {
        let handler = {
            let mut state = self.state.lock();
            state.delegate = None;
            state.background_completion_handler.take()
        };
        self.shutdown.cancel();

        info!(proxy = %self.config.identifier, "Proxy invalidated");
        if let Some(handler) = handler {
            self.dispatch(Dispatch::Completed(handler));
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_events(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<TransferEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle_event(event).await;
    }
    debug!("Proxy event task exited");
}

async fn run_dispatch(mut queue: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(dispatch) = queue.recv().await {
        match dispatch {
            Dispatch::Finished(delegate, event) => delegate.transfer_finished(&event),
            Dispatch::Evicted(delegate, deleted) => delegate.eviction_finished(&deleted),
            Dispatch::Completed(handler) => handler(),
        }
    }
    debug!("Proxy dispatch task exited");
}

fn resolve_file_url(url: &Url) -> Result<Resolution> {
    let path = url
        .to_file_path()
        .map_err(|_| FileProxyError::InvalidUrl(url.to_string()))?;
    match std::fs::metadata(&path) {
        Ok(metadata) if metadata.is_file() => Ok(Resolution::Local(url.clone())),
        Ok(_) => Err(FileProxyError::TargetRequired(url.to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Err(FileProxyError::TargetRequired(url.to_string()))
        }
        Err(e) => Err(FileProxyError::fs(path, e)),
    }
}

fn file_url(path: &Path) -> Result<Url> {
    Url::from_file_path(path).map_err(|_| FileProxyError::InvalidUrl(path.display().to_string()))
}

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?path, error = %e, "Failed to remove payload");
        }
    }
}
