//! # HTTP Transfer Engine
//!
//! A [`TransferEngine`] backed by reqwest. Each transfer runs as its own
//! tokio task and streams the response body into the destination hint.
//! A partial payload left by an earlier attempt is resumed with a `Range`
//! request when the server supports it. A partial response is only appended
//! when its `Content-Range` starts where the payload on disk ends.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_RANGE, HeaderMap, HeaderValue, RANGE};
use reqwest::{Client, StatusCode};
use rustls::ClientConfig;
use rustls::crypto::aws_lc_rs;
use rustls_platform_verifier::BuilderVerifierExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{FileProxyError, Result};
use crate::transfer::{CompletionSink, EngineOutcome, TaskId, TransferEngine, TransferRequest};

pub const DEFAULT_USER_AGENT: &str = concat!("fileproxy/", env!("CARGO_PKG_VERSION"));

/// Settings of the HTTP client used for transfers.
#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    /// Overall timeout of one request, zero for none
    pub timeout: Duration,
    pub connect_timeout: Duration,
    /// Maximum time between two body chunks, zero for none
    pub read_timeout: Duration,
    pub follow_redirects: bool,
    pub user_agent: String,
    pub headers: HeaderMap,
    /// Resume partial payloads with range requests
    pub resume: bool,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HeaderMap::new(),
            resume: true,
        }
    }
}

impl HttpEngineConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: &'static str, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &HttpEngineConfig) -> Result<Client> {
    let provider = Arc::new(aws_lc_rs::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FileProxyError::ConfigError(format!("TLS protocol versions: {e}")))?
        .with_platform_verifier()
        .map_err(|e| FileProxyError::ConfigError(format!("TLS verifier: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        client_builder = client_builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    if !config.read_timeout.is_zero() {
        client_builder = client_builder.read_timeout(config.read_timeout);
    }

    client_builder
        .build()
        .map_err(|e| FileProxyError::ConfigError(format!("HTTP client: {e}")))
}

/// Why a download did not produce a payload.
#[derive(Debug)]
enum Failure {
    Status(u16),
    Transport(String),
}

impl From<reqwest::Error> for Failure {
    fn from(e: reqwest::Error) -> Self {
        Failure::Transport(e.to_string())
    }
}

impl From<std::io::Error> for Failure {
    fn from(e: std::io::Error) -> Self {
        Failure::Transport(e.to_string())
    }
}

/// Downloads over HTTP(S) on a tokio runtime.
pub struct HttpTransferEngine {
    client: Client,
    runtime: Handle,
    resume: bool,
    tasks: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    shutdown: CancellationToken,
}

impl HttpTransferEngine {
    /// Must be called within a tokio runtime, on which transfers will run.
    pub fn new(config: HttpEngineConfig) -> Result<Self> {
        let client = create_client(&config)?;
        Self::with_client(client, config.resume)
    }

    pub fn with_client(client: Client, resume: bool) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| FileProxyError::ConfigError(format!("no tokio runtime: {e}")))?;
        Ok(Self {
            client,
            runtime,
            resume,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        })
    }

    /// Number of transfers currently running.
    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl TransferEngine for HttpTransferEngine {
    fn begin(&self, request: TransferRequest, sink: CompletionSink) {
        let token = self.shutdown.child_token();
        self.tasks.lock().insert(request.task_id, token.clone());

        let client = self.client.clone();
        let tasks = Arc::clone(&self.tasks);
        let resume = self.resume;

        self.runtime.spawn(async move {
            let task_id = request.task_id;
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(task = %task_id, url = %request.url, "Transfer cancelled");
                    EngineOutcome::Cancelled
                }
                outcome = run_transfer(&client, &request, resume, &sink) => outcome,
            };
            tasks.lock().remove(&task_id);
            sink.complete(outcome);
        });
    }

    fn cancel(&self, task_id: TaskId) {
        if let Some(token) = self.tasks.lock().get(&task_id) {
            token.cancel();
        }
    }

    fn invalidate(&self, finishing: bool) {
        if !finishing {
            self.shutdown.cancel();
        }
    }
}

async fn run_transfer(
    client: &Client,
    request: &TransferRequest,
    resume: bool,
    sink: &CompletionSink,
) -> EngineOutcome {
    if let Some(delay) = request.config.delay_until_begin(Utc::now()) {
        debug!(task = %request.task_id, delay = ?delay, "Deferring transfer");
        tokio::time::sleep(delay).await;
    }
    sink.started();

    info!(task = %request.task_id, url = %request.url, "Downloading");
    match download(client, &request.url, &request.destination_hint, resume).await {
        Ok(bytes) => {
            info!(task = %request.task_id, url = %request.url, bytes, "Download complete");
            EngineOutcome::Success(request.destination_hint.clone())
        }
        Err(Failure::Status(status)) => EngineOutcome::HttpFailure(status),
        Err(Failure::Transport(message)) => {
            warn!(task = %request.task_id, url = %request.url, error = %message, "Download failed");
            EngineOutcome::TransportFailure(message)
        }
    }
}

async fn download(
    client: &Client,
    url: &Url,
    path: &Path,
    resume: bool,
) -> std::result::Result<u64, Failure> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut offset = if resume {
        fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
    } else {
        0
    };

    let response = loop {
        let response = send(client, url, offset).await?;
        if offset == 0 {
            break response;
        }
        match response.status() {
            StatusCode::RANGE_NOT_SATISFIABLE => {
                debug!(url = %url, offset, "Partial payload rejected, starting over");
            }
            StatusCode::PARTIAL_CONTENT
                if content_range_start(response.headers()) != Some(offset) =>
            {
                debug!(url = %url, offset, "Partial response misaligned, starting over");
            }
            _ => break response,
        }
        offset = 0;
    };

    let status = response.status();
    if status.is_redirection() {
        return Err(Failure::Transport(format!("redirect not followed ({status})")));
    }
    if !status.is_success() {
        return Err(Failure::Status(status.as_u16()));
    }

    let append = offset > 0 && status == StatusCode::PARTIAL_CONTENT;
    let mut file = if append {
        debug!(url = %url, offset, "Resuming partial payload");
        fs::OpenOptions::new().append(true).open(path).await?
    } else {
        fs::File::create(path).await?
    };

    let mut written = if append { offset } else { 0 };
    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(written)
}

/// First byte position of a `Content-Range: bytes <first>-<last>/<length>`
/// header.
fn content_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (first, _) = range.split_once('-')?;
    first.trim().parse().ok()
}

async fn send(
    client: &Client,
    url: &Url,
    offset: u64,
) -> std::result::Result<reqwest::Response, Failure> {
    let mut request = client.get(url.clone());
    if offset > 0 {
        request = request.header(RANGE, format!("bytes={offset}-"));
    }
    Ok(request.send().await?)
}
