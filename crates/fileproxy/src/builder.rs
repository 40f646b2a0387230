//! # Builder for FileProxy
//!
//! Fluent construction of a [`FileProxy`], optionally with its delegate and
//! background completion handler in place before the first request.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fileproxy_engine::{FileProxy, HttpEngineConfig, HttpTransferEngine};
//!
//! # async fn run() -> fileproxy_engine::Result<()> {
//! let engine = Arc::new(HttpTransferEngine::new(HttpEngineConfig::default())?);
//! let proxy = FileProxy::builder()
//!     .with_identifier("podcasts")
//!     .with_root_dir("/var/cache/fileproxy")
//!     .with_max_bytes(512 * 1024 * 1024)
//!     .build(engine)
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use crate::config::FileProxyConfig;
use crate::delegate::FileProxyDelegate;
use crate::error::Result;
use crate::proxy::{BackgroundCompletionHandler, FileProxy};
use crate::transfer::TransferEngine;

/// Builder for creating FileProxy instances with a fluent API
#[derive(Default)]
pub struct FileProxyBuilder {
    config: FileProxyConfig,
    delegate: Option<Weak<dyn FileProxyDelegate>>,
    background_completion_handler: Option<BackgroundCompletionHandler>,
}

impl FileProxyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: FileProxyConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.config.identifier = identifier.into();
        self
    }

    pub fn with_root_dir(mut self, root_dir: impl Into<PathBuf>) -> Self {
        self.config.root_dir = root_dir.into();
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.config.max_bytes = max_bytes;
        self
    }

    /// The proxy keeps only a weak reference to the delegate
    pub fn with_delegate<D: FileProxyDelegate + 'static>(mut self, delegate: &Arc<D>) -> Self {
        let weak: Weak<D> = Arc::downgrade(delegate);
        self.delegate = Some(weak);
        self
    }

    pub fn with_background_completion_handler(
        mut self,
        handler: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.background_completion_handler = Some(Box::new(handler));
        self
    }

    pub fn config(&self) -> &FileProxyConfig {
        &self.config
    }

    /// Build the proxy on top of `engine`
    pub async fn build(self, engine: Arc<dyn TransferEngine>) -> Result<FileProxy> {
        let proxy = FileProxy::new(self.config, engine).await?;
        if self.delegate.is_some() {
            proxy.set_delegate_weak(self.delegate);
        }
        if let Some(handler) = self.background_completion_handler {
            proxy.set_background_completion_handler(handler);
        }
        Ok(proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Notification, RecordingDelegate, StubEngine};
    use url::Url;

    #[tokio::test]
    async fn test_builder_applies_settings() {
        let dir = tempfile::tempdir().unwrap();
        let (delegate, mut rx) = RecordingDelegate::new();
        let delegate = Arc::new(delegate);
        let engine = Arc::new(StubEngine::new());

        let proxy = FileProxy::builder()
            .with_identifier("built")
            .with_root_dir(dir.path())
            .with_max_bytes(1024)
            .with_delegate(&delegate)
            .build(engine.clone())
            .await
            .unwrap();

        assert_eq!(proxy.identifier(), "built");
        assert_eq!(proxy.max_bytes(), 1024);
        assert!(proxy.storage_dir().ends_with("built"));
        assert!(proxy.storage_dir().is_dir());

        let url = Url::parse("https://x/a").unwrap();
        let transfer = proxy.resolve(&url, None).unwrap().transfer().cloned().unwrap();
        engine.succeed("https://x/a", b"a");
        transfer.wait().await;
        assert!(matches!(rx.recv().await, Some(Notification::Finished(_))));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileProxyBuilder::new()
            .with_identifier("../escape")
            .with_root_dir(dir.path())
            .build(Arc::new(StubEngine::new()))
            .await;
        assert!(result.is_err());

        let result = FileProxyBuilder::new()
            .with_root_dir(dir.path())
            .with_max_bytes(0)
            .build(Arc::new(StubEngine::new()))
            .await;
        assert!(result.is_err());
    }
}
