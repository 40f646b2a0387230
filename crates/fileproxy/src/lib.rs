//! # FileProxy
//!
//! A transparent file cache for remote resources. Callers ask the proxy for
//! a URL and get back either the `file://` URL of a local copy or, while the
//! copy is being fetched in the background, the original URL so they can
//! stream it directly.
//!
//! ## Features
//!
//! - Deterministic, collision-free file naming per proxy identifier
//! - Deduplicated background transfers with shared outcomes
//! - Atomic installs and oldest-first eviction under a byte budget
//! - Resumable HTTP engine with cancellation
//! - Graceful or immediate invalidation

pub mod builder;
pub mod config;
pub mod delegate;
pub mod error;
pub mod eviction;
pub mod http;
pub mod locator;
pub mod pin;
pub mod proxy;
pub mod registry;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use builder::FileProxyBuilder;
pub use config::{FileProxyConfig, TransferConfig};
pub use delegate::{FileProxyDelegate, TransferFinished};
pub use error::{FileProxyError, Result, TransferError};
pub use eviction::EvictionReport;
pub use http::{HttpEngineConfig, HttpTransferEngine, create_client};
pub use locator::FileLocator;
pub use proxy::{BackgroundCompletionHandler, CachedFile, FileProxy, Resolution};
pub use registry::{TransferHandle, TransferOutcome, TransferStatus};
pub use transfer::{CompletionSink, EngineOutcome, TaskId, TransferEngine, TransferRequest};
