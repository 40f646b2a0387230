use std::path::{Path, PathBuf};

use url::Url;

use crate::registry::TransferOutcome;

/// A finished transfer, as reported to the delegate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFinished {
    /// The remote URL that was requested
    pub url: Url,
    pub outcome: TransferOutcome,
}

impl TransferFinished {
    /// Local path of the installed file, if the transfer succeeded.
    pub fn installed_path(&self) -> Option<&Path> {
        self.outcome.installed_path()
    }
}

/// Observes a proxy. The proxy holds its delegate weakly and calls it from a
/// dispatch task of its own, in the order the events happened. A slow
/// callback delays later callbacks but not installs.
pub trait FileProxyDelegate: Send + Sync {
    /// A transfer reached a terminal state. On success the file is already
    /// installed and resolvable as local.
    fn transfer_finished(&self, event: &TransferFinished);

    /// The eviction pass following an install finished, having deleted
    /// `deleted`.
    fn eviction_finished(&self, deleted: &[PathBuf]) {
        let _ = deleted;
    }
}
