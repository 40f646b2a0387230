use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FileProxyError, Result};
use crate::locator::validate_identifier;

const DEFAULT_IDENTIFIER: &str = "default";
const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024; // 256MB

/// Configuration of one proxy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileProxyConfig {
    /// Namespaces the storage area of this proxy below `root_dir`
    pub identifier: String,

    /// Directory holding the storage areas of all proxies
    pub root_dir: PathBuf,

    /// Maximum size of the storage area in bytes. Installed files are evicted,
    /// oldest first, when this is exceeded.
    pub max_bytes: u64,
}

impl Default for FileProxyConfig {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_IDENTIFIER.to_owned(),
            root_dir: std::env::temp_dir().join("fileproxy"),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl FileProxyConfig {
    pub fn new(
        identifier: impl Into<String>,
        root_dir: impl Into<PathBuf>,
        max_bytes: u64,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            root_dir: root_dir.into(),
            max_bytes,
        }
    }

    /// Checks the identifier and byte budget.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.identifier)?;
        if self.max_bytes == 0 {
            return Err(FileProxyError::ConfigError(
                "max_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The storage area of this proxy.
    pub fn storage_dir(&self) -> PathBuf {
        self.root_dir.join(&self.identifier)
    }
}

/// Advisory hints for a background transfer, passed to the transfer engine
/// unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub expected_bytes_to_send: Option<u64>,
    pub expected_bytes_to_receive: Option<u64>,
    /// The transfer should not start before this time
    pub earliest_begin: Option<DateTime<Utc>>,
}

impl TransferConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expected_bytes_to_send(mut self, bytes: u64) -> Self {
        self.expected_bytes_to_send = Some(bytes);
        self
    }

    pub fn with_expected_bytes_to_receive(mut self, bytes: u64) -> Self {
        self.expected_bytes_to_receive = Some(bytes);
        self
    }

    pub fn with_earliest_begin(mut self, at: DateTime<Utc>) -> Self {
        self.earliest_begin = Some(at);
        self
    }

    /// How long to wait from `now` before the transfer may begin.
    pub fn delay_until_begin(&self, now: DateTime<Utc>) -> Option<Duration> {
        let begin = self.earliest_begin?;
        (begin - now).to_std().ok().filter(|d| !d.is_zero())
    }
}
