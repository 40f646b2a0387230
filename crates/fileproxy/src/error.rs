use std::io;
use std::path::PathBuf;

/// Errors returned synchronously by proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum FileProxyError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid proxy identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No local file available for {0}")]
    TargetRequired(String),

    #[error("Maximum of {0} bytes exceeded")]
    MaxBytesExceeded(u64),

    #[error("File system error at {}: {source}", path.display())]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Proxy {0} has been invalidated")]
    Invalidated(String),
}

impl FileProxyError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: io::Error) -> Self {
        FileProxyError::FileSystem {
            path: path.into(),
            source,
        }
    }

    /// Whether this is a file system error caused by a missing path.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            FileProxyError::FileSystem { source, .. } if source.kind() == io::ErrorKind::NotFound
        )
    }
}

/// Reasons a background transfer did not produce an installed file.
///
/// Delivered asynchronously through transfer handles and the delegate, never
/// returned from `url_for`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Server returned status code {0}")]
    Http(u16),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Payload of {size} bytes exceeds the maximum of {max_bytes} bytes")]
    MaxBytesExceeded { size: u64, max_bytes: u64 },
}

pub type Result<T, E = FileProxyError> = std::result::Result<T, E>;
