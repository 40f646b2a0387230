//! # File Locator
//!
//! Maps a remote URL to the path of its local copy. The mapping is a pure
//! function of the proxy's storage root, its identifier and the URL, so the
//! same URL resolves to the same file across restarts.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{FileProxyError, Result};

/// Name of the directory, inside a storage area, holding partial payloads.
pub const STAGING_DIR: &str = ".transfers";

const PARTIAL_EXTENSION: &str = "part";
const MAX_EXTENSION_LEN: usize = 8;

/// Computes local paths for one proxy's storage area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocator {
    directory: PathBuf,
}

impl FileLocator {
    pub fn new(root_dir: impl AsRef<Path>, identifier: &str) -> Result<Self> {
        validate_identifier(identifier)?;
        Ok(Self {
            directory: root_dir.as_ref().join(identifier),
        })
    }

    /// The storage area all installed files live in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The directory partial payloads are written to. It is a child of the
    /// storage area so installing is a rename within one file system.
    pub fn staging_directory(&self) -> PathBuf {
        self.directory.join(STAGING_DIR)
    }

    /// Path of the installed copy of `url`.
    pub fn locate(&self, url: &Url) -> Result<PathBuf> {
        Ok(self.directory.join(file_name(url)?))
    }

    /// Path the transfer engine should stream the payload of `url` into.
    pub fn partial_path(&self, url: &Url) -> Result<PathBuf> {
        let mut name = file_name(url)?;
        name.push('.');
        name.push_str(PARTIAL_EXTENSION);
        Ok(self.staging_directory().join(name))
    }
}

/// Path of the installed copy of `url` for the proxy named `identifier`.
pub fn locate(root_dir: impl AsRef<Path>, identifier: &str, url: &Url) -> Result<PathBuf> {
    FileLocator::new(root_dir, identifier)?.locate(url)
}

/// Stable file name for `url`: the SHA-256 of the URL without its fragment,
/// keeping a short extension from the last path segment when there is one.
pub fn file_name(url: &Url) -> Result<String> {
    if url.cannot_be_a_base() {
        return Err(FileProxyError::InvalidUrl(url.to_string()));
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => {}
        _ => return Err(FileProxyError::InvalidUrl(url.to_string())),
    }
    let last_segment = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).next_back())
        .ok_or_else(|| FileProxyError::InvalidUrl(url.to_string()))?;

    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_str());
    let hash = hasher.finalize();

    let mut name = format!("{hash:x}");
    if let Some(extension) = extension_of(last_segment) {
        name.push('.');
        name.push_str(&extension);
    }
    Ok(name)
}

fn extension_of(segment: &str) -> Option<String> {
    let (stem, extension) = segment.rsplit_once('.')?;
    if stem.is_empty()
        || extension.is_empty()
        || extension.len() > MAX_EXTENSION_LEN
        || !extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(extension.to_ascii_lowercase())
}

/// Identifiers must name exactly one visible directory below the root.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let invalid = identifier.is_empty()
        || identifier.starts_with('.')
        || identifier
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control());
    if invalid {
        return Err(FileProxyError::InvalidIdentifier(identifier.to_string()));
    }
    Ok(())
}
