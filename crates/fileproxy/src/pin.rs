//! Reference counts for files that must not be evicted: files being installed
//! and files held open by readers.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, Default)]
pub struct PinSet {
    pins: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl PinSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins `path` until the returned guard is dropped.
    pub fn pin(&self, path: impl Into<PathBuf>) -> PinGuard {
        let path = path.into();
        *self.pins.lock().entry(path.clone()).or_insert(0) += 1;
        PinGuard {
            pins: self.clone(),
            path,
        }
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.pins.lock().contains_key(path)
    }

    /// Deletes `path` unless it is pinned. The check and the delete happen
    /// under the pin lock, so a file pinned before this call is never removed.
    ///
    /// Returns `Ok(false)` when the file was pinned and left in place.
    pub(crate) fn remove_unless_pinned(&self, path: &Path) -> io::Result<bool> {
        let pins = self.pins.lock();
        if pins.contains_key(path) {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    fn release(&self, path: &Path) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(path) {
            *count -= 1;
            if *count == 0 {
                pins.remove(path);
            }
        }
    }
}

/// Keeps a path pinned while alive.
#[derive(Debug)]
pub struct PinGuard {
    pins: PinSet,
    path: PathBuf,
}

impl PinGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.pins.release(&self.path);
    }
}
