//! # Eviction
//!
//! Keeps a storage area within its byte budget. Partial payloads left in the
//! staging directory by failed or cancelled transfers go first, then installed
//! files, oldest modification time first. Pinned files are skipped and left
//! for a later pass.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::locator::STAGING_DIR;
use crate::pin::PinSet;

/// An installed file as seen by an eviction pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

/// What an eviction pass did.
#[derive(Debug, Default)]
pub struct EvictionReport {
    /// Deleted files, in deletion order
    pub deleted: Vec<PathBuf>,
    /// Files kept because they were pinned while over budget
    pub skipped: Vec<PathBuf>,
    /// Files that could not be deleted
    pub failed: Vec<(PathBuf, io::Error)>,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl EvictionReport {
    pub fn is_within(&self, max_bytes: u64) -> bool {
        self.bytes_after <= max_bytes
    }
}

/// Lists the installed files of `directory`: regular, non-hidden, top-level
/// files. Partial payloads live in the hidden staging subdirectory.
pub fn scan(directory: &Path) -> io::Result<Vec<StoredFile>> {
    scan_files(directory)
}

/// Lists the partial payloads in the staging directory of `directory`.
pub fn scan_staged(directory: &Path) -> io::Result<Vec<StoredFile>> {
    scan_files(&directory.join(STAGING_DIR))
}

fn scan_files(directory: &Path) -> io::Result<Vec<StoredFile>> {
    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            // Removed since listing
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        if !metadata.is_file() {
            continue;
        }
        files.push(StoredFile {
            path: entry.path(),
            size: metadata.len(),
            modified: metadata.modified()?,
        });
    }
    Ok(files)
}

/// Total size of the installed files and partial payloads of `directory`.
pub fn storage_size(directory: &Path) -> io::Result<u64> {
    let installed: u64 = scan(directory)?.iter().map(|f| f.size).sum();
    let staged: u64 = scan_staged(directory)?.iter().map(|f| f.size).sum();
    Ok(installed + staged)
}

/// Deletes files from `directory` until its installed files and partial
/// payloads total at most `max_bytes`. Partial payloads are deleted before
/// installed files; within each group the oldest goes first, ties in
/// modification time broken by path.
pub fn enforce(directory: &Path, max_bytes: u64, pins: &PinSet) -> io::Result<EvictionReport> {
    let mut staged = scan_staged(directory)?;
    let mut installed = scan(directory)?;
    let total: u64 = staged.iter().chain(&installed).map(|f| f.size).sum();

    let mut report = EvictionReport {
        bytes_before: total,
        bytes_after: total,
        ..Default::default()
    };

    if total <= max_bytes {
        debug!(dir = ?directory, total, max_bytes, "Storage within budget");
        return Ok(report);
    }

    sort_oldest_first(&mut staged);
    sort_oldest_first(&mut installed);

    for file in staged.into_iter().chain(installed) {
        if report.bytes_after <= max_bytes {
            break;
        }
        match pins.remove_unless_pinned(&file.path) {
            Ok(true) => {
                debug!(path = ?file.path, size = file.size, "Evicted file");
                report.bytes_after -= file.size;
                report.deleted.push(file.path);
            }
            Ok(false) => {
                debug!(path = ?file.path, "Skipping pinned file");
                report.skipped.push(file.path);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.bytes_after -= file.size;
            }
            Err(e) => {
                warn!(path = ?file.path, error = %e, "Failed to evict file");
                report.failed.push((file.path, e));
            }
        }
    }

    info!(
        dir = ?directory,
        deleted = report.deleted.len(),
        bytes_before = report.bytes_before,
        bytes_after = report.bytes_after,
        max_bytes,
        "Eviction pass finished"
    );

    Ok(report)
}

fn sort_oldest_first(files: &mut [StoredFile]) {
    files.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn write_file(dir: &Path, name: &str, size: usize, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, vec![0u8; size]).unwrap();
        let modified = SystemTime::now() - Duration::from_secs(age_secs);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
        path
    }

    #[test]
    fn test_within_budget_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a", 10, 30);
        write_file(dir.path(), "b", 20, 20);

        let report = enforce(dir.path(), 30, &PinSet::new()).unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.bytes_after, 30);
        assert_eq!(storage_size(dir.path()).unwrap(), 30);
    }

    #[test]
    fn test_oldest_files_deleted_first() {
        let dir = tempfile::tempdir().unwrap();
        let t1 = write_file(dir.path(), "c-oldest", 10, 300);
        let t2 = write_file(dir.path(), "b-middle", 20, 200);
        let t3 = write_file(dir.path(), "a-newest", 30, 100);

        let report = enforce(dir.path(), 35, &PinSet::new()).unwrap();
        assert_eq!(report.deleted, vec![t1.clone(), t2.clone()]);
        assert_eq!(report.bytes_before, 60);
        assert_eq!(report.bytes_after, 30);
        assert!(report.is_within(35));
        assert!(!t1.exists());
        assert!(!t2.exists());
        assert!(t3.exists());
    }

    #[test]
    fn test_stops_once_within_budget() {
        let dir = tempfile::tempdir().unwrap();
        let t1 = write_file(dir.path(), "one", 10, 300);
        let t2 = write_file(dir.path(), "two", 20, 200);
        write_file(dir.path(), "three", 30, 100);

        let report = enforce(dir.path(), 50, &PinSet::new()).unwrap();
        assert_eq!(report.deleted, vec![t1]);
        assert!(t2.exists());
        assert_eq!(report.bytes_after, 50);
    }

    #[test]
    fn test_ties_broken_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a", 10, 100);
        let b = dir.path().join("b");
        fs::write(&b, vec![0u8; 10]).unwrap();
        let modified = fs::metadata(&a).unwrap().modified().unwrap();
        fs::File::options()
            .write(true)
            .open(&b)
            .unwrap()
            .set_modified(modified)
            .unwrap();

        let report = enforce(dir.path(), 10, &PinSet::new()).unwrap();
        assert_eq!(report.deleted, vec![a]);
        assert!(b.exists());
    }

    #[test]
    fn test_pinned_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_file(dir.path(), "old", 50, 300);
        let new = write_file(dir.path(), "new", 50, 100);

        let pins = PinSet::new();
        let guard = pins.pin(&old);

        let report = enforce(dir.path(), 60, &pins).unwrap();
        assert_eq!(report.skipped, vec![old.clone()]);
        assert_eq!(report.deleted, vec![new.clone()]);
        assert!(old.exists());

        // Once released, the old file is a candidate again
        drop(guard);
        write_file(dir.path(), "newer", 50, 10);
        let report = enforce(dir.path(), 60, &pins).unwrap();
        assert_eq!(report.deleted, vec![old]);
    }

    #[test]
    fn test_all_pinned_leaves_storage_over_budget() {
        let dir = tempfile::tempdir().unwrap();
        let only = write_file(dir.path(), "only", 80, 10);
        let pins = PinSet::new();
        let _guard = pins.pin(&only);

        let report = enforce(dir.path(), 50, &pins).unwrap();
        assert!(report.deleted.is_empty());
        assert!(!report.is_within(50));
        assert!(only.exists());
    }

    #[test]
    fn test_hidden_entries_and_directories_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir").join("inner"), vec![0u8; 500]).unwrap();
        fs::write(dir.path().join(".lock"), vec![0u8; 500]).unwrap();
        write_file(dir.path(), "a", 10, 10);

        assert_eq!(scan(dir.path()).unwrap().len(), 1);
        assert_eq!(storage_size(dir.path()).unwrap(), 10);
        let report = enforce(dir.path(), 20, &PinSet::new()).unwrap();
        assert!(report.deleted.is_empty());
        assert!(dir.path().join(".lock").exists());
    }

    #[test]
    fn test_staged_partials_count_and_go_first() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(STAGING_DIR);
        fs::create_dir(&staging).unwrap();
        let installed = write_file(dir.path(), "installed", 40, 500);
        let stale = write_file(&staging, "stale.part", 40, 10);

        assert!(scan(dir.path()).unwrap().iter().all(|f| f.path != stale));
        assert_eq!(storage_size(dir.path()).unwrap(), 80);

        let report = enforce(dir.path(), 50, &PinSet::new()).unwrap();
        assert_eq!(report.deleted, vec![stale.clone()]);
        assert!(!stale.exists());
        assert!(installed.exists());
        assert_eq!(report.bytes_after, 40);
    }

    #[test]
    fn test_partials_of_running_transfers_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(STAGING_DIR);
        fs::create_dir(&staging).unwrap();
        let running = write_file(&staging, "running.part", 40, 10);
        let installed = write_file(dir.path(), "installed", 40, 500);

        let pins = PinSet::new();
        let _guard = pins.pin(&running);

        let report = enforce(dir.path(), 50, &pins).unwrap();
        assert_eq!(report.skipped, vec![running.clone()]);
        assert_eq!(report.deleted, vec![installed]);
        assert!(running.exists());
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(storage_size(&missing).unwrap(), 0);
        assert!(enforce(&missing, 1, &PinSet::new()).unwrap().deleted.is_empty());
    }
}
