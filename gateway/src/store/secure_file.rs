//! Owner-only, crash-safe JSON files.
//!
//! Everything the gateway persists (issued token hashes, the upstream grant and
//! session token) goes through [`write_json`]: serialize, write to a sibling temp
//! file created with mode `0600`, fsync, then rename over the target. A reader
//! therefore sees either the old file or the new one, never a torn write.
//!
//! Read-modify-write cycles that may race with another process (the CLI editing
//! the token file under a running server) take [`lock_exclusive`] first.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::AppError;

const OWNER_ONLY: u32 = 0o600;

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), AppError> {
    let content = serde_json::to_vec_pretty(value)?;
    write_private(path, &content).map_err(|e| {
        AppError::Storage(format!("failed to write {}: {}", path.display(), e))
    })
}

/// Reads and decodes `path`. A missing file is `Ok(None)`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, AppError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(AppError::Storage(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| {
        AppError::Storage(format!("corrupt file {}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

pub fn remove(path: &Path) -> Result<(), AppError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::Storage(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Modification time and length; a change in either means the file was
/// rewritten. `None` when the file does not exist.
pub type FileStamp = (SystemTime, u64);

pub fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

/// Advisory lock on a sibling `.<name>.lock` file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Blocks until no other handle, in this process or another, holds the lock
/// for `path`. Run it off the async workers.
pub fn lock_exclusive(path: &Path) -> Result<FileLock, AppError> {
    let lock_path = lock_path(path);
    let locked: io::Result<File> = (|| {
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        opts.mode(OWNER_ONLY);
        let file = opts.open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    })();
    locked.map(|file| FileLock { file }).map_err(|e| {
        AppError::Storage(format!("failed to lock {}: {}", lock_path.display(), e))
    })
}

fn lock_path(path: &Path) -> PathBuf {
    path.with_file_name(format!(
        ".{}.lock",
        path.file_name().unwrap_or_default().to_string_lossy()
    ))
}

fn write_private(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory"))?;
    fs::create_dir_all(parent)?;

    let temp_path = path.with_file_name(format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    let result: io::Result<()> = (|| {
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(OWNER_ONLY);

        let mut file = opts.open(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, path)?;

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(OWNER_ONLY))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    #[cfg(unix)]
    {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let missing: Option<serde_json::Value> = read_json(&path).unwrap();
        assert!(missing.is_none());

        write_json(&path, &json!({"a": 1})).unwrap();
        let loaded: Option<serde_json::Value> = read_json(&path).unwrap();
        assert_eq!(loaded.unwrap()["a"], 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.json");
        fs::write(&path, b"{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_json(&path, &json!({"k": "v"})).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        write_json(&path, &json!([])).unwrap();
        write_json(&path, &json!([1])).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, b"{not json").unwrap();
        let err = read_json::<serde_json::Value>(&path).unwrap_err();
        assert_eq!(err.kind(), "storage_error");
    }

    #[test]
    fn test_lock_is_exclusive_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let held = lock_exclusive(&path).unwrap();
        let other = OpenOptions::new().write(true).open(lock_path(&path)).unwrap();
        assert!(other.try_lock_exclusive().is_err());

        drop(held);
        assert!(other.try_lock_exclusive().is_ok());
        FileExt::unlock(&other).unwrap();
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.json");
        remove(&path).unwrap();
        write_json(&path, &json!({})).unwrap();
        remove(&path).unwrap();
        assert!(stamp(&path).is_none());
    }
}
