//! Durable small-state persistence: flock + temp file + fsync + atomic
//! rename, with restrictive modes on unix.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Create `dir` (and parents) with owner-only permissions.
#[cfg(target_family = "unix")]
pub fn ensure_secure_dir(dir: &Path) -> io::Result<()> {
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
}

#[cfg(not(target_family = "unix"))]
pub fn ensure_secure_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Persist bytes with durable semantics (flock + fsync + atomic rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "state file has no parent directory")
    })?;
    ensure_secure_dir(dir)?;

    let lock = File::create(lock_path(path))?;
    lock.lock_exclusive()?;

    let tmp = temp_path(path);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);
    let mut file = options.open(&tmp)?;

    io::Write::write_all(&mut file, bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp, path)?;

    let dir_handle = File::open(dir)?;
    dir_handle.sync_all()?;

    drop(lock);
    Ok(())
}

/// Serialise a value as pretty JSON and persist it atomically.
pub fn store_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("Failed to serialise {}: {}", path.display(), err),
        )
    })?;
    write_atomic(path, &bytes)
}

/// Load a JSON state file; `Ok(None)` when the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)?;
    let value = serde_json::from_reader(file).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse {}: {}", path.display(), err),
        )
    })?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        id: String,
        count: u32,
    }

    #[test]
    fn test_store_and_load_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        let value = Sample {
            id: "abc".into(),
            count: 7,
        };
        store_json(&path, &value).expect("store");

        let loaded: Option<Sample> = load_json(&path).expect("load");
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded: Option<Sample> = load_json(&dir.path().join("missing.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn test_written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        write_atomic(&path, b"{}").expect("write");

        let mode = std::fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_overwrite_replaces_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        store_json(&path, &Sample { id: "a".into(), count: 1 }).expect("store");
        store_json(&path, &Sample { id: "b".into(), count: 2 }).expect("store");

        let loaded: Option<Sample> = load_json(&path).expect("load");
        assert_eq!(loaded.map(|s| s.id), Some("b".to_string()));
    }
}
