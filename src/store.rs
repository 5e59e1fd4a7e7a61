//! Atomic JSON state files.
//!
//! Write protocol:
//! 1) write a temp file in the target's directory
//! 2) fsync the temp file
//! 3) rename temp -> target
//! 4) fsync the directory
//!
//! A reader therefore always sees either the previous committed value or the
//! new one. Two racing writers resolve as "last rename wins".
//!
//! Read policy: a missing file means "not started yet" (`Ok(None)`); a file
//! that exists but does not decode is an [`Error::MalformedState`]. State is
//! never silently reset.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

/// A uniquely named temp file next to `target`, removed on drop unless persisted.
fn temp_file_for(target: &Path, dir: &Path) -> Result<NamedTempFile> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    tempfile::Builder::new()
        .prefix(&format!(".{name}.tmp."))
        .tempfile_in(dir)
        .map_err(|e| Error::io("create_temp", dir, e))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Flush a directory entry table so a completed rename survives power loss.
///
/// No-op on platforms where directories cannot be opened for sync.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let handle = File::open(dir).map_err(|e| Error::io("open_dir", dir, e))?;
        handle
            .sync_all()
            .map_err(|e| Error::io("fsync_dir", dir, e))?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Atomically replace `path` with `bytes`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| Error::io("create_dir", dir, e))?;

    // On any early return the temp file is dropped, which deletes it.
    let mut tmp = temp_file_for(path, dir)?;
    tmp.write_all(bytes)
        .map_err(|e| Error::io("write_temp", tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("fsync_temp", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| Error::io("rename", path, e.error))?;
    sync_dir(dir)?;
    debug!(path = %path.display(), bytes = bytes.len(), "state committed");
    Ok(())
}

/// Serialize `value` as pretty JSON and commit it atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    write_atomic(path, &json)
}

/// Load a JSON state file. Missing ⇒ `Ok(None)`; undecodable ⇒ error.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io("read", path, e)),
    };
    serde_json::from_slice(&raw)
        .map(Some)
        .map_err(|e| Error::MalformedState {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Load a JSON state file, using `T::default()` when it does not exist yet.
pub fn load_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    Ok(load_json(path)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        n: u64,
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let got: Option<Counter> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(got.is_none());
        let d: Counter = load_or_default(&dir.path().join("nope.json")).unwrap();
        assert_eq!(d, Counter::default());
    }

    #[test]
    fn malformed_file_fails_loudly() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("bad.json");
        fs::write(&p, b"{\"n\": ").unwrap();
        let err = load_json::<Counter>(&p).unwrap_err();
        assert!(matches!(err, Error::MalformedState { .. }), "{err}");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("nested/state.json");
        save_json(&p, &Counter { n: 7 }).unwrap();
        assert_eq!(load_json::<Counter>(&p).unwrap(), Some(Counter { n: 7 }));
        save_json(&p, &Counter { n: 8 }).unwrap();
        assert_eq!(load_json::<Counter>(&p).unwrap(), Some(Counter { n: 8 }));
    }

    #[test]
    fn failed_commit_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory in the way makes the final rename fail.
        let p = dir.path().join("state.json");
        fs::create_dir(&p).unwrap();
        fs::write(p.join("keep"), b"x").unwrap();
        assert!(save_json(&p, &Counter { n: 1 }).is_err());
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("state.json");
        for n in 0..5 {
            save_json(&p, &Counter { n }).unwrap();
        }
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
    }
}
