//! Atomic JSON file I/O (§4.B).
//!
//! Every document is an opaque `serde_json::Value` — this module never
//! inspects or validates the shape of what it reads or writes. Writes go to
//! a temp sibling (named with the current pid and a random suffix) and are
//! then renamed over the target, so readers never observe a partial write.

use crate::error::StateError;
use anyhow::{Context, Result};
use rand::Rng;
use serde_json::Value;
use std::path::Path;

/// Strict JSON parse. Returns `Ok(None)` if the file does not exist;
/// returns `StateError::Corrupt` if it exists but fails to parse.
pub fn load_json(path: &Path) -> Result<Option<Value>, StateError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            source: anyhow::Error::new(e),
        })
}

/// Strict JSON parse, falling back to JSON5 on failure (for human-edited
/// config files). Still raises `Corrupt` — with the original strict-parse
/// cause attached — if neither parser accepts the content.
pub fn load_json_lenient(path: &Path) -> Result<Option<Value>, StateError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok(None);
    }

    match serde_json::from_str(&content) {
        Ok(v) => Ok(Some(v)),
        Err(strict_err) => json5::from_str(&content).map(Some).map_err(|_| StateError::Corrupt {
            path: path.display().to_string(),
            source: anyhow::Error::new(strict_err),
        }),
    }
}

/// Write `document` to `path` atomically: write to a temp sibling, then
/// rename over the target. The parent directory is created (mode `0o700`
/// on unix) if it doesn't exist.
pub fn save_json(path: &Path, document: &Value) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        crate::data_dir::ensure_dir_0700(parent)
            .map_err(|e| StateError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    }

    let tmp_path = temp_sibling(path);
    let json = serde_json::to_string_pretty(document)
        .context("failed to serialize document")
        .map_err(|e| StateError::Corrupt {
            path: path.display().to_string(),
            source: e,
        })?;

    std::fs::write(&tmp_path, &json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// `save_json` followed by a best-effort copy to `<path>.bak`. Backup copy
/// failures are silent — the primary write already succeeded.
pub fn save_json_with_backup(path: &Path, document: &Value) -> Result<(), StateError> {
    save_json(path, document)?;
    let bak = bak_path(path);
    let _ = std::fs::copy(path, &bak);
    Ok(())
}

/// Delete `path`. A missing file is not an error.
pub fn delete(path: &Path) -> Result<(), StateError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn temp_sibling(path: &Path) -> std::path::PathBuf {
    let pid = std::process::id();
    let rand_suffix: u64 = rand::rng().random();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{file_name}.{pid}.{rand_suffix:x}.tmp"))
}

fn bak_path(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{file_name}.bak"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_load_missing_file_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nonexistent.json");
        assert_eq!(load_json(&path).unwrap(), None);
    }

    #[test]
    fn test_load_empty_file_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.json");
        std::fs::write(&path, "").unwrap();
        assert_eq!(load_json(&path).unwrap(), None);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        let doc = json!({"name": "A", "count": 3});

        save_json(&path, &doc).unwrap();
        let loaded = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, doc);

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("dir").join("doc.json");
        save_json(&path, &json!({})).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_load_corrupt_raises_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "{bad json").unwrap();
        let err = load_json(&path).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn test_load_lenient_falls_back_to_json5() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cfg.json");
        // Trailing comma and unquoted key: invalid strict JSON, valid JSON5.
        std::fs::write(&path, "{ name: 'a', count: 3, }").unwrap();
        let loaded = load_json_lenient(&path).unwrap().unwrap();
        assert_eq!(loaded["name"], "a");
        assert_eq!(loaded["count"], 3);
    }

    #[test]
    fn test_load_lenient_still_raises_on_total_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("garbage.json");
        std::fs::write(&path, "not json at all {{{").unwrap();
        let err = load_json_lenient(&path).unwrap_err();
        assert!(matches!(err, StateError::Corrupt { .. }));
    }

    #[test]
    fn test_save_with_backup_creates_bak_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        save_json_with_backup(&path, &json!({"v": 1})).unwrap();

        let bak = tmp.path().join("doc.json.bak");
        assert!(bak.exists());
        // `.bak` is a copy of the write that was just made, not the prior one.
        let bak_contents: Value =
            serde_json::from_str(&std::fs::read_to_string(&bak).unwrap()).unwrap();
        assert_eq!(bak_contents["v"], 1);

        save_json_with_backup(&path, &json!({"v": 2})).unwrap();
        let bak_contents: Value =
            serde_json::from_str(&std::fs::read_to_string(&bak).unwrap()).unwrap();
        assert_eq!(bak_contents["v"], 2);
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nope.json");
        assert!(delete(&path).is_ok());
    }

    #[test]
    fn test_delete_then_load_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("doc.json");
        save_json(&path, &json!({"a": 1})).unwrap();
        delete(&path).unwrap();
        assert_eq!(load_json(&path).unwrap(), None);
    }
}
