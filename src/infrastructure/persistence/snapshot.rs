//! Small JSON snapshots persisted write-then-rename, plus an append-only
//! JSONL writer for time-series records.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Atomically replace `path` with `bytes` (write temp file, then rename).
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)
        .with_context(|| format!("Failed to write temp file {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename into {}", path.display()))?;
    Ok(())
}

/// Typed JSON snapshot at a fixed path.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        let json = serde_json::to_vec_pretty(value).context("Failed to serialize snapshot")?;
        write_atomic(&self.path, &json)
    }

    /// Load the snapshot if the file exists; `Ok(None)` when it does not.
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes).with_context(|| {
                    format!("Failed to parse snapshot {}", self.path.display())
                })?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| {
                format!("Failed to read snapshot {}", self.path.display())
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only JSONL file, one serialized record per line.
pub struct JsonlAppender {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAppender {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn append<T: Serialize>(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record).context("Failed to serialize record")?;
        let _guard = self.lock.lock().expect("appender lock poisoned");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create dir {}", parent.display()))?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: u32,
        label: String,
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("bfxtrader-persist-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let store = SnapshotStore::new(temp_path("snap.json"));
        let value = Probe {
            id: 7,
            label: "seven".into(),
        };
        store.save(&value).unwrap();
        let loaded: Option<Probe> = store.load().unwrap();
        assert_eq!(loaded, Some(value));
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let store = SnapshotStore::new(temp_path("missing.json"));
        let loaded: Option<Probe> = store.load().unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let path = temp_path("clean.json");
        let store = SnapshotStore::new(path.clone());
        store.save(&Probe { id: 1, label: "x".into() }).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_jsonl_appends_lines() {
        let path = temp_path("series.jsonl");
        let _ = fs::remove_file(&path);
        let appender = JsonlAppender::new(path.clone());
        for i in 0..3 {
            appender
                .append(&Probe {
                    id: i,
                    label: format!("row-{}", i),
                })
                .unwrap();
        }
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 3);
        let last: Probe = serde_json::from_str(content.lines().last().unwrap()).unwrap();
        assert_eq!(last.id, 2);
    }
}
