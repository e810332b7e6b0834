//! Process-wide monotonic nonce issuance for the authenticated API path.
//!
//! Bitfinex rejects any private request whose nonce is not strictly greater
//! than the last one it saw for the key, so issued values must survive
//! restarts. Every bump is persisted write-then-rename inside the critical
//! section before the value is handed out.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Offset applied when the exchange reports "nonce too small".
const NONCE_BUMP_OFFSET: i64 = 1000;

pub struct NonceService {
    path: PathBuf,
    last: Mutex<i64>,
}

impl NonceService {
    /// Open (or create) the nonce file for one API key. The file name is
    /// derived from the key so distinct keys never share a sequence.
    pub fn open(dir: &Path, api_key: &str) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create nonce dir {}", dir.display()))?;

        let digest = Sha256::digest(api_key.as_bytes());
        let path = dir.join(format!("nonce-{}.txt", hex::encode(&digest[..8])));

        let persisted = match fs::read_to_string(&path) {
            Ok(raw) => raw.trim().parse::<i64>().unwrap_or(0),
            Err(_) => 0,
        };

        let seed = persisted.max(unix_micros());
        info!(
            "NonceService: Opened {} (persisted={}, seed={})",
            path.display(),
            persisted,
            seed
        );

        Ok(Self {
            path,
            last: Mutex::new(seed),
        })
    }

    /// Issue the next nonce: strictly greater than every previously issued
    /// value, persisted before return.
    pub fn next(&self) -> Result<i64> {
        let mut last = self.last.lock().expect("nonce lock poisoned");
        let candidate = (*last + 1).max(unix_micros());
        self.persist(candidate)?;
        *last = candidate;
        Ok(candidate)
    }

    /// One-shot recovery after a "nonce too small" rejection: jump past the
    /// server's floor by a fixed offset. The caller retries with `next()`.
    pub fn bump_past(&self, server_min: i64) -> Result<i64> {
        let mut last = self.last.lock().expect("nonce lock poisoned");
        let candidate = (*last + NONCE_BUMP_OFFSET).max(server_min + NONCE_BUMP_OFFSET);
        self.persist(candidate)?;
        *last = candidate;
        warn!(
            "NonceService: Bumped nonce past server floor {} -> {}",
            server_min, candidate
        );
        Ok(candidate)
    }

    pub fn current(&self) -> i64 {
        *self.last.lock().expect("nonce lock poisoned")
    }

    fn persist(&self, value: i64) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, value.to_string())
            .with_context(|| format!("Failed to write nonce tmp file {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to rename nonce file into {}", self.path.display()))?;
        Ok(())
    }
}

fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bfxtrader-nonce-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_strictly_increasing() {
        let dir = temp_dir("incr");
        let service = NonceService::open(&dir, "key-a").unwrap();
        let mut prev = 0;
        for _ in 0..100 {
            let n = service.next().unwrap();
            assert!(n > prev, "nonce {} not greater than {}", n, prev);
            prev = n;
        }
    }

    #[test]
    fn test_survives_restart() {
        let dir = temp_dir("restart");
        let first = {
            let service = NonceService::open(&dir, "key-a").unwrap();
            service.next().unwrap()
        };
        let service = NonceService::open(&dir, "key-a").unwrap();
        let second = service.next().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_bump_past_server_floor() {
        let dir = temp_dir("bump");
        let service = NonceService::open(&dir, "key-a").unwrap();
        let before = service.current();
        let floor = before + 5_000_000;
        service.bump_past(floor).unwrap();
        let next = service.next().unwrap();
        assert!(next > floor, "next {} must exceed server floor {}", next, floor);
    }

    #[test]
    fn test_distinct_keys_use_distinct_files() {
        let dir = temp_dir("keys");
        let _a = NonceService::open(&dir, "key-a").unwrap();
        let _b = NonceService::open(&dir, "key-b").unwrap();
        let files: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_concurrent_issuance_is_unique() {
        let dir = temp_dir("concurrent");
        let service = Arc::new(NonceService::open(&dir, "key-a").unwrap());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = service.clone();
            handles.push(std::thread::spawn(move || {
                (0..50).map(|_| service.next().unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for nonce in handle.join().unwrap() {
                assert!(seen.insert(nonce), "duplicate nonce issued: {}", nonce);
            }
        }
        assert_eq!(seen.len(), 400);
    }
}
