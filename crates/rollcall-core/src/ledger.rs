//! Append-only per-session recognition log.
//!
//! Each session is one JSON-lines file, `session_<uuid>.jsonl`, holding one
//! [`RecognitionResult`] per line in append order. Appends to the same
//! session are serialized by a per-session mutex so no result is lost under
//! concurrent writers.

use crate::types::RecognitionResult;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid session id: {0:?} (expected a UUID)")]
    InvalidSessionId(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Canonical (lowercase, hyphenated) form of a session id.
pub fn canonical_session_id(session_id: &str) -> Result<String, LedgerError> {
    Uuid::parse_str(session_id.trim())
        .map(|u| u.hyphenated().to_string())
        .map_err(|_| LedgerError::InvalidSessionId(session_id.to_string()))
}

/// Fresh server-generated session id.
pub fn new_session_id() -> String {
    Uuid::new_v4().hyphenated().to_string()
}

pub struct SessionLedger {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLedger {
    /// Open the ledger rooted at `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `result` to the session's log.
    pub fn append(&self, session_id: &str, result: &RecognitionResult) -> Result<(), LedgerError> {
        let id = canonical_session_id(session_id)?;
        let mut line = serde_json::to_vec(result)?;
        line.push(b'\n');

        let path = self.session_path(&id);
        self.with_session_lock(&id, || -> Result<(), LedgerError> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(&line)?;
            file.sync_data()?;
            Ok(())
        })?;

        tracing::debug!(session_id = %id, path = %path.display(), "session result appended");
        Ok(())
    }

    /// All results recorded for the session, oldest first, or `None` if the
    /// session was never written.
    ///
    /// Lines that fail to parse (e.g. a write torn by a crash) are skipped.
    pub fn read(&self, session_id: &str) -> Result<Option<Vec<RecognitionResult>>, LedgerError> {
        let id = canonical_session_id(session_id)?;

        self.with_session_lock(&id, || -> Result<Option<Vec<RecognitionResult>>, LedgerError> {
            let file = match std::fs::File::open(self.session_path(&id)) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let mut results = Vec::new();
            for (lineno, line) in BufReader::new(file).lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecognitionResult>(&line) {
                    Ok(r) => results.push(r),
                    Err(e) => {
                        tracing::warn!(session_id = %id, line = lineno + 1, error = %e, "skipping unreadable session entry");
                    }
                }
            }
            Ok(Some(results))
        })
    }

    fn session_path(&self, canonical_id: &str) -> PathBuf {
        self.dir.join(format!("session_{canonical_id}.jsonl"))
    }

    /// Run `f` holding the session's lock. The lock entry is dropped from
    /// the map once no other caller holds or waits on it.
    fn with_session_lock<R>(&self, canonical_id: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(canonical_id.to_string()).or_default())
        };

        let out = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Clones are only handed out under the map lock, so a count of two
        // (map + ours) means nobody else is using this session.
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(&lock) == 2 {
            locks.remove(canonical_id);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceRegion, RecognizedFace};
    use chrono::Utc;

    fn result(session_id: &str, n: usize) -> RecognitionResult {
        RecognitionResult {
            session_id: session_id.to_string(),
            recognized: vec![RecognizedFace {
                identity: format!("S{n}"),
                confidence: 0.9,
                distance: 0.1,
                region: FaceRegion { x: 1, y: 2, width: 30, height: 40 },
                detection_confidence: 0.99,
            }],
            total_faces_detected: 1,
            total_recognized: 1,
            processing_time_secs: 0.01,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_read_unknown_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::open(dir.path()).unwrap();
        assert!(ledger.read(&new_session_id()).unwrap().is_none());
    }

    #[test]
    fn test_append_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::open(dir.path()).unwrap();
        let id = new_session_id();

        for n in 0..3 {
            ledger.append(&id, &result(&id, n)).unwrap();
        }

        let got = ledger.read(&id).unwrap().unwrap();
        let ids: Vec<_> = got.iter().map(|r| r.recognized[0].identity.as_str()).collect();
        assert_eq!(ids, ["S0", "S1", "S2"]);
        assert_eq!(got[0].recognized, result(&id, 0).recognized);
        assert_eq!(got[0].session_id, id);
    }

    #[test]
    fn test_session_id_is_canonicalized() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::open(dir.path()).unwrap();
        let id = new_session_id();

        ledger.append(&id.to_uppercase(), &result(&id, 0)).unwrap();
        assert_eq!(ledger.read(&id).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_rejects_non_uuid_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::open(dir.path()).unwrap();
        let err = ledger.append("../../etc/passwd", &result("x", 0)).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidSessionId(_)));
    }

    #[test]
    fn test_torn_line_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::open(dir.path()).unwrap();
        let id = new_session_id();
        ledger.append(&id, &result(&id, 0)).unwrap();

        let path = dir.path().join(format!("session_{id}.jsonl"));
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(b"{\"session_id\":\"trunc").unwrap();

        assert_eq!(ledger.read(&id).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_appends_lose_nothing() {
        const WRITERS: usize = 16;
        const PER_WRITER: usize = 10;

        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(SessionLedger::open(dir.path()).unwrap());
        let id = new_session_id();

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let ledger = Arc::clone(&ledger);
                let id = id.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        ledger.append(&id, &result(&id, w * PER_WRITER + i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let got = ledger.read(&id).unwrap().unwrap();
        assert_eq!(got.len(), WRITERS * PER_WRITER);

        let mut seen: Vec<_> = got.iter().map(|r| r.recognized[0].identity.clone()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), WRITERS * PER_WRITER);
        assert!(ledger.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_session_locks_released_after_use() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SessionLedger::open(dir.path()).unwrap();

        for n in 0..50 {
            let id = new_session_id();
            ledger.append(&id, &result(&id, n)).unwrap();
            assert_eq!(ledger.read(&id).unwrap().unwrap().len(), 1);
        }
        assert!(ledger.read(&new_session_id()).unwrap().is_none());
        assert!(ledger.locks.lock().unwrap().is_empty());
    }
}
