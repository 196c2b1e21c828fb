//! Cache sessions
//!
//! A [`CacheSession`] memoizes input hashes across repeated
//! [`Inputs`](crate::cache::Inputs) constructions within one bounded scope,
//! typically a single build invocation. File hashes are reused only while
//! the file's size and modification time are unchanged; directory hashes are
//! reused for the session's whole lifetime, since no comparably cheap
//! recursive metadata check exists. Dropping the session (or not using one)
//! always forces a fresh hash, so mutations are observed across sessions.

use crate::cache::hashing;
use crate::error::{KilnError, KilnResult};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tracing::debug;

#[derive(Clone)]
#[derive(Debug)]
struct FileFingerprint {
    size: u64,
    modified: Option<SystemTime>,
    hash: String,
}

#[derive(Debug, Default)]
struct SessionState {
    file_hashes: HashMap<PathBuf, FileFingerprint>,
    directory_hashes: HashMap<PathBuf, String>,
}

/// Scoped memoization of file and directory hashes
///
/// Cloning yields another handle to the same session.
#[derive(Clone, Debug, Default)]
pub struct CacheSession {
    state: Arc<Mutex<SessionState>>,
}

impl CacheSession {
    /// Create a fresh session with no remembered hashes
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a file's contents, reusing the session's previous result when
    /// the file's size and modification time are unchanged
    pub(crate) fn file_hash(&self, path: &Path) -> KilnResult<String> {
        let metadata = fs::metadata(path).map_err(|e| {
            KilnError::io(format!("reading metadata of {}", path.display()), e)
        })?;
        let size = metadata.len();
        let modified = metadata.modified().ok();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(fingerprint) = state.file_hashes.get(path) {
            if fingerprint.size == size && fingerprint.modified == modified {
                debug!(path = %path.display(), "reusing session file hash");
                return Ok(fingerprint.hash.clone());
            }
        }

        let hash = hashing::hash_file_contents(path)?;
        state.file_hashes.insert(
            path.to_path_buf(),
            FileFingerprint {
                size,
                modified,
                hash: hash.clone(),
            },
        );
        Ok(hash)
    }

    /// Hash a directory tree, reusing the session's previous result for the
    /// same path
    pub(crate) fn directory_hash(&self, path: &Path) -> KilnResult<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(hash) = state.directory_hashes.get(path) {
            debug!(path = %path.display(), "reusing session directory hash");
            return Ok(hash.clone());
        }

        let hash = hashing::hash_directory(path)?;
        state.directory_hashes.insert(path.to_path_buf(), hash.clone());
        Ok(hash)
    }
}
