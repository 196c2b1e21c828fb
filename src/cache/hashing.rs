//! Content hashing for cache inputs
//!
//! Files hash to the SHA-256 of their raw bytes; no text decoding or
//! line-ending normalization is applied, so keys are stable for a given
//! byte sequence regardless of platform.
//!
//! Directories hash to a single aggregate digest over a sorted recursive
//! walk. Each entry contributes its path relative to the root plus a type
//! tag plus (for files) its contents, so the digest changes whenever
//! anything inside the tree is modified, added, removed, renamed, or moved,
//! while staying independent of the root's own absolute path or name.

use crate::error::{KilnError, KilnResult};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// Hash a file's contents using SHA-256, returning the hex digest
pub fn hash_file_contents(path: &Path) -> KilnResult<String> {
    let contents = fs::read(path).map_err(|e| KilnError::Io {
        context: format!("reading file {}", path.display()),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

/// Hash a directory tree into a single SHA-256 hex digest.
///
/// Empty subdirectories participate in the digest; the root itself does not.
pub fn hash_directory(root: &Path) -> KilnResult<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root).sort_by(|a, b| a.path().cmp(b.path())) {
        let entry = entry.map_err(|e| KilnError::Io {
            context: format!("walking directory {}", root.display()),
            source: e.into(),
        })?;

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| KilnError::Internal(format!("walk escaped root: {}", e)))?;
        if relative.as_os_str().is_empty() {
            continue;
        }

        // NUL separators keep adjacent fields from running together, so
        // distinct trees can never concatenate to the same byte stream.
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        if entry.file_type().is_dir() {
            hasher.update(b"d");
        } else {
            hasher.update(b"f");
            let contents = fs::read(entry.path()).map_err(|e| KilnError::Io {
                context: format!("reading file {}", entry.path().display()),
                source: e,
            })?;
            hasher.update(&contents);
        }
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}
