//! Content-addressed cache storage
//!
//! Each entry lives in `<cacheDir>/<sha256-key>/`, holding the cached
//! artifact under the fixed name `output` (a single file or a whole
//! directory tree) next to an `inputs` sidecar with the canonical inputs
//! string. An entry is a hit only when the sidecar exists and matches the
//! querying inputs exactly; anything else left behind by a crash, a partial
//! write, or a key collision surfaces as corruption and is wholesale
//! repopulated on the next query, never patched.
//!
//! Every entry directory is guarded by its own [`SyncFile`], drawn from a
//! lock table private to this cache instance, so queries for different keys
//! (or through different instances) never serialize against each other.
//! Multi-process caches additionally place a `<key>.lock` sibling next to
//! each entry directory for OS-level advisory locking.

use crate::cache::inputs::Inputs;
use crate::error::{ActionError, KilnError, KilnResult};
use crate::locking::{canonical_path, LockScope, LockTable, SyncFile};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;
use tracing::debug;

const ARTIFACT_FILE_NAME: &str = "output";
const INPUTS_FILE_NAME: &str = "inputs";

/// What a cache query observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryEvent {
    /// A valid entry existed; the build action did not run
    Hit,
    /// No entry existed; the build action ran and populated one
    Missed,
    /// A stale or damaged entry was found, discarded, and repopulated
    Corrupted,
}

impl fmt::Display for QueryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "hit"),
            Self::Missed => write!(f, "missed"),
            Self::Corrupted => write!(f, "corrupted"),
        }
    }
}

/// Why an entry failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionCause {
    /// The entry directory exists but its `inputs` sidecar does not
    MissingInputsFile(PathBuf),
    /// The `inputs` sidecar content differs from the querying inputs
    InputsMismatch { expected: String, actual: String },
}

impl fmt::Display for CorruptionCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingInputsFile(path) => {
                write!(f, "inputs file '{}' does not exist", path.display())
            }
            Self::InputsMismatch { expected, actual } => write!(
                f,
                "inputs file content mismatch, expected [{}] but found [{}]",
                expected, actual
            ),
        }
    }
}

/// Outcome of a cache query
#[derive(Debug)]
pub struct QueryResult {
    event: QueryEvent,
    cause: Option<CorruptionCause>,
    cached_file: Option<PathBuf>,
}

impl QueryResult {
    /// Whether the query hit, missed, or repaired a corrupted entry
    pub fn event(&self) -> QueryEvent {
        self.event
    }

    /// The detected corruption, when `event()` is [`QueryEvent::Corrupted`]
    pub fn corruption_cause(&self) -> Option<&CorruptionCause> {
        self.cause.as_ref()
    }

    /// The artifact's location inside the cache, for in-cache queries
    pub fn cached_file(&self) -> Option<&Path> {
        self.cached_file.as_deref()
    }
}

enum EntryStatus {
    Hit,
    Missed,
    Corrupted(CorruptionCause),
}

/// Local content-addressed build cache
///
/// Counters and the in-memory lock table are per instance; two instances
/// pointed at the same directory only coordinate when created with
/// multi-process locking, via OS advisory locks.
pub struct FileCache {
    cache_dir: PathBuf,
    scope: LockScope,
    lock_table: LockTable,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FileCache {
    /// Create a cache whose entry locks are valid within this process only
    pub fn with_single_process_locking(cache_dir: impl AsRef<Path>) -> KilnResult<Self> {
        Self::new(cache_dir.as_ref(), LockScope::SingleProcess)
    }

    /// Create a cache whose entry locks also hold across processes
    pub fn with_multi_process_locking(cache_dir: impl AsRef<Path>) -> KilnResult<Self> {
        Self::new(cache_dir.as_ref(), LockScope::MultiProcess)
    }

    fn new(cache_dir: &Path, scope: LockScope) -> KilnResult<Self> {
        // The directory itself is created lazily, on first real use.
        Ok(Self {
            cache_dir: canonical_path(cache_dir)?,
            scope,
            lock_table: LockTable::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// The canonical cache root directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Number of queries answered from the cache by this instance
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of queries that ran the build action on this instance
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Produce `output` from the cache, running `action` on a miss.
    ///
    /// On a hit the cached artifact is copied over `output` (stale content
    /// removed, parent directories created) without invoking `action`. On a
    /// miss or a corrupted entry, stale output is removed, `action` runs
    /// producing its result directly at `output`, and the result is then
    /// copied into the cache. `action` runs at most once and its failures
    /// are wrapped, leaving no partial cache entry behind.
    pub fn create_file(
        &self,
        output: &Path,
        inputs: &Inputs,
        action: impl FnOnce() -> Result<(), ActionError>,
    ) -> KilnResult<QueryResult> {
        let output = canonical_path(output)?;
        self.check_output_location(&output)?;

        let result = self.query_entry(
            inputs,
            |cached_artifact| copy_artifact_out(cached_artifact, &output),
            |cached_artifact| {
                delete_path(&output)?;
                action().map_err(KilnError::action)?;
                if output.exists() {
                    copy_recursively(&output, cached_artifact)?;
                }
                Ok(())
            },
        )?;

        // The cached location is not part of this variant's contract.
        Ok(QueryResult {
            cached_file: None,
            ..result
        })
    }

    /// Produce an artifact stored at a cache-chosen location.
    ///
    /// On a miss, `action` receives the path inside the entry directory and
    /// must create it (file or directory, caller's choice of shape). The
    /// returned [`QueryResult::cached_file`] points into the cache and can
    /// be used directly, without copying out.
    pub fn create_file_in_cache_if_absent(
        &self,
        inputs: &Inputs,
        action: impl FnOnce(&Path) -> Result<(), ActionError>,
    ) -> KilnResult<QueryResult> {
        self.query_entry(
            inputs,
            |_| Ok(()),
            |cached_artifact| {
                let entry_dir = cached_artifact
                    .parent()
                    .ok_or_else(|| KilnError::Internal("artifact path has no parent".into()))?;
                fs::create_dir_all(entry_dir).map_err(|e| {
                    KilnError::io(format!("creating cache entry {}", entry_dir.display()), e)
                })?;
                action(cached_artifact).map_err(KilnError::action)?;
                if !cached_artifact.exists() {
                    return Err(KilnError::Internal(format!(
                        "build action did not create '{}'",
                        cached_artifact.display()
                    )));
                }
                Ok(())
            },
        )
    }

    /// Check whether a valid entry for `inputs` exists, without locking
    pub fn cache_entry_exists(&self, inputs: &Inputs) -> KilnResult<bool> {
        let entry_dir = self.cache_dir.join(inputs.key());
        Ok(matches!(entry_status(&entry_dir, inputs)?, EntryStatus::Hit))
    }

    /// The deterministic in-cache location for the artifact of `inputs`.
    ///
    /// Pure path computation; the entry need not exist.
    pub fn get_file_in_cache(&self, inputs: &Inputs) -> PathBuf {
        self.cache_dir.join(inputs.key()).join(ARTIFACT_FILE_NAME)
    }

    /// Delete every entry whose directory mtime is at or before the cutoff
    /// (milliseconds since the Unix epoch), along with its sibling lock
    /// file. A missing or empty cache directory is a no-op.
    pub fn delete_old_cache_entries(&self, cutoff_timestamp_ms: u64) -> KilnResult<()> {
        if !self.cache_dir.exists() {
            return Ok(());
        }

        let entries = fs::read_dir(&self.cache_dir).map_err(|e| {
            KilnError::io(format!("listing cache dir {}", self.cache_dir.display()), e)
        })?;

        for entry in entries {
            let entry = entry.map_err(|e| KilnError::io("listing cache dir", e))?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            let modified_ms = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64);
            let Some(modified_ms) = modified_ms else {
                continue;
            };
            if modified_ms > cutoff_timestamp_ms {
                continue;
            }

            let entry_lock = SyncFile::with_table(&path, self.scope, &self.lock_table)?;
            entry_lock.write_internal(|p| {
                if p.exists() {
                    fs::remove_dir_all(p).map_err(|e| {
                        KilnError::io(format!("deleting cache entry {}", p.display()), e)
                    })?;
                }
                Ok(())
            })?;

            let mut lock_name = entry.file_name();
            lock_name.push(".lock");
            let lock_file = self.cache_dir.join(lock_name);
            if lock_file.exists() {
                fs::remove_file(&lock_file).map_err(|e| {
                    KilnError::io(format!("deleting lock file {}", lock_file.display()), e)
                })?;
            }
            debug!(entry = %path.display(), "evicted old cache entry");
        }

        // In-memory locks for entries no query is touching have no live
        // handles left; drop them so the table does not grow without bound.
        self.lock_table.prune();
        Ok(())
    }

    /// Remove the entire cache directory tree
    pub fn delete(&self) -> KilnResult<()> {
        if self.cache_dir.exists() {
            fs::remove_dir_all(&self.cache_dir).map_err(|e| {
                KilnError::io(format!("deleting cache dir {}", self.cache_dir.display()), e)
            })?;
        }
        Ok(())
    }

    /// Hit-probe under a SHARED entry lock, then populate under EXCLUSIVE
    /// with a re-check, so racing callers for the same key run the build
    /// action exactly once and the losers observe a hit.
    fn query_entry(
        &self,
        inputs: &Inputs,
        on_hit: impl Fn(&Path) -> KilnResult<()>,
        populate: impl FnOnce(&Path) -> KilnResult<()>,
    ) -> KilnResult<QueryResult> {
        fs::create_dir_all(&self.cache_dir).map_err(|e| {
            KilnError::io(format!("creating cache dir {}", self.cache_dir.display()), e)
        })?;

        let key = inputs.key();
        let entry_dir = self.cache_dir.join(&key);
        let entry_lock = SyncFile::with_table(&entry_dir, self.scope, &self.lock_table)?;

        let probe = entry_lock.read_internal(|entry_dir| {
            if let EntryStatus::Hit = entry_status(entry_dir, inputs)? {
                on_hit(&entry_dir.join(ARTIFACT_FILE_NAME))?;
                Ok(true)
            } else {
                Ok(false)
            }
        })?;
        if probe {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, "cache hit");
            return Ok(QueryResult {
                event: QueryEvent::Hit,
                cause: None,
                cached_file: Some(entry_dir.join(ARTIFACT_FILE_NAME)),
            });
        }

        let result = entry_lock.write_internal(|entry_dir| {
            let artifact = entry_dir.join(ARTIFACT_FILE_NAME);
            match entry_status(entry_dir, inputs)? {
                // Another caller populated the entry while we waited.
                EntryStatus::Hit => {
                    on_hit(&artifact)?;
                    Ok(QueryResult {
                        event: QueryEvent::Hit,
                        cause: None,
                        cached_file: Some(artifact),
                    })
                }
                EntryStatus::Missed => {
                    populate_entry(entry_dir, &artifact, inputs, populate)?;
                    Ok(QueryResult {
                        event: QueryEvent::Missed,
                        cause: None,
                        cached_file: Some(artifact),
                    })
                }
                EntryStatus::Corrupted(cause) => {
                    debug!(%key, %cause, "repopulating corrupted cache entry");
                    if entry_dir.exists() {
                        fs::remove_dir_all(entry_dir).map_err(|e| {
                            KilnError::io(
                                format!("clearing corrupted entry {}", entry_dir.display()),
                                e,
                            )
                        })?;
                    }
                    populate_entry(entry_dir, &artifact, inputs, populate)?;
                    Ok(QueryResult {
                        event: QueryEvent::Corrupted,
                        cause: Some(cause),
                        cached_file: Some(artifact),
                    })
                }
            }
        })?;

        match result.event {
            QueryEvent::Hit => self.hits.fetch_add(1, Ordering::Relaxed),
            QueryEvent::Missed | QueryEvent::Corrupted => {
                debug!(%key, event = %result.event, "cache populated");
                self.misses.fetch_add(1, Ordering::Relaxed)
            }
        };
        Ok(result)
    }

    fn check_output_location(&self, output: &Path) -> KilnResult<()> {
        if output == self.cache_dir {
            return Err(KilnError::OutputSameAsCacheDir(self.cache_dir.clone()));
        }
        if output.starts_with(&self.cache_dir) {
            return Err(KilnError::OutputInsideCacheDir {
                output: output.to_path_buf(),
                cache_dir: self.cache_dir.clone(),
            });
        }
        if self.cache_dir.starts_with(output) {
            return Err(KilnError::OutputContainsCacheDir {
                output: output.to_path_buf(),
                cache_dir: self.cache_dir.clone(),
            });
        }
        Ok(())
    }
}

/// Run the populate step, then seal the entry with its `inputs` sidecar.
///
/// The sidecar is written last: a crash mid-populate leaves an entry that
/// fails validation and gets repopulated, never one that reads as valid.
fn populate_entry(
    entry_dir: &Path,
    artifact: &Path,
    inputs: &Inputs,
    populate: impl FnOnce(&Path) -> KilnResult<()>,
) -> KilnResult<()> {
    populate(artifact)?;
    fs::create_dir_all(entry_dir).map_err(|e| {
        KilnError::io(format!("creating cache entry {}", entry_dir.display()), e)
    })?;
    let inputs_file = entry_dir.join(INPUTS_FILE_NAME);
    fs::write(&inputs_file, inputs.to_string()).map_err(|e| {
        KilnError::io(format!("writing inputs file {}", inputs_file.display()), e)
    })?;
    Ok(())
}

fn entry_status(entry_dir: &Path, inputs: &Inputs) -> KilnResult<EntryStatus> {
    if !entry_dir.exists() {
        return Ok(EntryStatus::Missed);
    }
    let inputs_file = entry_dir.join(INPUTS_FILE_NAME);
    if !inputs_file.exists() {
        return Ok(EntryStatus::Corrupted(CorruptionCause::MissingInputsFile(
            inputs_file,
        )));
    }
    // Compare raw bytes: a garbage sidecar (including invalid UTF-8) is
    // corruption to self-heal from, not a read error to surface.
    let actual = fs::read(&inputs_file).map_err(|e| {
        KilnError::io(format!("reading inputs file {}", inputs_file.display()), e)
    })?;
    let expected = inputs.to_string();
    if actual != expected.as_bytes() {
        return Ok(EntryStatus::Corrupted(CorruptionCause::InputsMismatch {
            expected,
            actual: String::from_utf8_lossy(&actual).into_owned(),
        }));
    }
    Ok(EntryStatus::Hit)
}

/// Copy the cached artifact over `output`, clearing stale content first.
///
/// An absent artifact is a cached "no output produced" result: the stale
/// output is still cleared, and nothing is created.
fn copy_artifact_out(cached_artifact: &Path, output: &Path) -> KilnResult<()> {
    delete_path(output)?;
    if cached_artifact.exists() {
        copy_recursively(cached_artifact, output)?;
    }
    Ok(())
}

/// Remove a file or a whole directory tree, leaving the parent in place
fn delete_path(path: &Path) -> KilnResult<()> {
    if path.is_dir() {
        fs::remove_dir_all(path)
            .map_err(|e| KilnError::io(format!("removing directory {}", path.display()), e))?;
    } else if path.exists() {
        fs::remove_file(path)
            .map_err(|e| KilnError::io(format!("removing file {}", path.display()), e))?;
    }
    Ok(())
}

/// Copy a file, or a directory tree preserving empty subdirectories
fn copy_recursively(src: &Path, dst: &Path) -> KilnResult<()> {
    if src.is_dir() {
        for entry in walkdir::WalkDir::new(src) {
            let entry = entry.map_err(|e| KilnError::Io {
                context: format!("walking {}", src.display()),
                source: e.into(),
            })?;
            let relative = entry
                .path()
                .strip_prefix(src)
                .map_err(|e| KilnError::Internal(format!("walk escaped root: {}", e)))?;
            let target = dst.join(relative);
            if entry.file_type().is_dir() {
                fs::create_dir_all(&target).map_err(|e| {
                    KilnError::io(format!("creating directory {}", target.display()), e)
                })?;
            } else {
                fs::copy(entry.path(), &target).map_err(|e| {
                    KilnError::io(format!("copying to {}", target.display()), e)
                })?;
            }
        }
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                KilnError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }
        fs::copy(src, dst)
            .map_err(|e| KilnError::io(format!("copying to {}", dst.display()), e))?;
    }
    Ok(())
}
