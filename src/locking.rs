//! File-level lock coordination
//!
//! Wraps a filesystem path with reader/writer lock semantics. Within one
//! process, handles for the same canonical path share an in-memory lock, so
//! separate [`SyncFile`] instances still serialize correctly. With
//! [`LockScope::MultiProcess`], an OS advisory lock is additionally taken on
//! a sidecar `<fileName>.lock` file, extending the same guarantees across
//! process boundaries.
//!
//! Calls block indefinitely until the lock is available; there is no timeout
//! and no cancellation at this layer. Advisory locks are only as reliable as
//! the underlying filesystem (network filesystems often are not).

use crate::error::{ActionError, KilnError, KilnResult};
use fs4::fs_std::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use tracing::{debug, warn};

/// Locking scope for a [`SyncFile`] or a cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockScope {
    /// Serialize access within this process only
    SingleProcess,
    /// Serialize access across processes via an OS advisory lock on a
    /// sidecar `.lock` file
    MultiProcess,
}

/// In-memory table of per-path reader/writer locks.
///
/// Keyed by canonical path. The process-global table backs the public
/// [`SyncFile::new`] constructor; the cache keeps a private table per
/// instance so distinct cache instances never share in-memory lock state.
#[derive(Default)]
pub(crate) struct LockTable {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(path.to_path_buf()).or_default().clone()
    }

    /// Drop entries no live handle refers to.
    ///
    /// A strong count of 1 under the table mutex means only the table itself
    /// holds the lock, so nothing can be holding or waiting on it; a later
    /// handle for the same path simply gets a fresh lock. The cache calls
    /// this after evicting entries. The process-global table is not pruned:
    /// it only ever holds one entry per distinct path passed to
    /// [`SyncFile::new`].
    pub(crate) fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

static PROCESS_LOCKS: OnceLock<LockTable> = OnceLock::new();

fn process_lock_table() -> &'static LockTable {
    PROCESS_LOCKS.get_or_init(LockTable::new)
}

/// A filesystem path guarded by reader/writer locks
///
/// All accessors hand the action the canonical (symlink-resolved,
/// `.`/`..`-normalized) form of the path and release the lock on every exit
/// path, including action failures.
#[derive(Debug)]
pub struct SyncFile {
    path: PathBuf,
    scope: LockScope,
    lock: Arc<RwLock<()>>,
    lock_file_path: Option<PathBuf>,
}

impl SyncFile {
    /// Create a handle for `path` using the process-global lock table.
    ///
    /// With [`LockScope::MultiProcess`], the sidecar `<fileName>.lock` file
    /// is created eagerly; the parent directory must already exist.
    pub fn new(path: impl AsRef<Path>, scope: LockScope) -> KilnResult<Self> {
        Self::with_table(path, scope, process_lock_table())
    }

    pub(crate) fn with_table(
        path: impl AsRef<Path>,
        scope: LockScope,
        table: &LockTable,
    ) -> KilnResult<Self> {
        let path = canonical_path(path.as_ref())?;
        let lock = table.lock_for(&path);

        let lock_file_path = match scope {
            LockScope::SingleProcess => None,
            LockScope::MultiProcess => Some(create_lock_file(&path)?),
        };

        Ok(Self {
            path,
            scope,
            lock,
            lock_file_path,
        })
    }

    /// The canonical path this handle guards
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The locking scope this handle was created with
    pub fn scope(&self) -> LockScope {
        self.scope
    }

    /// Run `action` under a SHARED lock.
    ///
    /// Concurrent `read` calls on the same path may run in parallel.
    pub fn read<T>(&self, action: impl FnOnce(&Path) -> Result<T, ActionError>) -> KilnResult<T> {
        self.read_internal(|path| action(path).map_err(KilnError::action))
    }

    /// Run `action` under an EXCLUSIVE lock.
    ///
    /// Excludes every other holder, shared or exclusive, on the same path.
    pub fn write<T>(&self, action: impl FnOnce(&Path) -> Result<T, ActionError>) -> KilnResult<T> {
        self.write_internal(|path| action(path).map_err(KilnError::action))
    }

    /// SHARED-locked variant for crate internals, whose failures are storage
    /// faults rather than wrapped action failures.
    pub(crate) fn read_internal<T>(
        &self,
        action: impl FnOnce(&Path) -> KilnResult<T>,
    ) -> KilnResult<T> {
        let _guard = self.lock.read().unwrap_or_else(PoisonError::into_inner);
        let os_lock = self.acquire_os_lock(false)?;
        let result = action(&self.path);
        release_os_lock(os_lock);
        result
    }

    /// EXCLUSIVE-locked variant for crate internals
    pub(crate) fn write_internal<T>(
        &self,
        action: impl FnOnce(&Path) -> KilnResult<T>,
    ) -> KilnResult<T> {
        let _guard = self.lock.write().unwrap_or_else(PoisonError::into_inner);
        let os_lock = self.acquire_os_lock(true)?;
        let result = action(&self.path);
        release_os_lock(os_lock);
        result
    }

    /// Run `action` under an EXCLUSIVE lock only if the path does not exist.
    ///
    /// The action must create the path; if it returns successfully without
    /// doing so, that is an internal-state error distinct from the action's
    /// own declared failures. If the path already exists, the action never
    /// runs.
    pub fn create_if_absent(
        &self,
        action: impl FnOnce(&Path) -> Result<(), ActionError>,
    ) -> KilnResult<()> {
        self.write(|path| {
            if path.exists() {
                return Ok(CreateOutcome::AlreadyPresent);
            }
            action(path)?;
            Ok(CreateOutcome::Ran)
        })
        .and_then(|outcome| match outcome {
            CreateOutcome::AlreadyPresent => Ok(()),
            CreateOutcome::Ran if self.path.exists() => Ok(()),
            CreateOutcome::Ran => Err(KilnError::Internal(format!(
                "create_if_absent action did not create '{}'",
                self.path.display()
            ))),
        })
    }

    fn acquire_os_lock(&self, exclusive: bool) -> KilnResult<Option<File>> {
        let Some(lock_path) = &self.lock_file_path else {
            return Ok(None);
        };

        // The lock file may have been evicted together with a cache entry;
        // recreate it on demand.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(lock_path)
            .map_err(|e| KilnError::io(format!("opening lock file {}", lock_path.display()), e))?;

        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| KilnError::io(format!("locking {}", lock_path.display()), e))?;
        debug!(
            path = %lock_path.display(),
            exclusive,
            "acquired advisory file lock"
        );

        Ok(Some(file))
    }
}

enum CreateOutcome {
    AlreadyPresent,
    Ran,
}

fn release_os_lock(file: Option<File>) {
    if let Some(file) = file {
        // The OS releases the lock when the handle closes; unlock explicitly
        // so failures are at least visible.
        if let Err(e) = FileExt::unlock(&file) {
            warn!("failed to release advisory file lock: {}", e);
        }
    }
}

/// Create the sidecar lock file for `path` if it does not already exist
fn create_lock_file(path: &Path) -> KilnResult<PathBuf> {
    let parent = path
        .parent()
        .filter(|p| p.exists())
        .ok_or_else(|| KilnError::LockFileParentMissing(path.to_path_buf()))?;

    let file_name = path.file_name().ok_or_else(|| {
        KilnError::Internal(format!("path '{}' has no file name", path.display()))
    })?;

    let mut lock_name = file_name.to_os_string();
    lock_name.push(".lock");
    let lock_path = parent.join(lock_name);

    if !lock_path.exists() {
        File::create(&lock_path).map_err(|e| {
            KilnError::io(format!("creating lock file {}", lock_path.display()), e)
        })?;
    }
    Ok(lock_path)
}

/// Canonicalize `path` even if it does not exist yet.
///
/// Existing prefixes are resolved through the filesystem (symlinks
/// included); the non-existing tail is appended after lexical
/// `.`/`..` normalization.
pub(crate) fn canonical_path(path: &Path) -> KilnResult<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| KilnError::io("resolving current directory", e))?
            .join(path)
    };
    resolve_existing_prefix(&lexical_normalize(&absolute))
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

fn resolve_existing_prefix(path: &Path) -> KilnResult<PathBuf> {
    if path.exists() {
        return std::fs::canonicalize(path)
            .map_err(|e| KilnError::io(format!("canonicalizing {}", path.display()), e));
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok(resolve_existing_prefix(parent)?.join(name)),
        _ => Ok(path.to_path_buf()),
    }
}
