//! Kiln - Local content-addressed build cache
//!
//! Caches the outputs of expensive build steps on the local filesystem,
//! keyed by a SHA-256 digest of the step's declared inputs. Entries are
//! guarded by per-entry locks so concurrent builds racing on the same key
//! never corrupt each other, within one process or across processes.

pub mod cache;
pub mod error;
pub mod locking;

pub use cache::{
    CacheSession, Command, CorruptionCause, DirectoryProperties, FileCache, FileProperties,
    Inputs, QueryEvent, QueryResult,
};
pub use error::{ActionError, KilnError, KilnResult};
pub use locking::{LockScope, SyncFile};
