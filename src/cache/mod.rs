//! Content-addressed build cache
//!
//! Caches build outputs keyed by a SHA-256 digest of structured inputs.
//! Each entry owns a subdirectory of the cache root, guarded by its own
//! lock, with an `inputs` sidecar used to detect and self-heal corruption.
//!
//! # Query Outcomes
//!
//! | Event | Action ran | Description |
//! |-----------|------------|----------------------------------------------|
//! | Hit | no | Valid entry found, artifact reused |
//! | Missed | yes | No entry existed, one was populated |
//! | Corrupted | yes | Damaged entry discarded and repopulated |

pub mod hashing;
pub mod inputs;
pub mod session;
pub mod store;

pub use inputs::{Command, DirectoryProperties, FileProperties, Inputs};
pub use session::CacheSession;
pub use store::{CorruptionCause, FileCache, QueryEvent, QueryResult};
