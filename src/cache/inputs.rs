//! Structured cache inputs and key derivation
//!
//! An [`Inputs`] value is the ordered set of named parameters that together
//! identify one unit of cacheable work. Its canonical string form (one
//! `name=value` line per parameter, led by the command) is both what gets
//! hashed into the cache key and what is persisted verbatim as the entry's
//! `inputs` sidecar for corruption detection: two inputs map to the same
//! entry exactly when their canonical strings are character-equal.
//!
//! To keep that mapping injective, parameter names must not contain `=` or
//! line breaks, and string values and paths must not contain line breaks;
//! the builder rejects them up front.

use crate::cache::hashing;
use crate::cache::session::CacheSession;
use crate::error::{KilnError, KilnResult};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[cfg(windows)]
pub(crate) const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub(crate) const LINE_SEPARATOR: &str = "\n";

/// The logical operation a set of inputs belongs to
///
/// Scopes the parameter namespace so unrelated build steps can never
/// collide on a key, whatever parameters they declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Reserved for tests and examples
    Test,
    /// Pre-building a library dependency
    PrebuildLibrary,
    /// Extracting an archive to a directory
    ExtractArchive,
    /// Generating sources from a template or schema
    GenerateSources,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Test => "test",
            Self::PrebuildLibrary => "prebuild_library",
            Self::ExtractArchive => "extract_archive",
            Self::GenerateSources => "generate_sources",
        };
        write!(f, "{}", name)
    }
}

/// How a file parameter is identified in the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileProperties {
    /// By content hash only
    Hash,
    /// By path plus content hash
    PathHash,
    /// By path plus size plus last-modified time (no content read)
    PathSizeTimestamp,
}

/// How a directory parameter is identified in the inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryProperties {
    /// By recursive structural hash only
    Hash,
    /// By path plus recursive structural hash
    PathHash,
}

#[derive(Debug, Clone)]
enum ParamValue {
    String(String),
    Bool(bool),
    I64(i64),
    Hash(String),
    PathHash {
        path: PathBuf,
        hash: String,
    },
    PathSizeTimestamp {
        path: PathBuf,
        size: u64,
        timestamp_ms: u64,
    },
}

impl ParamValue {
    /// Whether the free-form text this value interpolates into the canonical
    /// string contains a line break. Hashes, sizes and timestamps render from
    /// fixed alphabets and cannot forge extra lines.
    fn contains_line_break(&self) -> bool {
        match self {
            Self::String(v) => v.contains(['\n', '\r']),
            Self::PathHash { path, .. } | Self::PathSizeTimestamp { path, .. } => {
                path.to_string_lossy().contains(['\n', '\r'])
            }
            Self::Bool(_) | Self::I64(_) | Self::Hash(_) => false,
        }
    }

    fn write_lines(&self, name: &str, lines: &mut Vec<String>) {
        match self {
            Self::String(v) => lines.push(format!("{}={}", name, v)),
            Self::Bool(v) => lines.push(format!("{}={}", name, v)),
            Self::I64(v) => lines.push(format!("{}={}", name, v)),
            Self::Hash(hash) => lines.push(format!("{}={}", name, hash)),
            Self::PathHash { path, hash } => {
                lines.push(format!("{}.path={}", name, path.display()));
                lines.push(format!("{}.hash={}", name, hash));
            }
            Self::PathSizeTimestamp {
                path,
                size,
                timestamp_ms,
            } => {
                lines.push(format!("{}.path={}", name, path.display()));
                lines.push(format!("{}.size={}", name, size));
                lines.push(format!("{}.timestamp={}", name, timestamp_ms));
            }
        }
    }
}

/// Ordered, named parameters identifying one unit of cacheable work
///
/// Immutable once built; construct via [`Inputs::builder`].
#[derive(Debug, Clone)]
pub struct Inputs {
    command: Command,
    params: Vec<(String, ParamValue)>,
}

impl Inputs {
    /// Start building inputs for `command`
    pub fn builder(command: Command) -> Builder {
        Builder {
            command,
            session: None,
            params: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// Start building inputs, memoizing file/directory hashes in `session`
    pub fn builder_with_session(command: Command, session: CacheSession) -> Builder {
        Builder {
            command,
            session: Some(session),
            params: Vec::new(),
            names: HashSet::new(),
        }
    }

    /// The command these inputs belong to
    pub fn command(&self) -> Command {
        self.command
    }

    /// The cache key: SHA-256 hex digest of the canonical string form
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for Inputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = vec![format!("COMMAND={}", self.command)];
        for (name, value) in &self.params {
            value.write_lines(name, &mut lines);
        }
        write!(f, "{}", lines.join(LINE_SEPARATOR))
    }
}

/// Append-only builder for [`Inputs`]
///
/// Parameter names must be unique; insertion order is part of the identity.
#[derive(Debug)]
pub struct Builder {
    command: Command,
    session: Option<CacheSession>,
    params: Vec<(String, ParamValue)>,
    names: HashSet<String>,
}

impl Builder {
    fn put(mut self, name: &str, value: ParamValue) -> KilnResult<Self> {
        // Names and free-form values must not be able to forge extra
        // `name=value` lines in the canonical string, or two distinct inputs
        // could share a key AND a byte-identical sidecar.
        if name.contains(['=', '\n', '\r']) {
            return Err(KilnError::InvalidInputName(name.to_string()));
        }
        if value.contains_line_break() {
            return Err(KilnError::InvalidInputValue(name.to_string()));
        }
        if !self.names.insert(name.to_string()) {
            return Err(KilnError::DuplicateInputName(name.to_string()));
        }
        self.params.push((name.to_string(), value));
        Ok(self)
    }

    /// Add a string parameter
    pub fn put_string(self, name: &str, value: impl Into<String>) -> KilnResult<Self> {
        self.put(name, ParamValue::String(value.into()))
    }

    /// Add a boolean parameter
    pub fn put_bool(self, name: &str, value: bool) -> KilnResult<Self> {
        self.put(name, ParamValue::Bool(value))
    }

    /// Add an integer parameter
    pub fn put_i64(self, name: &str, value: i64) -> KilnResult<Self> {
        self.put(name, ParamValue::I64(value))
    }

    /// Add a file parameter, identified per `properties`
    pub fn put_file(
        self,
        name: &str,
        path: &Path,
        properties: FileProperties,
    ) -> KilnResult<Self> {
        let value = match properties {
            FileProperties::Hash => ParamValue::Hash(self.file_hash(path)?),
            FileProperties::PathHash => ParamValue::PathHash {
                path: path.to_path_buf(),
                hash: self.file_hash(path)?,
            },
            FileProperties::PathSizeTimestamp => {
                let metadata = fs::metadata(path).map_err(|e| {
                    KilnError::io(format!("reading metadata of {}", path.display()), e)
                })?;
                let timestamp_ms = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                ParamValue::PathSizeTimestamp {
                    path: path.to_path_buf(),
                    size: metadata.len(),
                    timestamp_ms,
                }
            }
        };
        self.put(name, value)
    }

    /// Add a directory parameter, identified per `properties`
    pub fn put_directory(
        self,
        name: &str,
        path: &Path,
        properties: DirectoryProperties,
    ) -> KilnResult<Self> {
        let value = match properties {
            DirectoryProperties::Hash => ParamValue::Hash(self.directory_hash(path)?),
            DirectoryProperties::PathHash => ParamValue::PathHash {
                path: path.to_path_buf(),
                hash: self.directory_hash(path)?,
            },
        };
        self.put(name, value)
    }

    /// Finish building; fails if no parameter was added
    pub fn build(self) -> KilnResult<Inputs> {
        if self.params.is_empty() {
            return Err(KilnError::EmptyInputs);
        }
        Ok(Inputs {
            command: self.command,
            params: self.params,
        })
    }

    fn file_hash(&self, path: &Path) -> KilnResult<String> {
        match &self.session {
            Some(session) => session.file_hash(path),
            None => hashing::hash_file_contents(path),
        }
    }

    fn directory_hash(&self, path: &Path) -> KilnResult<String> {
        match &self.session {
            Some(session) => session.directory_hash(path),
            None => hashing::hash_directory(path),
        }
    }
}
