use std::path::PathBuf;

use thiserror::Error;

/// Caller misuse of the group or accessor API.
///
/// These mirror the ways a caller can hold the API wrong; they never indicate
/// a damaged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicErrorKind {
    /// The operation requires a different group state (e.g. committing a
    /// shared group, or opening a group twice).
    WrongGroupState,
    /// The group or table accessor is detached.
    DetachedAccessor,
    /// A table index was outside `0..=size()`.
    TableIndexOutOfRange,
    /// A table name exceeded the maximum length.
    TableNameTooLong,
}

impl LogicErrorKind {
    const fn message(self) -> &'static str {
        match self {
            Self::WrongGroupState => "wrong group state",
            Self::DetachedAccessor => "detached accessor",
            Self::TableIndexOutOfRange => "table index out of range",
            Self::TableNameTooLong => "table name too long",
        }
    }
}

/// Primary error type for TuskDB operations.
///
/// Structured variants for the failure modes the engine can actually hit;
/// convenience constructors below keep call sites terse.
#[derive(Error, Debug)]
pub enum TuskError {
    /// The file is not a valid database, or uses an unsupported format.
    #[error("invalid database: {reason} ('{}')", path.display())]
    InvalidDatabase { reason: String, path: PathBuf },

    /// A heap node, file header, or transaction log failed to decode.
    #[error("database image is malformed: {detail}")]
    DatabaseCorrupt { detail: String },

    /// API misuse by the caller.
    #[error("logic error: {}", .0.message())]
    LogicError(LogicErrorKind),

    /// Named table does not exist.
    #[error("no such table")]
    NoSuchTable,

    /// A table with that name already exists.
    #[error("table name already in use")]
    TableNameInUse,

    /// The table is the target of a link column in another table.
    #[error("table is the target of a cross-table link column")]
    CrossTableLinkTarget,

    /// A table was found, but its descriptor did not match expectations.
    #[error("descriptor mismatch")]
    DescriptorMismatch,

    /// Typed cell access with the wrong column type.
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// A string value exceeds what the leaf format can store.
    #[error("string too long: {len} bytes (max {max})")]
    StringTooLong { len: usize, max: usize },

    /// File I/O error, propagated unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Buffer allocation failed (only raised by `write_to_mem`).
    #[error("out of memory")]
    BadAlloc,

    /// Operation not supported by this build.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl TuskError {
    /// Create an `InvalidDatabase` error.
    pub fn invalid_database(reason: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::InvalidDatabase {
            reason: reason.into(),
            path: path.into(),
        }
    }

    /// Create a `DatabaseCorrupt` error.
    pub fn corrupt(detail: impl Into<String>) -> Self {
        Self::DatabaseCorrupt {
            detail: detail.into(),
        }
    }

    /// Create a `LogicError` of the given kind.
    pub const fn logic(kind: LogicErrorKind) -> Self {
        Self::LogicError(kind)
    }

    /// Whether this error leaves attached accessors in an undefined state,
    /// obliging the caller to detach or destroy the group.
    pub const fn requires_detach(&self) -> bool {
        matches!(self, Self::DatabaseCorrupt { .. })
    }
}

/// Result type alias using `TuskError`.
pub type Result<T> = std::result::Result<T, TuskError>;
