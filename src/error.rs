// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use std::fmt;

/// Errors that can occur while operating the index.
///
/// Mirrors the error kinds named in the design: most are absorbed internally
/// (see each call site's docs for the propagation policy) rather than ever
/// reaching a caller.
#[derive(Debug)]
#[allow(clippy::module_name_repetitions)]
pub enum Error {
    /// A bit-codec precondition was violated by the caller (e.g. a field
    /// size larger than the codec supports).
    BufferError(&'static str),

    /// A delta list, chapter page, or save stream failed a structural check
    /// (bad magic, non-decreasing offsets, non-terminating guard scan).
    ///
    /// Absorbed during rebuild; surfaced to the caller during steady-state
    /// search.
    CorruptData(&'static str),

    /// A mutable delta list could not accept an insertion within its zone's
    /// byte budget. Absorbed by the caller as a missed dedupe.
    Overflow,

    /// The requested name was not present.
    NotFound,

    /// A collision entry was inserted for a key that already has a
    /// collision entry on top of it.
    DuplicateName,

    /// An argument was out of range or otherwise invalid.
    InvalidArgument(&'static str),

    /// The index was asked to do something incompatible with its current
    /// lifecycle state (e.g. mutate while `Suspended`).
    BadState(&'static str),

    /// Underlying I/O failure.
    Io(std::io::Error),

    /// The chapter writer failed to commit a chapter; carries its own
    /// message since the underlying cause can vary (I/O, corrupt state).
    ChapterWriteFailed(String),

    /// The thread that owned a sparse-cache barrier promotion failed to
    /// load the chapter being admitted; every zone waiting on that barrier
    /// observes this same failure.
    SparseCacheLoadFailed(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferError(msg) => write!(f, "buffer error: {msg}"),
            Self::CorruptData(msg) => write!(f, "corrupt data: {msg}"),
            Self::Overflow => write!(f, "delta list overflow"),
            Self::NotFound => write!(f, "not found"),
            Self::DuplicateName => write!(f, "duplicate name"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::BadState(msg) => write!(f, "bad state: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::ChapterWriteFailed(msg) => write!(f, "chapter write failed: {msg}"),
            Self::SparseCacheLoadFailed(msg) => write!(f, "sparse cache load failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// The result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The status a [`crate::request::Request`] completes with.
///
/// `Queued` is not an error: it signals that ownership of the request has
/// been handed to the volume page cache's reader pool and the caller's
/// completion callback will be invoked later, exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Queued,
    Error,
}
