// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-process request ABI: the unit of work that flows through the
//! zone scheduler from [`crate::index::Index::enqueue`] to completion.
//!
//! A request is created by the caller, handed to the index, routed through
//! the triage/zone queues described in [`crate::zone`], possibly suspended
//! and re-dispatched while a page read or sparse-cache barrier completes,
//! and finally handed back to the caller's completion callback exactly
//! once. Back-pointers to the owning index are deliberately absent here —
//! see the module docs on [`crate::zone::ZoneScheduler`] for why.

use crate::chapter::RecordData;
use crate::error::{Error, Status};
use crate::record_name::RecordName;

/// The operation a [`Request`] performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Store `name`, returning whether it was already present.
    Post,
    /// Look up `name` and, if found, refresh its chapter to the newest
    /// open chapter (the common "dedupe hit, keep this block live" path).
    Query,
    /// Look up `name` without refreshing its chapter.
    QueryNoUpdate,
    /// Overwrite `name`'s metadata in place; it must already exist.
    Update,
    /// Remove `name`'s entry, if present.
    Delete,
}

/// Where a request's name was ultimately resolved, or why it wasn't.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    /// No search has completed yet, or the name was never found.
    Unknown,
    /// Found in the zone's currently open (not yet closed) chapter.
    InOpenChapter,
    /// Found in a chapter that has closed but not yet finished writing.
    InWritingChapter,
    /// Found via a paged read of a committed dense chapter.
    InDense,
    /// Found via the sparse cache.
    InSparse,
    /// The index was shut down or suspended before the request completed.
    Unavailable,
}

/// Control messages routed alongside data requests on the same zone
/// queues, so FIFO ordering with in-flight requests is preserved (see
/// spec.md §5 Ordering).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlMessage {
    /// Join the sparse-cache barrier admitting `virtual_chapter`.
    SparseCacheBarrier(u64),
    /// A zone has closed `virtual_chapter`; every other zone must process
    /// this before closing the same chapter itself.
    AnnounceChapterClosed(u64),
    /// Drain and exit.
    Stop,
}

/// One request's full lifecycle state.
///
/// Cheap to move between queues; the completion callback is the only heap
/// allocation, and only the caller ever owns one outside the scheduler.
pub struct Request {
    pub kind: RequestKind,
    pub name: RecordName,
    pub new_metadata: Option<RecordData>,
    pub old_metadata: Option<RecordData>,
    /// The zone this request has been routed to, once triage (or direct
    /// dispatch) has computed it.
    pub zone: Option<u32>,
    pub virtual_chapter: Option<u64>,
    pub location: Location,
    pub found: bool,
    /// Set when this request has been handed back to a queue after being
    /// suspended (a page read or a sparse-cache barrier); survives the
    /// round trip so the zone worker resuming it knows not to re-run work
    /// already done (e.g. the volume-index lookup).
    pub requeued: bool,
    pub status: Status,
    pub message: Option<&'static str>,
    callback: Option<Box<dyn FnOnce(Request) + Send>>,
}

impl Request {
    fn new(kind: RequestKind, name: RecordName) -> Self {
        Self {
            kind,
            name,
            new_metadata: None,
            old_metadata: None,
            zone: None,
            virtual_chapter: None,
            location: Location::Unknown,
            found: false,
            requeued: false,
            status: Status::Success,
            message: None,
            callback: None,
        }
    }

    #[must_use]
    pub fn post(name: RecordName, metadata: RecordData) -> Self {
        let mut request = Self::new(RequestKind::Post, name);
        request.new_metadata = Some(metadata);
        request
    }

    #[must_use]
    pub fn query(name: RecordName) -> Self {
        Self::new(RequestKind::Query, name)
    }

    #[must_use]
    pub fn query_no_update(name: RecordName) -> Self {
        Self::new(RequestKind::QueryNoUpdate, name)
    }

    #[must_use]
    pub fn update(name: RecordName, metadata: RecordData) -> Self {
        let mut request = Self::new(RequestKind::Update, name);
        request.new_metadata = Some(metadata);
        request
    }

    #[must_use]
    pub fn delete(name: RecordName) -> Self {
        Self::new(RequestKind::Delete, name)
    }

    /// Attaches the completion callback. A request with no callback attached
    /// is only useful for tests that drive dispatch directly and inspect
    /// the returned `Request`.
    #[must_use]
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(Request) + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub(crate) fn fail(&mut self, error: &Error) {
        self.status = Status::Error;
        self.message = Some(match error {
            Error::BufferError(_) => "buffer error",
            Error::CorruptData(_) => "corrupt data",
            Error::Overflow => "delta list overflow",
            Error::NotFound => "not found",
            Error::DuplicateName => "duplicate name",
            Error::InvalidArgument(_) => "invalid argument",
            Error::BadState(_) => "bad state",
            Error::Io(_) => "I/O error",
            Error::ChapterWriteFailed(_) => "chapter write failed",
            Error::SparseCacheLoadFailed(_) => "sparse cache load failed",
        });
    }

    /// Hands the request to its completion callback, if one was attached.
    /// Consumes `self`; a request with no callback is simply dropped.
    pub(crate) fn complete(mut self) {
        if let Some(callback) = self.callback.take() {
            callback(self);
        }
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("zone", &self.zone)
            .field("virtual_chapter", &self.virtual_chapter)
            .field("location", &self.location)
            .field("found", &self.found)
            .field("requeued", &self.requeued)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::RECORD_DATA_SIZE;
    use crate::record_name::RECORD_NAME_SIZE;
    use std::sync::mpsc;
    use test_log::test;

    fn name() -> RecordName {
        RecordName::new([7u8; RECORD_NAME_SIZE])
    }

    #[test]
    fn completion_callback_runs_exactly_once() {
        let (tx, rx) = mpsc::channel();
        let request = Request::post(name(), [0u8; RECORD_DATA_SIZE]).on_complete(move |r| {
            tx.send(r.status).unwrap();
        });

        request.complete();
        assert_eq!(rx.recv().unwrap(), Status::Success);
    }

    #[test]
    fn request_without_callback_is_dropped_silently() {
        let request = Request::query(name());
        request.complete();
    }

    #[test]
    fn fail_sets_error_status_and_message() {
        let mut request = Request::delete(name());
        request.fail(&Error::Overflow);
        assert_eq!(request.status, Status::Error);
        assert_eq!(request.message, Some("delta list overflow"));
    }
}
