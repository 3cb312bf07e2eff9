// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The boundary to the out-of-scope paged volume store.
//!
//! The block-device-backed reader/writer with prefetch and per-page buffer
//! lifetime lives outside this crate (spec.md §1 names it explicitly as an
//! external collaborator). [`VolumePageCache`] is the seam a real product
//! plugs its implementation into; [`InMemoryVolumeStore`] is a complete,
//! synchronous stand-in used by this crate's own tests and by callers that
//! don't need real persistence (e.g. a pure in-memory index).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// The outcome of asking the page cache for a page.
///
/// `Queued` means the cache has taken ownership of completing the
/// request asynchronously; the caller must not block and must arrange for
/// the request to be re-dispatched when the read finishes (see
/// [`crate::zone`]).
pub enum PageQuery {
    Ready(Arc<[u8]>),
    Queued,
}

/// The paged volume store a chapter writer commits pages to and a zone
/// worker reads committed chapters back from.
///
/// A real implementation backs this with prefetching, page buffer
/// lifetime management, and asynchronous I/O; none of that is this
/// crate's concern; it only needs the shape of the interface.
pub trait VolumePageCache: Send + Sync {
    /// Bytes per page, fixed for the life of the volume.
    fn bytes_per_page(&self) -> u32;

    /// Writes `data` (exactly [`Self::bytes_per_page`] bytes) to
    /// `(physical_chapter, page_number)`, overwriting whatever chapter
    /// previously occupied that physical slot.
    fn write_page(&self, physical_chapter: u32, page_number: u32, data: &[u8]) -> Result<()>;

    /// Reads `(physical_chapter, page_number)` back, or reports that the
    /// read has been queued for asynchronous completion.
    ///
    /// Callers acquire a "pending search" token before calling this and
    /// release it only once the data has actually been consumed, whether
    /// that happens inline (`Ready`) or after a later re-dispatch
    /// (`Queued`); see [`crate::zone::ZoneWorker`].
    fn get_page_protected(&self, physical_chapter: u32, page_number: u32) -> Result<PageQuery>;

    /// Invalidates any cached content for `physical_chapter`, called just
    /// before a chapter writer overwrites that physical slot with a new
    /// virtual chapter.
    fn invalidate(&self, physical_chapter: u32);
}

/// A synchronous, all-in-memory [`VolumePageCache`]: every `read` is
/// immediately `Ready`, never `Queued`. Sufficient for unit and
/// integration tests and for embedders that don't need real persistence.
pub struct InMemoryVolumeStore {
    bytes_per_page: u32,
    pages: Mutex<HashMap<(u32, u32), Arc<[u8]>>>,
}

impl InMemoryVolumeStore {
    #[must_use]
    pub fn new(bytes_per_page: u32) -> Self {
        Self {
            bytes_per_page,
            pages: Mutex::new(HashMap::new()),
        }
    }
}

impl VolumePageCache for InMemoryVolumeStore {
    fn bytes_per_page(&self) -> u32 {
        self.bytes_per_page
    }

    fn write_page(&self, physical_chapter: u32, page_number: u32, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), self.bytes_per_page as usize);
        let mut pages = self.pages.lock().expect("volume store mutex poisoned");
        pages.insert((physical_chapter, page_number), Arc::from(data));
        Ok(())
    }

    fn get_page_protected(&self, physical_chapter: u32, page_number: u32) -> Result<PageQuery> {
        let pages = self.pages.lock().expect("volume store mutex poisoned");
        match pages.get(&(physical_chapter, page_number)) {
            Some(data) => Ok(PageQuery::Ready(Arc::clone(data))),
            None => Ok(PageQuery::Ready(Arc::from(vec![0u8; self.bytes_per_page as usize]))),
        }
    }

    fn invalidate(&self, physical_chapter: u32) {
        let mut pages = self.pages.lock().expect("volume store mutex poisoned");
        pages.retain(|&(chapter, _), _| chapter != physical_chapter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn write_then_read_round_trips() {
        let store = InMemoryVolumeStore::new(64);
        let data = vec![7u8; 64];
        store.write_page(0, 3, &data).unwrap();

        match store.get_page_protected(0, 3).unwrap() {
            PageQuery::Ready(bytes) => assert_eq!(&*bytes, data.as_slice()),
            PageQuery::Queued => panic!("in-memory store never queues"),
        }
    }

    #[test]
    fn invalidate_clears_only_the_named_chapter() {
        let store = InMemoryVolumeStore::new(8);
        store.write_page(0, 0, &[1u8; 8]).unwrap();
        store.write_page(1, 0, &[2u8; 8]).unwrap();

        store.invalidate(0);

        match store.get_page_protected(0, 0).unwrap() {
            PageQuery::Ready(bytes) => assert_eq!(&*bytes, &[0u8; 8]),
            PageQuery::Queued => unreachable!(),
        }
        match store.get_page_protected(1, 0).unwrap() {
            PageQuery::Ready(bytes) => assert_eq!(&*bytes, &[2u8; 8]),
            PageQuery::Queued => unreachable!(),
        }
    }
}
