// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A small LRU of decoded chapter indexes for chapters that have fallen
//! into the sparse region.
//!
//! Membership is global across zones: a zone worker that decides a
//! fingerprint maps to a sparse chapter not currently cached asks for a
//! barrier promotion rather than mutating the cache itself. Every zone
//! that reaches [`SparseCache::update_sparse_cache`] for the same virtual
//! chapter rendezvouses on a counter-and-condvar barrier; the last thread
//! to arrive performs the actual load, insert, and eviction, then wakes
//! the rest. Outside a barrier, every zone worker may read the cache
//! freely, since all of them were synchronized by the barrier that most
//! recently mutated it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};

use crate::bits::huffman::{compute_coding_constants, CodingParams};
use crate::chapter::chapter_index::{
    chapter_delta_address, chapter_delta_list, mean_delta_for_chapter_index, value_bits_for_chapter_index,
};
use crate::delta_index::immutable::{self, PageHeader};
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::record_name::RecordName;
use crate::volume_store::{PageQuery, VolumePageCache};

/// One chapter's index pages, verified and held ready for repeated
/// [`immutable::search_list`] queries without re-reading the volume.
struct CachedChapter {
    pages: Vec<(PageHeader, Arc<[u8]>)>,
}

impl CachedChapter {
    fn search(
        &self,
        coding: CodingParams,
        value_bits: u32,
        list_number: u32,
        key: u64,
        name: &RecordName,
    ) -> Result<Option<u32>> {
        for (header, bytes) in &self.pages {
            let first = u32::from(header.first_list);
            if list_number >= first && list_number < first + u32::from(header.list_count) {
                return immutable::search_list(bytes, header, value_bits, coding, list_number, key, name);
            }
        }
        Ok(None)
    }
}

struct CacheState {
    entries: HashMap<u64, CachedChapter>,
    /// Least-recently-used at the front, most-recently-used at the back.
    order: VecDeque<u64>,
}

impl CacheState {
    fn touch(&mut self, virtual_chapter: u64) {
        if let Some(pos) = self.order.iter().position(|&v| v == virtual_chapter) {
            self.order.remove(pos);
        }
        self.order.push_back(virtual_chapter);
    }
}

struct BarrierState {
    waiting: u32,
    generation: u64,
    last_error: Option<String>,
}

/// The shared, barrier-coordinated sparse-chapter cache.
pub struct SparseCache {
    geometry: Geometry,
    nonce: u64,
    volume: Arc<dyn VolumePageCache>,
    capacity: usize,
    zone_count: u32,
    coding: CodingParams,
    value_bits: u32,
    state: Mutex<CacheState>,
    barrier: (Mutex<BarrierState>, Condvar),
}

impl SparseCache {
    /// Builds an empty cache holding at most `capacity` chapters, shared by
    /// `zone_count` zone workers.
    pub fn new(geometry: Geometry, nonce: u64, volume: Arc<dyn VolumePageCache>, zone_count: u32, capacity: usize) -> Result<Self> {
        if zone_count == 0 {
            return Err(Error::InvalidArgument("sparse cache zone_count must be > 0"));
        }
        if capacity == 0 {
            return Err(Error::InvalidArgument("sparse cache capacity must be > 0"));
        }

        Ok(Self {
            coding: compute_coding_constants(mean_delta_for_chapter_index(&geometry)),
            value_bits: value_bits_for_chapter_index(&geometry),
            geometry,
            nonce,
            volume,
            capacity,
            zone_count,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            barrier: (
                Mutex::new(BarrierState {
                    waiting: 0,
                    generation: 0,
                    last_error: None,
                }),
                Condvar::new(),
            ),
        })
    }

    /// `true` if `virtual_chapter` is currently resident. Safe to call
    /// outside a barrier; see the module docs.
    #[must_use]
    pub fn contains(&self, virtual_chapter: u64) -> bool {
        self.state
            .lock()
            .expect("sparse cache mutex poisoned")
            .entries
            .contains_key(&virtual_chapter)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().expect("sparse cache mutex poisoned").entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Looks up `name` within `virtual_chapter`'s cached index.
    ///
    /// Returns `Ok(None)` both when the chapter is cached but the name is
    /// absent from it, and when the chapter is not cached at all — a
    /// caller reaches this only after a zone worker has already confirmed
    /// (via [`Self::update_sparse_cache`]) that the chapter is resident, so
    /// it does not need to distinguish the two here.
    pub fn search(&self, virtual_chapter: u64, name: &RecordName) -> Result<Option<u32>> {
        let list_number = chapter_delta_list(name, &self.geometry);
        let key = chapter_delta_address(name, &self.geometry);

        let state = self.state.lock().expect("sparse cache mutex poisoned");
        match state.entries.get(&virtual_chapter) {
            Some(chapter) => chapter.search(self.coding, self.value_bits, list_number, key, name),
            None => Ok(None),
        }
    }

    /// Joins the barrier for admitting `virtual_chapter` into the cache.
    ///
    /// Every zone that calls this for the same chapter blocks until all
    /// `zone_count` zones have called it; the last arrival performs the
    /// load and eviction alone, then wakes the others. All callers
    /// observe the same outcome, including any load error.
    pub fn update_sparse_cache(&self, virtual_chapter: u64) -> Result<()> {
        let (lock, cvar) = &self.barrier;
        let mut guard = lock.lock().expect("sparse cache barrier mutex poisoned");
        let my_generation = guard.generation;
        guard.waiting += 1;

        if guard.waiting < self.zone_count {
            while guard.generation == my_generation {
                guard = cvar.wait(guard).expect("sparse cache barrier mutex poisoned");
            }
            return match &guard.last_error {
                Some(msg) => Err(Error::SparseCacheLoadFailed(msg.clone())),
                None => Ok(()),
            };
        }

        drop(guard);
        let result = self.load_and_insert(virtual_chapter);

        let mut guard = lock.lock().expect("sparse cache barrier mutex poisoned");
        guard.waiting = 0;
        guard.generation += 1;
        guard.last_error = result.as_ref().err().map(std::string::ToString::to_string);
        cvar.notify_all();
        result
    }

    fn load_and_insert(&self, virtual_chapter: u64) -> Result<()> {
        {
            let mut state = self.state.lock().expect("sparse cache mutex poisoned");
            if state.entries.contains_key(&virtual_chapter) {
                state.touch(virtual_chapter);
                return Ok(());
            }
        }

        let chapter = self.load_chapter(virtual_chapter)?;

        let mut state = self.state.lock().expect("sparse cache mutex poisoned");
        if state.order.len() >= self.capacity {
            if let Some(oldest) = state.order.pop_front() {
                state.entries.remove(&oldest);
                debug!("sparse cache evicted vcn={oldest} to admit vcn={virtual_chapter}");
            }
        }
        state.entries.insert(virtual_chapter, chapter);
        state.order.push_back(virtual_chapter);
        Ok(())
    }

    /// Reads and verifies every index page of `virtual_chapter` from the
    /// volume. A page reported [`PageQuery::Queued`] is retried rather
    /// than suspended on: by the time a chapter is old enough to be
    /// sparse it is immutable and already durably written, so the volume
    /// page cache's own readiness is the only thing being waited out.
    fn load_chapter(&self, virtual_chapter: u64) -> Result<CachedChapter> {
        let physical_chapter = self.geometry.physical_chapter(virtual_chapter);
        let mut pages = Vec::with_capacity(self.geometry.index_pages_per_chapter as usize);

        for page_index in 0..self.geometry.index_pages_per_chapter {
            let bytes = loop {
                match self
                    .volume
                    .get_page_protected(physical_chapter, page_index)
                    .map_err(|e| Error::SparseCacheLoadFailed(e.to_string()))?
                {
                    PageQuery::Ready(bytes) => break bytes,
                    PageQuery::Queued => {
                        trace!("sparse cache load of vcn={virtual_chapter} page={page_index} queued, retrying");
                        std::thread::yield_now();
                    }
                }
            };

            let header = immutable::verify_page(self.nonce, &bytes).map_err(|e| Error::SparseCacheLoadFailed(e.to_string()))?;
            if header.virtual_chapter != virtual_chapter {
                return Err(Error::SparseCacheLoadFailed(format!(
                    "page for physical chapter {physical_chapter} holds vcn {}, expected {virtual_chapter}",
                    header.virtual_chapter
                )));
            }
            pages.push((header, bytes));
        }

        Ok(CachedChapter { pages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::open_chapter::OpenChapter;
    use crate::chapter::writer::write_chapter;
    use crate::chapter::{RecordData, RECORD_DATA_SIZE};
    use crate::chapter::index_page_map::IndexPageMap;
    use crate::record_name::RECORD_NAME_SIZE;
    use crate::volume_store::InMemoryVolumeStore;
    use test_log::test;

    fn geometry() -> Geometry {
        Geometry::new(4, 64, 2, 6, 4096, 14, 6, 0, 0).unwrap()
    }

    fn name(tag: u32) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[0..4].copy_from_slice(&tag.to_be_bytes());
        bytes[8..12].copy_from_slice(&tag.to_be_bytes());
        RecordName::new(bytes)
    }

    fn meta(tag: u32) -> RecordData {
        [tag as u8; RECORD_DATA_SIZE]
    }

    fn commit_chapter(volume: &dyn VolumePageCache, page_map: &Mutex<IndexPageMap>, geometry: &Geometry, nonce: u64, vcn: u64, tags: &[u32]) {
        let mut chapter = OpenChapter::new(geometry.records_per_chapter).unwrap();
        for &tag in tags {
            chapter.put(&name(tag), meta(tag)).unwrap();
        }
        write_chapter(geometry, nonce, vcn, &[chapter], &|_| true, volume, page_map).unwrap();
    }

    #[test]
    fn single_zone_barrier_loads_and_finds_records() {
        let nonce = 7;
        let geometry = geometry();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Mutex::new(IndexPageMap::new(geometry));
        commit_chapter(volume.as_ref(), &page_map, &geometry, nonce, 3, &[1, 2, 3]);

        let cache = SparseCache::new(geometry, nonce, volume, 1, 4).unwrap();

        cache.update_sparse_cache(3).unwrap();
        assert!(cache.contains(3));

        // Names sort by their leading bytes, so tag 2 lands at record
        // number 1 (0-based) among {1, 2, 3}.
        assert_eq!(cache.search(3, &name(2)).unwrap(), Some(1));
        assert_eq!(cache.search(3, &name(99)).unwrap(), None);
    }

    #[test]
    fn search_before_admission_reports_absent_rather_than_erroring() {
        let nonce = 8;
        let geometry = geometry();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Mutex::new(IndexPageMap::new(geometry));
        commit_chapter(volume.as_ref(), &page_map, &geometry, nonce, 1, &[5]);

        let cache = SparseCache::new(geometry, nonce, volume, 1, 4).unwrap();
        assert_eq!(cache.search(1, &name(5)).unwrap(), None);
    }

    #[test]
    fn capacity_bound_evicts_oldest_entry() {
        let nonce = 9;
        let geometry = geometry();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Mutex::new(IndexPageMap::new(geometry));
        commit_chapter(volume.as_ref(), &page_map, &geometry, nonce, 0, &[1, 2, 3]);
        commit_chapter(volume.as_ref(), &page_map, &geometry, nonce, 1, &[4, 5, 6]);

        let cache = SparseCache::new(geometry, nonce, Arc::clone(&volume), 1, 1).unwrap();

        cache.update_sparse_cache(0).unwrap();
        assert!(cache.contains(0));

        cache.update_sparse_cache(1).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn multi_zone_barrier_converges_on_a_single_admitted_chapter() {
        let nonce = 11;
        let geometry = geometry();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Mutex::new(IndexPageMap::new(geometry));
        commit_chapter(volume.as_ref(), &page_map, &geometry, nonce, 2, &[10, 20]);

        let cache = Arc::new(SparseCache::new(geometry, nonce, volume, 2, 4).unwrap());

        let first = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.update_sparse_cache(2))
        };
        let second = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.update_sparse_cache(2))
        };

        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();

        assert!(cache.contains(2));
        assert_eq!(cache.len(), 1);
    }
}
