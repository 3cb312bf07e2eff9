// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The background worker that commits a closed chapter to the volume
//! store.
//!
//! Exactly one thread per index. Zone workers submit their closing open
//! chapter via [`ChapterWriter::submit_chapter`]; the writer wakes once
//! every zone has submitted for the same virtual chapter, collates their
//! records into one name-sorted array, builds the chapter's delta index
//! over its sampled records, packs index pages followed by record pages,
//! and updates the shared index-page-map — mirroring `chapter_writer` /
//! `close_open_chapter` in the reference implementation.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};

use crate::delta_index::immutable;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::record_name::RecordName;
use crate::volume_store::VolumePageCache;

use super::chapter_index::ChapterIndex;
use super::index_page_map::IndexPageMap;
use super::open_chapter::OpenChapter;
use super::{RecordData, RECORD_DATA_SIZE};
use crate::record_name::RECORD_NAME_SIZE;

const BYTES_PER_RECORD: usize = RECORD_NAME_SIZE + RECORD_DATA_SIZE;

/// Leading bytes of every record page holding a `u32le` count of the
/// entries actually written to that page. A record's 256-bit name can
/// legitimately be all-zero bytes and still sort first on a page, so the
/// page tail can't be recognized by scanning for a zero sentinel; an
/// explicit count is the only unambiguous boundary.
const RECORD_PAGE_HEADER_BYTES: usize = 4;

/// The result of successfully committing one chapter.
#[derive(Clone, Copy, Debug)]
pub struct WriteOutcome {
    pub virtual_chapter: u64,
    pub record_count: usize,
    pub index_pages_written: u32,
    pub record_pages_written: u32,
}

struct Shared {
    zones_to_write: u32,
    chapters: Vec<Option<OpenChapter>>,
    pending_virtual_chapter: Option<u64>,
    newest_written: u64,
    last_error: Option<String>,
    stop: bool,
}

/// Shared handle to the chapter writer; cheap to clone, all clones refer
/// to the same background thread and state.
pub struct ChapterWriter {
    state: Arc<(Mutex<Shared>, Condvar)>,
    zone_count: u32,
    geometry: Geometry,
    nonce: u64,
    volume: Arc<dyn VolumePageCache>,
    page_map: Arc<Mutex<IndexPageMap>>,
    sample_predicate: Arc<dyn Fn(&RecordName) -> bool + Send + Sync>,
    thread: Mutex<Option<JoinHandle<()>>>,
    #[cfg(feature = "test-hooks")]
    pub chapters_written: std::sync::atomic::AtomicU64,
}

impl ChapterWriter {
    /// Builds (but does not start) a chapter writer for `zone_count`
    /// zones. `sample_predicate` decides which records are retained in the
    /// chapter's index (i.e. [`crate::volume_index::VolumeIndex::is_sample`]
    /// closed over the geometry it was built from).
    pub fn new(
        geometry: Geometry,
        zone_count: u32,
        nonce: u64,
        volume: Arc<dyn VolumePageCache>,
        page_map: Arc<Mutex<IndexPageMap>>,
        sample_predicate: Arc<dyn Fn(&RecordName) -> bool + Send + Sync>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new((
                Mutex::new(Shared {
                    zones_to_write: 0,
                    chapters: (0..zone_count).map(|_| None).collect(),
                    pending_virtual_chapter: None,
                    newest_written: 0,
                    last_error: None,
                    stop: false,
                }),
                Condvar::new(),
            )),
            zone_count,
            geometry,
            nonce,
            volume,
            page_map,
            sample_predicate,
            thread: Mutex::new(None),
            #[cfg(feature = "test-hooks")]
            chapters_written: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Starts the background thread. A no-op if already started.
    pub fn spawn(self: &Arc<Self>) {
        let mut slot = self.thread.lock().expect("chapter writer mutex poisoned");
        if slot.is_some() {
            return;
        }
        let writer = Arc::clone(self);
        *slot = Some(std::thread::spawn(move || writer.run()));
    }

    fn run(self: Arc<Self>) {
        let (lock, cvar) = &*self.state;
        loop {
            let mut guard = lock.lock().expect("chapter writer mutex poisoned");
            while guard.zones_to_write < self.zone_count && !guard.stop {
                guard = cvar.wait(guard).expect("chapter writer mutex poisoned");
            }

            if guard.stop && guard.zones_to_write < self.zone_count {
                return;
            }

            let virtual_chapter = guard
                .pending_virtual_chapter
                .expect("zones_to_write == zone_count implies a pending chapter");
            let chapters: Vec<OpenChapter> = guard.chapters.iter_mut().map(|c| c.take().unwrap()).collect();
            drop(guard);

            let outcome = write_chapter(
                &self.geometry,
                self.nonce,
                virtual_chapter,
                &chapters,
                self.sample_predicate.as_ref(),
                self.volume.as_ref(),
                &self.page_map,
            );

            let mut guard = lock.lock().expect("chapter writer mutex poisoned");
            match outcome {
                Ok(result) => {
                    debug!(
                        "chapter writer committed vcn={} records={}",
                        result.virtual_chapter, result.record_count
                    );
                    guard.newest_written = virtual_chapter;
                    guard.last_error = None;
                    #[cfg(feature = "test-hooks")]
                    self.chapters_written
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
                Err(e) => {
                    warn!("chapter writer failed to commit vcn={virtual_chapter}: {e}");
                    guard.last_error = Some(e.to_string());
                }
            }
            guard.zones_to_write = 0;
            guard.pending_virtual_chapter = None;
            cvar.notify_all();
        }
    }

    /// Hands a zone's closing chapter to the writer. Returns the number of
    /// zones that have now submitted for this virtual chapter; the caller
    /// that observes this reach `zone_count` is responsible for nothing
    /// further — the writer wakes on its own.
    pub fn submit_chapter(&self, zone_number: u32, chapter: OpenChapter, virtual_chapter: u64) -> u32 {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().expect("chapter writer mutex poisoned");

        debug_assert!(
            guard.pending_virtual_chapter.map_or(true, |v| v == virtual_chapter),
            "all zones must submit the same virtual chapter"
        );
        guard.pending_virtual_chapter = Some(virtual_chapter);
        guard.chapters[zone_number as usize] = Some(chapter);
        guard.zones_to_write += 1;
        let finished = guard.zones_to_write;
        cvar.notify_all();
        finished
    }

    /// Blocks until `virtual_chapter` has been committed (or the writer
    /// has reported an error while trying to commit it).
    pub fn wait_for_chapter(&self, virtual_chapter: u64) -> Result<()> {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().expect("chapter writer mutex poisoned");
        while guard.newest_written < virtual_chapter && guard.last_error.is_none() {
            guard = cvar.wait(guard).expect("chapter writer mutex poisoned");
        }
        if let Some(msg) = &guard.last_error {
            return Err(Error::ChapterWriteFailed(msg.clone()));
        }
        Ok(())
    }

    /// Signals the writer thread to stop once any in-flight chapter
    /// finishes, and waits for it to exit.
    pub fn stop(&self) {
        {
            let (lock, cvar) = &*self.state;
            let mut guard = lock.lock().expect("chapter writer mutex poisoned");
            guard.stop = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.thread.lock().expect("chapter writer mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// The pure core of committing one chapter: collate, build the chapter
/// index, pack pages, write them, and update the page map. Exposed
/// directly so it is unit-testable without a thread.
pub fn write_chapter(
    geometry: &Geometry,
    nonce: u64,
    virtual_chapter: u64,
    zone_chapters: &[OpenChapter],
    is_sample: &dyn Fn(&RecordName) -> bool,
    volume: &dyn VolumePageCache,
    page_map: &Mutex<IndexPageMap>,
) -> Result<WriteOutcome> {
    let mut collated: Vec<(RecordName, RecordData)> = zone_chapters
        .iter()
        .flat_map(|c| c.iter_live().copied())
        .collect();
    collated.sort_unstable_by_key(|(name, _)| *name);

    let chapter_index_bytes = (geometry.bytes_per_page as usize).max(4096) * 8;
    let mut chapter_index = ChapterIndex::new(*geometry, chapter_index_bytes)?;

    for (i, (name, _)) in collated.iter().enumerate() {
        if !is_sample(name) {
            continue;
        }
        if let Err(Error::Overflow) = chapter_index.put(name, i as u32) {
            warn!("chapter index overflowed while indexing vcn={virtual_chapter}; dropping a sample");
        }
    }

    let physical_chapter = geometry.physical_chapter(virtual_chapter);
    volume.invalidate(physical_chapter);

    let total_lists = 1u32 << geometry.chapter_delta_list_bits;
    let mut first_list = 0u32;
    let mut highest_written = 0u32;
    let mut page_map_guard = page_map.lock().expect("index page map mutex poisoned");

    for page_index in 0..geometry.index_pages_per_chapter {
        let mut page = vec![0u8; geometry.bytes_per_page as usize];
        let packed = if first_list < total_lists {
            immutable::pack_page(
                chapter_index.delta_index(),
                first_list,
                nonce,
                virtual_chapter,
                &mut page,
            )?
        } else {
            0
        };

        if packed > 0 {
            highest_written = first_list + packed - 1;
            first_list += packed;
        }

        page_map_guard.update(virtual_chapter, physical_chapter, page_index, highest_written);
        volume.write_page(physical_chapter, page_index, &page)?;
    }
    drop(page_map_guard);

    let records_per_page = ((geometry.bytes_per_page as usize - RECORD_PAGE_HEADER_BYTES) / BYTES_PER_RECORD).max(1);
    let mut record_pages_written = 0u32;

    for page_index in 0..geometry.record_pages_per_chapter {
        let mut page = vec![0u8; geometry.bytes_per_page as usize];
        let start = page_index as usize * records_per_page;

        let written = if start < collated.len() {
            let end = (start + records_per_page).min(collated.len());
            for (i, (name, metadata)) in collated[start..end].iter().enumerate() {
                let offset = RECORD_PAGE_HEADER_BYTES + i * BYTES_PER_RECORD;
                page[offset..offset + RECORD_NAME_SIZE].copy_from_slice(name.as_bytes());
                page[offset + RECORD_NAME_SIZE..offset + BYTES_PER_RECORD].copy_from_slice(metadata);
            }
            end - start
        } else {
            0
        };
        LittleEndian::write_u32(&mut page[0..RECORD_PAGE_HEADER_BYTES], written as u32);

        volume.write_page(physical_chapter, geometry.index_pages_per_chapter + page_index, &page)?;
        record_pages_written += 1;
    }

    Ok(WriteOutcome {
        virtual_chapter,
        record_count: collated.len(),
        index_pages_written: geometry.index_pages_per_chapter,
        record_pages_written,
    })
}

/// Reads a record page back and linearly scans it for `name`, as a dense
/// (post-write, non-sparse) chapter lookup does after the index page map
/// has already narrowed the search to the right chapter.
///
/// Bounds the scan by the page's leading record count rather than by
/// looking for an all-zero name: a record's 256-bit fingerprint can
/// legitimately be all-zero bytes and still sort first on a page, so a
/// zero sentinel can't distinguish a real record from trailing padding.
#[must_use]
pub fn scan_record_page(page: &[u8], name: &RecordName) -> Option<RecordData> {
    if page.len() < RECORD_PAGE_HEADER_BYTES {
        return None;
    }
    let record_count = LittleEndian::read_u32(&page[0..RECORD_PAGE_HEADER_BYTES]) as usize;
    let records = &page[RECORD_PAGE_HEADER_BYTES..];

    for chunk in records.chunks_exact(BYTES_PER_RECORD).take(record_count) {
        let (name_bytes, metadata_bytes) = chunk.split_at(RECORD_NAME_SIZE);
        if name_bytes == name.as_bytes() {
            let mut metadata = [0u8; RECORD_DATA_SIZE];
            metadata.copy_from_slice(metadata_bytes);
            return Some(metadata);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_name::RECORD_NAME_SIZE;
    use crate::volume_store::{InMemoryVolumeStore, PageQuery};
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

    #[test]
    fn write_chapter_produces_pages_findable_by_name() {
        let geometry = geometry();
        let volume = InMemoryVolumeStore::new(geometry.bytes_per_page);
        let page_map = Mutex::new(IndexPageMap::new(geometry));

        let mut chapter = OpenChapter::new(20).unwrap();
        for i in 0..20u32 {
            chapter.put(&name(i), [i as u8; RECORD_DATA_SIZE]).unwrap();
        }

        let outcome = write_chapter(&geometry, 1, 0, &[chapter], &|_| true, &volume, &page_map).unwrap();
        assert_eq!(outcome.record_count, 20);

        let physical = geometry.physical_chapter(0);
        let mut found = 0;
        for page_index in 0..geometry.record_pages_per_chapter {
            match volume
                .get_page_protected(physical, geometry.index_pages_per_chapter + page_index)
                .unwrap()
            {
                PageQuery::Ready(bytes) => {
                    for i in 0..20u32 {
                        if scan_record_page(&bytes, &name(i)).is_some() {
                            found += 1;
                        }
                    }
                }
                PageQuery::Queued => unreachable!(),
            }
        }
        assert_eq!(found, 20);
    }

    #[test]
    fn submit_chapter_reports_running_count_and_writer_commits_once() {
        let geometry = geometry();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Arc::new(Mutex::new(IndexPageMap::new(geometry)));
        let writer = ChapterWriter::new(geometry, 2, 1, volume, page_map, Arc::new(|_: &RecordName| true));
        writer.spawn();

        let mut chapter_a = OpenChapter::new(10).unwrap();
        chapter_a.put(&name(1), [1u8; RECORD_DATA_SIZE]).unwrap();
        let mut chapter_b = OpenChapter::new(10).unwrap();
        chapter_b.put(&name(2), [2u8; RECORD_DATA_SIZE]).unwrap();

        assert_eq!(writer.submit_chapter(0, chapter_a, 5), 1);
        assert_eq!(writer.submit_chapter(1, chapter_b, 5), 2);

        writer.wait_for_chapter(5).unwrap();
        writer.stop();
    }
}
