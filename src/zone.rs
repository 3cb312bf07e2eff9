// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The zone scheduler: one worker thread per zone, each owning its own
//! open chapter and processing [`Request`]s and [`ControlMessage`]s from a
//! dedicated queue in FIFO order.
//!
//! Routing a request to its zone is cheap and lock-light (a single read
//! lock over the volume index), so it happens inline in
//! [`ZoneScheduler::enqueue`] rather than behind a dedicated triage thread.
//! A separate [`TriageMessage`]-driven relay thread exists only when the
//! geometry is sparse and there is more than one zone: it serializes the
//! decision to admit a sparse chapter into the shared cache and broadcasts
//! a [`ControlMessage::SparseCacheBarrier`] to every zone queue, so that
//! every zone worker reaches [`crate::sparse_cache::SparseCache::update_sparse_cache`]
//! for that chapter exactly once, including zones with no request of their
//! own waiting on it. The requesting zone re-enqueues its own request
//! behind that broadcast (`requeued = true`) so it is retried once the
//! barrier has been satisfied.

use std::sync::{Arc, Mutex, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, trace, warn};

use crate::bits::huffman::compute_coding_constants;
use crate::chapter::chapter_index::{chapter_delta_address, chapter_delta_list, mean_delta_for_chapter_index, value_bits_for_chapter_index};
use crate::chapter::index_page_map::IndexPageMap;
use crate::chapter::open_chapter::OpenChapter;
use crate::chapter::writer::{scan_record_page, ChapterWriter};
use crate::chapter::RecordData;
use crate::config::Config;
use crate::delta_index::immutable;
use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::record_name::RecordName;
use crate::request::{ControlMessage, Location, Request, RequestKind};
use crate::sparse_cache::SparseCache;
use crate::volume_index::VolumeIndex;
use crate::volume_store::{PageQuery, VolumePageCache};

enum ZoneMessage {
    Data(Request),
    Control(ControlMessage),
}

enum TriageMessage {
    /// A zone worker needs `virtual_chapter` admitted into the sparse
    /// cache and cannot join the barrier alone.
    Promote { virtual_chapter: u64 },
    Stop,
}

/// Where a name ultimately resolved, carrying what a dispatch needs to
/// finish the request: the metadata, and (for committed locations) whether
/// it came from the sparse or dense region.
enum Located {
    InOpenChapter(RecordData),
    Committed { metadata: RecordData, sparse: bool },
}

impl Located {
    fn location(&self) -> Location {
        match self {
            Self::InOpenChapter(_) => Location::InOpenChapter,
            Self::Committed { sparse: true, .. } => Location::InSparse,
            Self::Committed { sparse: false, .. } => Location::InDense,
        }
    }

    fn metadata(&self) -> RecordData {
        match self {
            Self::InOpenChapter(m) | Self::Committed { metadata: m, .. } => *m,
        }
    }
}

enum LocateOutcome {
    Found(Located),
    Absent,
    /// A sparse chapter needs barrier admission and this zone cannot
    /// satisfy the barrier alone; the caller must requeue its request and
    /// return without completing it.
    NeedsPromotion(u64),
}

struct Shared {
    geometry: Geometry,
    zone_count: u32,
    volume_index: Arc<RwLock<VolumeIndex>>,
    chapter_writer: Arc<ChapterWriter>,
    sparse_cache: Option<Arc<SparseCache>>,
    page_map: Arc<Mutex<IndexPageMap>>,
    volume: Arc<dyn VolumePageCache>,
    nonce: u64,
    zone_senders: Vec<Sender<ZoneMessage>>,
    triage_sender: Option<Sender<TriageMessage>>,
}

struct ZoneWorker {
    zone_number: u32,
    shared: Arc<Shared>,
    receiver: Receiver<ZoneMessage>,
    own_sender: Sender<ZoneMessage>,
    open_chapter: OpenChapter,
    current_virtual_chapter: u64,
    capacity: u32,
}

impl ZoneWorker {
    fn run(mut self) {
        loop {
            match self.receiver.recv() {
                Ok(ZoneMessage::Data(request)) => self.dispatch(request),
                Ok(ZoneMessage::Control(ControlMessage::AnnounceChapterClosed(vcn))) => {
                    if self.current_virtual_chapter == vcn {
                        self.close_and_submit(true);
                    }
                }
                Ok(ZoneMessage::Control(ControlMessage::SparseCacheBarrier(vcn))) => {
                    if let Some(cache) = &self.shared.sparse_cache {
                        if let Err(e) = cache.update_sparse_cache(vcn) {
                            warn!("zone {} sparse cache barrier for vcn={vcn} failed: {e}", self.zone_number);
                        }
                    }
                }
                Ok(ZoneMessage::Control(ControlMessage::Stop)) | Err(_) => break,
            }
        }
        debug!("zone {} worker exiting", self.zone_number);
    }

    fn dispatch(&mut self, request: Request) {
        match request.kind {
            RequestKind::Post => self.dispatch_post(request),
            RequestKind::Query => self.dispatch_query(request, true),
            RequestKind::QueryNoUpdate => self.dispatch_query(request, false),
            RequestKind::Update => self.dispatch_update(request),
            RequestKind::Delete => self.dispatch_delete(request),
        }
    }

    fn dispatch_post(&mut self, mut request: Request) {
        match self.locate(&request.name) {
            Ok(LocateOutcome::NeedsPromotion(vcn)) => self.requeue_for_promotion(request, vcn),
            Ok(LocateOutcome::Found(located)) => {
                request.found = true;
                request.location = located.location();
                if matches!(located, Located::Committed { .. }) {
                    self.refresh_chapter(&request.name);
                }
                request.complete();
            }
            Ok(LocateOutcome::Absent) => {
                let metadata = request.new_metadata.expect("post request carries metadata");
                match self.insert_new(&request.name, metadata) {
                    Ok(()) => {
                        request.found = false;
                        request.location = Location::InOpenChapter;
                        request.complete();
                    }
                    Err(e) => {
                        request.fail(&e);
                        request.complete();
                    }
                }
            }
            Err(e) => {
                request.fail(&e);
                request.complete();
            }
        }
    }

    fn dispatch_query(&mut self, mut request: Request, refresh_on_hit: bool) {
        match self.locate(&request.name) {
            Ok(LocateOutcome::NeedsPromotion(vcn)) => self.requeue_for_promotion(request, vcn),
            Ok(LocateOutcome::Found(located)) => {
                request.found = true;
                request.location = located.location();
                request.old_metadata = Some(located.metadata());
                if refresh_on_hit && matches!(located, Located::Committed { .. }) {
                    self.refresh_chapter(&request.name);
                }
                request.complete();
            }
            Ok(LocateOutcome::Absent) => {
                request.found = false;
                request.complete();
            }
            Err(e) => {
                request.fail(&e);
                request.complete();
            }
        }
    }

    fn dispatch_update(&mut self, mut request: Request) {
        let metadata = request.new_metadata.expect("update request carries metadata");
        match self.locate(&request.name) {
            Ok(LocateOutcome::NeedsPromotion(vcn)) => self.requeue_for_promotion(request, vcn),
            Ok(LocateOutcome::Found(Located::InOpenChapter(_))) => {
                let _ = self.open_chapter.put(&request.name, metadata);
                request.found = true;
                request.location = Location::InOpenChapter;
                request.complete();
            }
            Ok(LocateOutcome::Found(Located::Committed { .. })) => {
                // Committed chapter pages are immutable, so an update is a
                // logical overwrite: append a fresh copy to the current
                // open chapter and redirect the index pointer at it. The
                // stale copy ages out naturally when its chapter cycles
                // off the ring.
                match self.insert_new(&request.name, metadata) {
                    Ok(()) => {
                        request.found = true;
                        request.location = Location::InOpenChapter;
                        request.complete();
                    }
                    Err(e) => {
                        request.fail(&e);
                        request.complete();
                    }
                }
            }
            Ok(LocateOutcome::Absent) => {
                request.found = false;
                request.fail(&Error::NotFound);
                request.complete();
            }
            Err(e) => {
                request.fail(&e);
                request.complete();
            }
        }
    }

    fn dispatch_delete(&mut self, mut request: Request) {
        match self.locate(&request.name) {
            Ok(LocateOutcome::NeedsPromotion(vcn)) => self.requeue_for_promotion(request, vcn),
            Ok(LocateOutcome::Found(located)) => {
                request.found = true;
                request.location = located.location();
                if matches!(located, Located::InOpenChapter(_)) {
                    self.open_chapter.remove(&request.name);
                }
                let mut index = self.shared.volume_index.write().expect("volume index lock poisoned");
                match index.get_record(&request.name) {
                    Ok(record) => {
                        if let Err(e) = index.remove_record(&record) {
                            debug!("failed to remove volume-index entry on delete: {e}");
                        }
                    }
                    Err(e) => debug!("failed to locate volume-index entry to delete: {e}"),
                }
                request.complete();
            }
            Ok(LocateOutcome::Absent) => {
                request.found = false;
                request.complete();
            }
            Err(e) => {
                request.fail(&e);
                request.complete();
            }
        }
    }

    fn requeue_for_promotion(&self, mut request: Request, virtual_chapter: u64) {
        trace!("zone {} requesting promotion of vcn={virtual_chapter}", self.zone_number);
        if let Some(triage) = &self.shared.triage_sender {
            let _ = triage.send(TriageMessage::Promote { virtual_chapter });
        }
        request.requeued = true;
        let _ = self.own_sender.send(ZoneMessage::Data(request));
    }

    /// Redirects the volume-index pointer for `name` to the current open
    /// chapter without moving any data. This is the "dedupe hit, keep this
    /// block live" refresh shared by `Post` and `Query` hits against a
    /// committed chapter.
    fn refresh_chapter(&self, name: &RecordName) {
        let result = self
            .shared
            .volume_index
            .write()
            .expect("volume index lock poisoned")
            .put_record(name, self.current_virtual_chapter);
        if let Err(e) = result {
            debug!("failed to refresh chapter pointer: {e}");
        }
    }

    fn insert_new(&mut self, name: &RecordName, metadata: RecordData) -> Result<()> {
        match self.open_chapter.put(name, metadata) {
            Ok(_) => {}
            Err(Error::Overflow) => {
                self.close_and_submit(false);
                self.open_chapter.put(name, metadata)?;
            }
            Err(e) => return Err(e),
        }

        self.shared
            .volume_index
            .write()
            .expect("volume index lock poisoned")
            .put_record(name, self.current_virtual_chapter)
    }

    /// Finds `name`, performing whatever reads or barrier joins are needed
    /// along the way. Never mutates the open chapter.
    fn locate(&mut self, name: &RecordName) -> Result<LocateOutcome> {
        if let Some(metadata) = self.open_chapter.search(name) {
            return Ok(LocateOutcome::Found(Located::InOpenChapter(*metadata)));
        }

        let vcn = self
            .shared
            .volume_index
            .write()
            .expect("volume index lock poisoned")
            .lookup(name)?;

        let Some(vcn) = vcn else {
            return Ok(LocateOutcome::Absent);
        };

        self.shared.chapter_writer.wait_for_chapter(vcn)?;
        let physical = self.shared.geometry.physical_chapter(vcn);
        let sparse = self.shared.geometry.is_chapter_sparse(vcn, self.current_virtual_chapter);

        let present = if sparse {
            let cache = self.shared.sparse_cache.as_ref().expect("sparse geometry implies a cache");
            if !cache.contains(vcn) {
                if self.shared.zone_count == 1 {
                    cache.update_sparse_cache(vcn)?;
                } else {
                    return Ok(LocateOutcome::NeedsPromotion(vcn));
                }
            }
            cache.search(vcn, name)?.is_some()
        } else {
            self.search_dense_index(physical, vcn, name)?.is_some()
        };

        if !present {
            return Ok(LocateOutcome::Absent);
        }

        match self.read_record(physical, name)? {
            Some(metadata) => Ok(LocateOutcome::Found(Located::Committed { metadata, sparse })),
            None => Ok(LocateOutcome::Absent),
        }
    }

    fn search_dense_index(&self, physical: u32, vcn: u64, name: &RecordName) -> Result<Option<u32>> {
        let page_index = {
            let page_map = self.shared.page_map.lock().expect("index page map mutex poisoned");
            page_map.find_index_page(name, physical)?
        };
        let bytes = self.read_page(physical, page_index)?;
        let header = immutable::verify_page(self.shared.nonce, &bytes)?;
        if header.virtual_chapter != vcn {
            return Err(Error::CorruptData(
                "index page virtual chapter does not match the volume-index mapping",
            ));
        }

        let list_number = chapter_delta_list(name, &self.shared.geometry);
        let key = chapter_delta_address(name, &self.shared.geometry);
        let coding = compute_coding_constants(mean_delta_for_chapter_index(&self.shared.geometry));
        let value_bits = value_bits_for_chapter_index(&self.shared.geometry);
        immutable::search_list(&bytes, &header, value_bits, coding, list_number, key, name)
    }

    fn read_record(&self, physical: u32, name: &RecordName) -> Result<Option<RecordData>> {
        for page_index in 0..self.shared.geometry.record_pages_per_chapter {
            let bytes = self.read_page(physical, self.shared.geometry.index_pages_per_chapter + page_index)?;
            if let Some(metadata) = scan_record_page(&bytes, name) {
                return Ok(Some(metadata));
            }
        }
        Ok(None)
    }

    /// Retries a `Queued` page read by yielding rather than suspending the
    /// request: the volume page cache's own readiness is all that's being
    /// waited out here, and building a full asynchronous completion path
    /// for it is out of scope (the page cache is an external collaborator;
    /// see [`crate::volume_store::VolumePageCache`]).
    fn read_page(&self, physical: u32, page_index: u32) -> Result<Arc<[u8]>> {
        loop {
            match self.shared.volume.get_page_protected(physical, page_index)? {
                PageQuery::Ready(bytes) => return Ok(bytes),
                PageQuery::Queued => std::thread::yield_now(),
            }
        }
    }

    fn close_and_submit(&mut self, from_announcement: bool) {
        let vcn = self.current_virtual_chapter;
        let chapter = std::mem::replace(
            &mut self.open_chapter,
            OpenChapter::new(self.capacity).expect("capacity was already validated"),
        );
        self.shared.chapter_writer.submit_chapter(self.zone_number, chapter, vcn);
        self.current_virtual_chapter += 1;
        self.shared
            .volume_index
            .write()
            .expect("volume index lock poisoned")
            .set_zone_open_chapter(self.zone_number, self.current_virtual_chapter);

        debug!("zone {} closed vcn={vcn}", self.zone_number);

        if !from_announcement {
            for (zone_number, sender) in self.shared.zone_senders.iter().enumerate() {
                if zone_number as u32 != self.zone_number {
                    let _ = sender.send(ZoneMessage::Control(ControlMessage::AnnounceChapterClosed(vcn)));
                }
            }
        }
    }
}

/// Runs the triage relay. Remembers the last virtual chapter it broadcast a
/// barrier for and elides an identical back-to-back repeat: once the first
/// promotion's barrier has gone out, every zone either already has the
/// chapter cached or is about to, so a second promotion for the same vcn
/// arriving before the cache catches up needs no further broadcast.
fn run_triage(receiver: Receiver<TriageMessage>, zone_senders: Vec<Sender<ZoneMessage>>, sparse_cache: Arc<SparseCache>) {
    let mut last_broadcast: Option<u64> = None;
    loop {
        match receiver.recv() {
            Ok(TriageMessage::Promote { virtual_chapter }) => {
                if sparse_cache.contains(virtual_chapter) {
                    continue;
                }
                if last_broadcast == Some(virtual_chapter) {
                    trace!("triage eliding repeat barrier for vcn={virtual_chapter}");
                    continue;
                }
                trace!("triage broadcasting sparse cache barrier for vcn={virtual_chapter}");
                for sender in &zone_senders {
                    let _ = sender.send(ZoneMessage::Control(ControlMessage::SparseCacheBarrier(virtual_chapter)));
                }
                last_broadcast = Some(virtual_chapter);
            }
            Ok(TriageMessage::Stop) | Err(_) => break,
        }
    }
}

/// The top-level request router: one worker thread per zone, plus an
/// optional triage relay thread for sparse multi-zone barrier admission.
pub struct ZoneScheduler {
    zone_senders: Vec<Sender<ZoneMessage>>,
    triage_sender: Option<Sender<TriageMessage>>,
    threads: Mutex<Vec<std::thread::JoinHandle<()>>>,
    volume_index: Arc<RwLock<VolumeIndex>>,
    chapter_writer: Arc<ChapterWriter>,
    sparse_cache: Option<Arc<SparseCache>>,
}

impl ZoneScheduler {
    /// Starts the scheduler fresh: every zone's open chapter begins empty at
    /// `starting_virtual_chapter` (`0` for a brand new index).
    pub fn new(
        config: &Config,
        volume: Arc<dyn VolumePageCache>,
        page_map: Arc<Mutex<IndexPageMap>>,
        volume_index: Arc<RwLock<VolumeIndex>>,
        starting_virtual_chapter: u64,
    ) -> Result<Self> {
        let zone_count = config.zone_count;
        let open_chapters = (0..zone_count)
            .map(|_| OpenChapter::new(Self::zone_capacity(config.geometry, zone_count).max(1)))
            .collect::<Result<Vec<_>>>()?;
        let starting_virtual_chapters = vec![starting_virtual_chapter; zone_count as usize];
        Self::build(config, volume, page_map, volume_index, open_chapters, starting_virtual_chapters)
    }

    /// Resumes the scheduler from a reopened index: `open_chapters[zone]`
    /// and `starting_virtual_chapters[zone]` come from a loaded
    /// [`crate::chapter::open_chapter::OpenChapter`] snapshot and the
    /// volume index's recorded per-zone open chapter, respectively (see
    /// [`crate::persistence`]).
    pub fn resume(
        config: &Config,
        volume: Arc<dyn VolumePageCache>,
        page_map: Arc<Mutex<IndexPageMap>>,
        volume_index: Arc<RwLock<VolumeIndex>>,
        open_chapters: Vec<OpenChapter>,
        starting_virtual_chapters: Vec<u64>,
    ) -> Result<Self> {
        Self::build(config, volume, page_map, volume_index, open_chapters, starting_virtual_chapters)
    }

    fn zone_capacity(geometry: Geometry, zone_count: u32) -> u32 {
        (geometry.records_per_chapter + zone_count - 1) / zone_count
    }

    fn build(
        config: &Config,
        volume: Arc<dyn VolumePageCache>,
        page_map: Arc<Mutex<IndexPageMap>>,
        volume_index: Arc<RwLock<VolumeIndex>>,
        open_chapters: Vec<OpenChapter>,
        starting_virtual_chapters: Vec<u64>,
    ) -> Result<Self> {
        let zone_count = config.zone_count;
        let geometry = config.geometry;

        if open_chapters.len() != zone_count as usize || starting_virtual_chapters.len() != zone_count as usize {
            return Err(Error::InvalidArgument(
                "open chapter and starting virtual chapter counts must match zone_count",
            ));
        }

        let sparse_cache = if geometry.is_sparse() {
            Some(Arc::new(SparseCache::new(
                geometry,
                config.nonce,
                Arc::clone(&volume),
                zone_count,
                config.sparse_cache_capacity,
            )?))
        } else {
            None
        };

        let sample_predicate: Arc<dyn Fn(&RecordName) -> bool + Send + Sync> = {
            let volume_index = Arc::clone(&volume_index);
            Arc::new(move |name: &RecordName| volume_index.read().expect("volume index lock poisoned").is_sample(name))
        };

        let chapter_writer = ChapterWriter::new(
            geometry,
            zone_count,
            config.nonce,
            Arc::clone(&volume),
            Arc::clone(&page_map),
            sample_predicate,
        );
        chapter_writer.spawn();

        let mut senders = Vec::with_capacity(zone_count as usize);
        let mut receivers = Vec::with_capacity(zone_count as usize);
        for _ in 0..zone_count {
            let (tx, rx) = unbounded();
            senders.push(tx);
            receivers.push(rx);
        }

        let triage_sender = if zone_count > 1 && geometry.is_sparse() {
            let (tx, rx) = unbounded::<TriageMessage>();
            let zone_senders = senders.clone();
            let cache = Arc::clone(sparse_cache.as_ref().expect("sparse geometry implies a cache"));
            std::thread::spawn(move || run_triage(rx, zone_senders, cache));
            Some(tx)
        } else {
            None
        };

        {
            let mut index = volume_index.write().expect("volume index lock poisoned");
            for (zone_number, &vcn) in starting_virtual_chapters.iter().enumerate() {
                index.set_zone_open_chapter(zone_number as u32, vcn);
            }
        }

        let shared = Arc::new(Shared {
            geometry,
            zone_count,
            volume_index: Arc::clone(&volume_index),
            chapter_writer: Arc::clone(&chapter_writer),
            sparse_cache: sparse_cache.clone(),
            page_map,
            volume,
            nonce: config.nonce,
            zone_senders: senders.clone(),
            triage_sender: triage_sender.clone(),
        });

        let capacity = Self::zone_capacity(geometry, zone_count).max(1);

        let mut threads = Vec::with_capacity(zone_count as usize);
        for (zone_number, (receiver, open_chapter)) in receivers.into_iter().zip(open_chapters).enumerate() {
            let zone_number = zone_number as u32;
            let worker = ZoneWorker {
                zone_number,
                shared: Arc::clone(&shared),
                receiver,
                own_sender: senders[zone_number as usize].clone(),
                open_chapter,
                current_virtual_chapter: starting_virtual_chapters[zone_number as usize],
                capacity,
            };
            threads.push(std::thread::spawn(move || worker.run()));
        }

        Ok(Self {
            zone_senders: senders,
            triage_sender,
            threads: Mutex::new(threads),
            volume_index,
            chapter_writer,
            sparse_cache,
        })
    }

    #[must_use]
    pub fn zone_count(&self) -> u32 {
        self.zone_senders.len() as u32
    }

    /// Routes `request` to its owning zone and enqueues it. The request's
    /// completion callback, if any, runs on that zone's worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume-index lookup fails, or if the target
    /// zone's worker has already stopped.
    pub fn enqueue(&self, mut request: Request) -> Result<()> {
        let zone = self
            .volume_index
            .read()
            .expect("volume index lock poisoned")
            .zone_of(&request.name)?;
        request.zone = Some(zone);
        self.zone_senders[zone as usize]
            .send(ZoneMessage::Data(request))
            .map_err(|_| Error::BadState("zone worker has stopped"))
    }

    /// Signals every zone worker (and the triage thread, if any) to drain
    /// and exit, then stops the chapter writer. Requests already queued
    /// ahead of the stop signal are processed to completion first.
    pub fn stop(&self) {
        for sender in &self.zone_senders {
            let _ = sender.send(ZoneMessage::Control(ControlMessage::Stop));
        }
        if let Some(triage) = &self.triage_sender {
            let _ = triage.send(TriageMessage::Stop);
        }

        let mut threads = self.threads.lock().expect("zone scheduler mutex poisoned");
        for handle in threads.drain(..) {
            let _ = handle.join();
        }

        self.chapter_writer.stop();
    }

    #[must_use]
    pub fn sparse_cache_len(&self) -> usize {
        self.sparse_cache.as_ref().map_or(0, |c| c.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapter::writer::write_chapter;
    use crate::chapter::RECORD_DATA_SIZE;
    use crate::record_name::RECORD_NAME_SIZE;
    use crate::volume_store::InMemoryVolumeStore;
    use std::sync::mpsc;
    use test_log::test;

    fn name(tag: u8) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[0] = tag;
        bytes[8] = tag;
        RecordName::new(bytes)
    }

    fn meta(tag: u8) -> RecordData {
        [tag; RECORD_DATA_SIZE]
    }

    fn dense_geometry() -> Geometry {
        Geometry::new(4, 4, 1, 2, 4096, 14, 6, 0, 0).unwrap()
    }

    fn scheduler_for(geometry: Geometry, zone_count: u32) -> (ZoneScheduler, Arc<RwLock<VolumeIndex>>) {
        let config = Config::builder(geometry).zone_count(zone_count).build().unwrap();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Arc::new(Mutex::new(IndexPageMap::new(geometry)));
        let volume_index = Arc::new(RwLock::new(
            VolumeIndex::new(geometry, config.volume_index_list_count, zone_count, config.volume_index_mean_delta, 4096).unwrap(),
        ));
        let scheduler = ZoneScheduler::new(&config, volume, page_map, Arc::clone(&volume_index), 0).unwrap();
        (scheduler, volume_index)
    }

    fn run_and_wait(scheduler: &ZoneScheduler, request: Request) -> Request {
        let (tx, rx) = mpsc::channel();
        let request = request.on_complete(move |r| {
            let _ = tx.send(r);
        });
        scheduler.enqueue(request).unwrap();
        rx.recv().unwrap()
    }

    #[test]
    fn post_then_query_hits_open_chapter() {
        let (scheduler, _) = scheduler_for(dense_geometry(), 1);

        let first = run_and_wait(&scheduler, Request::post(name(1), meta(1)));
        assert!(!first.found);

        let second = run_and_wait(&scheduler, Request::post(name(1), meta(1)));
        assert!(second.found);
        assert_eq!(second.location, Location::InOpenChapter);

        let query = run_and_wait(&scheduler, Request::query(name(1)));
        assert!(query.found);
        assert_eq!(query.old_metadata, Some(meta(1)));

        scheduler.stop();
    }

    #[test]
    fn delete_then_query_reports_absent() {
        let (scheduler, _) = scheduler_for(dense_geometry(), 1);
        run_and_wait(&scheduler, Request::post(name(2), meta(2)));

        let deleted = run_and_wait(&scheduler, Request::delete(name(2)));
        assert!(deleted.found);

        let query = run_and_wait(&scheduler, Request::query(name(2)));
        assert!(!query.found);

        scheduler.stop();
    }

    #[test]
    fn update_in_open_chapter_overwrites_metadata() {
        let (scheduler, _) = scheduler_for(dense_geometry(), 1);
        run_and_wait(&scheduler, Request::post(name(3), meta(3)));

        let updated = run_and_wait(&scheduler, Request::update(name(3), meta(99)));
        assert!(updated.found);

        let query = run_and_wait(&scheduler, Request::query(name(3)));
        assert_eq!(query.old_metadata, Some(meta(99)));

        scheduler.stop();
    }

    #[test]
    fn query_after_chapter_commit_finds_record_in_dense_storage() {
        let geometry = dense_geometry();
        let (scheduler, _) = scheduler_for(geometry, 1);

        // records_per_chapter == 4 and zone_count == 1, so posting a 5th
        // distinct name forces the first chapter closed and committed.
        for tag in 0..4u8 {
            run_and_wait(&scheduler, Request::post(name(tag), meta(tag)));
        }
        run_and_wait(&scheduler, Request::post(name(200), meta(200)));

        let query = run_and_wait(&scheduler, Request::query(name(2)));
        assert!(query.found);
        assert_eq!(query.location, Location::InDense);
        assert_eq!(query.old_metadata, Some(meta(2)));

        scheduler.stop();
    }

    #[test]
    fn sparse_lookup_admits_via_triage_broadcast_with_an_idle_zone() {
        let geometry = Geometry::new(4, 8, 1, 2, 4096, 14, 6, 2, 1).unwrap();
        let nonce = 5;
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Arc::new(Mutex::new(IndexPageMap::new(geometry)));

        // Commit a chapter directly, bypassing the scheduler, the same way
        // the sparse-cache and chapter-writer tests build fixtures.
        let mut chapter = OpenChapter::new(geometry.records_per_chapter).unwrap();
        chapter.put(&name(9), meta(9)).unwrap();
        write_chapter(&geometry, nonce, 0, &[chapter], &|_| true, volume.as_ref(), &page_map).unwrap();

        let zone_count = 2;
        let volume_index = Arc::new(RwLock::new(VolumeIndex::new(geometry, 8, zone_count, 20, 4096).unwrap()));
        volume_index.write().unwrap().put_record(&name(9), 0).unwrap();

        let config = Config::builder(geometry)
            .zone_count(zone_count)
            .nonce(nonce)
            .sparse_cache_capacity(2)
            .build()
            .unwrap();

        // current_virtual_chapter == 3 makes vcn 0 sparse: dense_span = 4 - 2 = 2.
        let scheduler = ZoneScheduler::new(&config, volume, page_map, Arc::clone(&volume_index), 3).unwrap();

        let query = run_and_wait(&scheduler, Request::query_no_update(name(9)));
        assert!(query.found, "{query:?}");
        assert_eq!(query.location, Location::InSparse);
        assert_eq!(query.old_metadata, Some(meta(9)));
        assert_eq!(scheduler.sparse_cache_len(), 1);

        scheduler.stop();
    }

    #[test]
    fn resume_restores_the_zones_open_chapter_contents() {
        let geometry = dense_geometry();
        let config = Config::builder(geometry).zone_count(1).build().unwrap();
        let volume: Arc<dyn VolumePageCache> = Arc::new(InMemoryVolumeStore::new(geometry.bytes_per_page));
        let page_map = Arc::new(Mutex::new(IndexPageMap::new(geometry)));
        let volume_index = Arc::new(RwLock::new(
            VolumeIndex::new(geometry, config.volume_index_list_count, 1, config.volume_index_mean_delta, 4096).unwrap(),
        ));

        let mut restored = OpenChapter::new(4).unwrap();
        restored.put(&name(1), meta(1)).unwrap();
        volume_index.write().unwrap().put_record(&name(1), 7).unwrap();

        let scheduler =
            ZoneScheduler::resume(&config, volume, page_map, Arc::clone(&volume_index), vec![restored], vec![7]).unwrap();

        let query = run_and_wait(&scheduler, Request::query_no_update(name(1)));
        assert!(query.found, "{query:?}");
        assert_eq!(query.location, Location::InOpenChapter);
        assert_eq!(query.old_metadata, Some(meta(1)));

        scheduler.stop();
    }
}
