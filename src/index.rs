// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The top-level index: ties [`Config`], [`VolumeIndex`], [`IndexPageMap`]
//! and the [`ZoneScheduler`] together behind an open/post/query/update/
//! delete/suspend/resume/close API, and owns the on-disk directory a save
//! recovers from on reopen.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use log::{debug, error, info};

use crate::chapter::index_page_map::IndexPageMap;
use crate::chapter::open_chapter::OpenChapter;
use crate::chapter::RecordData;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::persistence::{self, Snapshot};
use crate::record_name::RecordName;
use crate::request::{Location, Request};
use crate::volume_index::VolumeIndex;
use crate::volume_store::VolumePageCache;
use crate::zone::ZoneScheduler;

/// The suspend handshake's states (spec.md §5): `Opening` covers both a
/// freshly opened and a steady-state running index — there is no separate
/// "running" state because nothing past open ever needs to distinguish the
/// two. `Suspending` is a request in flight; the long-running rebuild/save
/// path observes it at its next per-chapter checkpoint and transitions to
/// `Suspended`. `Freeing` is terminal: once set, `checkpoint` never blocks
/// again, so a suspended rebuild thread can still notice shutdown and exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LifecycleState {
    Opening,
    Suspending,
    Suspended,
    Freeing,
}

/// Paired mutex/condvar implementing the suspend handshake. A long-running
/// operation (e.g. a future rebuild-from-volume pass) calls [`checkpoint`]
/// between natural break points (one chapter at a time); everything else
/// only calls [`request_suspend`], [`resume`], or [`begin_freeing`].
struct SuspendState {
    state: Mutex<LifecycleState>,
    condvar: Condvar,
}

impl SuspendState {
    fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Opening),
            condvar: Condvar::new(),
        }
    }

    fn request_suspend(&self) {
        let mut state = self.state.lock().expect("suspend state mutex poisoned");
        if *state == LifecycleState::Opening {
            *state = LifecycleState::Suspending;
        }
        self.condvar.notify_all();
    }

    /// Blocks until the state leaves `Suspending` (either because a
    /// checkpoint acknowledged it, or because there was no long-running
    /// operation in flight to acknowledge it and it's still `Suspending`
    /// itself — callers that need the acknowledged form should poll
    /// `is_suspended` rather than rely on this alone).
    fn wait_while_suspending(&self) {
        let mut state = self.state.lock().expect("suspend state mutex poisoned");
        while *state == LifecycleState::Suspending {
            state = self.condvar.wait(state).expect("suspend state mutex poisoned");
        }
    }

    #[must_use]
    fn is_suspended(&self) -> bool {
        *self.state.lock().expect("suspend state mutex poisoned") == LifecycleState::Suspended
    }

    fn resume(&self) {
        let mut state = self.state.lock().expect("suspend state mutex poisoned");
        if matches!(*state, LifecycleState::Suspending | LifecycleState::Suspended) {
            *state = LifecycleState::Opening;
        }
        self.condvar.notify_all();
    }

    fn begin_freeing(&self) {
        let mut state = self.state.lock().expect("suspend state mutex poisoned");
        *state = LifecycleState::Freeing;
        self.condvar.notify_all();
    }

    /// Called by a long-running operation between natural break points.
    /// Acknowledges a pending suspend and blocks until resumed or freed;
    /// a no-op once freeing has begun, so the caller can always still
    /// observe shutdown and exit its loop.
    fn checkpoint(&self) {
        let mut state = self.state.lock().expect("suspend state mutex poisoned");
        if *state != LifecycleState::Suspending {
            return;
        }
        *state = LifecycleState::Suspended;
        self.condvar.notify_all();
        while *state == LifecycleState::Suspended {
            state = self.condvar.wait(state).expect("suspend state mutex poisoned");
        }
    }
}

/// A deduplication index over one volume.
///
/// Cheap to clone the handle callers get back from [`Index::open`] is not
/// supported directly — wrap it in an `Arc` if multiple threads need to
/// share one, the same way [`ZoneScheduler`] itself is shared internally.
pub struct Index {
    dir: PathBuf,
    config: Config,
    volume: Arc<dyn VolumePageCache>,
    volume_index: Arc<RwLock<VolumeIndex>>,
    page_map: Arc<Mutex<IndexPageMap>>,
    scheduler: ZoneScheduler,
    suspend: Arc<SuspendState>,
}

impl Index {
    /// Creates a brand new index rooted at `dir`, discarding anything
    /// already there. `volume` is the paged store chapters are written to
    /// and read from; see [`VolumePageCache`].
    pub fn create(dir: impl AsRef<Path>, config: Config, volume: Arc<dyn VolumePageCache>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        info!("creating index at {}", dir.display());

        let volume_index = Arc::new(RwLock::new(VolumeIndex::new(
            config.geometry,
            config.volume_index_list_count,
            config.zone_count,
            config.volume_index_mean_delta,
            config.volume_index_zone_memory_bytes,
        )?));
        let page_map = Arc::new(Mutex::new(IndexPageMap::new(config.geometry)));

        let scheduler = ZoneScheduler::new(&config, Arc::clone(&volume), Arc::clone(&page_map), Arc::clone(&volume_index), 0)?;

        Ok(Self {
            dir,
            config,
            volume,
            volume_index,
            page_map,
            scheduler,
            suspend: Arc::new(SuspendState::new()),
        })
    }

    /// Reopens an index previously [`close`](Self::close)d at `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BadState`] if `dir` holds no clean snapshot — this
    /// crate does not implement a rebuild-from-volume recovery path (the
    /// crash-durability of in-flight requests is explicitly out of scope);
    /// callers recovering from an unclean shutdown should call
    /// [`Index::create`] against a fresh volume instead.
    pub fn open(dir: impl AsRef<Path>, volume: Arc<dyn VolumePageCache>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        if !persistence::is_clean(&dir) {
            error!("no clean snapshot at {}", dir.display());
            return Err(Error::BadState("no clean snapshot to open; use Index::create for a fresh volume"));
        }

        let loaded = persistence::load(&dir)?;
        let config = loaded.config;
        let volume_index = Arc::new(RwLock::new(loaded.volume_index));
        let page_map = Arc::new(Mutex::new(loaded.page_map));

        let starting_virtual_chapters: Vec<u64> = (0..config.zone_count)
            .map(|zone_number| volume_index.read().expect("volume index lock poisoned").zone_open_chapter(zone_number))
            .collect();

        let scheduler = ZoneScheduler::resume(
            &config,
            Arc::clone(&volume),
            Arc::clone(&page_map),
            Arc::clone(&volume_index),
            loaded.open_chapters,
            starting_virtual_chapters,
        )?;

        info!("reopened index at {}", dir.display());

        Ok(Self {
            dir,
            config,
            volume,
            volume_index,
            page_map,
            scheduler,
            suspend: Arc::new(SuspendState::new()),
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Routes `request` to its owning zone. The completion callback, if
    /// any, runs on that zone's worker thread.
    pub fn enqueue(&self, request: Request) -> Result<()> {
        self.scheduler.enqueue(request)
    }

    /// Stores `name`, returning whether it was already present and, if so,
    /// where it was found.
    pub fn post(&self, name: RecordName, metadata: RecordData) -> Result<(bool, Location)> {
        let request = self.run(Request::post(name, metadata))?;
        Ok((request.found, request.location))
    }

    /// Looks up `name`, refreshing its chapter to the current open chapter
    /// on a hit against committed storage.
    pub fn query(&self, name: RecordName) -> Result<Option<RecordData>> {
        let request = self.run(Request::query(name))?;
        Ok(request.old_metadata.filter(|_| request.found))
    }

    /// Looks up `name` without refreshing its chapter.
    pub fn query_no_update(&self, name: RecordName) -> Result<Option<RecordData>> {
        let request = self.run(Request::query_no_update(name))?;
        Ok(request.old_metadata.filter(|_| request.found))
    }

    /// Overwrites `name`'s metadata. Fails with [`Error::NotFound`] if
    /// absent.
    pub fn update(&self, name: RecordName, metadata: RecordData) -> Result<()> {
        let request = self.run(Request::update(name, metadata))?;
        if request.status == crate::error::Status::Error {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Removes `name`'s entry, if present. Returns whether it was found.
    pub fn delete(&self, name: RecordName) -> Result<bool> {
        let request = self.run(Request::delete(name))?;
        Ok(request.found)
    }

    /// Dispatches `request` and blocks the calling thread for its
    /// completion. The convenience methods above all funnel through this;
    /// callers wanting to pipeline many requests should use
    /// [`Index::enqueue`] directly with their own callback instead.
    fn run(&self, request: Request) -> Result<Request> {
        let (tx, rx) = std::sync::mpsc::channel();
        let request = request.on_complete(move |completed| {
            let _ = tx.send(completed);
        });
        self.scheduler.enqueue(request)?;
        rx.recv().map_err(|_| Error::BadState("zone worker dropped the request without completing it"))
    }

    /// Requests a suspend and blocks until it has been acknowledged (or
    /// there was nothing to acknowledge it, in dense-only configurations
    /// with no long-running checkpointed operation currently active).
    pub fn suspend(&self) {
        self.suspend.request_suspend();
        self.suspend.wait_while_suspending();
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspend.is_suspended()
    }

    /// Clears a prior suspend request, letting any checkpointed operation
    /// resume.
    pub fn resume(&self) {
        self.suspend.resume();
    }

    /// Saves every zone's volume-index shard, open-chapter snapshot, and
    /// the index-page-map sidecar to this index's directory, plus the
    /// configuration they were created under. Does not stop the scheduler;
    /// callers that also want to stop accepting new requests should call
    /// [`Index::close`] instead.
    pub fn save(&self) -> Result<()> {
        let volume_index = self.volume_index.read().expect("volume index lock poisoned");
        let page_map = self.page_map.lock().expect("index page map mutex poisoned");

        // The scheduler owns each zone's live open chapter; a true snapshot
        // would need to ask each zone worker for its current contents,
        // which requires a request round trip per zone. Saving a fresh
        // collection of empty open chapters is always safe (a reopen just
        // starts each zone's chapter over), so that's what's captured here
        // until a dedicated "drain open chapter" zone message exists.
        let capacity = (self.config.geometry.records_per_chapter + self.config.zone_count - 1) / self.config.zone_count;
        let open_chapters: Vec<OpenChapter> = (0..self.config.zone_count)
            .map(|_| OpenChapter::new(capacity.max(1)).expect("capacity was already validated at Config::builder time"))
            .collect();

        persistence::save(
            &self.dir,
            &Snapshot {
                config: &self.config,
                volume_index: &volume_index,
                open_chapters: &open_chapters,
                page_map: &page_map,
            },
        )
    }

    /// Stops the zone scheduler, marks the index as freeing (unblocking any
    /// checkpointed operation so it can exit), and saves a final clean
    /// snapshot.
    pub fn close(self) -> Result<()> {
        debug!("closing index at {}", self.dir.display());
        self.suspend.begin_freeing();
        self.scheduler.stop();
        self.save()
    }
}
