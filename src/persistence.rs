// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! On-disk layout for the state this crate owns across a clean close and
//! reopen.
//!
//! The paged volume store itself persists on its own (see
//! [`crate::volume_store`]); what lives here is the side state a reopen
//! needs to resume without a full rebuild: the [`Config`] a volume was
//! created under, the volume index, every zone's open-chapter snapshot, and
//! the index-page-map sidecar. Each file is written with
//! [`crate::file::rewrite_atomic`] so a crash mid-save leaves the previous
//! snapshot intact rather than a half-written one; absence of either
//! snapshot file on open means recovery from the volume store is needed
//! instead (spec.md §6).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::path::Path;

use crate::chapter::index_page_map::IndexPageMap;
use crate::chapter::open_chapter::OpenChapter;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::file::{self, CONFIG_FILE, INDEX_PAGE_MAP_FILE, OPEN_CHAPTER_SNAPSHOT_FILE, VOLUME_INDEX_SNAPSHOT_FILE};
use crate::volume_index::VolumeIndex;

/// Borrowed view of everything [`save`] writes out.
pub struct Snapshot<'a> {
    pub config: &'a Config,
    pub volume_index: &'a VolumeIndex,
    pub open_chapters: &'a [OpenChapter],
    pub page_map: &'a IndexPageMap,
}

/// The state [`load`] recovers, ready to hand to the zone scheduler.
pub struct Loaded {
    pub config: Config,
    pub volume_index: VolumeIndex,
    pub open_chapters: Vec<OpenChapter>,
    pub page_map: IndexPageMap,
}

/// `true` if a clean snapshot is present at `dir`. `false` means either
/// `dir` has never been saved to, or a prior save was interrupted before
/// both snapshot files landed; either way the caller should rebuild from
/// the volume store rather than trust what's here.
#[must_use]
pub fn is_clean(dir: &Path) -> bool {
    dir.join(VOLUME_INDEX_SNAPSHOT_FILE).is_file() && dir.join(OPEN_CHAPTER_SNAPSHOT_FILE).is_file()
}

/// Writes every file of `snapshot` to `dir`, creating it if needed, and
/// fsyncs the directory entry once all of them have landed.
pub fn save(dir: &Path, snapshot: &Snapshot<'_>) -> Result<()> {
    std::fs::create_dir_all(dir)?;

    let mut config_bytes = Vec::new();
    snapshot.config.write(&mut config_bytes)?;
    file::rewrite_atomic(dir.join(CONFIG_FILE), &config_bytes)?;

    let zone_count = snapshot.volume_index.zone_count();
    let mut volume_index_bytes = Vec::new();
    volume_index_bytes.write_u32::<LittleEndian>(zone_count)?;
    for zone in 0..zone_count {
        let mut zone_bytes = Vec::new();
        snapshot.volume_index.save_zone(zone, &mut zone_bytes)?;
        volume_index_bytes.write_u64::<LittleEndian>(zone_bytes.len() as u64)?;
        volume_index_bytes.extend_from_slice(&zone_bytes);
    }
    file::rewrite_atomic(dir.join(VOLUME_INDEX_SNAPSHOT_FILE), &volume_index_bytes)?;

    let mut open_chapter_bytes = Vec::new();
    open_chapter_bytes.write_u32::<LittleEndian>(snapshot.open_chapters.len() as u32)?;
    for chapter in snapshot.open_chapters {
        let mut chapter_bytes = Vec::new();
        chapter.write(&mut chapter_bytes)?;
        open_chapter_bytes.write_u64::<LittleEndian>(chapter_bytes.len() as u64)?;
        open_chapter_bytes.extend_from_slice(&chapter_bytes);
    }
    file::rewrite_atomic(dir.join(OPEN_CHAPTER_SNAPSHOT_FILE), &open_chapter_bytes)?;

    let mut page_map_bytes = Vec::new();
    snapshot.page_map.write(&mut page_map_bytes)?;
    file::rewrite_atomic(dir.join(INDEX_PAGE_MAP_FILE), &page_map_bytes)?;

    file::fsync_directory(dir)?;
    Ok(())
}

/// Recovers a clean snapshot from `dir`. Callers should check
/// [`is_clean`] first; this returns [`Error::Io`] with a not-found kind if
/// either snapshot file is missing.
pub fn load(dir: &Path) -> Result<Loaded> {
    let config_bytes = std::fs::read(dir.join(CONFIG_FILE))?;
    let config = Config::read(&mut config_bytes.as_slice())?;

    let mut volume_index = VolumeIndex::new(
        config.geometry,
        config.volume_index_list_count,
        config.zone_count,
        config.volume_index_mean_delta,
        config.volume_index_zone_memory_bytes,
    )?;

    let volume_index_bytes = std::fs::read(dir.join(VOLUME_INDEX_SNAPSHOT_FILE))?;
    let mut reader = volume_index_bytes.as_slice();
    let saved_zone_count = reader.read_u32::<LittleEndian>()?;
    if saved_zone_count != config.zone_count {
        return Err(Error::CorruptData(
            "volume index snapshot's zone count does not match its config",
        ));
    }
    for zone in 0..saved_zone_count {
        let len = reader.read_u64::<LittleEndian>()? as usize;
        if len > reader.len() {
            return Err(Error::CorruptData("volume index snapshot is truncated"));
        }
        let (chunk, rest) = reader.split_at(len);
        volume_index.load_zone(zone, &mut &*chunk)?;
        reader = rest;
    }

    let open_chapter_bytes = std::fs::read(dir.join(OPEN_CHAPTER_SNAPSHOT_FILE))?;
    let mut reader = open_chapter_bytes.as_slice();
    let chapter_count = reader.read_u32::<LittleEndian>()?;
    let mut open_chapters = Vec::with_capacity(chapter_count as usize);
    for _ in 0..chapter_count {
        let len = reader.read_u64::<LittleEndian>()? as usize;
        if len > reader.len() {
            return Err(Error::CorruptData("open chapter snapshot is truncated"));
        }
        let (chunk, rest) = reader.split_at(len);
        open_chapters.push(OpenChapter::read(&mut &*chunk)?);
        reader = rest;
    }

    let page_map_bytes = std::fs::read(dir.join(INDEX_PAGE_MAP_FILE))?;
    let page_map = IndexPageMap::read(&mut page_map_bytes.as_slice(), config.geometry)?;

    Ok(Loaded {
        config,
        volume_index,
        open_chapters,
        page_map,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;
    use crate::record_name::RECORD_NAME_SIZE;
    use crate::record_name::RecordName;
    use test_log::test;

    fn geometry() -> Geometry {
        Geometry::new(4, 64, 2, 6, 4096, 14, 6, 0, 0).unwrap()
    }

    fn name(tag: u8) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[0] = tag;
        RecordName::new(bytes)
    }

    #[test]
    fn fresh_directory_is_not_clean() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_clean(dir.path()));
    }

    #[test]
    fn save_then_load_round_trips_every_component() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::builder(geometry()).zone_count(2).nonce(77).build().unwrap();

        let mut volume_index = VolumeIndex::new(
            config.geometry,
            config.volume_index_list_count,
            config.zone_count,
            config.volume_index_mean_delta,
            config.volume_index_zone_memory_bytes,
        )
        .unwrap();
        volume_index.put_record(&name(1), 3).unwrap();
        volume_index.set_zone_open_chapter(0, 5);
        volume_index.set_zone_open_chapter(1, 5);

        let mut chapter_zero = OpenChapter::new(8).unwrap();
        chapter_zero.put(&name(2), [9u8; 16]).unwrap();
        let chapter_one = OpenChapter::new(8).unwrap();
        let open_chapters = vec![chapter_zero, chapter_one];

        let page_map = IndexPageMap::new(config.geometry);

        save(
            dir.path(),
            &Snapshot {
                config: &config,
                volume_index: &volume_index,
                open_chapters: &open_chapters,
                page_map: &page_map,
            },
        )
        .unwrap();

        assert!(is_clean(dir.path()));

        let mut loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.config.zone_count, 2);
        assert_eq!(loaded.config.nonce, 77);
        assert_eq!(loaded.volume_index.lookup(&name(1)).unwrap(), Some(3));
        assert_eq!(loaded.open_chapters.len(), 2);
        assert_eq!(loaded.open_chapters[0].search(&name(2)), Some(&[9u8; 16]));
        assert_eq!(loaded.open_chapters[1].size(), 0);
        assert_eq!(loaded.page_map.last_update(), 0);
    }
}
