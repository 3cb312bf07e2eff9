// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A dense sidecar mapping each chapter's index pages to the range of
//! delta lists they hold, so a lookup can binary-search straight to the
//! one index page it needs instead of reading every page in a chapter.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::record_name::RecordName;

use super::chapter_index::chapter_delta_list;

const MAGIC: &[u8; 8] = b"IPM-0001";

/// Maps `(physical_chapter, index_page)` to the highest delta-list id
/// packed into that page; lists are assigned to pages in increasing order
/// (see [`crate::delta_index::immutable::pack_page`]), so the lowest list
/// on a page is one past the previous page's highest (or `0` for the
/// first page).
pub struct IndexPageMap {
    geometry: Geometry,
    last_update: u64,
    entries: Vec<u16>,
}

impl IndexPageMap {
    /// Builds an all-zero map sized for `geometry`'s ring of chapters.
    pub fn new(geometry: Geometry) -> Self {
        let size = geometry.chapters_per_volume as usize * geometry.index_pages_per_chapter as usize;
        Self {
            geometry,
            last_update: 0,
            entries: vec![0u16; size],
        }
    }

    fn entry_index(&self, physical_chapter: u32, index_page: u32) -> usize {
        physical_chapter as usize * self.geometry.index_pages_per_chapter as usize + index_page as usize
    }

    /// Records that `index_page` (within `physical_chapter`) packs delta
    /// lists up to and including `highest_delta_list`.
    pub fn update(&mut self, virtual_chapter: u64, physical_chapter: u32, index_page: u32, highest_delta_list: u32) {
        let idx = self.entry_index(physical_chapter, index_page);
        #[allow(clippy::cast_possible_truncation)]
        {
            self.entries[idx] = highest_delta_list as u16;
        }
        self.last_update = self.last_update.max(virtual_chapter);
    }

    /// Finds the index page within `physical_chapter` that contains
    /// `name`'s delta list.
    pub fn find_index_page(&self, name: &RecordName, physical_chapter: u32) -> Result<u32> {
        let target_list = chapter_delta_list(name, &self.geometry);
        let pages = self.geometry.index_pages_per_chapter;
        let base = self.entry_index(physical_chapter, 0);

        let slice = &self.entries[base..base + pages as usize];
        match slice.binary_search(&(target_list as u16)) {
            Ok(i) | Err(i) if i < slice.len() => Ok(i as u32),
            _ => Err(Error::CorruptData("index page map has no page covering this delta list")),
        }
    }

    /// The inclusive `[lowest, highest]` delta-list range assigned to a
    /// given index page.
    #[must_use]
    pub fn list_number_bounds(&self, physical_chapter: u32, index_page: u32) -> (u32, u32) {
        let idx = self.entry_index(physical_chapter, index_page);
        let highest = u32::from(self.entries[idx]);
        let lowest = if index_page == 0 {
            0
        } else {
            u32::from(self.entries[idx - 1]) + 1
        };
        (lowest, highest)
    }

    #[must_use]
    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u64::<LittleEndian>(self.last_update)?;
        writer.write_u32::<LittleEndian>(self.entries.len() as u32)?;
        for &e in &self.entries {
            writer.write_u16::<LittleEndian>(e)?;
        }
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R, geometry: Geometry) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::CorruptData("index page map sidecar has the wrong magic"));
        }

        let last_update = reader.read_u64::<LittleEndian>()?;
        let count = reader.read_u32::<LittleEndian>()? as usize;
        let expected = geometry.chapters_per_volume as usize * geometry.index_pages_per_chapter as usize;
        if count != expected {
            return Err(Error::CorruptData(
                "index page map sidecar size does not match this geometry",
            ));
        }

        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(reader.read_u16::<LittleEndian>()?);
        }

        Ok(Self {
            geometry,
            last_update,
            entries,
        })
    }
}
