// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The delta index built over a chapter's sampled records when it closes.
//!
//! Addressing mirrors the volume index's, but drawn from
//! [`RecordName::chapter_index_bytes`] instead: the high
//! `chapter_delta_list_bits` select a delta list, and the low
//! `chapter_address_bits` are the sort key within it. The stored value is
//! the record's position in the chapter's collated (name-sorted) record
//! array, which a record page lookup turns into page + in-page offset.

use crate::delta_index::MutableDeltaIndex;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::record_name::RecordName;

/// The delta list a name hashes to within a chapter index of
/// `chapter_delta_list_bits` lists.
#[must_use]
pub fn chapter_delta_list(name: &RecordName, geometry: &Geometry) -> u32 {
    let shifted = name.chapter_index_bytes() >> geometry.chapter_address_bits;
    let mask = (1u64 << geometry.chapter_delta_list_bits) - 1;
    (shifted & mask) as u32
}

/// The within-list sort key for a name in a chapter index.
#[must_use]
pub fn chapter_delta_address(name: &RecordName, geometry: &Geometry) -> u64 {
    let mask = (1u64 << geometry.chapter_address_bits) - 1;
    name.chapter_index_bytes() & mask
}

/// A delta index over one chapter's sampled records, built fresh each time
/// a chapter closes and packed into [`crate::geometry::Geometry::index_pages_per_chapter`]
/// immutable pages by the chapter writer.
pub struct ChapterIndex {
    delta_index: MutableDeltaIndex,
    geometry: Geometry,
}

impl ChapterIndex {
    /// Builds an empty chapter index sized for `geometry`.
    ///
    /// The Huffman coding parameters are derived from
    /// [`mean_delta_for_chapter_index`], a pure function of `geometry`
    /// rather than of this chapter's actual record count: the packed page
    /// header has no room to carry per-chapter coding constants, so a
    /// reader (the volume lookup path, the sparse cache) must be able to
    /// re-derive the exact same parameters from geometry alone in order to
    /// decode a page it didn't write.
    ///
    /// `zone_memory_bytes` is sized generously relative to
    /// `records_per_chapter` since, unlike the volume index, a chapter
    /// index is built once from a known-size batch and then immediately
    /// packed into pages and discarded.
    pub fn new(geometry: Geometry, zone_memory_bytes: usize) -> Result<Self> {
        let list_count = 1u32 << geometry.chapter_delta_list_bits;
        let value_bits = value_bits_for_chapter_index(&geometry);
        let mean_delta = mean_delta_for_chapter_index(&geometry);
        let delta_index = MutableDeltaIndex::new(list_count, 1, mean_delta, value_bits, zone_memory_bytes)?;

        Ok(Self { delta_index, geometry })
    }

    /// Records `name`'s position (`record_number`, 0-based into the
    /// collated record array) in the chapter index.
    ///
    /// Callers always insert each collated record's name exactly once, so a
    /// plain key match with no confirmed collision-name is a new record
    /// that happens to share a delta-list key with an earlier one, not a
    /// re-insertion: only a match resolved through the collision chain
    /// (`entry.is_collision`) is treated as a true duplicate.
    pub fn put(&mut self, name: &RecordName, record_number: u32) -> Result<()> {
        let list = chapter_delta_list(name, &self.geometry);
        let key = chapter_delta_address(name, &self.geometry);
        let (entry, found) = self.delta_index.get_entry(list, key, Some(name))?;
        let confirmed_duplicate = found && entry.is_collision;
        self.delta_index
            .put_entry(&entry, confirmed_duplicate, list, key, record_number, Some(name))
            .map(|_| ())
    }

    /// Looks up `name`'s record number, if this chapter index has it.
    pub fn get(&mut self, name: &RecordName) -> Result<Option<u32>> {
        let list = chapter_delta_list(name, &self.geometry);
        let key = chapter_delta_address(name, &self.geometry);
        let (entry, found) = self.delta_index.get_entry(list, key, Some(name))?;
        Ok(found.then_some(entry.value))
    }

    pub fn delta_index(&self) -> &MutableDeltaIndex {
        &self.delta_index
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.delta_index.record_count()
    }
}

/// `ceil(log2(n))`, the number of bits needed to address `n` distinct
/// record numbers (minimum 1 bit so a zero-size chapter still has a valid
/// field width).
fn record_number_bits(n: u32) -> u32 {
    if n <= 1 {
        1
    } else {
        32 - (n - 1).leading_zeros()
    }
}

/// The value-field width for a chapter index built over `geometry`: wide
/// enough to address any record number within one chapter.
#[must_use]
pub fn value_bits_for_chapter_index(geometry: &Geometry) -> u32 {
    record_number_bits(geometry.records_per_chapter)
}

/// The mean inter-key delta a chapter index's Huffman coding is tuned for,
/// derived purely from `geometry`: the expected occupancy of one delta
/// list (`records_per_chapter / list_count`) spread evenly over the
/// `chapter_address_bits`-wide key space.
///
/// This must be a pure function of `geometry` alone (not of any
/// particular chapter's actual record count) because a packed immutable
/// page carries no coding-parameter header field; a reader re-derives the
/// same constants a writer used purely from the geometry both share.
#[must_use]
pub fn mean_delta_for_chapter_index(geometry: &Geometry) -> u32 {
    let list_count = (1u64 << geometry.chapter_delta_list_bits).max(1);
    let expected_per_list = (u64::from(geometry.records_per_chapter) / list_count).max(1);
    let key_space = 1u64 << geometry.chapter_address_bits;
    (key_space / expected_per_list).max(1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_name::RECORD_NAME_SIZE;
    use test_log::test;

    fn geometry() -> Geometry {
        Geometry::new(10, 1_000, 1, 63, 4_096, 14, 6, 2, 32).unwrap()
    }

    fn name(tag: u32) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[8..12].copy_from_slice(&tag.to_be_bytes());
        RecordName::new(bytes)
    }

    #[test]
    fn put_then_get_round_trips() {
        let geometry = geometry();
        let mut index = ChapterIndex::new(geometry, 1 << 20).unwrap();

        for i in 0..50u32 {
            index.put(&name(i), i).unwrap();
        }

        for i in 0..50u32 {
            assert_eq!(index.get(&name(i)).unwrap(), Some(i));
        }
        assert_eq!(index.get(&name(9999)).unwrap(), None);
    }

    #[test]
    fn record_number_bits_matches_expected_widths() {
        assert_eq!(record_number_bits(1), 1);
        assert_eq!(record_number_bits(2), 1);
        assert_eq!(record_number_bits(3), 2);
        assert_eq!(record_number_bits(1024), 10);
    }
}
