// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The volume-wide name → chapter map.
//!
//! A single [`MutableDeltaIndex`] keyed by a name's [`RecordName::volume_index_bytes`],
//! sharded across zones the same way the delta index itself shards its
//! lists. Because the delta index's value field is sized to
//! `Geometry::chapter_address_bits`, it cannot hold a raw virtual chapter
//! number once the index has been running long enough to wrap; instead
//! each zone remembers its own `open_chapter` (set by
//! [`VolumeIndex::set_zone_open_chapter`]) and stored chapter numbers are
//! decoded relative to it.

pub mod record;

use std::io::{Read, Write};

use crate::delta_index::{save, MutableDeltaIndex};
use crate::error::Result;
use crate::geometry::Geometry;
use crate::record_name::RecordName;

pub use record::VolumeIndexRecord;

/// Per-zone state that lives alongside (not inside) the delta index.
struct VolumeIndexZone {
    open_chapter: u64,
}

pub struct VolumeIndex {
    delta_index: MutableDeltaIndex,
    geometry: Geometry,
    zones: Vec<VolumeIndexZone>,
    value_bits: u32,
    list_count: u32,
    mean_delta: u32,
}

/// Splits a name's volume-index address into the delta list it shards to
/// and the per-list sort key within that list.
///
/// Reusing the same 64-bit address for both (`list_number = address %
/// list_count`, `key = address / list_count`) keeps the sharding
/// deterministic from the name alone without needing another slice of it.
fn split_address(address: u64, list_count: u32) -> (u32, u64) {
    let key = address / u64::from(list_count);
    #[allow(clippy::cast_possible_truncation)]
    let list_number = (address % u64::from(list_count)) as u32;
    (list_number, key)
}

fn encode_chapter(value_bits: u32, virtual_chapter: u64) -> u32 {
    let mask = (1u64 << value_bits) - 1;
    #[allow(clippy::cast_possible_truncation)]
    {
        (virtual_chapter & mask) as u32
    }
}

/// Recovers the virtual chapter number nearest `open_chapter` (at or below
/// it) that is congruent to `encoded` modulo `2^value_bits`.
fn decode_chapter(value_bits: u32, open_chapter: u64, encoded: u32) -> u64 {
    let modulus = 1u64 << value_bits;
    let base = open_chapter - (open_chapter % modulus);
    let candidate = base + u64::from(encoded);
    if candidate > open_chapter && candidate >= modulus {
        candidate - modulus
    } else {
        candidate
    }
}

impl VolumeIndex {
    /// Builds an empty volume index over `list_count` lists, sharded into
    /// `zone_count` zones of `zone_memory_bytes` each.
    pub fn new(
        geometry: Geometry,
        list_count: u32,
        zone_count: u32,
        mean_delta: u32,
        zone_memory_bytes: usize,
    ) -> Result<Self> {
        let value_bits = u32::from(geometry.chapter_address_bits);
        let delta_index = MutableDeltaIndex::new(list_count, zone_count, mean_delta, value_bits, zone_memory_bytes)?;
        let zones = (0..zone_count).map(|_| VolumeIndexZone { open_chapter: 0 }).collect();

        Ok(Self {
            delta_index,
            geometry,
            zones,
            value_bits,
            list_count,
            mean_delta,
        })
    }

    #[must_use]
    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.delta_index.record_count()
    }

    /// The zone a name's entry lives in, without performing a search.
    pub fn zone_of(&self, name: &RecordName) -> Result<u32> {
        let (list_number, _) = split_address(name.volume_index_bytes(), self.list_count);
        let (zone_index, _) = self.delta_index.locate(list_number)?;
        Ok(zone_index as u32)
    }

    /// `true` if `name` should be retained in sparse mode: `sample_rate ==
    /// 0` (dense mode, everything is kept) or its sample slice is a
    /// multiple of the rate.
    #[must_use]
    pub fn is_sample(&self, name: &RecordName) -> bool {
        let rate = self.geometry.sparse_sample_rate;
        rate == 0 || u32::from(name.sample_bytes()) % rate == 0
    }

    /// Records the virtual chapter most recently closed for `zone_number`.
    ///
    /// Lazy expiry falls out of this: any entry whose decoded chapter
    /// number falls behind [`Geometry::oldest_live_chapter`] relative to the
    /// new open chapter is treated as absent by [`VolumeIndex::lookup`] the
    /// next time it is looked up, without a separate sweep.
    pub fn set_zone_open_chapter(&mut self, zone_number: u32, virtual_chapter: u64) {
        self.zones[zone_number as usize].open_chapter = virtual_chapter;
    }

    /// The virtual chapter most recently recorded open for `zone_number`,
    /// via [`Self::set_zone_open_chapter`] or a loaded snapshot.
    #[must_use]
    pub fn zone_open_chapter(&self, zone_number: u32) -> u64 {
        self.zones[zone_number as usize].open_chapter
    }

    /// Looks up `name`, returning its live virtual chapter if present and
    /// not yet expired off the ring.
    pub fn lookup(&mut self, name: &RecordName) -> Result<Option<u64>> {
        let record = self.get_record(name)?;
        Ok(self.decode_if_live(&record))
    }

    /// Locates `name`'s slot, resolving collisions by full-name comparison.
    pub fn get_record(&mut self, name: &RecordName) -> Result<VolumeIndexRecord> {
        let (list_number, key) = split_address(name.volume_index_bytes(), self.list_count);
        let (entry, found) = self.delta_index.get_entry(list_number, key, Some(name))?;
        Ok(VolumeIndexRecord {
            list_number,
            entry,
            found,
        })
    }

    /// Inserts or overwrites `name`'s chapter mapping.
    ///
    /// A found record is treated as this same name being refreshed to a
    /// newer chapter (the overwhelmingly common steady-state case: the same
    /// dedupe hint touched again) and is updated in place rather than
    /// re-inserted; only an absent record allocates a new entry. This
    /// mirrors the reference implementation's `set_volume_index_record_chapter`
    /// vs. `put_volume_index_record` split in its index-zone search path.
    ///
    /// An [`crate::error::Error::Overflow`] here means the owning delta
    /// list is full; the caller's policy is to drop the dedupe hint rather
    /// than fail whatever request triggered the write.
    pub fn put_record(&mut self, name: &RecordName, virtual_chapter: u64) -> Result<()> {
        let (list_number, key) = split_address(name.volume_index_bytes(), self.list_count);
        let record = self.get_record(name)?;
        let value = encode_chapter(self.value_bits, virtual_chapter);

        if record.found {
            return self.delta_index.set_value(list_number, &record.entry, value);
        }

        self.delta_index
            .put_entry(&record.entry, record.found, list_number, key, value, Some(name))
            .map(|_| ())
    }

    /// Overwrites the chapter number of an already-located record.
    pub fn set_record_chapter(&mut self, record: &VolumeIndexRecord, virtual_chapter: u64) -> Result<()> {
        let value = encode_chapter(self.value_bits, virtual_chapter);
        self.delta_index.set_value(record.list_number, &record.entry, value)
    }

    /// Removes an already-located record. A no-op if it was never found.
    pub fn remove_record(&mut self, record: &VolumeIndexRecord) -> Result<()> {
        if !record.found {
            return Ok(());
        }
        self.delta_index.remove_entry(record.list_number, &record.entry)
    }

    fn decode_if_live(&self, record: &VolumeIndexRecord) -> Option<u64> {
        if !record.found {
            return None;
        }
        let (zone_index, _) = self.delta_index.locate(record.list_number).ok()?;
        let open_chapter = self.zones[zone_index].open_chapter;
        let virtual_chapter = decode_chapter(self.value_bits, open_chapter, record.entry.value);

        if virtual_chapter < self.geometry.oldest_live_chapter(open_chapter) {
            None
        } else {
            Some(virtual_chapter)
        }
    }

    /// Writes one zone's save stream, prefixed with that zone's
    /// `open_chapter` (needed to decode stored chapter numbers back on
    /// load, since they are encoded relative to it).
    pub fn save_zone<W: Write>(&self, zone_number: u32, writer: &mut W) -> Result<()> {
        use byteorder::{LittleEndian, WriteBytesExt};

        writer.write_u64::<LittleEndian>(self.zones[zone_number as usize].open_chapter)?;
        save::save_zone(
            self.delta_index.zone(zone_number),
            zone_number,
            self.zone_count(),
            writer,
        )
    }

    /// Loads one zone's save stream back in place.
    pub fn load_zone<R: Read>(&mut self, zone_number: u32, reader: &mut R) -> Result<()> {
        use byteorder::{LittleEndian, ReadBytesExt};

        let open_chapter = reader.read_u64::<LittleEndian>()?;
        let zone_memory_bytes = self.delta_index.zone(zone_number).memory.len();
        let (zone, _, _) = save::load_zone(reader, self.mean_delta, self.value_bits, zone_memory_bytes)?;

        *self.delta_index.zone_mut(zone_number) = zone;
        self.zones[zone_number as usize].open_chapter = open_chapter;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_name::RECORD_NAME_SIZE;
    use test_log::test;

    fn geometry() -> Geometry {
        Geometry::new(10, 1_000, 1, 63, 4_096, 14, 20, 2, 32).unwrap()
    }

    fn name_with_address(address: u64) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[0..8].copy_from_slice(&address.to_be_bytes());
        RecordName::new(bytes)
    }

    #[test]
    fn put_then_lookup_returns_the_stored_chapter() {
        let mut index = VolumeIndex::new(geometry(), 8, 2, 20, 4096).unwrap();
        let name = name_with_address(123_456);

        index.put_record(&name, 7).unwrap();
        assert_eq!(index.lookup(&name).unwrap(), Some(7));
    }

    #[test]
    fn lookup_of_unknown_name_is_none() {
        let mut index = VolumeIndex::new(geometry(), 8, 2, 20, 4096).unwrap();
        let name = name_with_address(1);
        assert_eq!(index.lookup(&name).unwrap(), None);
    }

    #[test]
    fn remove_record_clears_the_mapping() {
        let mut index = VolumeIndex::new(geometry(), 8, 2, 20, 4096).unwrap();
        let name = name_with_address(9);

        index.put_record(&name, 1).unwrap();
        let record = index.get_record(&name).unwrap();
        index.remove_record(&record).unwrap();

        assert_eq!(index.lookup(&name).unwrap(), None);
    }

    #[test]
    fn expired_chapter_reads_as_absent() {
        let mut index = VolumeIndex::new(geometry(), 8, 1, 20, 4096).unwrap();
        let name = name_with_address(42);

        index.put_record(&name, 2).unwrap();
        index.set_zone_open_chapter(0, 200);

        assert_eq!(index.lookup(&name).unwrap(), None);
    }

    #[test]
    fn zone_open_chapter_reflects_the_last_set_value() {
        let mut index = VolumeIndex::new(geometry(), 8, 2, 20, 4096).unwrap();
        assert_eq!(index.zone_open_chapter(1), 0);
        index.set_zone_open_chapter(1, 12);
        assert_eq!(index.zone_open_chapter(1), 12);
    }

    #[test]
    fn zone_of_is_stable_and_in_range() {
        let index = VolumeIndex::new(geometry(), 8, 3, 20, 4096).unwrap();
        let name = name_with_address(77);
        let zone = index.zone_of(&name).unwrap();
        assert!(zone < index.zone_count());
        assert_eq!(zone, index.zone_of(&name).unwrap());
    }

    #[test]
    fn save_and_load_zone_round_trips() {
        let mut index = VolumeIndex::new(geometry(), 8, 1, 20, 4096).unwrap();
        let name = name_with_address(555);
        index.put_record(&name, 3).unwrap();
        index.set_zone_open_chapter(0, 50);

        let mut buf = Vec::new();
        index.save_zone(0, &mut buf).unwrap();

        let mut reloaded = VolumeIndex::new(geometry(), 8, 1, 20, 4096).unwrap();
        reloaded.load_zone(0, &mut buf.as_slice()).unwrap();

        assert_eq!(reloaded.lookup(&name).unwrap(), Some(3));
    }
}
