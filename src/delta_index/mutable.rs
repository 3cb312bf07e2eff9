// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::entry::{self, DeltaIndexEntry};
use super::zone::DeltaZone;
use crate::error::{Error, Result};
use crate::record_name::RecordName;

/// A delta index that owns its memory and grows in place, sharded across
/// `zone_count` zones that partition `list_count` lists contiguously: each
/// zone but the last owns `list_count / zone_count` lists, and the last
/// absorbs the remainder.
///
/// Each zone is touched by exactly one zone worker, so `MutableDeltaIndex`
/// itself performs no internal locking — callers route a request to the
/// right zone (see [`crate::zone`]) before calling in.
pub struct MutableDeltaIndex {
    zones: Vec<DeltaZone>,
    list_count: u32,
}

impl MutableDeltaIndex {
    /// Builds a delta index over `list_count` lists split across
    /// `zone_count` zones, each zone getting `zone_memory_bytes` of byte
    /// budget and coding parameters derived from `mean_delta`.
    pub fn new(
        list_count: u32,
        zone_count: u32,
        mean_delta: u32,
        value_bits: u32,
        zone_memory_bytes: usize,
    ) -> Result<Self> {
        if zone_count == 0 {
            return Err(Error::InvalidArgument("zone_count must be > 0"));
        }
        if list_count == 0 {
            return Err(Error::InvalidArgument("list_count must be > 0"));
        }

        let base = list_count / zone_count;
        let remainder = list_count - base * zone_count;

        let mut zones = Vec::with_capacity(zone_count as usize);
        let mut first_list = 0u32;

        for zone_index in 0..zone_count {
            let count = if zone_index == zone_count - 1 {
                base + remainder
            } else {
                base
            };
            // A zone can end up with zero lists only when list_count is
            // smaller than zone_count; still needs at least one guard pair.
            let count = count.max(1);
            zones.push(DeltaZone::new(
                count,
                first_list,
                mean_delta,
                value_bits,
                zone_memory_bytes,
            )?);
            first_list += count;
        }

        Ok(Self { zones, list_count })
    }

    #[must_use]
    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    #[must_use]
    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.zones.iter().map(|z| z.record_count).sum()
    }

    #[must_use]
    pub fn collision_count(&self) -> u64 {
        self.zones.iter().map(|z| z.collision_count).sum()
    }

    #[must_use]
    pub fn overflow_count(&self) -> u64 {
        self.zones.iter().map(|z| z.overflow_count).sum()
    }

    pub fn zone(&self, zone_index: u32) -> &DeltaZone {
        &self.zones[zone_index as usize]
    }

    pub fn zone_mut(&mut self, zone_index: u32) -> &mut DeltaZone {
        &mut self.zones[zone_index as usize]
    }

    pub fn zones(&self) -> &[DeltaZone] {
        &self.zones
    }

    /// Maps a global list number to its owning zone index and the list
    /// number local to that zone.
    pub(crate) fn locate(&self, list_number: u32) -> Result<(usize, u32)> {
        if list_number >= self.list_count {
            return Err(Error::CorruptData("delta list number out of range"));
        }

        let mut remaining = list_number;
        for (zone_index, zone) in self.zones.iter().enumerate() {
            if remaining < zone.list_count() {
                return Ok((zone_index, remaining));
            }
            remaining -= zone.list_count();
        }

        Err(Error::CorruptData("delta list number out of range"))
    }

    pub fn get_entry(
        &mut self,
        list_number: u32,
        key: u64,
        name: Option<&RecordName>,
    ) -> Result<(DeltaIndexEntry, bool)> {
        let (zone_index, local_list) = self.locate(list_number)?;
        entry::get_entry(&mut self.zones[zone_index], local_list, key, name)
    }

    pub fn put_entry(
        &mut self,
        found_entry: &DeltaIndexEntry,
        found: bool,
        list_number: u32,
        key: u64,
        value: u32,
        name: Option<&RecordName>,
    ) -> Result<DeltaIndexEntry> {
        let (zone_index, _) = self.locate(list_number)?;
        entry::put_entry(&mut self.zones[zone_index], found_entry, found, key, value, name)
    }

    pub fn remove_entry(&mut self, list_number: u32, found_entry: &DeltaIndexEntry) -> Result<()> {
        let (zone_index, _) = self.locate(list_number)?;
        entry::remove_entry(&mut self.zones[zone_index], found_entry)
    }

    pub fn set_value(&mut self, list_number: u32, found_entry: &DeltaIndexEntry, value: u32) -> Result<()> {
        let (zone_index, _) = self.locate(list_number)?;
        entry::set_value(&mut self.zones[zone_index], found_entry, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn zones_partition_lists_with_last_absorbing_remainder() {
        let index = MutableDeltaIndex::new(10, 3, 20, 12, 4096).unwrap();
        assert_eq!(index.zone(0).list_count(), 3);
        assert_eq!(index.zone(1).list_count(), 3);
        assert_eq!(index.zone(2).list_count(), 4);
    }

    #[test]
    fn locate_routes_to_correct_zone() {
        let index = MutableDeltaIndex::new(10, 3, 20, 12, 4096).unwrap();
        assert_eq!(index.locate(0).unwrap(), (0, 0));
        assert_eq!(index.locate(2).unwrap(), (0, 2));
        assert_eq!(index.locate(3).unwrap(), (1, 0));
        assert_eq!(index.locate(6).unwrap(), (2, 0));
        assert_eq!(index.locate(9).unwrap(), (2, 3));
        assert!(index.locate(10).is_err());
    }

    #[test]
    fn put_and_get_round_trips_across_zones() {
        let mut index = MutableDeltaIndex::new(6, 2, 20, 12, 4096).unwrap();

        for list in 0..6u32 {
            let (entry, found) = index.get_entry(list, 100, None).unwrap();
            index.put_entry(&entry, found, list, 100, list + 1, None).unwrap();
        }

        for list in 0..6u32 {
            let (entry, found) = index.get_entry(list, 100, None).unwrap();
            assert!(found, "list {list} should have its record");
            assert_eq!(entry.value, list + 1);
        }

        assert_eq!(index.record_count(), 6);
    }
}
