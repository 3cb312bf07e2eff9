// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::bits::huffman::{compute_coding_constants, CodingParams};
use crate::bits::{set_zero, GUARD_BITS, POST_FIELD_GUARD_BYTES};
use crate::error::{Error, Result};

/// One delta list's bookkeeping, kept separately from the bit stream itself.
///
/// `save_key`/`save_offset` cache the key and bit offset of the last entry a
/// full scan reached, so a subsequent `start_search` for a larger key can
/// resume instead of re-walking the list from its first entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaList {
    pub start_bit: u64,
    pub size_bits: u32,
    pub save_key: u64,
    pub save_offset: u64,
    pub has_save: bool,
}

impl DeltaList {
    #[must_use]
    pub fn end_bit(&self) -> u64 {
        self.start_bit + u64::from(self.size_bits)
    }

    pub fn clear_save_point(&mut self) {
        self.save_key = 0;
        self.save_offset = 0;
        self.has_save = false;
    }
}

/// A contiguous byte buffer holding many delta lists, addressed by bit
/// offset, plus the guard lists (index `0` and `list_count + 1`) that bound
/// real list `1..=list_count`.
///
/// Exactly one zone worker ever touches a given zone's memory, so no
/// internal locking is needed; `MutableDeltaIndex` is what shards a whole
/// delta index into `zone_count` of these.
pub struct DeltaZone {
    pub memory: Vec<u8>,
    pub delta_lists: Vec<DeltaList>,
    pub value_bits: u32,
    pub coding: CodingParams,
    pub record_count: u64,
    pub collision_count: u64,
    pub overflow_count: u64,
    pub first_list: u32,
}

impl DeltaZone {
    /// Allocates a new zone with `list_count` empty real lists (plus the two
    /// guard lists), evenly dividing `size_bytes` of capacity between them,
    /// and coding parameters derived from `mean_delta`.
    ///
    /// `first_list` is this zone's offset into the delta index's global list
    /// numbering (zones partition `list_count` lists contiguously).
    pub fn new(
        list_count: u32,
        first_list: u32,
        mean_delta: u32,
        value_bits: u32,
        size_bytes: usize,
    ) -> Result<Self> {
        if size_bytes <= POST_FIELD_GUARD_BYTES {
            return Err(Error::InvalidArgument(
                "delta zone size must exceed the guard region",
            ));
        }

        let mut memory = vec![0u8; size_bytes];
        let guard_start = size_bytes * 8 - GUARD_BITS;
        for byte in &mut memory[size_bytes - POST_FIELD_GUARD_BYTES..] {
            *byte = 0xFF;
        }

        let usable_bits = guard_start as u64;
        let per_list_bits = if list_count == 0 {
            0
        } else {
            usable_bits / u64::from(list_count)
        };

        let mut delta_lists = Vec::with_capacity(list_count as usize + 2);
        // Guard list 0: zero-size, sits at the very start.
        delta_lists.push(DeltaList {
            start_bit: 0,
            size_bits: 0,
            save_key: 0,
            save_offset: 0,
            has_save: false,
        });

        let mut cursor = 0u64;
        for _ in 0..list_count {
            delta_lists.push(DeltaList {
                start_bit: cursor,
                size_bits: 0,
                save_key: 0,
                save_offset: 0,
                has_save: false,
            });
            cursor += per_list_bits;
        }

        // Guard list N+1: zero-size, tail anchored at the guard region start.
        delta_lists.push(DeltaList {
            start_bit: guard_start as u64,
            size_bits: 0,
            save_key: 0,
            save_offset: 0,
            has_save: false,
        });

        let coding = compute_coding_constants(mean_delta.max(1));

        Ok(Self {
            memory,
            delta_lists,
            value_bits,
            coding,
            record_count: 0,
            collision_count: 0,
            overflow_count: 0,
            first_list,
        })
    }

    /// Number of real (non-guard) lists this zone owns.
    #[must_use]
    pub fn list_count(&self) -> u32 {
        self.delta_lists.len() as u32 - 2
    }

    /// Validates `list_number` is a real list (not a guard) and returns its
    /// index into `delta_lists`.
    pub fn list_index(&self, list_number: u32) -> Result<usize> {
        if list_number >= self.list_count() {
            return Err(Error::CorruptData("delta list number out of range"));
        }
        Ok(list_number as usize + 1)
    }

    /// Total bits of capacity available to real lists (excludes the trailing
    /// guard region).
    #[must_use]
    pub fn usable_bits(&self) -> u64 {
        let size_bits = (self.memory.len() * 8) as u64;
        size_bits - GUARD_BITS as u64
    }

    /// Total bits currently occupied by all real lists.
    #[must_use]
    pub fn used_bits(&self) -> u64 {
        self.delta_lists[1..self.delta_lists.len() - 1]
            .iter()
            .map(|l| u64::from(l.size_bits))
            .sum()
    }

    /// Re-derives the tail guard's all-ones bytes; called after any
    /// operation that could have written over them (it shouldn't, but this
    /// keeps the invariant explicit at zone construction and during tests).
    pub fn reset_guard(&mut self) {
        let len = self.memory.len();
        set_zero(&mut self.memory, (len * 8 - GUARD_BITS) as u64, GUARD_BITS as u32);
        for byte in &mut self.memory[len - POST_FIELD_GUARD_BYTES..] {
            *byte = 0xFF;
        }
    }

    /// Opens a blank gap of `size` bits adjacent to `offset_in_list` (bit
    /// offset relative to the list's own start) in list `list_idx`, growing
    /// into whichever neighboring gap is cheaper to shift, or redistributing
    /// the zone's free space via [`Self::extend_zone`] if neither gap alone
    /// suffices. Returns the absolute bit offset of the new gap; content
    /// that was at or after `offset_in_list` is preserved immediately after
    /// it, i.e. at `gap_offset + size`, regardless of which direction was
    /// chosen.
    pub fn insert_bits(&mut self, list_idx: usize, offset_in_list: u64, size: u32) -> Result<u64> {
        if size == 0 {
            return Ok(self.delta_lists[list_idx].start_bit + offset_in_list);
        }

        loop {
            let list = self.delta_lists[list_idx];
            let bit_offset = list.start_bit + offset_in_list;
            let before_gap = list.start_bit - self.delta_lists[list_idx - 1].end_bit();
            let after_gap = self.delta_lists[list_idx + 1].start_bit - list.end_bit();

            let can_forward = after_gap >= u64::from(size);
            let can_backward = before_gap >= u64::from(size);

            if can_forward && (!can_backward || list.end_bit() - bit_offset <= offset_in_list) {
                return Ok(self.shift_forward(list_idx, bit_offset, size));
            } else if can_backward {
                return Ok(self.shift_backward(list_idx, bit_offset, size));
            }

            self.extend_zone(list_idx, size)?;
        }
    }

    /// Removes `size` bits at `offset_in_list` within list `list_idx`,
    /// shifting the list's trailing content backward to close the gap.
    pub fn delete_bits(&mut self, list_idx: usize, offset_in_list: u64, size: u32) {
        if size == 0 {
            return;
        }

        let list = self.delta_lists[list_idx];
        debug_assert!(offset_in_list + u64::from(size) <= u64::from(list.size_bits));

        let bit_offset = list.start_bit + offset_in_list;
        let tail_start = bit_offset + u64::from(size);
        let tail_bits = (list.end_bit() - tail_start) as u32;

        if tail_bits > 0 {
            crate::bits::move_bits(&mut self.memory, tail_start, bit_offset, tail_bits);
        }

        self.delta_lists[list_idx].size_bits -= size;
    }

    fn shift_forward(&mut self, list_idx: usize, bit_offset: u64, size: u32) -> u64 {
        let list = self.delta_lists[list_idx];
        let tail_bits = (list.end_bit() - bit_offset) as u32;

        if tail_bits > 0 {
            crate::bits::move_bits(&mut self.memory, bit_offset, bit_offset + u64::from(size), tail_bits);
        }

        self.delta_lists[list_idx].size_bits += size;
        bit_offset
    }

    fn shift_backward(&mut self, list_idx: usize, bit_offset: u64, size: u32) -> u64 {
        let list = self.delta_lists[list_idx];
        let head_bits = (bit_offset - list.start_bit) as u32;

        if head_bits > 0 {
            crate::bits::move_bits(
                &mut self.memory,
                list.start_bit,
                list.start_bit - u64::from(size),
                head_bits,
            );
        }

        self.delta_lists[list_idx].start_bit -= u64::from(size);
        self.delta_lists[list_idx].size_bits += size;
        bit_offset - u64::from(size)
    }

    /// Redistributes the zone's current free space (the gaps between lists,
    /// not the list contents themselves) so that list `growing_index` has at
    /// least `growing_size` bits of slack immediately before it, returning
    /// [`Error::Overflow`] if the zone's fixed byte budget cannot hold the
    /// existing content plus the requested growth.
    ///
    /// Lists are repacked contiguously with any remaining slack spread
    /// evenly; content is relocated via [`crate::bits::copy_bits`] into a
    /// freshly allocated buffer of the same size rather than shuffled in
    /// place, since a zone's byte budget never changes and a fresh buffer
    /// makes the relocation trivially correct.
    pub fn extend_zone(&mut self, growing_index: usize, growing_size: u32) -> Result<()> {
        let list_count = self.list_count() as usize;
        let used_bits = self.used_bits();
        let total_needed = used_bits + u64::from(growing_size);

        if total_needed > self.usable_bits() {
            self.overflow_count += 1;
            return Err(Error::Overflow);
        }

        let slack = self.usable_bits() - total_needed;
        let per_list_slack = if list_count == 0 {
            0
        } else {
            slack / list_count as u64
        };

        let mut new_memory = vec![0u8; self.memory.len()];
        let guard_start = (self.memory.len() * 8 - GUARD_BITS) as u64;
        for byte in &mut new_memory[self.memory.len() - POST_FIELD_GUARD_BYTES..] {
            *byte = 0xFF;
        }

        let mut cursor = 0u64;
        for idx in 1..=list_count {
            let old_list = self.delta_lists[idx];
            let extra = if idx == growing_index {
                u64::from(growing_size)
            } else {
                0
            };
            let new_start = cursor + extra;

            if old_list.size_bits > 0 {
                crate::bits::copy_bits(
                    &self.memory,
                    old_list.start_bit,
                    &mut new_memory,
                    new_start,
                    old_list.size_bits,
                );
            }

            self.delta_lists[idx].start_bit = new_start;
            cursor = new_start + u64::from(old_list.size_bits) + per_list_slack;
        }

        self.delta_lists[list_count + 1].start_bit = guard_start;
        self.memory = new_memory;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn new_zone_divides_capacity_evenly() {
        let zone = DeltaZone::new(4, 0, 10, 8, 256).unwrap();
        assert_eq!(zone.list_count(), 4);
        assert_eq!(zone.delta_lists.len(), 6);
        assert_eq!(zone.delta_lists[0].start_bit, 0);
        assert!(zone.delta_lists[5].start_bit > zone.delta_lists[4].start_bit);
    }

    #[test]
    fn tail_guard_is_all_ones() {
        let zone = DeltaZone::new(4, 0, 10, 8, 256).unwrap();
        let tail = &zone.memory[256 - POST_FIELD_GUARD_BYTES..];
        assert!(tail.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn rejects_tiny_zone() {
        assert!(DeltaZone::new(4, 0, 10, 8, 4).is_err());
    }

    #[test]
    fn list_index_rejects_out_of_range() {
        let zone = DeltaZone::new(4, 0, 10, 8, 256).unwrap();
        assert!(zone.list_index(4).is_err());
        assert!(zone.list_index(3).is_ok());
    }

    #[test]
    fn insert_bits_appends_at_list_end() {
        let mut zone = DeltaZone::new(4, 0, 10, 8, 256).unwrap();
        let start = zone.delta_lists[2].start_bit;
        let gap = zone.insert_bits(2, 0, 20).unwrap();
        assert_eq!(gap, start);
        assert_eq!(zone.delta_lists[2].size_bits, 20);
    }

    #[test]
    fn insert_then_delete_round_trips_size() {
        let mut zone = DeltaZone::new(4, 0, 10, 8, 256).unwrap();
        zone.insert_bits(2, 0, 20).unwrap();
        assert_eq!(zone.delta_lists[2].size_bits, 20);
        zone.delete_bits(2, 0, 20);
        assert_eq!(zone.delta_lists[2].size_bits, 0);
    }

    #[test]
    fn insert_bits_overflows_when_zone_is_full() {
        let mut zone = DeltaZone::new(1, 0, 10, 8, 16).unwrap();
        let usable = zone.usable_bits() as u32;
        let result = zone.insert_bits(1, 0, usable + 1);
        assert!(matches!(result, Err(Error::Overflow)));
    }

    #[test]
    fn extend_zone_preserves_existing_content() {
        let mut zone = DeltaZone::new(3, 0, 10, 8, 512).unwrap();
        zone.insert_bits(1, 0, 30).unwrap();
        set_zero(&mut zone.memory, zone.delta_lists[1].start_bit, 30);
        crate::bits::set_field(0x1234, &mut zone.memory, zone.delta_lists[1].start_bit, 25);

        zone.extend_zone(2, 100).unwrap();

        assert_eq!(
            crate::bits::get_field(&zone.memory, zone.delta_lists[1].start_bit, 25),
            0x1234
        );
        assert!(zone.delta_lists[2].start_bit - zone.delta_lists[1].end_bit() >= 100);
    }
}
