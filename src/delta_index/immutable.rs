// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The read-only, packed-page form of a delta index, as written into (and
//! read back from) a chapter's index pages.
//!
//! A page is a fixed-width header (byte-aligned, via [`byteorder`]) followed
//! by a bit-packed offset table, the concatenated delta-list bit streams it
//! indexes, and a trailing all-ones guard region.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use super::entry::COLLISION_BITS;
use super::mutable::MutableDeltaIndex;
use crate::bits::huffman::{decode_delta, CodingParams};
use crate::bits::{
    copy_bits, get_big_field, get_field, set_field, set_zero, GUARD_BITS, POST_FIELD_GUARD_BYTES,
};
use crate::error::{Error, Result};
use crate::record_name::{RecordName, RECORD_NAME_SIZE};

/// Width, in bits, of each offset-table entry. Matches the reference
/// implementation's `IMMUTABLE_HEADER_SIZE`; despite the name this sizes
/// the per-list offset field, not the fixed page header below.
pub const OFFSET_FIELD_BITS: u32 = 19;

/// Size in bytes of the fixed, byte-aligned leading header.
pub const HEADER_BYTES: usize = 8 + 8 + 2 + 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHeader {
    pub nonce: u64,
    pub virtual_chapter: u64,
    pub first_list: u16,
    pub list_count: u16,
}

fn read_header<B: ByteOrder>(memory: &[u8]) -> Option<PageHeader> {
    if memory.len() < HEADER_BYTES {
        return None;
    }
    Some(PageHeader {
        nonce: B::read_u64(&memory[0..8]),
        virtual_chapter: B::read_u64(&memory[8..16]),
        first_list: B::read_u16(&memory[16..18]),
        list_count: B::read_u16(&memory[18..20]),
    })
}

fn write_header<B: ByteOrder>(memory: &mut [u8], header: PageHeader) {
    B::write_u64(&mut memory[0..8], header.nonce);
    B::write_u64(&mut memory[8..16], header.virtual_chapter);
    B::write_u16(&mut memory[16..18], header.first_list);
    B::write_u16(&mut memory[18..20], header.list_count);
}

fn offset_table_bit(index: u32) -> u64 {
    (HEADER_BYTES * 8) as u64 + u64::from(index) * u64::from(OFFSET_FIELD_BITS)
}

/// Verifies a page's structural integrity: matching nonce, an offset table
/// whose first entry lands exactly where the table ends, non-decreasing
/// offsets, a last offset inside the guard region, and an all-ones guard.
///
/// Tries little-endian first, then big-endian, so pages written by an
/// older big-endian host still load. Failure is reported, never panics —
/// during chapter rebuild a page that fails this check is simply treated
/// as not yet written.
pub fn verify_page(expected_nonce: u64, memory: &[u8]) -> Result<PageHeader> {
    for header in [read_header::<LittleEndian>(memory), read_header::<BigEndian>(memory)]
        .into_iter()
        .flatten()
    {
        if header.nonce != expected_nonce {
            continue;
        }
        if verify_offsets(memory, &header).is_ok() {
            return Ok(header);
        }
    }

    Err(Error::CorruptData("immutable chapter page failed verification"))
}

fn verify_offsets(memory: &[u8], header: &PageHeader) -> Result<()> {
    if memory.len() * 8 <= GUARD_BITS {
        return Err(Error::CorruptData("page smaller than the guard region"));
    }

    let entries = u32::from(header.list_count) + 1;
    let table_end_bit = offset_table_bit(entries);

    let first_offset = u64::from(get_field(memory, offset_table_bit(0), OFFSET_FIELD_BITS));
    if first_offset != table_end_bit {
        return Err(Error::CorruptData(
            "offset table does not end where the first list starts",
        ));
    }

    let mut previous = first_offset;
    for i in 1..entries {
        let offset = u64::from(get_field(memory, offset_table_bit(i), OFFSET_FIELD_BITS));
        if offset < previous {
            return Err(Error::CorruptData("immutable page offsets are not non-decreasing"));
        }
        previous = offset;
    }

    let guard_start = (memory.len() * 8 - GUARD_BITS) as u64;
    if previous > guard_start {
        return Err(Error::CorruptData("last list offset overruns the guard region"));
    }

    let tail = &memory[memory.len() - POST_FIELD_GUARD_BYTES..];
    if !tail.iter().all(|&b| b == 0xFF) {
        return Err(Error::CorruptData("immutable page guard region is not all-ones"));
    }

    Ok(())
}

/// Greedily packs as many consecutive lists starting at `first_list` as fit
/// in `memory`, writing the header, offset table, and list content, and
/// returns how many lists were packed.
///
/// Lists are copied via [`copy_bits`] from the mutable index's zones — the
/// source and destination buffers are always disjoint here, unlike the
/// in-place shuffling `DeltaZone` itself does during insertion.
pub fn pack_page(
    index: &MutableDeltaIndex,
    first_list: u32,
    nonce: u64,
    virtual_chapter: u64,
    memory: &mut [u8],
) -> Result<u32> {
    if memory.len() * 8 <= (HEADER_BYTES * 8) + GUARD_BITS {
        return Err(Error::InvalidArgument("page too small to hold a chapter index page"));
    }

    let available_bits = (memory.len() * 8 - GUARD_BITS) as u64 - (HEADER_BYTES * 8) as u64;
    let total_lists = index.list_count();

    let mut count = 0u32;
    let mut content_bits = 0u64;

    while first_list + count < total_lists {
        let list_number = first_list + count;
        let (zone_index, local) = index.locate(list_number)?;
        let list_size = u64::from(index.zone(zone_index as u32).delta_lists[local as usize + 1].size_bits);

        let candidate_entries = count + 2;
        let candidate_table_bits = u64::from(candidate_entries) * u64::from(OFFSET_FIELD_BITS);

        if candidate_table_bits + content_bits + list_size > available_bits {
            break;
        }

        content_bits += list_size;
        count += 1;
    }

    write_header::<LittleEndian>(
        memory,
        PageHeader {
            nonce,
            virtual_chapter,
            first_list: first_list as u16,
            list_count: count as u16,
        },
    );

    let entries = count + 1;
    let table_bits = u64::from(entries) * u64::from(OFFSET_FIELD_BITS);
    let content_start = (HEADER_BYTES * 8) as u64 + table_bits;

    let mut cursor = content_start;
    for i in 0..count {
        set_field(cursor as u32, memory, offset_table_bit(i), OFFSET_FIELD_BITS);

        let list_number = first_list + i;
        let (zone_index, local) = index.locate(list_number)?;
        let zone = index.zone(zone_index as u32);
        let list = zone.delta_lists[local as usize + 1];

        if list.size_bits > 0 {
            copy_bits(&zone.memory, list.start_bit, memory, cursor, list.size_bits);
        }
        cursor += u64::from(list.size_bits);
    }
    set_field(cursor as u32, memory, offset_table_bit(count), OFFSET_FIELD_BITS);

    set_zero(memory, (memory.len() * 8 - GUARD_BITS) as u64, GUARD_BITS as u32);
    let len = memory.len();
    for byte in &mut memory[len - POST_FIELD_GUARD_BYTES..] {
        *byte = 0xFF;
    }

    Ok(count)
}

/// Searches one delta list within an already-[`verify_page`]-ed page for
/// `key`/`name`, without needing a [`MutableDeltaIndex`] reconstructed
/// from it.
///
/// `list_number` is global (as in [`PageHeader::first_list`] numbering);
/// it must fall within `[first_list, first_list + list_count)`. Mirrors
/// [`super::entry::get_entry`]'s walk, but over a page's offset-table
/// addressed lists rather than a [`super::zone::DeltaZone`]'s tracked
/// ones, since a packed page has no `save_key`/`save_offset` to resume
/// from and values are never mutated after packing.
pub fn search_list(
    memory: &[u8],
    header: &PageHeader,
    value_bits: u32,
    coding: CodingParams,
    list_number: u32,
    key: u64,
    name: &RecordName,
) -> Result<Option<u32>> {
    let first_list = u32::from(header.first_list);
    if list_number < first_list || list_number >= first_list + u32::from(header.list_count) {
        return Err(Error::InvalidArgument("list_number not covered by this page"));
    }
    let local = list_number - first_list;

    let start = u64::from(get_field(memory, offset_table_bit(local), OFFSET_FIELD_BITS));
    let end = u64::from(get_field(memory, offset_table_bit(local + 1), OFFSET_FIELD_BITS));

    let mut offset = start;
    let mut current_key = 0u64;

    while offset < end {
        let value = get_field(memory, offset, value_bits);
        let delta_offset = offset + u64::from(value_bits);
        let max_scan = (memory.len() * 8) as u64 - delta_offset;
        let (delta, delta_bits) = decode_delta(memory, delta_offset, coding, max_scan)?;

        let is_collision = delta == 0 && offset != start;
        let mut entry_bits = value_bits + delta_bits;
        if is_collision {
            entry_bits += COLLISION_BITS;
        }
        if offset + u64::from(entry_bits) > end {
            return Err(Error::CorruptData("packed delta list entry overruns its page region"));
        }

        current_key += u64::from(delta);

        if is_collision {
            let suffix_offset = offset + u64::from(value_bits + delta_bits);
            if read_name(memory, suffix_offset) == *name.as_bytes() {
                return Ok(Some(value));
            }
        } else if current_key == key {
            return Ok(Some(value));
        } else if current_key > key {
            return Ok(None);
        }

        offset += u64::from(entry_bits);
    }

    Ok(None)
}

fn read_name(memory: &[u8], offset: u64) -> [u8; RECORD_NAME_SIZE] {
    let mut out = [0u8; RECORD_NAME_SIZE];
    let mut pos = offset;
    let mut written = 0u32;
    while written < COLLISION_BITS {
        let chunk = (COLLISION_BITS - written).min(crate::bits::MAX_BIG_FIELD_BITS);
        let bits = get_big_field(memory, pos, chunk);
        crate::bits::set_big_field(bits, &mut out, u64::from(written), chunk);
        pos += u64::from(chunk);
        written += chunk;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn populated_index() -> MutableDeltaIndex {
        let mut index = MutableDeltaIndex::new(4, 1, 20, 12, 4096).unwrap();
        for (list, key) in [(0u32, 5u64), (0, 50), (1, 10), (2, 1), (3, 1000)] {
            let (entry, found) = index.get_entry(list, key, None).unwrap();
            index
                .put_entry(&entry, found, list, key, (key % 4000) as u32, None)
                .unwrap();
        }
        index
    }

    #[test]
    fn pack_and_verify_round_trip() {
        let index = populated_index();
        let mut page = vec![0u8; 512];

        let packed = pack_page(&index, 0, 0xDEAD_BEEF, 7, &mut page).unwrap();
        assert!(packed > 0);

        let header = verify_page(0xDEAD_BEEF, &page).unwrap();
        assert_eq!(header.virtual_chapter, 7);
        assert_eq!(header.first_list, 0);
        assert_eq!(header.list_count, packed as u16);
    }

    #[test]
    fn verify_rejects_wrong_nonce() {
        let index = populated_index();
        let mut page = vec![0u8; 512];
        pack_page(&index, 0, 42, 1, &mut page).unwrap();

        let result = verify_page(99, &page);
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }

    #[test]
    fn verify_rejects_corrupted_guard() {
        let index = populated_index();
        let mut page = vec![0u8; 512];
        pack_page(&index, 0, 42, 1, &mut page).unwrap();

        let last = page.len() - 1;
        page[last] = 0x00;

        let result = verify_page(42, &page);
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }

    #[test]
    fn pack_page_splits_across_multiple_pages_when_too_small() {
        let index = populated_index();
        let mut page = vec![0u8; HEADER_BYTES + 16];

        let packed = pack_page(&index, 0, 1, 1, &mut page).unwrap();
        assert!(packed < index.list_count());
    }
}
