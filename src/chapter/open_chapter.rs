// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The in-memory chapter a single zone is currently accepting records
//! into: a linear-probed hash table over record names, addressed by the
//! name's [`RecordName::chapter_index_bytes`] slice the same way the
//! chapter index will address them once the chapter closes.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::record_name::{RecordName, RECORD_NAME_SIZE};

use super::{RecordData, RECORD_DATA_SIZE};

const MAGIC: &[u8; 8] = b"OC-00001";

/// One hash-table slot. `record_number == 0` means empty; valid record
/// numbers are `1..=capacity` (1-based, matching the reference
/// implementation's record array layout).
#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    record_number: u32,
    deleted: bool,
}

/// A capacity-bounded open chapter for one zone.
///
/// `capacity` is `records_per_chapter / zone_count` (rounded up so the
/// chapter as a whole still holds `records_per_chapter` across all zones).
/// The hash table itself is sized to roughly twice that, rounded to a
/// power of two, to keep linear-probe chains short.
pub struct OpenChapter {
    capacity: u32,
    slot_count: u32,
    slots: Vec<Slot>,
    records: Vec<(RecordName, RecordData)>,
    size: u32,
    deletions: u32,
}

impl OpenChapter {
    /// Builds an empty open chapter with room for `capacity` records.
    pub fn new(capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument("open chapter capacity must be > 0"));
        }

        let slot_count = (2 * capacity).next_power_of_two();

        Ok(Self {
            capacity,
            slot_count,
            slots: vec![Slot::default(); slot_count as usize],
            // Index 0 is an unused sentinel so `record_number == 0` in a
            // slot unambiguously means "empty".
            records: Vec::with_capacity(capacity as usize + 1),
            size: 0,
            deletions: 0,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of live (non-deleted) records currently stored.
    #[must_use]
    pub fn size(&self) -> u32 {
        self.size - self.deletions
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size >= self.capacity
    }

    fn hash_slot(&self, name: &RecordName) -> usize {
        (name.chapter_index_bytes() % u64::from(self.slot_count)) as usize
    }

    /// Finds `name`'s slot and, if occupied by a live record, its record
    /// number. Returns the slot index either way so callers can insert at
    /// the first empty slot found during the same probe.
    fn locate(&self, name: &RecordName) -> (usize, Option<u32>) {
        let start = self.hash_slot(name);
        let mut probe = start;

        loop {
            let slot = self.slots[probe];
            if slot.record_number == 0 {
                return (probe, None);
            }

            let (stored_name, _) = &self.records[slot.record_number as usize - 1];
            if stored_name == name && !slot.deleted {
                return (probe, Some(slot.record_number));
            }

            probe = (probe + 1) % self.slot_count as usize;
            if probe == start {
                return (probe, None);
            }
        }
    }

    /// Looks up `name`'s metadata, if a live entry for it exists.
    #[must_use]
    pub fn search(&self, name: &RecordName) -> Option<&RecordData> {
        let (_, record_number) = self.locate(name);
        record_number.map(|n| &self.records[n as usize - 1].1)
    }

    /// Inserts or overwrites `name`'s metadata.
    ///
    /// Returns the remaining capacity after the insert; `0` signals the
    /// caller should close the chapter. Overwriting an existing live entry
    /// does not consume capacity.
    pub fn put(&mut self, name: &RecordName, metadata: RecordData) -> Result<u32> {
        let (slot_index, existing) = self.locate(name);

        if let Some(record_number) = existing {
            self.records[record_number as usize - 1].1 = metadata;
            return Ok(self.capacity - self.size);
        }

        if self.is_full() {
            return Err(Error::Overflow);
        }

        self.records.push((*name, metadata));
        let record_number = self.records.len() as u32;

        self.slots[slot_index] = Slot {
            record_number,
            deleted: false,
        };
        self.size += 1;

        Ok(self.capacity - self.size)
    }

    /// Marks `name`'s entry, if any, as deleted. A no-op if absent.
    pub fn remove(&mut self, name: &RecordName) {
        let (slot_index, existing) = self.locate(name);
        if existing.is_some() && !self.slots[slot_index].deleted {
            self.slots[slot_index].deleted = true;
            self.deletions += 1;
        }
    }

    /// Iterates every live `(name, metadata)` pair, in record-insertion
    /// order, for collation into the closing chapter's sorted record
    /// pages.
    pub fn iter_live(&self) -> impl Iterator<Item = &(RecordName, RecordData)> {
        let deleted: std::collections::HashSet<u32> = self
            .slots
            .iter()
            .filter(|s| s.deleted && s.record_number != 0)
            .map(|s| s.record_number)
            .collect();

        self.records
            .iter()
            .enumerate()
            .filter(move |(i, _)| !deleted.contains(&(*i as u32 + 1)))
            .map(|(_, r)| r)
    }

    /// Writes a snapshot of this chapter's live records, so a reopened index
    /// can resume the zone's open chapter exactly where it left off instead
    /// of starting the zone empty (at the cost of whatever was posted since
    /// the last clean save — see spec.md §6).
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u32::<LittleEndian>(self.capacity)?;
        let live: Vec<_> = self.iter_live().collect();
        writer.write_u32::<LittleEndian>(live.len() as u32)?;
        for (name, metadata) in live {
            writer.write_all(name.as_bytes())?;
            writer.write_all(metadata)?;
        }
        Ok(())
    }

    /// Rebuilds an open chapter from a snapshot written by [`Self::write`].
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::CorruptData("open chapter snapshot has the wrong magic"));
        }

        let capacity = reader.read_u32::<LittleEndian>()?;
        let mut chapter = Self::new(capacity)?;

        let count = reader.read_u32::<LittleEndian>()?;
        for _ in 0..count {
            let mut name_bytes = [0u8; RECORD_NAME_SIZE];
            reader.read_exact(&mut name_bytes)?;
            let mut metadata = [0u8; RECORD_DATA_SIZE];
            reader.read_exact(&mut metadata)?;
            chapter.put(&RecordName::new(name_bytes), metadata)?;
        }

        Ok(chapter)
    }

    /// Resets the chapter to empty, ready to accept the next one. Keeps
    /// the allocated slot table and record vector capacity.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
        self.records.clear();
        self.size = 0;
        self.deletions = 0;
    }
}
