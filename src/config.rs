// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Tunable parameters for an [`crate::index::Index`], analogous to the
//! reference implementation's `memory_size`-class configuration: a
//! [`Geometry`] plus the sizing knobs that aren't fixed layout but still
//! have to be picked once, validated, and never changed for the life of
//! the index.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::geometry::Geometry;
use crate::version::Version;

/// Fully validated, immutable configuration for one index instance.
///
/// Built via [`ConfigBuilder`], which fills in defaults derived from
/// `geometry` for anything the caller doesn't set explicitly.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub geometry: Geometry,
    /// Number of zone workers (and, with it, delta-index zones) sharing
    /// the volume index.
    pub zone_count: u32,
    /// Number of delta lists the volume index is sharded into.
    pub volume_index_list_count: u32,
    /// Huffman coding parameter derived from the expected occupancy of one
    /// volume-index delta list.
    pub volume_index_mean_delta: u32,
    /// Byte budget per volume-index zone.
    pub volume_index_zone_memory_bytes: usize,
    /// Capacity, in chapters, of the shared sparse cache. Unused in dense
    /// mode.
    pub sparse_cache_capacity: usize,
    /// Distinguishes chapter pages written by this index instance from a
    /// stale or foreign volume occupying the same physical slots.
    pub nonce: u64,
}

impl Config {
    /// Starts building a [`Config`] over `geometry`, with every other field
    /// defaulted from it.
    #[must_use]
    pub fn builder(geometry: Geometry) -> ConfigBuilder {
        ConfigBuilder::new(geometry)
    }

    /// Writes this configuration as the index's `config` file, so a reopen
    /// can recover the exact geometry and sizing a save was made under.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        Version::V0.write_file_header(writer)?;

        writer.write_u32::<LittleEndian>(self.geometry.chapters_per_volume)?;
        writer.write_u32::<LittleEndian>(self.geometry.records_per_chapter)?;
        writer.write_u32::<LittleEndian>(self.geometry.index_pages_per_chapter)?;
        writer.write_u32::<LittleEndian>(self.geometry.record_pages_per_chapter)?;
        writer.write_u32::<LittleEndian>(self.geometry.bytes_per_page)?;
        writer.write_u8(self.geometry.chapter_address_bits)?;
        writer.write_u8(self.geometry.chapter_delta_list_bits)?;
        writer.write_u32::<LittleEndian>(self.geometry.sparse_chapters_per_volume)?;
        writer.write_u32::<LittleEndian>(self.geometry.sparse_sample_rate)?;

        writer.write_u32::<LittleEndian>(self.zone_count)?;
        writer.write_u32::<LittleEndian>(self.volume_index_list_count)?;
        writer.write_u32::<LittleEndian>(self.volume_index_mean_delta)?;
        writer.write_u64::<LittleEndian>(self.volume_index_zone_memory_bytes as u64)?;
        writer.write_u64::<LittleEndian>(self.sparse_cache_capacity as u64)?;
        writer.write_u64::<LittleEndian>(self.nonce)?;

        Ok(())
    }

    /// Reads a configuration previously written by [`Self::write`].
    pub fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; 5];
        reader.read_exact(&mut header)?;
        if Version::parse_file_header(&header).is_none() {
            return Err(Error::CorruptData("config file has an unrecognized header"));
        }

        let chapters_per_volume = reader.read_u32::<LittleEndian>()?;
        let records_per_chapter = reader.read_u32::<LittleEndian>()?;
        let index_pages_per_chapter = reader.read_u32::<LittleEndian>()?;
        let record_pages_per_chapter = reader.read_u32::<LittleEndian>()?;
        let bytes_per_page = reader.read_u32::<LittleEndian>()?;
        let chapter_address_bits = reader.read_u8()?;
        let chapter_delta_list_bits = reader.read_u8()?;
        let sparse_chapters_per_volume = reader.read_u32::<LittleEndian>()?;
        let sparse_sample_rate = reader.read_u32::<LittleEndian>()?;

        let geometry = Geometry::new(
            chapters_per_volume,
            records_per_chapter,
            index_pages_per_chapter,
            record_pages_per_chapter,
            bytes_per_page,
            chapter_address_bits,
            chapter_delta_list_bits,
            sparse_chapters_per_volume,
            sparse_sample_rate,
        )?;

        let zone_count = reader.read_u32::<LittleEndian>()?;
        let volume_index_list_count = reader.read_u32::<LittleEndian>()?;
        let volume_index_mean_delta = reader.read_u32::<LittleEndian>()?;
        let volume_index_zone_memory_bytes = reader.read_u64::<LittleEndian>()? as usize;
        let sparse_cache_capacity = reader.read_u64::<LittleEndian>()? as usize;
        let nonce = reader.read_u64::<LittleEndian>()?;

        Ok(Config {
            geometry,
            zone_count,
            volume_index_list_count,
            volume_index_mean_delta,
            volume_index_zone_memory_bytes,
            sparse_cache_capacity,
            nonce,
        })
    }
}

/// Builds and validates a [`Config`].
pub struct ConfigBuilder {
    geometry: Geometry,
    zone_count: u32,
    volume_index_list_count: Option<u32>,
    volume_index_mean_delta: Option<u32>,
    volume_index_zone_memory_bytes: Option<usize>,
    sparse_cache_capacity: Option<usize>,
    nonce: u64,
}

/// A reasonable number of volume-index records to aim for per delta list:
/// enough that Huffman-coded deltas amortize well, small enough that a
/// single-zone insert doesn't scan deep lists routinely.
const TARGET_RECORDS_PER_LIST: u64 = 1_000;

impl ConfigBuilder {
    fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            zone_count: 1,
            volume_index_list_count: None,
            volume_index_mean_delta: None,
            volume_index_zone_memory_bytes: None,
            sparse_cache_capacity: None,
            nonce: 0,
        }
    }

    #[must_use]
    pub fn zone_count(mut self, zone_count: u32) -> Self {
        self.zone_count = zone_count;
        self
    }

    #[must_use]
    pub fn volume_index_list_count(mut self, list_count: u32) -> Self {
        self.volume_index_list_count = Some(list_count);
        self
    }

    #[must_use]
    pub fn volume_index_mean_delta(mut self, mean_delta: u32) -> Self {
        self.volume_index_mean_delta = Some(mean_delta);
        self
    }

    #[must_use]
    pub fn volume_index_zone_memory_bytes(mut self, bytes: usize) -> Self {
        self.volume_index_zone_memory_bytes = Some(bytes);
        self
    }

    #[must_use]
    pub fn sparse_cache_capacity(mut self, capacity: usize) -> Self {
        self.sparse_cache_capacity = Some(capacity);
        self
    }

    #[must_use]
    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    fn total_records_estimate(&self) -> u64 {
        u64::from(self.geometry.chapters_per_volume) * u64::from(self.geometry.records_per_chapter)
    }

    /// Builds the [`Config`], deriving any unset field purely from
    /// `geometry` and `zone_count`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `zone_count` is zero, if
    /// sparse mode is configured but `sparse_cache_capacity` resolves to
    /// zero, or if an explicitly set field is internally inconsistent.
    pub fn build(self) -> Result<Config> {
        if self.zone_count == 0 {
            return Err(Error::InvalidArgument("zone_count must be > 0"));
        }

        let total_records = self.total_records_estimate().max(1);

        let volume_index_list_count = self.volume_index_list_count.unwrap_or_else(|| {
            let lists = (total_records / TARGET_RECORDS_PER_LIST).max(u64::from(self.zone_count));
            #[allow(clippy::cast_possible_truncation)]
            {
                lists as u32
            }
        });
        if volume_index_list_count == 0 {
            return Err(Error::InvalidArgument("volume_index_list_count must be > 0"));
        }

        let volume_index_mean_delta = self.volume_index_mean_delta.unwrap_or_else(|| {
            let key_space = 1u64 << 40; // the volume-index key's effective width after sharding by list
            let expected_per_list = (total_records / u64::from(volume_index_list_count)).max(1);
            (key_space / expected_per_list).clamp(1, u64::from(u32::MAX)) as u32
        });

        let volume_index_zone_memory_bytes = self.volume_index_zone_memory_bytes.unwrap_or_else(|| {
            // ~1.25x headroom over a naive bits-per-record estimate so
            // insertion has room to rebalance without routinely overflowing.
            let value_bits = u64::from(self.geometry.chapter_address_bits);
            let bits_per_record = value_bits + 24;
            let total_bits = total_records * bits_per_record * 5 / 4;
            let per_zone_bits = total_bits / u64::from(self.zone_count).max(1);
            ((per_zone_bits / 8).max(4096) as usize).next_power_of_two()
        });

        let sparse_cache_capacity = self.sparse_cache_capacity.unwrap_or_else(|| {
            if self.geometry.is_sparse() {
                (self.geometry.sparse_chapters_per_volume as usize / 4).max(2)
            } else {
                0
            }
        });

        if self.geometry.is_sparse() && sparse_cache_capacity == 0 {
            return Err(Error::InvalidArgument(
                "sparse_cache_capacity must be > 0 when the geometry is sparse",
            ));
        }

        Ok(Config {
            geometry: self.geometry,
            zone_count: self.zone_count,
            volume_index_list_count,
            volume_index_mean_delta,
            volume_index_zone_memory_bytes,
            sparse_cache_capacity,
            nonce: self.nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn geometry() -> Geometry {
        Geometry::new(10, 1_000, 1, 63, 4_096, 14, 20, 2, 32).unwrap()
    }

    fn dense_geometry() -> Geometry {
        Geometry::new(10, 1_000, 1, 63, 4_096, 14, 20, 0, 0).unwrap()
    }

    #[test]
    fn defaults_derive_sensible_values() {
        let config = Config::builder(geometry()).build().unwrap();
        assert_eq!(config.zone_count, 1);
        assert!(config.volume_index_list_count > 0);
        assert!(config.volume_index_mean_delta > 0);
        assert!(config.volume_index_zone_memory_bytes >= 4096);
        assert!(config.sparse_cache_capacity > 0);
    }

    #[test]
    fn dense_geometry_needs_no_sparse_cache() {
        let config = Config::builder(dense_geometry()).build().unwrap();
        assert_eq!(config.sparse_cache_capacity, 0);
    }

    #[test]
    fn rejects_zero_zone_count() {
        let result = Config::builder(geometry()).zone_count(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn explicit_overrides_are_honored() {
        let config = Config::builder(geometry())
            .zone_count(4)
            .volume_index_list_count(64)
            .volume_index_mean_delta(500)
            .sparse_cache_capacity(8)
            .nonce(99)
            .build()
            .unwrap();

        assert_eq!(config.zone_count, 4);
        assert_eq!(config.volume_index_list_count, 64);
        assert_eq!(config.volume_index_mean_delta, 500);
        assert_eq!(config.sparse_cache_capacity, 8);
        assert_eq!(config.nonce, 99);
    }

    #[test]
    fn sparse_geometry_rejects_explicit_zero_cache_capacity() {
        let result = Config::builder(geometry()).sparse_cache_capacity(0).build();
        assert!(result.is_err());
    }

    #[test]
    fn write_then_read_round_trips() {
        let config = Config::builder(geometry()).zone_count(3).nonce(42).build().unwrap();

        let mut buf = Vec::new();
        config.write(&mut buf).unwrap();

        let loaded = Config::read(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.geometry, config.geometry);
        assert_eq!(loaded.zone_count, config.zone_count);
        assert_eq!(loaded.volume_index_list_count, config.volume_index_list_count);
        assert_eq!(loaded.volume_index_mean_delta, config.volume_index_mean_delta);
        assert_eq!(loaded.volume_index_zone_memory_bytes, config.volume_index_zone_memory_bytes);
        assert_eq!(loaded.sparse_cache_capacity, config.sparse_cache_capacity);
        assert_eq!(loaded.nonce, config.nonce);
    }

    #[test]
    fn read_rejects_bad_header() {
        let result = Config::read(&mut [0u8; 5].as_slice());
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }
}
