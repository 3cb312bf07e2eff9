// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The chapter lifecycle: the per-zone open chapter that accepts new
//! records, the chapter index built over a chapter's sampled records when
//! it closes, the index-page-map that lets a lookup find the one index
//! page holding a given name without scanning all of them, and the
//! background writer that commits a closed chapter to the volume store.

pub mod chapter_index;
pub mod index_page_map;
pub mod open_chapter;
pub mod writer;

pub use chapter_index::ChapterIndex;
pub use index_page_map::IndexPageMap;
pub use open_chapter::OpenChapter;
pub use writer::{ChapterWriter, WriteOutcome};

/// Size in bytes of the opaque metadata payload stored alongside a name,
/// matching the original's fixed-size `uds_record_data`.
pub const RECORD_DATA_SIZE: usize = 16;

/// Opaque caller metadata: typically a block-storage location hint.
pub type RecordData = [u8; RECORD_DATA_SIZE];
