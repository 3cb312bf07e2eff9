// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The bit-packed, Huffman-coded associative structure that both the
//! volume index and each chapter's index are built from.
//!
//! A delta index exists in two forms: [`mutable::MutableDeltaIndex`] grows
//! in place as records are posted, sharded across zones so each zone
//! worker owns its slice lock-free; [`immutable`] packs a mutable index's
//! lists into the read-only pages a chapter writes to the volume, and
//! verifies them back. [`zone`] and [`entry`] hold the primitives both
//! forms share; [`save`] is the on-disk framing for a mutable index's
//! zones.

pub mod entry;
pub mod immutable;
pub mod mutable;
pub mod save;
pub mod zone;

pub use entry::{DeltaIndexEntry, COLLISION_BITS};
pub use mutable::MutableDeltaIndex;
pub use save::{load_zone, save_zone};
pub use zone::{DeltaList, DeltaZone};
