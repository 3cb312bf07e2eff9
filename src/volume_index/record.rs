// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The handle a volume-index lookup hands back, letting a caller mutate
//! the same delta-index slot without searching for it a second time.

use crate::delta_index::DeltaIndexEntry;

/// A located (or definitively absent) slot for one name's volume-index
/// entry.
///
/// `found` mirrors the delta-index cursor's own found/not-found result; it
/// does not account for lazy chapter expiry, which [`super::VolumeIndex`]
/// applies separately when decoding the stored chapter number.
#[derive(Clone, Copy, Debug)]
pub struct VolumeIndexRecord {
    pub(super) list_number: u32,
    pub(super) entry: DeltaIndexEntry,
    pub(super) found: bool,
}

impl VolumeIndexRecord {
    #[must_use]
    pub fn is_found(&self) -> bool {
        self.found
    }

    #[must_use]
    pub fn is_collision(&self) -> bool {
        self.entry.is_collision
    }
}
