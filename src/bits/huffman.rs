// Copyright (c) 2024-present, uds-index
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Delta encoding: a Huffman-ish code tuned for geometric inter-key gaps.
//!
//! Each delta list is coded with parameters derived once from its mean
//! inter-key delta. Small deltas (below `min_keys`) are emitted as a fixed
//! `min_bits`-wide field; larger deltas spill into a unary-terminated tail.
//! This keeps the common case (deltas clustered near the mean) close to the
//! information-theoretic minimum while bounding the worst case.

use super::{get_field, set_field, set_zero};
use crate::error::{Error, Result};

/// The per-list coding parameters, derived from the list's mean delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CodingParams {
    pub min_bits: u32,
    pub min_keys: u32,
    pub incr_keys: u32,
}

/// Derives Huffman coding constants from a list's mean inter-key delta.
///
/// `incr_keys` approximates `ln(2) * mean_delta` via the integer ratio
/// `836158 / 1206321`, `min_bits` is the bit length of `incr_keys + 1`, and
/// `min_keys = 2^min_bits - incr_keys`. These constants, and their exact
/// integer arithmetic, are taken from the reference implementation rather
/// than re-derived from the floating-point approximation, so that coded
/// streams match byte-for-byte across implementations.
#[must_use]
pub fn compute_coding_constants(mean_delta: u32) -> CodingParams {
    let incr_keys = ((836_158u64 * u64::from(mean_delta) + 603_160) / 1_206_321) as u32;
    let incr_keys = incr_keys.max(1);

    let min_bits = bit_length(incr_keys + 1);
    let min_keys = (1u32 << min_bits) - incr_keys;

    CodingParams {
        min_bits,
        min_keys,
        incr_keys,
    }
}

/// `ceil(log2(value))` for `value >= 1`, computed without floating point.
fn bit_length(value: u32) -> u32 {
    debug_assert!(value >= 1);
    32 - (value - 1).leading_zeros()
}

/// Encodes `delta` into `memory` at bit `offset` using `params`.
///
/// Returns the number of bits written.
pub fn encode_delta(memory: &mut [u8], offset: u64, delta: u32, params: CodingParams) -> u32 {
    if delta < params.min_keys {
        set_field(delta, memory, offset, params.min_bits);
        return params.min_bits;
    }

    let t = delta - params.min_keys;
    let t1 = t % params.incr_keys + params.min_keys;
    let t2 = t / params.incr_keys;

    set_field(t1, memory, offset, params.min_bits);
    set_zero(memory, offset + u64::from(params.min_bits), t2);
    set_field(1, memory, offset + u64::from(params.min_bits) + u64::from(t2), 1);

    params.min_bits + t2 + 1
}

/// The number of bits [`encode_delta`] would use for `delta`, without
/// writing anything. Used by delta-list mutation to size a gap before the
/// bits that will fill it exist.
#[must_use]
pub fn delta_bit_length(delta: u32, params: CodingParams) -> u32 {
    if delta < params.min_keys {
        return params.min_bits;
    }

    let t = delta - params.min_keys;
    let t2 = t / params.incr_keys;

    params.min_bits + t2 + 1
}

/// Decodes a delta starting at bit `offset`.
///
/// Returns `(delta, bits_consumed)`. The zero-scan used to recover `t2`
/// terminates even on corrupt input because callers guarantee the delta
/// zone's tail guard bytes are all-ones (see [`crate::bits`] module docs);
/// `max_scan_bits` additionally bounds the scan defensively and turns a scan
/// that still fails to terminate into [`Error::CorruptData`] rather than an
/// unbounded loop.
pub fn decode_delta(
    memory: &[u8],
    offset: u64,
    params: CodingParams,
    max_scan_bits: u64,
) -> Result<(u32, u32)> {
    let t1 = get_field(memory, offset, params.min_bits);

    if t1 < params.min_keys {
        return Ok((t1, params.min_bits));
    }

    let mut scan_offset = offset + u64::from(params.min_bits);
    let mut t2: u32 = 0;
    let end = offset + max_scan_bits;

    loop {
        if scan_offset >= end {
            return Err(Error::CorruptData(
                "huffman delta scan did not terminate within bounds",
            ));
        }

        if get_field(memory, scan_offset, 1) == 1 {
            break;
        }

        t2 += 1;
        scan_offset += 1;
    }

    let delta = t2 * params.incr_keys + (t1 - params.min_keys);
    let bits = params.min_bits + t2 + 1;

    Ok((delta, bits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn coding_constants_match_reference_formula() {
        // mean_delta = 100 -> incr_keys ~= ln(2)*100 ~= 69
        let params = compute_coding_constants(100);
        assert_eq!(params.incr_keys, (836_158u64 * 100 + 603_160) as u32 / 1_206_321);
        assert_eq!(params.min_keys, (1 << params.min_bits) - params.incr_keys);
        assert!(params.min_keys < (1 << params.min_bits));
    }

    fn all_ones_buffer(bytes: usize) -> Vec<u8> {
        vec![0xFFu8; bytes]
    }

    #[test]
    fn small_delta_round_trip() {
        let params = compute_coding_constants(50);
        let mut mem = all_ones_buffer(16);
        set_zero(&mut mem, 0, 128);

        let delta = params.min_keys.saturating_sub(1).max(1) - 1;
        let bits = encode_delta(&mut mem, 0, delta, params);
        assert_eq!(bits, params.min_bits);

        let (decoded, consumed) = decode_delta(&mem, 0, params, 128).unwrap();
        assert_eq!(decoded, delta);
        assert_eq!(consumed, bits);
    }

    #[test]
    fn large_delta_round_trip() {
        let params = compute_coding_constants(20);
        let mut mem = all_ones_buffer(32);
        set_zero(&mut mem, 0, 256);

        let delta = params.min_keys + params.incr_keys * 5 + 2;
        let bits = encode_delta(&mut mem, 0, delta, params);

        let (decoded, consumed) = decode_delta(&mem, 0, params, 256).unwrap();
        assert_eq!(decoded, delta);
        assert_eq!(consumed, bits);
    }

    #[test]
    fn sequence_of_deltas_round_trips() {
        let params = compute_coding_constants(30);
        let mut mem = all_ones_buffer(256);
        set_zero(&mut mem, 0, 2000);

        let deltas: Vec<u32> = (0..50u32).map(|i| (i * 7) % 500).collect();

        let mut offset = 0u64;
        let mut bit_lengths = Vec::new();
        for &d in &deltas {
            let bits = encode_delta(&mut mem, offset, d, params);
            bit_lengths.push(bits);
            offset += u64::from(bits);
        }

        let mut offset = 0u64;
        for (i, &d) in deltas.iter().enumerate() {
            let (decoded, consumed) = decode_delta(&mem, offset, params, 2000).unwrap();
            assert_eq!(decoded, d, "mismatch at index {i}");
            assert_eq!(consumed, bit_lengths[i]);
            offset += u64::from(consumed);
        }
    }

    #[test]
    fn delta_bit_length_matches_encode() {
        let params = compute_coding_constants(40);
        let mut mem = all_ones_buffer(32);
        set_zero(&mut mem, 0, 256);

        for delta in [0, 1, params.min_keys, params.min_keys + 1, params.min_keys + params.incr_keys * 3] {
            let predicted = delta_bit_length(delta, params);
            let actual = encode_delta(&mut mem, 0, delta, params);
            assert_eq!(predicted, actual, "mismatch for delta={delta}");
        }
    }

    #[test]
    fn corrupt_scan_without_guard_reports_error() {
        let params = compute_coding_constants(10);
        // All zero memory with t1 >= min_keys forces the unary scan, but the
        // guard region here is all-zero, not all-ones, so it never finds a
        // terminating `1` bit within the scan bound.
        let mut mem = vec![0u8; 16];
        set_field(params.min_keys, &mut mem, 0, params.min_bits);

        let result = decode_delta(&mem, 0, params, 64);
        assert!(matches!(result, Err(Error::CorruptData(_))));
    }
}
