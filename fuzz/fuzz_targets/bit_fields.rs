#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use uds_index::bits;

const MEMORY_BYTES: usize = 64;

#[derive(Debug, Arbitrary)]
struct Input {
    offset: u16,
    size: u8,
    value: u32,
    move_src_offset: u16,
    move_dst_offset: u16,
    move_count: u8,
}

// Exercises `get_field`/`set_field` and `move_bits` against small, bounded
// offsets so libFuzzer can explore alignment and overlap edge cases without
// ever reading or writing past the guarded buffer.
fuzz_target!(|input: Input| {
    let max_bit = (MEMORY_BYTES as u64) * 8;

    let size = (input.size % (bits::MAX_FIELD_BITS as u8 + 1)).max(1) as u32;
    let offset = u64::from(input.offset) % (max_bit - u64::from(size) - 64);

    let mut memory = vec![0u8; MEMORY_BYTES];
    bits::set_field(input.value, &mut memory, offset, size);
    let read_back = bits::get_field(&memory, offset, size);
    let mask = if size >= 32 { u32::MAX } else { (1u32 << size) - 1 };
    assert_eq!(read_back, input.value & mask);

    let move_count = (u32::from(input.move_count) % 200) + 1;
    let src = u64::from(input.move_src_offset) % (max_bit - u64::from(move_count) - 64);
    let dst = u64::from(input.move_dst_offset) % (max_bit - u64::from(move_count) - 64);

    let mut source = vec![0xA5u8; MEMORY_BYTES];
    let mut reference = source.clone();
    bits::move_bits(&mut source, src, dst, move_count);
    bits::copy_bits(&reference.clone(), src, &mut reference, dst, move_count);

    for bit in 0..move_count {
        let moved = bits::get_field(&source, dst + u64::from(bit), 1);
        let copied = bits::get_field(&reference, dst + u64::from(bit), 1);
        assert_eq!(moved, copied);
    }
});
