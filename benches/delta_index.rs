use criterion::{criterion_group, criterion_main, Criterion};
use uds_index::delta_index::mutable::MutableDeltaIndex;

const LIST_COUNT: u32 = 64;
const ZONE_COUNT: u32 = 1;
const ZONE_MEMORY_BYTES: usize = 1 << 20;

fn names(count: u32) -> Vec<u64> {
    // A cheap deterministic pseudo-random walk over u64 keys, spread across
    // `LIST_COUNT` lists by the caller.
    let mut state = 0x9E3779B97F4A7C15u64;
    (0..count)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        })
        .collect()
}

fn put_entry(c: &mut Criterion) {
    c.bench_function("put_entry (append-only, 10k distinct keys)", |b| {
        b.iter(|| {
            let mut index =
                MutableDeltaIndex::new(LIST_COUNT, ZONE_COUNT, 100, 16, ZONE_MEMORY_BYTES)
                    .unwrap();
            let mut keys = names(10_000);
            keys.sort_unstable();

            for (i, key) in keys.into_iter().enumerate() {
                let list = (i as u32) % LIST_COUNT;
                let (entry, found) = index.get_entry(list, key, None).unwrap();
                if !found {
                    let _ = index.put_entry(&entry, found, list, key, (i % 65536) as u32, None);
                }
            }

            index.record_count()
        });
    });
}

fn get_entry(c: &mut Criterion) {
    let mut index =
        MutableDeltaIndex::new(LIST_COUNT, ZONE_COUNT, 100, 16, ZONE_MEMORY_BYTES).unwrap();
    let mut keys = names(10_000);
    keys.sort_unstable();
    for (i, key) in keys.iter().enumerate() {
        let list = (i as u32) % LIST_COUNT;
        if let Ok((entry, false)) = index.get_entry(list, *key, None) {
            let _ = index.put_entry(&entry, false, list, *key, (i % 65536) as u32, None);
        }
    }

    c.bench_function("get_entry (10k keys already present)", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let key = keys[i % keys.len()];
            let list = (i as u32) % LIST_COUNT;
            i += 1;
            index.get_entry(list, key, None).unwrap()
        });
    });
}

criterion_group!(benches, put_entry, get_entry);
criterion_main!(benches);
